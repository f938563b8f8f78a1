use std::io;
use thiserror::Error;

/// Unified error type for the proxy core.
#[derive(Error, Debug)]
pub enum GofwError {
    /// Bad port, address, log level, route file or CA material
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Server is already running")]
    AlreadyRunning,

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Authentication rejected")]
    AuthRejected,

    #[error("Upstream {addr} unreachable: {reason}")]
    UpstreamUnreachable { addr: String, reason: String },

    #[error("Destination {addr} unreachable: {reason}")]
    DestinationUnreachable { addr: String, reason: String },

    /// Malformed handshake on either side of a tunnel
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Log record {0} not found")]
    NotFound(u64),

    #[error("Log index {index} is beyond the latest index {latest}")]
    OutOfRange { index: u64, latest: u64 },

    #[error("Invalid proxy mode: {0}")]
    InvalidMode(i64),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl GofwError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        GofwError::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        GofwError::Config(msg.into())
    }
}

impl From<rustls::Error> for GofwError {
    fn from(e: rustls::Error) -> Self {
        GofwError::Tls(e.to_string())
    }
}

impl From<rcgen::RcgenError> for GofwError {
    fn from(e: rcgen::RcgenError) -> Self {
        GofwError::Tls(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GofwError>;
