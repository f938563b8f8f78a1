//! Process-wide facade behind the C entry points.
//!
//! One supervisor and one runtime live for the whole process; the `ffi`
//! functions only convert arguments and copy strings into caller buffers.

pub mod ffi;

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::runtime::Runtime;

use crate::config::ServerConfig;
use crate::error::GofwError;
use crate::logger::{LogRecord, LogSink, SubscriptionId};
use crate::server::ServerSupervisor;

pub const CHAR_BUF_SIZE: usize = 2048;

pub const SVR_STARTED: i32 = 0;
pub const SVR_ALREADY_STARTED: i32 = 1;
pub const SVR_ERROR_CODE: i32 = 1 << 15;
pub const SVR_ERROR_EXITED: i32 = 1 << 1;
pub const SVR_ERROR_CREATE: i32 = 1 << 2;
pub const SVR_ERROR_PANIC: i32 = 1 << 3;
pub const SVR_ERROR_BIND: i32 = 1 << 4;

pub const SVR_GLOBAL: i32 = 0x10000;
pub const SVR_IPLIST: i32 = 0x10001;
pub const SVR_NONE: i32 = 0x10002;

static RUNTIME: Lazy<std::result::Result<Runtime, String>> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("gofw-worker")
        .build()
        .map_err(|e| e.to_string())
});

static SUPERVISOR: Lazy<ServerSupervisor> = Lazy::new(ServerSupervisor::new);

// Sink registered by the last start call; also serializes start calls.
static CALLBACK_SUBSCRIPTION: Lazy<Mutex<Option<SubscriptionId>>> = Lazy::new(|| Mutex::new(None));

pub fn supervisor() -> &'static ServerSupervisor {
    &SUPERVISOR
}

/// Arguments of a start call, in boundary order.
#[derive(Debug, Clone, Default)]
pub struct StartParams {
    pub log_level: String,
    pub route_list: String,
    pub upstream: String,
    pub local_addr: String,
    pub auth: String,
    pub key: String,
    pub partial: bool,
    pub buffer_size: i32,
    pub control_port: i32,
    pub data_port: i32,
}

impl StartParams {
    pub fn into_config(self) -> std::result::Result<ServerConfig, GofwError> {
        let port = |value: i32, name: &str| {
            u16::try_from(value).map_err(|_| GofwError::config(format!("{} {} out of range", name, value)))
        };
        let buffer_size = usize::try_from(self.buffer_size)
            .map_err(|_| GofwError::config(format!("buffer size {} is negative", self.buffer_size)))?;

        Ok(ServerConfig {
            log_level: self.log_level,
            route_list: self.route_list,
            upstream: self.upstream,
            local_addr: self.local_addr,
            auth: self.auth,
            key: self.key,
            partial: self.partial,
            buffer_size,
            control_port: port(self.control_port, "control port")?,
            data_port: port(self.data_port, "data port")?,
            ..ServerConfig::default()
        })
    }
}

pub fn error_code(error: &GofwError) -> i32 {
    match error {
        GofwError::AlreadyRunning => SVR_ALREADY_STARTED,
        GofwError::Bind { .. } => SVR_ERROR_CODE | SVR_ERROR_BIND,
        _ => SVR_ERROR_CODE | SVR_ERROR_CREATE,
    }
}

/// Starts the process-wide server. `sink` replaces the sink of a previous
/// start; it is subscribed before startup so it also sees startup failures.
pub fn start(params: StartParams, sink: Option<Arc<dyn LogSink>>) -> i32 {
    let runtime = match RUNTIME.as_ref() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("cannot create runtime: {}", e);
            return SVR_ERROR_CODE | SVR_ERROR_CREATE;
        }
    };

    // held until the start completes; a racing start waits, then sees it running
    let mut subscription = CALLBACK_SUBSCRIPTION.lock();
    if SUPERVISOR.is_running() {
        return SVR_ALREADY_STARTED;
    }
    if let Some(previous) = subscription.take() {
        SUPERVISOR.events().unsubscribe(previous);
    }
    if let Some(sink) = sink {
        *subscription = Some(SUPERVISOR.events().subscribe(sink));
    }

    let config = match params.into_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("rejected start parameters: {}", e);
            return error_code(&e);
        }
    };

    match runtime.block_on(SUPERVISOR.start(config)) {
        Ok(()) => SVR_STARTED,
        Err(e) => error_code(&e),
    }
}

pub fn stop() -> bool {
    match RUNTIME.as_ref() {
        Ok(rt) => rt.block_on(SUPERVISOR.stop()),
        Err(_) => false,
    }
}

pub fn nickname() -> String {
    SUPERVISOR.nickname().unwrap_or_default()
}

/// Returns the code replaced, or -1 for an unknown code.
pub fn switch(code: i32) -> i32 {
    SUPERVISOR.switch_proxy_type(code).unwrap_or(-1)
}

pub fn set_mitm(enabled: bool) -> bool {
    SUPERVISOR.set_mitm(enabled)
}

/// Latest log index, `u64::MAX` when no server was ever started.
pub fn log_len() -> u64 {
    SUPERVISOR.log_buffer().map_or(u64::MAX, |b| b.latest_index())
}

pub fn log_read(index: u64) -> Option<LogRecord> {
    SUPERVISOR.log_buffer().and_then(|b| b.get(index).ok())
}

pub fn log_delete_since(index: u64) {
    if let Some(buffer) = SUPERVISOR.log_buffer() {
        buffer.delete_since(index);
    }
}

/// Copies `s` into `dst` as a NUL-terminated string, truncating on a char
/// boundary when needed. Returns the number of bytes copied, without the NUL.
pub fn copy_to_buf(dst: &mut [u8], s: &str) -> usize {
    if dst.is_empty() {
        return 0;
    }
    let mut len = s.len().min(dst.len() - 1);
    while !s.is_char_boundary(len) {
        len -= 1;
    }
    dst[..len].copy_from_slice(&s.as_bytes()[..len]);
    dst[len] = 0;
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_to_buf_truncates() {
        let mut buf = [0xffu8; 8];
        assert_eq!(copy_to_buf(&mut buf, "abcdefghij"), 7);
        assert_eq!(&buf[..8], b"abcdefg\0");
    }

    #[test]
    fn test_copy_to_buf_respects_char_boundary() {
        let mut buf = [0u8; 4];
        // "é" is two bytes; three fit, so only "aé" is copied
        assert_eq!(copy_to_buf(&mut buf, "aéé"), 3);
        assert_eq!(&buf, b"a\xc3\xa9\0");
    }

    #[test]
    fn test_params_reject_bad_ports() {
        let params = StartParams {
            control_port: 70000,
            ..StartParams::default()
        };
        assert!(matches!(params.into_config(), Err(GofwError::Config(_))));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(error_code(&GofwError::AlreadyRunning), SVR_ALREADY_STARTED);
        assert_eq!(error_code(&GofwError::config("x")), 0x8004);
        let bind = GofwError::Bind {
            addr: "127.0.0.1:1".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert_eq!(error_code(&bind), 0x8010);
    }
}
