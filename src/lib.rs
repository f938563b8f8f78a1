pub mod boundary;
pub mod config;
pub mod error;
pub mod logger;
pub mod mode;
pub mod protocol;
pub mod router;
pub mod server;
pub mod tunnel;
pub mod utils;

pub use config::{ConfigManager, Role, ServerConfig};
pub use error::{GofwError, Result};
pub use logger::{EventBus, LogBuffer, LogEvent, LogLevel, LogRecord, LogSink, Logger};
pub use mode::{ModeSnapshot, ProxyMode, ProxyModeController, RoutePolicy};
pub use protocol::Target;
pub use router::{DnsCache, RouteAction, RouteClassifier};
pub use server::ServerSupervisor;
pub use tunnel::{CertificateAuthority, SessionInfo, SessionState, TunnelSession};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = "gofw";
