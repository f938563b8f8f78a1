use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{GofwError, Result};
use crate::logger::{parse_level, LogLevel};
use crate::mode::{ProxyMode, RoutePolicy};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub role: Role,
    pub log_level: String,
    /// Route list content; `route_list_file` takes precedence when set.
    pub route_list: String,
    pub route_list_file: Option<PathBuf>,
    pub upstream: String,
    pub local_addr: String,
    /// `user:pass`, empty disables client authentication.
    pub auth: String,
    pub key: String,
    pub partial: bool,
    pub buffer_size: usize,
    pub control_port: u16,
    /// UDP data channel port, 0 disables it. Ignored in the server role, whose
    /// datagram relay shares the control port number.
    pub data_port: u16,
    pub proxy_mode: ProxyMode,
    pub route_policy: RoutePolicy,
    pub dns_cache_size: usize,
    pub max_connections: u32,
    pub timeouts: TimeoutConfig,
    pub mitm: MitmConfig,
    pub logging: LoggingConfig,
}

/// Which end of the sealed upstream channel this instance is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Serves proxy clients and reaches the upstream for routed traffic.
    #[default]
    Client,
    /// Accepts sealed channels from client instances and dials their targets.
    Server,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_secs: u64,
    pub handshake_secs: u64,
    pub idle_secs: u64,
    pub drain_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MitmConfig {
    pub enabled: bool,
    pub ca_cert: Option<PathBuf>,
    pub ca_key: Option<PathBuf>,
    /// Most minted leaf certificates kept at once.
    pub leaf_cache_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub file_enabled: bool,
    pub file_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            role: Role::Client,
            log_level: "info".to_string(),
            route_list: String::new(),
            route_list_file: None,
            upstream: String::new(),
            local_addr: "127.0.0.1".to_string(),
            auth: String::new(),
            key: String::new(),
            partial: false,
            buffer_size: 1024,
            control_port: 8100,
            data_port: 0,
            proxy_mode: ProxyMode::HttpConnect,
            route_policy: RoutePolicy::IpList,
            dns_cache_size: 1024,
            max_connections: 1000,
            timeouts: TimeoutConfig::default(),
            mitm: MitmConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            connect_secs: 10,
            handshake_secs: 10,
            idle_secs: 300,
            drain_secs: 5,
        }
    }
}

impl Default for MitmConfig {
    fn default() -> Self {
        MitmConfig {
            enabled: false,
            ca_cert: None,
            ca_key: None,
            leaf_cache_size: 256,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            file_enabled: false,
            file_path: PathBuf::from("gofw.log"),
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs.max(1))
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs.max(1))
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs.max(1))
    }

    pub fn drain(&self) -> Duration {
        Duration::from_secs(self.drain_secs)
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        self.level()?;
        self.control_bind_addr()?;
        if self.role == Role::Server {
            if self.key.is_empty() {
                return Err(GofwError::config("the server role needs a shared key"));
            }
        } else if self.upstream.trim().is_empty() {
            if self.route_policy != RoutePolicy::None {
                return Err(GofwError::config("upstream address is required"));
            }
        } else {
            self.upstream_target()?;
        }
        if !self.auth.is_empty() && !self.auth.contains(':') {
            return Err(GofwError::config("auth must be in user:pass form"));
        }
        if self.mitm.ca_cert.is_some() != self.mitm.ca_key.is_some() {
            return Err(GofwError::config("mitm.ca_cert and mitm.ca_key must be set together"));
        }
        Ok(())
    }

    pub fn level(&self) -> Result<Option<LogLevel>> {
        parse_level(&self.log_level)
    }

    pub fn credential(&self) -> Option<&str> {
        if self.auth.is_empty() {
            None
        } else {
            Some(self.auth.as_str())
        }
    }

    /// Address of the TCP control listener. `control_port` wins over a port
    /// embedded in `local_addr`; both zero asks the OS for a free port.
    pub fn control_bind_addr(&self) -> Result<SocketAddr> {
        let (ip, embedded) = parse_bind_host(&self.local_addr)?;
        let port = if self.control_port != 0 { self.control_port } else { embedded.unwrap_or(0) };
        Ok(SocketAddr::new(ip, port))
    }

    pub fn data_bind_addr(&self) -> Result<Option<SocketAddr>> {
        if self.data_port == 0 {
            return Ok(None);
        }
        let (ip, _) = parse_bind_host(&self.local_addr)?;
        Ok(Some(SocketAddr::new(ip, self.data_port)))
    }

    /// Upstream endpoint as `(host, port)`.
    pub fn upstream_target(&self) -> Result<(String, u16)> {
        let raw = self.upstream.trim();
        let (host, port) = raw
            .rsplit_once(':')
            .ok_or_else(|| GofwError::config(format!("upstream {} has no port", raw)))?;
        let port = port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| GofwError::config(format!("upstream {} has an invalid port", raw)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let host = if host.is_empty() { "127.0.0.1" } else { host };
        Ok((host.to_string(), port))
    }

    /// Loads the route list content, reading `route_list_file` when given.
    pub fn route_source(&self) -> Result<String> {
        match self.route_list_file {
            Some(ref path) => std::fs::read_to_string(path)
                .map_err(|e| GofwError::config(format!("cannot read route list {}: {}", path.display(), e))),
            None => Ok(self.route_list.clone()),
        }
    }
}

/// Accepts `ip`, `ip:port`, `[v6]:port`, `:port` and the empty string.
fn parse_bind_host(addr: &str) -> Result<(IpAddr, Option<u16>)> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Ok((IpAddr::V4(Ipv4Addr::LOCALHOST), None));
    }
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return Ok((ip, None));
    }
    if let Ok(sock) = addr.parse::<SocketAddr>() {
        return Ok((sock.ip(), Some(sock.port())));
    }
    if let Some(port) = addr.strip_prefix(':') {
        let port = port
            .parse::<u16>()
            .map_err(|_| GofwError::config(format!("invalid local address: {}", addr)))?;
        return Ok((IpAddr::V4(Ipv4Addr::UNSPECIFIED), Some(port)));
    }
    Err(GofwError::config(format!("invalid local address: {}", addr)))
}

pub struct ConfigManager {
    config_path: std::path::PathBuf,
}

impl ConfigManager {
    pub fn new(config_path: std::path::PathBuf) -> Self {
        Self { config_path }
    }

    pub async fn load_or_default(&self) -> Result<ServerConfig> {
        if self.config_path.exists() {
            let content = tokio::fs::read_to_string(&self.config_path).await?;
            toml::from_str(&content).map_err(|e| GofwError::config(e.to_string()))
        } else {
            Ok(ServerConfig::default())
        }
    }

    pub async fn save(&self, config: &ServerConfig) -> Result<()> {
        let content = toml::to_string_pretty(config).map_err(|e| GofwError::config(e.to_string()))?;
        tokio::fs::write(&self.config_path, content).await?;
        Ok(())
    }
}
