pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{Role, ServerConfig};
use crate::error::{GofwError, Result};
use crate::logger::{unix_nanos, EventBus, LogBuffer, LogEvent, LogLevel, Logger};
use crate::mode::{ModeSnapshot, ProxyModeController};
use crate::protocol::Target;
use crate::router::{DnsCache, RouteClassifier};
use crate::tunnel::{CertificateAuthority, SessionContext, SessionInfo, SessionRegistry, TunnelSession, UdpGrants};
use crate::utils::{hex_string, random_hex};

const ALIAS_LEN: usize = 7;

struct RunningServer {
    ctx: Arc<SessionContext>,
    registry: Arc<SessionRegistry>,
    accept_task: JoinHandle<()>,
    udp_task: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
    data_addr: Option<SocketAddr>,
    nickname: String,
    config: ServerConfig,
}

/// Owns the listeners of one proxy instance and the state that outlives it:
/// the mode controller, the event bus and the last log buffer.
pub struct ServerSupervisor {
    lifecycle: Mutex<()>,
    running: RwLock<Option<RunningServer>>,
    controller: Arc<ProxyModeController>,
    events: Arc<EventBus>,
    buffer: RwLock<Option<Arc<LogBuffer>>>,
}

impl Default for ServerSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerSupervisor {
    pub fn new() -> Self {
        Self {
            lifecycle: Mutex::new(()),
            running: RwLock::new(None),
            controller: Arc::new(ProxyModeController::default()),
            events: Arc::new(EventBus::new()),
            buffer: RwLock::new(None),
        }
    }

    /// Binds the listeners and starts accepting. Returns once they are live.
    pub async fn start(&self, config: ServerConfig) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.running.read().is_some() {
            self.publish_error("start requested while the server is already running");
            return Err(GofwError::AlreadyRunning);
        }

        match self.launch(config).await {
            Ok(running) => {
                *self.running.write() = Some(running);
                Ok(())
            }
            Err(e) => {
                self.publish_error(&format!("failed to start: {}", e));
                Err(e)
            }
        }
    }

    async fn launch(&self, config: ServerConfig) -> Result<RunningServer> {
        config.validate()?;

        let buffer = Arc::new(LogBuffer::new(config.buffer_size));
        let mut logger = Logger::new(config.level()?, buffer.clone(), self.events.clone());
        if config.logging.file_enabled {
            logger = logger.with_file(&config.logging.file_path)?;
        }
        let logger = Arc::new(logger);

        let classifier = RouteClassifier::load(&config.route_source()?);
        for skipped in classifier.skipped() {
            logger.warn(&format!(
                "route list line {}: skipped {:?}: {}",
                skipped.line, skipped.text, skipped.reason
            ));
        }
        let ca = CertificateAuthority::from_config(&config.mitm)?;

        let control_addr = config.control_bind_addr()?;
        let listener = TcpListener::bind(control_addr).await.map_err(|e| GofwError::Bind {
            addr: control_addr.to_string(),
            source: e,
        })?;
        let local_addr = listener.local_addr()?;

        // the upstream role takes datagrams on the control port number
        let data_bind = match config.role {
            Role::Client => config.data_bind_addr()?,
            Role::Server => Some(local_addr),
        };
        let udp_socket = match data_bind {
            Some(addr) => Some(UdpSocket::bind(addr).await.map_err(|e| GofwError::Bind {
                addr: addr.to_string(),
                source: e,
            })?),
            None => None,
        };
        let data_addr = match udp_socket {
            Some(ref socket) => Some(socket.local_addr()?),
            None => None,
        };

        let snapshot = ModeSnapshot {
            mode: config.proxy_mode,
            mitm: config.mitm.enabled,
            policy: config.route_policy,
        };
        self.controller.reset(snapshot);

        let upstream = if config.role == Role::Server || config.upstream.trim().is_empty() {
            None
        } else {
            let (host, port) = config.upstream_target()?;
            Some(Target::new(host, port).to_string())
        };

        let cancel = CancellationToken::new();
        let ctx = Arc::new(SessionContext {
            role: config.role,
            auth: config.credential().map(str::to_string),
            upstream,
            key: config.key.as_bytes().to_vec(),
            partial: config.partial,
            timeouts: config.timeouts.clone(),
            classifier: Arc::new(classifier),
            dns: Arc::new(DnsCache::new(config.dns_cache_size)),
            ca: Some(Arc::new(ca)),
            data_addr,
            grants: Arc::new(UdpGrants::new()),
            logger: logger.clone(),
            cancel,
        });
        let registry = Arc::new(SessionRegistry::new());

        let accept_task = tokio::spawn(accept_loop(
            listener,
            ctx.clone(),
            registry.clone(),
            self.controller.clone(),
            config.max_connections,
        ));

        let udp_task = udp_socket.map(|socket| match config.role {
            Role::Client => tokio::spawn(udp::serve(socket, ctx.clone(), self.controller.clone())),
            Role::Server => tokio::spawn(udp::serve_sealed(socket, ctx.clone())),
        });

        let nickname = nickname_for(&config);
        *self.buffer.write() = Some(buffer);

        let surface = match config.role {
            Role::Client => format!(
                "mode {}, policy {:?}, mitm {}",
                snapshot.mode,
                snapshot.policy,
                if snapshot.mitm { "on" } else { "off" }
            ),
            Role::Server => "upstream role".to_string(),
        };
        logger.always(
            LogLevel::Info,
            &format!(
                "{} {} started: nickname {}, listening on {}{}, {}",
                crate::NAME,
                crate::VERSION,
                nickname,
                local_addr,
                data_addr.map(|a| format!(", data on {}", a)).unwrap_or_default(),
                surface,
            ),
        );

        Ok(RunningServer {
            ctx,
            registry,
            accept_task,
            udp_task,
            local_addr,
            data_addr,
            nickname,
            config,
        })
    }

    /// Cancels every worker, waits up to the drain timeout for sessions to
    /// finish, then aborts the rest. Returns false when nothing was running.
    pub async fn stop(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(running) = self.running.write().take() else {
            return false;
        };

        let logger = running.ctx.logger.clone();
        logger.info(&format!("stopping, {} active sessions", running.registry.len()));
        running.ctx.cancel.cancel();

        let drain = running.config.timeouts.drain();
        if !running.registry.wait_empty(drain).await {
            let aborted = running.registry.abort_all();
            logger.warn(&format!(
                "{} sessions still open after {:?}, aborted",
                aborted, drain
            ));
        }

        let _ = running.accept_task.await;
        if let Some(task) = running.udp_task {
            let _ = task.await;
        }

        logger.info("stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.read().is_some()
    }

    /// `<alias>@<upstream>` of the running instance.
    pub fn nickname(&self) -> Option<String> {
        self.running.read().as_ref().map(|r| r.nickname.clone())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.read().as_ref().map(|r| r.local_addr)
    }

    pub fn data_addr(&self) -> Option<SocketAddr> {
        self.running.read().as_ref().and_then(|r| r.data_addr)
    }

    pub fn config(&self) -> Option<ServerConfig> {
        self.running.read().as_ref().map(|r| r.config.clone())
    }

    /// DER of the interception CA of the running instance, for clients that
    /// need to trust intercepted sessions.
    pub fn ca_certificate(&self) -> Option<Vec<u8>> {
        let running = self.running.read();
        let ca = running.as_ref()?.ctx.ca.as_ref()?;
        Some(ca.ca_der().to_vec())
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.running
            .read()
            .as_ref()
            .map(|r| r.registry.snapshot())
            .unwrap_or_default()
    }

    /// Buffer of the current run, or of the last one after a stop. `None`
    /// until the first successful start.
    pub fn log_buffer(&self) -> Option<Arc<LogBuffer>> {
        self.buffer.read().clone()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn controller(&self) -> &Arc<ProxyModeController> {
        &self.controller
    }

    pub fn mode_snapshot(&self) -> ModeSnapshot {
        self.controller.snapshot()
    }

    /// Applies a mode or route policy code; returns the code it replaced.
    pub fn switch_proxy_type(&self, code: i32) -> Result<i32> {
        let previous = self.controller.switch_code(code)?;
        if let Some(logger) = self.logger() {
            logger.info(&format!("proxy type switched from {:#x} to {:#x}", previous, code));
        }
        Ok(previous)
    }

    pub fn set_mitm(&self, enabled: bool) -> bool {
        let previous = self.controller.set_mitm(enabled);
        if let Some(logger) = self.logger() {
            logger.info(&format!("mitm {}", if enabled { "enabled" } else { "disabled" }));
        }
        previous
    }

    fn logger(&self) -> Option<Arc<Logger>> {
        self.running.read().as_ref().map(|r| r.ctx.logger.clone())
    }

    fn publish_error(&self, message: &str) {
        log::error!("{}", message);
        self.events.publish(&LogEvent {
            timestamp: unix_nanos(),
            level: LogLevel::Error,
            message: message.to_string(),
        });
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    registry: Arc<SessionRegistry>,
    controller: Arc<ProxyModeController>,
    max_connections: u32,
) {
    let max_conn = max_connections as usize;
    let semaphore = Arc::new(Semaphore::new(if max_conn == 0 {
        Semaphore::MAX_PERMITS
    } else {
        max_conn
    }));

    loop {
        let accepted = tokio::select! {
            r = listener.accept() => r,
            _ = ctx.cancel.cancelled() => break,
        };

        match accepted {
            Ok((socket, peer_addr)) => {
                let permit = match Arc::clone(&semaphore).try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        ctx.logger.warn(&format!(
                            "connection limit ({}) reached, dropping {}",
                            max_conn, peer_addr
                        ));
                        drop(socket);
                        continue;
                    }
                };
                let _ = socket.set_nodelay(true);

                let snapshot = controller.snapshot();
                let registration = registry.register(peer_addr, snapshot);
                let id = registration.id();
                let session = TunnelSession::new(registration, peer_addr, snapshot, ctx.clone());

                let handle = tokio::spawn(async move {
                    let _permit = permit;
                    session.run(socket).await;
                });
                registry.attach(id, handle.abort_handle());
            }
            Err(e) => {
                ctx.logger.warn(&format!("accept error: {}", e));
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }

    log::debug!("accept loop on {:?} stopped", listener.local_addr().ok());
}

/// Seven hex characters derived from the key, or random ones for an empty
/// key, followed by the upstream address.
pub fn nickname_for(config: &ServerConfig) -> String {
    let alias: String = if config.key.is_empty() {
        random_hex(ALIAS_LEN)
    } else {
        hex_string(&Sha256::digest(config.key.as_bytes())).chars().take(ALIAS_LEN).collect()
    };

    let upstream = match config.role {
        Role::Client => config.upstream.trim(),
        Role::Server => "",
    };
    if upstream.is_empty() {
        format!("{}@direct", alias)
    } else {
        format!("{}@{}", alias, upstream)
    }
}
