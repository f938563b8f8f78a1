mod channel;
mod forward;
pub mod mitm;
pub mod registry;
pub mod relay;
pub mod upstream;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

pub use mitm::CertificateAuthority;
pub use registry::{RegistrationGuard, SessionInfo, SessionRegistry, UdpGrant, UdpGrants};
pub use relay::{relay, RelayOutcome};

use crate::config::{Role, TimeoutConfig};
use crate::error::{GofwError, Result};
use crate::logger::{LogLevel, Logger};
use crate::mode::{ModeSnapshot, ProxyMode, RoutePolicy};
use crate::protocol::sniff::{self, Sniffed};
use crate::protocol::{http, socks5, Target};
use crate::router::{is_private, DnsCache, RouteAction, RouteClassifier};
use crate::utils::{format_bytes, format_duration};

/// How long a CONNECT / SOCKS client gets to start its TLS handshake before
/// interception is skipped.
const CLIENT_HELLO_WAIT: Duration = Duration::from_millis(800);

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Outbound leg of a session: a direct TCP stream or an upstream channel.
pub type BoxedStream = Box<dyn AsyncStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    Handshaking,
    Authenticating,
    Routing,
    Relaying,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Accepted => "accepted",
            SessionState::Handshaking => "handshaking",
            SessionState::Authenticating => "authenticating",
            SessionState::Routing => "routing",
            SessionState::Relaying => "relaying",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Everything a session needs from the server that spawned it. Built once per
/// start and shared by all sessions of that run.
pub struct SessionContext {
    pub role: Role,
    /// `user:pass` required from clients, also presented to the upstream.
    pub auth: Option<String>,
    pub upstream: Option<String>,
    pub key: Vec<u8>,
    pub partial: bool,
    pub timeouts: TimeoutConfig,
    pub classifier: Arc<RouteClassifier>,
    pub dns: Arc<DnsCache>,
    pub ca: Option<Arc<CertificateAuthority>>,
    /// Where the UDP relay listens, when it runs.
    pub data_addr: Option<SocketAddr>,
    pub grants: Arc<UdpGrants>,
    pub logger: Arc<Logger>,
    pub cancel: CancellationToken,
}

impl SessionContext {
    /// Decides the path for `target` under `policy`.
    pub async fn route(&self, target: &Target, policy: RoutePolicy) -> RouteAction {
        let private = target.host.eq_ignore_ascii_case("localhost") || target.ip().is_some_and(is_private);
        match policy {
            RoutePolicy::None => RouteAction::Direct,
            _ if private => RouteAction::Direct,
            RoutePolicy::Global => RouteAction::ViaUpstream,
            RoutePolicy::IpList => {
                if let Some(ip) = target.ip() {
                    return self.classifier.classify_ip(ip);
                }
                let by_name = self.classifier.classify_detailed(&target.host);
                if by_name.matched.is_some() || !self.classifier.has_cidr_rules() {
                    return by_name.action;
                }
                match self.dns.resolve(&target.host).await {
                    Ok(ip) if is_private(ip) => RouteAction::Direct,
                    Ok(ip) => self.classifier.classify_ip(ip),
                    Err(e) => {
                        log::debug!("resolving {} for routing failed: {}", target.host, e);
                        by_name.action
                    }
                }
            }
        }
    }

    pub async fn connect(&self, target: &Target, route: RouteAction) -> Result<BoxedStream> {
        match route {
            RouteAction::Direct => {
                let unreachable = |reason: String| GofwError::DestinationUnreachable {
                    addr: target.to_string(),
                    reason,
                };
                let stream = timeout(
                    self.timeouts.connect(),
                    TcpStream::connect((target.host.as_str(), target.port)),
                )
                .await
                .map_err(|_| unreachable("connect timed out".to_string()))?
                .map_err(|e| unreachable(e.to_string()))?;
                let _ = stream.set_nodelay(true);
                Ok(Box::new(stream))
            }
            RouteAction::ViaUpstream => {
                let upstream = self.upstream.as_deref().ok_or_else(|| GofwError::UpstreamUnreachable {
                    addr: String::new(),
                    reason: "no upstream configured".to_string(),
                })?;
                let channel = upstream::connect_upstream(
                    upstream,
                    &self.key,
                    target,
                    self.auth.as_deref().unwrap_or(""),
                    self.timeouts.connect(),
                )
                .await?;
                Ok(Box::new(channel.into_stream()))
            }
        }
    }
}

/// How the client expects to hear about the outcome of its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    Silent,
    Socks,
    HttpTunnel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FirstBytes {
    /// Not seen yet; the client speaks after our reply.
    Unknown,
    ClientHello { sni: String },
    Plain,
}

struct Opening {
    target: Target,
    /// Bytes already taken from the client that belong to the destination.
    preface: Vec<u8>,
    reply: Reply,
    first: FirstBytes,
}

enum Opened {
    /// One destination for the rest of the connection.
    Tunnel(Opening),
    /// Plain-HTTP proxy requests, routed one by one.
    Forward(forward::ForwardRequest),
    /// SOCKS5 UDP ASSOCIATE; the target is the client's declared endpoint.
    Associate(Target),
}

/// One client connection, from accept to close.
pub struct TunnelSession {
    id: u64,
    client: SocketAddr,
    snapshot: ModeSnapshot,
    state: SessionState,
    target: Option<Target>,
    route: Option<RouteAction>,
    started: Instant,
    ctx: Arc<SessionContext>,
    registration: RegistrationGuard,
}

impl TunnelSession {
    /// `snapshot` is the mode in force when the connection was accepted; later
    /// switches never reach this session.
    pub fn new(registration: RegistrationGuard, client: SocketAddr, snapshot: ModeSnapshot, ctx: Arc<SessionContext>) -> Self {
        TunnelSession {
            id: registration.id(),
            client,
            snapshot,
            state: SessionState::Accepted,
            target: None,
            route: None,
            started: Instant::now(),
            ctx,
            registration,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn snapshot(&self) -> ModeSnapshot {
        self.snapshot
    }

    fn transition(&mut self, state: SessionState) {
        log::trace!("session {} {} -> {}", self.id, self.state, state);
        self.state = state;
        let target = self.target.clone();
        let route = self.route;
        self.registration.registry().update(self.id, |info| {
            info.state = state;
            info.target = target;
            info.route = route;
        });
    }

    /// Drives the session to a terminal state and returns it.
    pub async fn run(mut self, client: TcpStream) -> SessionState {
        let cancel = self.ctx.cancel.clone();
        let outcome = tokio::select! {
            biased;
            r = self.drive(client) => r,
            _ = cancel.cancelled() => Err(GofwError::protocol("server stopping")),
        };

        self.transition(SessionState::Closing);
        let final_state = match outcome {
            Ok(relay) => {
                self.report_relay(&relay);
                SessionState::Closed
            }
            Err(e) => {
                self.report_failure(&e);
                SessionState::Failed
            }
        };
        self.transition(final_state);
        final_state
    }

    async fn drive(&mut self, mut client: TcpStream) -> Result<RelayOutcome> {
        self.transition(SessionState::Handshaking);
        if self.ctx.role == Role::Server {
            return self.serve_channel(client).await;
        }
        let opened = timeout(self.ctx.timeouts.handshake(), self.handshake(&mut client))
            .await
            .map_err(|_| GofwError::protocol("handshake timed out"))??;

        match opened {
            Opened::Tunnel(opening) => self.tunnel(client, opening).await,
            Opened::Forward(request) => self.forward(client, request).await,
            Opened::Associate(declared) => self.associate(client, declared).await,
        }
    }

    /// Opens the data port to this client for as long as the control
    /// connection stays up.
    async fn associate(&mut self, mut client: TcpStream, declared: Target) -> Result<RelayOutcome> {
        let Some(data_addr) = self.ctx.data_addr else {
            let _ = socks5::write_reply(&mut client, socks5::REP_CMD_NOT_SUPPORTED).await;
            return Err(GofwError::protocol("udp associate requested but no data port is open"));
        };
        let bound = if data_addr.ip().is_unspecified() {
            SocketAddr::new(client.local_addr()?.ip(), data_addr.port())
        } else {
            data_addr
        };

        let _grant = self.ctx.grants.grant(self.id, self.client.ip(), declared.port);
        self.target = Some(Target::new(bound.ip().to_string(), bound.port()));
        socks5::write_bound_reply(&mut client, socks5::REP_SUCCESS, bound).await?;
        self.transition(SessionState::Relaying);
        self.ctx.logger.debug(&format!(
            "session {}: udp association for {} on {}",
            self.id,
            SocketAddr::new(self.client.ip(), declared.port),
            bound
        ));

        let mut up = 0u64;
        let mut buf = [0u8; 512];
        let result = loop {
            match client.read(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(n) => up += n as u64,
                Err(e) => break Err(e),
            }
        };
        Ok(RelayOutcome { up, down: 0, result })
    }

    async fn tunnel(&mut self, mut client: TcpStream, opening: Opening) -> Result<RelayOutcome> {
        let target = opening.target.clone();
        self.target = Some(target.clone());
        self.transition(SessionState::Routing);
        let route = self.ctx.route(&target, self.snapshot.policy).await;
        self.route = Some(route);
        self.ctx
            .logger
            .debug(&format!("session {}: {} -> {} via {}", self.id, self.client, target, route));

        let mut outbound = match self.ctx.connect(&target, route).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = send_failure(&mut client, opening.reply, &e).await;
                return Err(e);
            }
        };
        send_success(&mut client, opening.reply).await?;

        let sni = self.interception_host(&client, &opening).await;
        self.transition(SessionState::Relaying);
        let idle = self.ctx.timeouts.idle();
        let cancel = self.ctx.cancel.clone();

        match (sni, self.ctx.ca.clone()) {
            (Some(host), Some(ca)) => {
                self.ctx.logger.debug(&format!("session {}: intercepting TLS for {}", self.id, host));
                let (inbound, outbound) = mitm::intercept(&ca, client, outbound, &host).await?;
                Ok(relay(inbound, outbound, idle, &cancel).await)
            }
            _ => {
                if !opening.preface.is_empty() {
                    outbound.write_all(&opening.preface).await?;
                }
                let mut outcome = relay(client, outbound, idle, &cancel).await;
                outcome.up += opening.preface.len() as u64;
                Ok(outcome)
            }
        }
    }

    async fn handshake(&mut self, client: &mut TcpStream) -> Result<Opened> {
        match self.snapshot.mode {
            ProxyMode::Socks => self.socks_handshake(client).await,
            ProxyMode::HttpConnect => self.http_handshake(client).await,
            ProxyMode::Relay | ProxyMode::TransparentMitm => {
                let sniffed = sniff::peek_destination(client, self.ctx.timeouts.handshake()).await?;
                let first = match sniffed {
                    Sniffed::Tls { ref target } => FirstBytes::ClientHello {
                        sni: target.host.clone(),
                    },
                    Sniffed::Http { .. } => FirstBytes::Plain,
                };
                Ok(Opened::Tunnel(Opening {
                    target: sniffed.target().clone(),
                    preface: Vec::new(),
                    reply: Reply::Silent,
                    first,
                }))
            }
        }
    }

    async fn socks_handshake(&mut self, client: &mut TcpStream) -> Result<Opened> {
        let methods = socks5::read_greeting(client).await?;

        match self.ctx.auth.clone() {
            Some(expected) => {
                if !methods.contains(&socks5::METHOD_USER_PASS) {
                    socks5::select_method(client, socks5::METHOD_NONE_ACCEPTABLE).await?;
                    return Err(GofwError::AuthRejected);
                }
                socks5::select_method(client, socks5::METHOD_USER_PASS).await?;
                self.transition(SessionState::Authenticating);
                let offered = socks5::read_credentials(client).await?;
                let ok = offered == expected;
                socks5::write_auth_status(client, ok).await?;
                if !ok {
                    return Err(GofwError::AuthRejected);
                }
            }
            None => {
                if !methods.contains(&socks5::METHOD_NO_AUTH) {
                    socks5::select_method(client, socks5::METHOD_NONE_ACCEPTABLE).await?;
                    return Err(GofwError::protocol("client offers no usable auth method"));
                }
                socks5::select_method(client, socks5::METHOD_NO_AUTH).await?;
            }
        }

        let request = socks5::read_request(client).await?;
        Ok(match request.command {
            socks5::Command::Connect => Opened::Tunnel(Opening {
                target: request.target,
                preface: Vec::new(),
                reply: Reply::Socks,
                first: FirstBytes::Unknown,
            }),
            socks5::Command::UdpAssociate => Opened::Associate(request.target),
        })
    }

    async fn http_handshake(&mut self, client: &mut TcpStream) -> Result<Opened> {
        let (raw, leftover) = http::read_head(client).await?;
        let head = match http::parse_head(&raw) {
            Ok(head) => head,
            Err(e) => {
                let _ = client.write_all(http::RESPONSE_BAD_REQUEST).await;
                return Err(e);
            }
        };

        if let Some(expected) = self.ctx.auth.clone() {
            self.transition(SessionState::Authenticating);
            if !http::check_proxy_auth(&head, &expected) {
                let _ = client.write_all(http::RESPONSE_AUTH_REQUIRED).await;
                return Err(GofwError::AuthRejected);
            }
        }

        let request = match http::interpret(&head) {
            Ok(request) => request,
            Err(e) => {
                let _ = client.write_all(http::RESPONSE_BAD_REQUEST).await;
                return Err(e);
            }
        };

        Ok(match request {
            http::ProxyRequest::Connect { target } => {
                let first = if leftover.is_empty() { FirstBytes::Unknown } else { FirstBytes::Plain };
                Opened::Tunnel(Opening {
                    target,
                    preface: leftover,
                    reply: Reply::HttpTunnel,
                    first,
                })
            }
            http::ProxyRequest::Forward { target, head, body } => Opened::Forward(forward::ForwardRequest {
                target,
                head,
                body,
                leftover,
            }),
        })
    }

    /// Host to mint a leaf for, when this session's TLS is to be terminated.
    async fn interception_host(&self, client: &TcpStream, opening: &Opening) -> Option<String> {
        if !self.snapshot.intercepts_tls() || self.ctx.ca.is_none() {
            return None;
        }
        match opening.first {
            FirstBytes::ClientHello { ref sni } => Some(sni.clone()),
            FirstBytes::Plain => None,
            FirstBytes::Unknown => match sniff::peek_destination(client, CLIENT_HELLO_WAIT).await {
                Ok(Sniffed::Tls { target }) => Some(target.host),
                _ => None,
            },
        }
    }

    fn describe(&self) -> String {
        let target = self.target.as_ref().map_or_else(|| "?".to_string(), |t| t.to_string());
        match self.route {
            Some(route) => format!("{} -> {} ({})", self.client, target, route),
            None => format!("{} -> {}", self.client, target),
        }
    }

    fn report_relay(&self, outcome: &RelayOutcome) {
        let logger = &self.ctx.logger;
        if let Err(ref e) = outcome.result {
            let level = if outcome.truncated() && self.ctx.partial {
                LogLevel::Info
            } else if e.kind() == std::io::ErrorKind::Interrupted {
                LogLevel::Debug
            } else {
                LogLevel::Warn
            };
            logger.log(level, &format!("session {}: relay ended early: {}", self.id, e));
        }

        logger.info(&format!(
            "session {} closed: {}, up {}, down {}, {}",
            self.id,
            self.describe(),
            format_bytes(outcome.up),
            format_bytes(outcome.down),
            format_duration(self.started.elapsed()),
        ));
    }

    fn report_failure(&self, error: &GofwError) {
        let level = match error {
            GofwError::UpstreamUnreachable { .. } => LogLevel::Error,
            GofwError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => LogLevel::Debug,
            _ => LogLevel::Warn,
        };
        self.ctx.logger.log(
            level,
            &format!("session {} failed in {}: {}: {}", self.id, self.state, self.describe(), error),
        );
    }
}

async fn send_success(client: &mut TcpStream, reply: Reply) -> Result<()> {
    match reply {
        Reply::Silent => Ok(()),
        Reply::Socks => socks5::write_reply(client, socks5::REP_SUCCESS).await,
        Reply::HttpTunnel => {
            client.write_all(http::RESPONSE_ESTABLISHED).await?;
            Ok(())
        }
    }
}

async fn send_failure(client: &mut TcpStream, reply: Reply, error: &GofwError) -> Result<()> {
    match reply {
        Reply::Socks => {
            let rep = match error {
                GofwError::DestinationUnreachable { reason, .. } if reason.contains("refused") => socks5::REP_CONN_REFUSED,
                GofwError::DestinationUnreachable { .. } => socks5::REP_HOST_UNREACHABLE,
                _ => socks5::REP_GENERAL_FAILURE,
            };
            socks5::write_reply(client, rep).await
        }
        Reply::HttpTunnel => {
            client.write_all(http::RESPONSE_BAD_GATEWAY).await?;
            Ok(())
        }
        Reply::Silent => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::{EventBus, LogBuffer};

    fn context(route_list: &str) -> SessionContext {
        SessionContext {
            role: Role::Client,
            auth: None,
            upstream: Some("127.0.0.1:1".to_string()),
            key: b"k".to_vec(),
            partial: false,
            timeouts: TimeoutConfig::default(),
            classifier: Arc::new(RouteClassifier::load(route_list)),
            dns: Arc::new(DnsCache::new(16)),
            ca: None,
            data_addr: None,
            grants: Arc::new(UdpGrants::new()),
            logger: Arc::new(Logger::new(None, Arc::new(LogBuffer::new(8)), Arc::new(EventBus::new()))),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_route_policy_overrides_list() {
        let ctx = context("example.com");
        let target = Target::new("example.com", 443);
        assert_eq!(ctx.route(&target, RoutePolicy::IpList).await, RouteAction::Direct);
        assert_eq!(ctx.route(&target, RoutePolicy::Global).await, RouteAction::ViaUpstream);
        assert_eq!(ctx.route(&Target::new("other.org", 443), RoutePolicy::None).await, RouteAction::Direct);
    }

    #[tokio::test]
    async fn test_private_targets_stay_direct() {
        let ctx = context("");
        assert_eq!(ctx.route(&Target::new("192.168.1.10", 80), RoutePolicy::Global).await, RouteAction::Direct);
        assert_eq!(ctx.route(&Target::new("localhost", 80), RoutePolicy::IpList).await, RouteAction::Direct);
        assert_eq!(ctx.route(&Target::new("8.8.8.8", 53), RoutePolicy::IpList).await, RouteAction::ViaUpstream);
    }

    #[tokio::test]
    async fn test_cidr_only_list_uses_dns_cache() {
        let ctx = context("[proxy_list]\n203.0.113.0/24\n[bypass_list]\n198.51.100.0/24");
        ctx.dns.insert("cached.test", "198.51.100.7".parse().unwrap());
        assert_eq!(ctx.route(&Target::new("cached.test", 443), RoutePolicy::IpList).await, RouteAction::Direct);
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Closed.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Relaying.is_terminal());
    }
}
