//! Datagram relay on the data port.
//!
//! In the client role, senders speak SOCKS5 UDP request datagrams and must hold
//! a live UDP ASSOCIATE grant. In the upstream role, peers send the same
//! datagrams sealed with the shared key. Each sender gets its own outbound
//! socket and task, so replies match without per-packet state and a slow
//! lookup only delays the sender that caused it.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{GofwError, Result};
use crate::mode::ProxyModeController;
use crate::protocol::socks5::{decode_udp_header, encode_udp_header};
use crate::protocol::Target;
use crate::router::RouteAction;
use crate::tunnel::upstream::{open_datagram, seal_datagram};
use crate::tunnel::SessionContext;

const MAX_DATAGRAM: usize = 64 * 1024;
const QUEUE_DEPTH: usize = 64;

#[derive(Clone)]
enum Ingress {
    /// Plain datagrams from granted clients, routed by the current policy.
    Socks(Arc<ProxyModeController>),
    /// Sealed datagrams from downstream instances, always sent direct.
    Sealed,
}

struct Association {
    queue: mpsc::Sender<Vec<u8>>,
    created: Instant,
    last_seen: AtomicU64,
}

impl Association {
    fn touch(&self) {
        self.last_seen
            .store(self.created.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        self.created
            .elapsed()
            .saturating_sub(Duration::from_millis(self.last_seen.load(Ordering::Relaxed)))
    }
}

type Associations = Arc<DashMap<SocketAddr, Arc<Association>>>;

/// Client role. Runs until the context's cancellation token fires.
pub async fn serve(socket: UdpSocket, ctx: Arc<SessionContext>, controller: Arc<ProxyModeController>) {
    run(socket, ctx, Ingress::Socks(controller)).await
}

/// Upstream role. Runs until the context's cancellation token fires.
pub async fn serve_sealed(socket: UdpSocket, ctx: Arc<SessionContext>) {
    run(socket, ctx, Ingress::Sealed).await
}

async fn run(socket: UdpSocket, ctx: Arc<SessionContext>, ingress: Ingress) {
    let socket = Arc::new(socket);
    let associations: Associations = Arc::new(DashMap::new());
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let received = tokio::select! {
            r = socket.recv_from(&mut buf) => r,
            _ = ctx.cancel.cancelled() => break,
        };
        let (n, client) = match received {
            Ok(v) => v,
            Err(e) => {
                log::debug!("udp receive error: {}", e);
                continue;
            }
        };

        let datagram = match ingress {
            Ingress::Socks(_) => buf[..n].to_vec(),
            Ingress::Sealed => match open_datagram(&ctx.key, &buf[..n]) {
                Ok(plain) => plain,
                Err(e) => {
                    ctx.logger.debug(&format!("udp: dropping datagram from {}: {}", client, e));
                    continue;
                }
            },
        };

        let association = match associations.get(&client).map(|a| a.clone()) {
            Some(existing) => existing,
            None => {
                let revoked = match ingress {
                    Ingress::Socks(_) => match ctx.grants.authorize(client) {
                        Some(token) => token,
                        None => {
                            ctx.logger
                                .debug(&format!("udp: dropping datagram from {}: no association", client));
                            continue;
                        }
                    },
                    Ingress::Sealed => ctx.cancel.child_token(),
                };
                match associate(&socket, client, revoked, &ctx, &ingress, &associations) {
                    Ok(created) => created,
                    Err(e) => {
                        ctx.logger.warn(&format!("udp: cannot open association for {}: {}", client, e));
                        continue;
                    }
                }
            }
        };
        association.touch();
        if association.queue.try_send(datagram).is_err() {
            ctx.logger.debug(&format!("udp: queue for {} is full, dropping datagram", client));
        }
    }

    associations.clear();
    ctx.logger.debug("udp data channel stopped");
}

fn associate(
    listener: &Arc<UdpSocket>,
    client: SocketAddr,
    revoked: CancellationToken,
    ctx: &Arc<SessionContext>,
    ingress: &Ingress,
    associations: &Associations,
) -> Result<Arc<Association>> {
    let bind_addr: SocketAddr = if listener.local_addr()?.is_ipv6() {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    };
    let outbound = std::net::UdpSocket::bind(bind_addr)?;
    outbound.set_nonblocking(true)?;
    let outbound = UdpSocket::from_std(outbound)?;

    let (queue, datagrams) = mpsc::channel(QUEUE_DEPTH);
    let association = Arc::new(Association {
        queue,
        created: Instant::now(),
        last_seen: AtomicU64::new(0),
    });
    associations.insert(client, association.clone());
    ctx.logger.debug(&format!("udp: new association for {}", client));

    let pump = Pump {
        listener: listener.clone(),
        outbound,
        client,
        association: association.clone(),
        revoked,
        ingress: ingress.clone(),
        ctx: ctx.clone(),
        upstream: None,
    };
    let associations = associations.clone();
    tokio::spawn(async move {
        pump.run(datagrams).await;
        associations.remove(&client);
    });
    Ok(association)
}

enum Event {
    Outgoing(Vec<u8>),
    Reply(usize, SocketAddr),
    Failed(std::io::Error),
    Quiet,
    Closed,
}

/// One sender's outbound socket: forwards its queued datagrams and returns
/// whatever comes back, until the sender goes quiet or loses its grant.
struct Pump {
    listener: Arc<UdpSocket>,
    outbound: UdpSocket,
    client: SocketAddr,
    association: Arc<Association>,
    revoked: CancellationToken,
    ingress: Ingress,
    ctx: Arc<SessionContext>,
    /// Resolved on the first datagram routed through the upstream.
    upstream: Option<SocketAddr>,
}

impl Pump {
    async fn run(mut self, mut datagrams: mpsc::Receiver<Vec<u8>>) {
        let idle = self.ctx.timeouts.idle();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let event = tokio::select! {
                d = datagrams.recv() => d.map_or(Event::Closed, Event::Outgoing),
                r = timeout(idle, self.outbound.recv_from(&mut buf)) => match r {
                    Ok(Ok((n, from))) => Event::Reply(n, from),
                    Ok(Err(e)) => Event::Failed(e),
                    Err(_) => Event::Quiet,
                },
                _ = self.revoked.cancelled() => Event::Closed,
                _ = self.ctx.cancel.cancelled() => Event::Closed,
            };

            match event {
                Event::Outgoing(datagram) => {
                    if let Err(e) = self.forward(&datagram).await {
                        self.ctx
                            .logger
                            .debug(&format!("udp: datagram from {} not forwarded: {}", self.client, e));
                    }
                }
                Event::Reply(n, from) => {
                    self.association.touch();
                    if let Err(e) = self.reply(&buf[..n], from).await {
                        self.ctx
                            .logger
                            .debug(&format!("udp: reply from {} to {} dropped: {}", from, self.client, e));
                    }
                }
                Event::Failed(e) => log::debug!("udp association {} receive error: {}", self.client, e),
                Event::Quiet => {
                    if self.association.idle_for() >= idle {
                        break;
                    }
                }
                Event::Closed => break,
            }
        }

        self.ctx
            .logger
            .debug(&format!("udp: association for {} closed", self.client));
    }

    /// `datagram` is a SOCKS5 UDP header followed by the payload.
    async fn forward(&mut self, datagram: &[u8]) -> Result<()> {
        let (target, payload) = decode_udp_header(datagram)?;
        let route = match self.ingress {
            Ingress::Socks(ref controller) => self.ctx.route(&target, controller.snapshot().policy).await,
            Ingress::Sealed => RouteAction::Direct,
        };

        match route {
            RouteAction::Direct => {
                let addr = tokio::net::lookup_host((target.host.as_str(), target.port))
                    .await?
                    .next()
                    .ok_or_else(|| GofwError::DestinationUnreachable {
                        addr: target.to_string(),
                        reason: "no address".to_string(),
                    })?;
                self.outbound.send_to(payload, addr).await?;
            }
            RouteAction::ViaUpstream => {
                let upstream = match self.upstream {
                    Some(addr) => addr,
                    None => {
                        let addr = resolve_upstream(&self.ctx).await?;
                        self.upstream = Some(addr);
                        addr
                    }
                };
                let sealed = seal_datagram(&self.ctx.key, datagram)?;
                self.outbound.send_to(&sealed, upstream).await?;
            }
        }
        Ok(())
    }

    async fn reply(&self, data: &[u8], from: SocketAddr) -> Result<()> {
        let plain = if Some(from) == self.upstream {
            // already carries the source header
            open_datagram(&self.ctx.key, data)?
        } else {
            let mut plain = encode_udp_header(&Target::new(from.ip().to_string(), from.port()));
            plain.extend_from_slice(data);
            plain
        };
        let out = match self.ingress {
            Ingress::Socks(_) => plain,
            Ingress::Sealed => seal_datagram(&self.ctx.key, &plain)?,
        };
        self.listener.send_to(&out, self.client).await?;
        Ok(())
    }
}

async fn resolve_upstream(ctx: &SessionContext) -> Result<SocketAddr> {
    let upstream = ctx.upstream.as_deref().ok_or_else(|| GofwError::UpstreamUnreachable {
        addr: String::new(),
        reason: "no upstream configured".to_string(),
    })?;
    let unreachable = |reason: String| GofwError::UpstreamUnreachable {
        addr: upstream.to_string(),
        reason,
    };
    tokio::net::lookup_host(upstream)
        .await
        .map_err(|e| unreachable(e.to_string()))?
        .next()
        .ok_or_else(|| unreachable("no address".to_string()))
}
