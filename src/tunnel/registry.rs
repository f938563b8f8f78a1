use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use super::SessionState;
use crate::mode::ModeSnapshot;
use crate::protocol::Target;
use crate::router::RouteAction;

/// Point-in-time view of a live session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: u64,
    pub client: SocketAddr,
    pub snapshot: ModeSnapshot,
    pub state: SessionState,
    pub target: Option<Target>,
    pub route: Option<RouteAction>,
    pub started: Instant,
}

struct Entry {
    info: SessionInfo,
    abort: Option<AbortHandle>,
}

/// Live sessions of one server instance.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<u64, Entry>,
    next_id: AtomicU64,
    emptied: Notify,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an id and records the session as `Accepted`. The returned
    /// guard unregisters the session when dropped, including on abort.
    pub fn register(self: &Arc<Self>, client: SocketAddr, snapshot: ModeSnapshot) -> RegistrationGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.sessions.insert(
            id,
            Entry {
                info: SessionInfo {
                    id,
                    client,
                    snapshot,
                    state: SessionState::Accepted,
                    target: None,
                    route: None,
                    started: Instant::now(),
                },
                abort: None,
            },
        );
        RegistrationGuard {
            registry: self.clone(),
            id,
        }
    }

    pub fn attach(&self, id: u64, handle: AbortHandle) {
        if let Some(mut entry) = self.sessions.get_mut(&id) {
            entry.abort = Some(handle);
        }
    }

    pub fn update(&self, id: u64, f: impl FnOnce(&mut SessionInfo)) {
        if let Some(mut entry) = self.sessions.get_mut(&id) {
            f(&mut entry.info);
        }
    }

    pub fn get(&self, id: u64) -> Option<SessionInfo> {
        self.sessions.get(&id).map(|e| e.info.clone())
    }

    fn remove(&self, id: u64) {
        self.sessions.remove(&id);
        if self.sessions.is_empty() {
            self.emptied.notify_waiters();
        }
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.sessions.iter().map(|e| e.info.clone()).collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Waits until no session is registered. Returns false on timeout.
    pub async fn wait_empty(&self, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let emptied = self.emptied.notified();
            if self.is_empty() {
                return true;
            }
            tokio::select! {
                _ = emptied => {}
                _ = tokio::time::sleep_until(deadline) => return self.is_empty(),
            }
        }
    }

    /// Aborts every session task still running; returns how many were hit.
    pub fn abort_all(&self) -> usize {
        let mut aborted = 0;
        for entry in self.sessions.iter() {
            if let Some(ref handle) = entry.abort {
                handle.abort();
                aborted += 1;
            }
        }
        aborted
    }
}

pub struct RegistrationGuard {
    registry: Arc<SessionRegistry>,
    id: u64,
}

impl RegistrationGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

struct Grant {
    ip: IpAddr,
    /// 0 when the client did not say which port it sends from.
    port: u16,
    revoked: CancellationToken,
}

/// Client endpoints allowed to use the data port. Each grant belongs to the
/// SOCKS5 control connection that asked for it and ends with it.
#[derive(Default)]
pub struct UdpGrants {
    grants: DashMap<u64, Grant>,
}

impl UdpGrants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(self: &Arc<Self>, session: u64, ip: IpAddr, port: u16) -> UdpGrant {
        self.grants.insert(
            session,
            Grant {
                ip,
                port,
                revoked: CancellationToken::new(),
            },
        );
        UdpGrant {
            grants: self.clone(),
            session,
        }
    }

    /// Token that fires when the grant covering `from` ends, or `None` when
    /// no live grant covers it.
    pub fn authorize(&self, from: SocketAddr) -> Option<CancellationToken> {
        self.grants
            .iter()
            .find(|g| g.ip == from.ip() && (g.port == 0 || g.port == from.port()))
            .map(|g| g.revoked.clone())
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

pub struct UdpGrant {
    grants: Arc<UdpGrants>,
    session: u64,
}

impl Drop for UdpGrant {
    fn drop(&mut self) {
        if let Some((_, grant)) = self.grants.grants.remove(&self.session) {
            grant.revoked.cancel();
        }
    }
}
