use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{GofwError, Result};

/// How new sessions negotiate with their client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    /// No negotiation; destination is sniffed from the first bytes.
    Relay,
    Socks,
    HttpConnect,
    /// Like `Relay`, and TLS is always intercepted.
    TransparentMitm,
}

impl ProxyMode {
    pub fn code(&self) -> i32 {
        match self {
            ProxyMode::Relay => 0,
            ProxyMode::Socks => 1,
            ProxyMode::HttpConnect => 2,
            ProxyMode::TransparentMitm => 3,
        }
    }
}

impl TryFrom<i32> for ProxyMode {
    type Error = GofwError;

    fn try_from(code: i32) -> Result<Self> {
        match code {
            0 => Ok(ProxyMode::Relay),
            1 => Ok(ProxyMode::Socks),
            2 => Ok(ProxyMode::HttpConnect),
            3 => Ok(ProxyMode::TransparentMitm),
            other => Err(GofwError::InvalidMode(other as i64)),
        }
    }
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProxyMode::Relay => "relay",
            ProxyMode::Socks => "socks",
            ProxyMode::HttpConnect => "http-connect",
            ProxyMode::TransparentMitm => "transparent-mitm",
        };
        f.write_str(name)
    }
}

pub const POLICY_CODE_BASE: i32 = 1 << 16;

/// Global override applied before the route list is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutePolicy {
    /// Everything goes through the upstream except private addresses.
    Global,
    IpList,
    /// Everything connects directly.
    None,
}

impl RoutePolicy {
    pub fn code(&self) -> i32 {
        match self {
            RoutePolicy::Global => POLICY_CODE_BASE,
            RoutePolicy::IpList => POLICY_CODE_BASE + 1,
            RoutePolicy::None => POLICY_CODE_BASE + 2,
        }
    }
}

impl TryFrom<i32> for RoutePolicy {
    type Error = GofwError;

    fn try_from(code: i32) -> Result<Self> {
        match code - POLICY_CODE_BASE {
            0 => Ok(RoutePolicy::Global),
            1 => Ok(RoutePolicy::IpList),
            2 => Ok(RoutePolicy::None),
            _ => Err(GofwError::InvalidMode(code as i64)),
        }
    }
}

/// The values a session copies at spawn time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeSnapshot {
    pub mode: ProxyMode,
    pub mitm: bool,
    pub policy: RoutePolicy,
}

impl ModeSnapshot {
    /// Whether TLS streams of this session should be terminated locally.
    pub fn intercepts_tls(&self) -> bool {
        self.mitm || self.mode == ProxyMode::TransparentMitm
    }
}

impl Default for ModeSnapshot {
    fn default() -> Self {
        ModeSnapshot {
            mode: ProxyMode::HttpConnect,
            mitm: false,
            policy: RoutePolicy::IpList,
        }
    }
}

/// Process-wide mode state. Writers replace the whole snapshot, readers load it
/// without locking, so a reader never observes a half-applied switch.
pub struct ProxyModeController {
    current: ArcSwap<ModeSnapshot>,
}

impl ProxyModeController {
    pub fn new(initial: ModeSnapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    pub fn snapshot(&self) -> ModeSnapshot {
        **self.current.load()
    }

    pub fn mode(&self) -> ProxyMode {
        self.current.load().mode
    }

    /// Installs `mode` and returns the one it replaced.
    pub fn switch(&self, mode: ProxyMode) -> ProxyMode {
        let previous = self.current.rcu(|cur| ModeSnapshot { mode, ..**cur });
        previous.mode
    }

    pub fn set_mitm(&self, enabled: bool) -> bool {
        let previous = self.current.rcu(|cur| ModeSnapshot { mitm: enabled, ..**cur });
        previous.mitm
    }

    pub fn set_route_policy(&self, policy: RoutePolicy) -> RoutePolicy {
        let previous = self.current.rcu(|cur| ModeSnapshot { policy, ..**cur });
        previous.policy
    }

    /// Applies a boundary code: `0..=3` select a proxy mode, `0x10000..=0x10002`
    /// select a route policy. Returns the code of the value replaced.
    pub fn switch_code(&self, code: i32) -> Result<i32> {
        if code >= POLICY_CODE_BASE {
            let policy = RoutePolicy::try_from(code)?;
            Ok(self.set_route_policy(policy).code())
        } else {
            let mode = ProxyMode::try_from(code)?;
            Ok(self.switch(mode).code())
        }
    }

    pub fn reset(&self, snapshot: ModeSnapshot) {
        self.current.store(Arc::new(snapshot));
    }
}

impl Default for ProxyModeController {
    fn default() -> Self {
        Self::new(ModeSnapshot::default())
    }
}
