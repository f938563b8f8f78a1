pub mod http;
pub mod sniff;
pub mod socks5;

use std::fmt;
use std::net::IpAddr;

/// Destination requested by a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        Self { host, port }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// Parses `host:port`, `[v6]:port`, or a bare host with `default_port`.
    pub fn parse(authority: &str, default_port: u16) -> Option<Self> {
        let authority = authority.trim();
        if authority.is_empty() {
            return None;
        }
        if let Some(rest) = authority.strip_prefix('[') {
            let (host, tail) = rest.split_once(']')?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().ok()?,
                None if tail.is_empty() => default_port,
                None => return None,
            };
            return Some(Self::new(host, port));
        }
        match authority.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                if host.is_empty() {
                    return None;
                }
                Some(Self::new(host, port.parse().ok()?))
            }
            // bare IPv6 literal without brackets
            Some(_) => Some(Self::new(authority, default_port)),
            None => Some(Self::new(authority, default_port)),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_parse() {
        assert_eq!(Target::parse("example.com:443", 80), Some(Target::new("example.com", 443)));
        assert_eq!(Target::parse("example.com", 80), Some(Target::new("example.com", 80)));
        assert_eq!(Target::parse("[::1]:8080", 80), Some(Target::new("::1", 8080)));
        assert_eq!(Target::parse("example.com:http", 80), None);
        assert_eq!(Target::parse("", 80), None);
    }

    #[test]
    fn test_target_display_brackets_v6() {
        assert_eq!(Target::new("::1", 443).to_string(), "[::1]:443");
        assert_eq!(Target::new("example.com", 443).to_string(), "example.com:443");
    }
}
