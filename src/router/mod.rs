pub mod dns;

use ahash::AHashMap;
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;

pub use dns::DnsCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    Direct,
    ViaUpstream,
}

impl fmt::Display for RouteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteAction::Direct => f.write_str("direct"),
            RouteAction::ViaUpstream => f.write_str("upstream"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutePattern {
    /// Matches the domain itself and every subdomain.
    DomainSuffix(String),
    Cidr(IpNet),
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutePattern::DomainSuffix(d) => f.write_str(d),
            RoutePattern::Cidr(net) => write!(f, "{}", net),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub pattern: RoutePattern,
    pub action: RouteAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRule {
    pub line: usize,
    pub text: String,
    pub reason: String,
}

/// Result of a lookup, with the rule that decided it (if any).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub action: RouteAction,
    pub matched: Option<RoutePattern>,
}

impl Classification {
    fn fallback() -> Self {
        Classification {
            action: RouteAction::ViaUpstream,
            matched: None,
        }
    }
}

/// Destination classifier built from a route list.
///
/// List format: one pattern per line, `#` starts a comment line. Lines before
/// any section header, and lines under `[bypass_list]`, connect directly;
/// lines under `[proxy_list]` go through the upstream. A pattern is a domain
/// (`example.com`, `.example.com` and `*.example.com` are the same rule), an IP
/// address or a CIDR block. Unmatched destinations go through the upstream.
#[derive(Debug, Default)]
pub struct RouteClassifier {
    domains: AHashMap<String, RouteAction>,
    // Longest prefix first.
    networks: Vec<(IpNet, RouteAction)>,
    entries: Vec<RouteEntry>,
    skipped: Vec<SkippedRule>,
}

impl RouteClassifier {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn load(source: &str) -> Self {
        let mut classifier = Self::default();
        let mut section: Option<RouteAction> = Some(RouteAction::Direct);

        for (i, raw) in source.lines().enumerate() {
            let line_no = i + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                section = match &line[1..line.len() - 1] {
                    "bypass_list" => Some(RouteAction::Direct),
                    "proxy_list" => Some(RouteAction::ViaUpstream),
                    other => {
                        classifier.skip(line_no, line, format!("unknown section {}", other));
                        None
                    }
                };
                continue;
            }

            let Some(action) = section else {
                classifier.skip(line_no, line, "entry in unknown section".to_string());
                continue;
            };

            match parse_pattern(line) {
                Ok(pattern) => classifier.insert(RouteEntry { pattern, action }),
                Err(reason) => classifier.skip(line_no, line, reason),
            }
        }

        classifier.networks.sort_by(|a, b| b.0.prefix_len().cmp(&a.0.prefix_len()));
        classifier
    }

    fn skip(&mut self, line: usize, text: &str, reason: String) {
        log::warn!("route list line {}: skipping {:?}: {}", line, text, reason);
        self.skipped.push(SkippedRule {
            line,
            text: text.to_string(),
            reason,
        });
    }

    fn insert(&mut self, entry: RouteEntry) {
        match entry.pattern {
            RoutePattern::DomainSuffix(ref domain) => {
                self.domains.insert(domain.clone(), entry.action);
            }
            RoutePattern::Cidr(net) => {
                self.networks.push((net, entry.action));
            }
        }
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    pub fn skipped(&self) -> &[SkippedRule] {
        &self.skipped
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_cidr_rules(&self) -> bool {
        !self.networks.is_empty()
    }

    pub fn classify(&self, host: &str) -> RouteAction {
        self.classify_detailed(host).action
    }

    /// Accepts a bare host, `host:port`, an IP literal or `[v6]:port`.
    pub fn classify_detailed(&self, host: &str) -> Classification {
        let host = normalize_host(host);
        if let Ok(ip) = host.parse::<IpAddr>() {
            return self.classify_ip_detailed(ip);
        }

        // Walk from the full name towards the TLD; the first hit is the most specific.
        let mut rest = host.as_str();
        loop {
            if let Some(action) = self.domains.get(rest) {
                return Classification {
                    action: *action,
                    matched: Some(RoutePattern::DomainSuffix(rest.to_string())),
                };
            }
            match rest.find('.') {
                Some(dot) => rest = &rest[dot + 1..],
                None => break,
            }
        }

        Classification::fallback()
    }

    pub fn classify_ip(&self, ip: IpAddr) -> RouteAction {
        self.classify_ip_detailed(ip).action
    }

    pub fn classify_ip_detailed(&self, ip: IpAddr) -> Classification {
        self.networks
            .iter()
            .find(|(net, _)| net.contains(&ip))
            .map(|(net, action)| Classification {
                action: *action,
                matched: Some(RoutePattern::Cidr(*net)),
            })
            .unwrap_or_else(Classification::fallback)
    }
}

/// Loopback, RFC 1918, link-local and unique-local addresses.
pub fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified(),
        IpAddr::V6(v6) => {
            let seg = v6.segments()[0];
            v6.is_loopback() || v6.is_unspecified() || (seg & 0xfe00) == 0xfc00 || (seg & 0xffc0) == 0xfe80
        }
    }
}

/// Strips port, IPv6 brackets and a trailing dot, and lowercases.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let bare = if let Some(rest) = host.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else if host.matches(':').count() == 1 {
        host.split(':').next().unwrap_or(host)
    } else {
        host
    };
    bare.trim_end_matches('.').to_ascii_lowercase()
}

fn parse_pattern(text: &str) -> std::result::Result<RoutePattern, String> {
    if text.contains('/') {
        return text
            .parse::<IpNet>()
            .map(|net| RoutePattern::Cidr(net.trunc()))
            .map_err(|_| "invalid CIDR block".to_string());
    }
    if let Ok(ip) = text.parse::<IpAddr>() {
        let host_len = if ip.is_ipv4() { 32 } else { 128 };
        return IpNet::new(ip, host_len)
            .map(RoutePattern::Cidr)
            .map_err(|_| "invalid address".to_string());
    }

    let domain = text
        .trim_start_matches("*.")
        .trim_start_matches('.')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if domain.is_empty() || domain.len() > 253 {
        return Err("invalid domain length".to_string());
    }

    let labels: Vec<&str> = domain.split('.').collect();
    for label in &labels {
        if label.is_empty() || label.len() > 63 {
            return Err("empty or oversized domain label".to_string());
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err("invalid character in domain".to_string());
        }
    }
    if labels.len() > 1 && labels.iter().all(|l| l.chars().all(|c| c.is_ascii_digit())) {
        return Err("malformed IP address".to_string());
    }

    Ok(RoutePattern::DomainSuffix(domain))
}
