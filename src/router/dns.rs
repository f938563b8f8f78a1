use lru::LruCache;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::num::NonZeroUsize;

const DEFAULT_CAPACITY: usize = 1024;

/// Bounded host -> address cache used by route classification.
pub struct DnsCache {
    entries: Mutex<LruCache<String, IpAddr>>,
}

impl DnsCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .or(NonZeroUsize::new(DEFAULT_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, host: &str) -> Option<IpAddr> {
        self.entries.lock().get(host).copied()
    }

    pub fn insert(&self, host: &str, ip: IpAddr) {
        self.entries.lock().put(host.to_string(), ip);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves through the cache; the first address returned by the system
    /// resolver is kept.
    pub async fn resolve(&self, host: &str) -> std::io::Result<IpAddr> {
        if let Some(ip) = self.get(host) {
            log::debug!("dns cache hit: {} -> {}", host, ip);
            return Ok(ip);
        }

        let ip = tokio::net::lookup_host((host, 0))
            .await?
            .map(|addr| addr.ip())
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, format!("no address for {}", host)))?;

        self.insert(host, ip);
        Ok(ip)
    }
}
