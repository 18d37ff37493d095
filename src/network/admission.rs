//! Admission control
//!
//! `Blacklist` rejects known-bad addresses (and our own); `ConnectionFilter`
//! keeps two dial attempts for the same address from running at once.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

// =============================================================================
// Blacklist
// =============================================================================

/// Denied addresses. `None` deadline means permanent.
#[derive(Debug, Default)]
pub struct Blacklist {
    entries: Mutex<HashMap<String, Option<Instant>>>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Option<Instant>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deny permanently
    pub fn add(&self, addr: &str) {
        log::debug!("Blacklist add {}", addr);
        self.entries().insert(addr.to_string(), None);
    }

    /// Deny for `ttl`. Never shortens a permanent entry; a `ttl` too large
    /// to represent is permanent.
    pub fn add_with_ttl(&self, addr: &str, ttl: Duration) {
        let mut entries = self.entries();
        if let Some(None) = entries.get(addr) {
            return;
        }
        log::debug!("Blacklist add {} for {:?}", addr, ttl);
        entries.insert(addr.to_string(), Instant::now().checked_add(ttl));
    }

    pub fn has(&self, addr: &str) -> bool {
        self.entries()
            .get(addr)
            .map_or(false, |deadline| is_live(*deadline, Instant::now()))
    }

    /// Whether any live entry is for `ip`, whatever its port. Inbound
    /// connections arrive from an ephemeral port, so they are matched here.
    pub fn has_host(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        self.entries()
            .iter()
            .any(|(addr, deadline)| is_live(*deadline, now) && host_of(addr) == Some(ip))
    }

    pub fn remove(&self, addr: &str) {
        self.entries().remove(addr);
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries; returns how many were dropped
    pub fn refresh(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, deadline| is_live(*deadline, now));
        before - entries.len()
    }
}

fn is_live(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.map_or(true, |d| d > now)
}

fn host_of(addr: &str) -> Option<IpAddr> {
    let (host, _) = addr.rsplit_once(':')?;
    host.trim_start_matches('[').trim_end_matches(']').parse().ok()
}

// =============================================================================
// Connection Filter
// =============================================================================

/// In-flight dial / discovery dedup set with per-entry deadlines.
/// `None` deadline means the claim only ends with `remove`.
#[derive(Debug, Default)]
pub struct ConnectionFilter {
    entries: Mutex<HashMap<String, Option<Instant>>>,
    closed: AtomicBool,
}

impl ConnectionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Option<Instant>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `key` for `ttl`. `false` if already claimed or the filter is closed.
    pub fn register(&self, key: &str, ttl: Duration) -> bool {
        if self.is_closed() {
            return false;
        }
        let now = Instant::now();
        let mut entries = self.entries();
        match entries.get(key) {
            Some(deadline) if is_live(*deadline, now) => false,
            _ => {
                entries.insert(key.to_string(), now.checked_add(ttl));
                true
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries()
            .get(key)
            .map_or(false, |deadline| is_live(*deadline, Instant::now()))
    }

    pub fn remove(&self, key: &str) {
        self.entries().remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries; returns how many were dropped
    pub fn refresh(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, deadline| is_live(*deadline, now));
        before - entries.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.entries().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blacklist_permanent_and_ttl() {
        let bl = Blacklist::new();
        bl.add("1.1.1.1:1");
        bl.add_with_ttl("2.2.2.2:2", Duration::from_secs(60));
        bl.add_with_ttl("3.3.3.3:3", Duration::ZERO);

        assert!(bl.has("1.1.1.1:1"));
        assert!(bl.has("2.2.2.2:2"));
        assert!(!bl.has("3.3.3.3:3"));
        assert!(!bl.has("4.4.4.4:4"));

        assert_eq!(bl.refresh(), 1);
        assert_eq!(bl.len(), 2);
    }

    #[test]
    fn test_blacklist_ttl_does_not_downgrade_permanent() {
        let bl = Blacklist::new();
        bl.add("1.1.1.1:1");
        bl.add_with_ttl("1.1.1.1:1", Duration::ZERO);
        assert!(bl.has("1.1.1.1:1"));
        bl.remove("1.1.1.1:1");
        assert!(bl.is_empty());
    }

    #[test]
    fn test_blacklist_matches_host_on_any_port() {
        let bl = Blacklist::new();
        bl.add("127.0.0.1:13802");
        bl.add_with_ttl("[::1]:13802", Duration::from_secs(60));
        bl.add_with_ttl("9.9.9.9:1", Duration::ZERO);

        assert!(bl.has_host("127.0.0.1".parse().unwrap()));
        assert!(bl.has_host("::1".parse().unwrap()));
        assert!(!bl.has_host("127.0.0.2".parse().unwrap()));
        // expired entries no longer match
        assert!(!bl.has_host("9.9.9.9".parse().unwrap()));
    }

    #[test]
    fn test_huge_ttl_is_permanent() {
        let bl = Blacklist::new();
        bl.add_with_ttl("1.1.1.1:1", Duration::from_secs(u64::MAX));
        assert!(bl.has("1.1.1.1:1"));
        assert_eq!(bl.refresh(), 0);

        let filter = ConnectionFilter::new();
        assert!(filter.register("a", Duration::from_secs(u64::MAX)));
        assert!(filter.contains("a"));
        assert!(!filter.register("a", Duration::ZERO));
        assert_eq!(filter.refresh(), 0);
        filter.remove("a");
        assert!(filter.is_empty());
    }

    #[test]
    fn test_filter_dedups_until_removed() {
        let filter = ConnectionFilter::new();
        assert!(filter.register("1.1.1.1:1", Duration::from_secs(60)));
        assert!(!filter.register("1.1.1.1:1", Duration::from_secs(60)));
        assert!(filter.contains("1.1.1.1:1"));

        filter.remove("1.1.1.1:1");
        assert!(filter.register("1.1.1.1:1", Duration::from_secs(60)));
    }

    #[test]
    fn test_filter_expiry_and_close() {
        let filter = ConnectionFilter::new();
        assert!(filter.register("a", Duration::ZERO));
        // expired entries can be claimed again
        assert!(filter.register("a", Duration::ZERO));
        assert_eq!(filter.refresh(), 1);

        filter.close();
        assert!(filter.is_closed());
        assert!(!filter.register("b", Duration::from_secs(60)));
    }
}
