//! Peer info registry
//!
//! Liveness and metadata reported by known peers, refreshed by the
//! peer-info monitor. Kept apart from the live connection map: during
//! convergence a peer can be in one and not the other.

use crate::network::message::ServiceFlags;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Metadata a peer reports about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// The address we know the peer by
    pub addr: String,
    /// Peer's public key
    pub name: String,
    pub services: ServiceFlags,
    pub version: u32,
    /// Unix seconds of the last report
    pub updated_at: i64,
}

#[derive(Debug, Default)]
pub struct PeerInfoRegistry {
    infos: Mutex<HashMap<String, PeerInfo>>,
}

impl PeerInfoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn infos(&self) -> MutexGuard<'_, HashMap<String, PeerInfo>> {
        self.infos.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_peer_info(&self, info: PeerInfo) {
        self.infos().insert(info.addr.clone(), info);
    }

    pub fn get_peer_info(&self, addr: &str) -> Option<PeerInfo> {
        self.infos().get(addr).cloned()
    }

    pub fn get_peer_infos(&self) -> HashMap<String, PeerInfo> {
        self.infos().clone()
    }

    pub fn remove(&self, addr: &str) {
        self.infos().remove(addr);
    }

    pub fn peer_size(&self) -> usize {
        self.infos().len()
    }

    pub fn has(&self, addr: &str) -> bool {
        self.infos().contains_key(addr)
    }

    pub fn flush(&self) {
        self.infos().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(addr: &str) -> PeerInfo {
        PeerInfo {
            addr: addr.to_string(),
            name: "02ab".to_string(),
            services: ServiceFlags::all(),
            version: 1,
            updated_at: 0,
        }
    }

    #[test]
    fn test_set_replace_remove() {
        let reg = PeerInfoRegistry::new();
        reg.set_peer_info(info("1.1.1.1:1"));
        reg.set_peer_info(PeerInfo {
            version: 2,
            ..info("1.1.1.1:1")
        });

        assert_eq!(reg.peer_size(), 1);
        assert_eq!(reg.get_peer_info("1.1.1.1:1").unwrap().version, 2);
        assert!(reg.has("1.1.1.1:1"));

        reg.remove("1.1.1.1:1");
        assert!(reg.get_peer_infos().is_empty());
    }

    #[test]
    fn test_flush() {
        let reg = PeerInfoRegistry::new();
        reg.set_peer_info(info("1.1.1.1:1"));
        reg.set_peer_info(info("2.2.2.2:2"));
        reg.flush();
        assert_eq!(reg.peer_size(), 0);
    }
}
