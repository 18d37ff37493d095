//! Test helpers
//!
//! Scripted stand-ins for the network boundaries (probe client, router) so
//! node behaviour can be exercised without sockets or a UPnP device.

use crate::config::P2pConfig;
use crate::network::addrbook::AddrBook;
use crate::network::message::{ServiceFlags, PROTOCOL_VERSION};
use crate::network::nat::{NatError, NatGateway, NatProtocol};
use crate::network::node_info::NodeInfo;
use crate::network::peer_info::PeerInfo;
use crate::network::probe::{PeerProbe, ProbeError};
use crate::storage::MemoryDb;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// `NodeInfo` over an in-memory address database
pub fn node_info_with(f: impl FnOnce(&mut P2pConfig)) -> Arc<NodeInfo> {
    let mut cfg = P2pConfig::default();
    f(&mut cfg);
    let book = match AddrBook::open(Arc::new(MemoryDb::new())) {
        Ok(book) => Arc::new(book),
        Err(e) => panic!("memory address book: {}", e),
    };
    Arc::new(NodeInfo::new(cfg, book))
}

// =============================================================================
// Probe
// =============================================================================

#[derive(Default)]
struct ProbeScript {
    unreachable: HashSet<String>,
    external_ip: HashMap<String, (String, bool)>,
    nat_ok: Option<bool>,
    addr_lists: HashMap<String, Vec<String>>,
    no_info: HashSet<String>,
}

/// Every address answers unless scripted otherwise
#[derive(Default)]
pub struct ScriptedProbe {
    script: Mutex<ProbeScript>,
    pings: AtomicUsize,
    external_ip_calls: Mutex<Vec<String>>,
    nat_checks: Mutex<Vec<(String, String)>>,
}

impl ScriptedProbe {
    fn script(&self) -> std::sync::MutexGuard<'_, ProbeScript> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_unreachable(&self, addr: &str) {
        self.script().unreachable.insert(addr.to_string());
    }

    pub fn set_reachable(&self, addr: &str) {
        self.script().unreachable.remove(addr);
    }

    /// What `addr` answers to `get_external_ip`
    pub fn set_external_ip(&self, addr: &str, ip: &str, outside: bool) {
        self.script()
            .external_ip
            .insert(addr.to_string(), (ip.to_string(), outside));
    }

    /// Answer of every `check_peer_nat_ok`; `None` makes them fail
    pub fn set_nat_ok(&self, ok: Option<bool>) {
        self.script().nat_ok = ok;
    }

    pub fn set_addr_list(&self, addr: &str, list: Vec<String>) {
        self.script().addr_lists.insert(addr.to_string(), list);
    }

    /// `addr` answers pings but not info requests
    pub fn set_no_info(&self, addr: &str) {
        self.script().no_info.insert(addr.to_string());
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn external_ip_calls(&self) -> Vec<String> {
        self.external_ip_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// `(asked, target)` pairs
    pub fn nat_checks(&self) -> Vec<(String, String)> {
        self.nat_checks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn reachable(&self, addr: &str) -> Result<(), ProbeError> {
        if self.script().unreachable.contains(addr) {
            Err(ProbeError::ConnectionFailed(
                addr.to_string(),
                "unreachable".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerProbe for ScriptedProbe {
    async fn ping(&self, addr: &str) -> Result<(), ProbeError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        self.reachable(addr)
    }

    async fn get_external_ip(
        &self,
        addr: &str,
        _listen_port: u16,
    ) -> Result<(String, bool), ProbeError> {
        self.external_ip_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(addr.to_string());
        self.reachable(addr)?;
        self.script()
            .external_ip
            .get(addr)
            .cloned()
            .ok_or_else(|| ProbeError::Remote("no external ip".to_string()))
    }

    async fn check_peer_nat_ok(&self, addr: &str, target: &str) -> Result<bool, ProbeError> {
        self.nat_checks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((addr.to_string(), target.to_string()));
        self.reachable(addr)?;
        self.script()
            .nat_ok
            .ok_or_else(|| ProbeError::Remote("nat check failed".to_string()))
    }

    async fn get_peer_info(&self, addr: &str) -> Result<PeerInfo, ProbeError> {
        self.reachable(addr)?;
        if self.script().no_info.contains(addr) {
            return Err(ProbeError::Remote("no info".to_string()));
        }
        Ok(PeerInfo {
            addr: addr.to_string(),
            name: format!("peer-{}", addr),
            services: ServiceFlags::SERVICE,
            version: PROTOCOL_VERSION,
            updated_at: chrono::Utc::now().timestamp(),
        })
    }

    async fn get_addr_list(&self, addr: &str) -> Result<Vec<String>, ProbeError> {
        self.reachable(addr)?;
        Ok(self
            .script()
            .addr_lists
            .get(addr)
            .cloned()
            .unwrap_or_default())
    }

    async fn is_routable(&self, addr: &str) -> bool {
        self.reachable(addr).is_ok()
    }
}

// =============================================================================
// Gateway
// =============================================================================

/// Router that fails the first `fail_first` mapping requests
#[derive(Default)]
pub struct ScriptedGateway {
    fail_first: usize,
    fail_all: bool,
    attempts: Mutex<Vec<(u16, u16, Duration)>>,
    deleted: Mutex<Vec<(u16, u16)>>,
}

impl ScriptedGateway {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn failing_first(n: usize) -> Self {
        Self {
            fail_first: n,
            ..Default::default()
        }
    }

    pub fn always_failing() -> Self {
        Self {
            fail_all: true,
            ..Default::default()
        }
    }

    /// External port of every `add_mapping` call, in order
    pub fn attempted_ports(&self) -> Vec<u16> {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(ext, _, _)| *ext)
            .collect()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn deleted(&self) -> Vec<(u16, u16)> {
        self.deleted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl NatGateway for ScriptedGateway {
    async fn add_mapping(
        &self,
        _protocol: NatProtocol,
        external_port: u16,
        internal_port: u16,
        _description: &str,
        lease: Duration,
    ) -> Result<(), NatError> {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.push((external_port, internal_port, lease));
        if self.fail_all || attempts.len() <= self.fail_first {
            return Err(NatError::PortMappingError("scripted failure".to_string()));
        }
        Ok(())
    }

    async fn delete_mapping(
        &self,
        _protocol: NatProtocol,
        external_port: u16,
        internal_port: u16,
    ) -> Result<(), NatError> {
        self.deleted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((external_port, internal_port));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_gateway_fails_first() {
        let gw = ScriptedGateway::failing_first(2);
        let lease = Duration::from_secs(1);
        assert!(gw.add_mapping(NatProtocol::Tcp, 1, 1, "", lease).await.is_err());
        assert!(gw.add_mapping(NatProtocol::Tcp, 2, 1, "", lease).await.is_err());
        assert!(gw.add_mapping(NatProtocol::Tcp, 3, 1, "", lease).await.is_ok());
        assert_eq!(gw.attempted_ports(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_scripted_probe_defaults() {
        let probe = ScriptedProbe::default();
        assert!(probe.ping("1.1.1.1:1").await.is_ok());
        assert!(probe.get_external_ip("1.1.1.1:1", 1).await.is_err());
        probe.set_unreachable("1.1.1.1:1");
        assert!(!probe.is_routable("1.1.1.1:1").await);
        assert_eq!(probe.ping_count(), 1);
    }
}
