//! Shared node context
//!
//! `NodeInfo` is handed by `Arc` to the node, its peers, the monitor loops
//! and the NAT task. Every field with more than one writer sits behind a
//! lock or an atomic and is reached only through the accessors below.

use crate::config::P2pConfig;
use crate::network::addrbook::AddrBook;
use crate::network::admission::{Blacklist, ConnectionFilter};
use crate::network::message::ServiceFlags;
use crate::network::nat::NatHandshake;
use crate::network::netaddr::NetAddress;
use crate::network::peer_info::PeerInfoRegistry;
use crate::network::queue::{NetworkEvent, QueueClient};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;

pub struct NodeInfo {
    /// Immutable runtime configuration, seeds already expanded
    pub cfg: P2pConfig,
    pub addr_book: Arc<AddrBook>,
    pub peer_infos: Arc<PeerInfoRegistry>,
    pub blacklist: Arc<Blacklist>,
    pub filter: Arc<ConnectionFilter>,
    pub nat: NatHandshake,

    local_ip: RwLock<Option<IpAddr>>,
    external_addr: RwLock<Option<NetAddress>>,
    listen_addr: RwLock<Option<NetAddress>>,
    service: AtomicU64,
    outside: AtomicBool,
    nat_done: AtomicBool,
    client: RwLock<Option<Arc<dyn QueueClient>>>,

    /// Peers that keep failing report `(address, peer id)` here
    monitor_tx: mpsc::UnboundedSender<(String, u64)>,
    monitor_rx: Mutex<Option<mpsc::UnboundedReceiver<(String, u64)>>>,
}

impl NodeInfo {
    pub fn new(mut cfg: P2pConfig, addr_book: Arc<AddrBook>) -> Self {
        cfg.seeds = cfg.effective_seeds();
        let (monitor_tx, monitor_rx) = mpsc::unbounded_channel();

        Self {
            cfg,
            addr_book,
            peer_infos: Arc::new(PeerInfoRegistry::new()),
            blacklist: Arc::new(Blacklist::new()),
            filter: Arc::new(ConnectionFilter::new()),
            nat: NatHandshake::new(),
            local_ip: RwLock::new(None),
            external_addr: RwLock::new(None),
            listen_addr: RwLock::new(None),
            service: AtomicU64::new(ServiceFlags::SERVICE.bits()),
            outside: AtomicBool::new(false),
            nat_done: AtomicBool::new(false),
            client: RwLock::new(None),
            monitor_tx,
            monitor_rx: Mutex::new(Some(monitor_rx)),
        }
    }

    pub fn local_ip(&self) -> Option<IpAddr> {
        *self.local_ip.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_local_ip(&self, ip: IpAddr) {
        *self.local_ip.write().unwrap_or_else(|e| e.into_inner()) = Some(ip);
    }

    pub fn external_addr(&self) -> Option<NetAddress> {
        *self.external_addr.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_external_addr(&self, addr: NetAddress) {
        *self.external_addr.write().unwrap_or_else(|e| e.into_inner()) = Some(addr);
    }

    pub fn listen_addr(&self) -> Option<NetAddress> {
        *self.listen_addr.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_listen_addr(&self, addr: NetAddress) {
        *self.listen_addr.write().unwrap_or_else(|e| e.into_inner()) = Some(addr);
    }

    pub fn service_ty(&self) -> ServiceFlags {
        ServiceFlags::from_bits_retain(self.service.load(Ordering::SeqCst))
    }

    pub fn set_service_ty(&self, service: ServiceFlags) {
        let old = self.service.swap(service.bits(), Ordering::SeqCst);
        if old != service.bits() {
            log::info!("Service flags {:#x} -> {:#x}", old, service.bits());
            self.notify(NetworkEvent::ServiceChanged(service));
        }
    }

    /// Stop advertising relay service; other bits stay as they are
    pub fn clear_network_service(&self) {
        self.set_service_ty(self.service_ty().difference(ServiceFlags::NODE_NETWORK));
    }

    pub fn outside(&self) -> bool {
        self.outside.load(Ordering::SeqCst)
    }

    pub fn set_net_side(&self, outside: bool) {
        self.outside.store(outside, Ordering::SeqCst);
    }

    pub fn is_nat_done(&self) -> bool {
        self.nat_done.load(Ordering::SeqCst)
    }

    pub fn set_nat_done(&self) {
        self.nat_done.store(true, Ordering::SeqCst);
    }

    pub fn set_queue_client(&self, client: Arc<dyn QueueClient>) {
        *self.client.write().unwrap_or_else(|e| e.into_inner()) = Some(client);
    }

    pub fn notify(&self, event: NetworkEvent) {
        let client = self.client.read().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(client) = client {
            client.notify(event);
        }
    }

    /// Report a failing peer to the error-peer monitor
    pub fn report_err_peer(&self, addr: &str, peer_id: u64) {
        let _ = self.monitor_tx.send((addr.to_string(), peer_id));
    }

    /// The receiving end, available once
    pub(crate) fn take_monitor_rx(&self) -> Option<mpsc::UnboundedReceiver<(String, u64)>> {
        self.monitor_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryDb;

    fn node_info() -> NodeInfo {
        let book = Arc::new(AddrBook::open(Arc::new(MemoryDb::new())).unwrap());
        NodeInfo::new(P2pConfig::default(), book)
    }

    #[test]
    fn test_defaults() {
        let info = node_info();
        assert_eq!(info.service_ty(), ServiceFlags::SERVICE);
        assert!(!info.outside());
        assert!(!info.is_nat_done());
        assert!(info.external_addr().is_none());
    }

    #[test]
    fn test_clear_network_service_is_idempotent() {
        let info = node_info();
        let (tx, mut rx) = mpsc::unbounded_channel::<NetworkEvent>();
        info.set_queue_client(Arc::new(tx));

        info.clear_network_service();
        info.clear_network_service();
        assert!(!info.service_ty().contains(ServiceFlags::NODE_NETWORK));
        assert_eq!(info.service_ty().bits(), 6);

        // only the real change is reported
        assert!(matches!(rx.try_recv(), Ok(NetworkEvent::ServiceChanged(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_monitor_rx_taken_once() {
        let info = node_info();
        let mut rx = info.take_monitor_rx().unwrap();
        assert!(info.take_monitor_rx().is_none());

        info.report_err_peer("1.1.1.1:1", 7);
        assert_eq!(rx.try_recv().unwrap(), ("1.1.1.1:1".to_string(), 7));
    }

    #[test]
    fn test_addresses() {
        let info = node_info();
        let ext: NetAddress = "1.2.3.4:23802".parse().unwrap();
        info.set_external_addr(ext);
        info.set_listen_addr("10.0.0.5:13802".parse().unwrap());
        assert_eq!(info.external_addr(), Some(ext));
        assert_eq!(info.listen_addr().unwrap().port, 13802);
    }
}
