//! P2P Node implementation
//!
//! The node owns the outbound peer map and orchestrates every networking
//! component: address detection, NAT negotiation, the monitor loops and
//! the ordered teardown on close.

use crate::config::P2pConfig;
use crate::network::addrbook::AddrBook;
use crate::network::bootstrap::{BootstrapError, BootstrapSource, HttpBootstrap};
use crate::network::listener::{Listener, ProbeListener};
use crate::network::message::ServiceFlags;
use crate::network::nat::{random_port, NatGateway, NatProtocol, NatWorker, NoGateway, UpnpGateway};
use crate::network::netaddr::{LocalIpSource, NetAddress, RouteLocalIp};
use crate::network::node_info::NodeInfo;
use crate::network::peer::Peer;
use crate::network::peer_info::PeerInfo;
use crate::network::probe::{PeerProbe, TcpProbe};
use crate::network::queue::{NetworkEvent, QueueClient};
use crate::network::tasks::TaskGroup;
use crate::storage::{AddrDb, JsonFileDb, StoreError};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

/// How long `close` waits for background loops before aborting them
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Address database error: {0}")]
    Store(#[from] StoreError),
    #[error("Listener error: {0}")]
    Listener(#[from] std::io::Error),
    #[error("Bootstrap client error: {0}")]
    Bootstrap(#[from] BootstrapError),
    #[error("Node is closed")]
    Closed,
}

/// Snapshot of node state for display
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub node_name: String,
    pub external_addr: Option<String>,
    pub listen_addr: Option<String>,
    pub outside: bool,
    pub nat_done: bool,
    pub services: ServiceFlags,
    pub outbound: usize,
    pub active: usize,
    pub known_addrs: usize,
}

/// The P2P node
pub struct Node {
    node_info: Arc<NodeInfo>,
    /// Live outbound peers by address
    out_bound: Mutex<HashMap<String, Arc<Peer>>>,
    listener: Option<Arc<dyn Listener>>,
    closed: AtomicBool,
    pub(crate) probe: Arc<dyn PeerProbe>,
    gateway: Arc<dyn NatGateway>,
    local_ip_source: Arc<dyn LocalIpSource>,
    pub(crate) bootstrap: Option<Arc<dyn BootstrapSource>>,
    pub(crate) tasks: TaskGroup,
}

/// Wires a node to its boundaries; anything left unset gets the
/// production implementation.
pub struct NodeBuilder {
    cfg: P2pConfig,
    db: Option<Arc<dyn AddrDb>>,
    probe: Option<Arc<dyn PeerProbe>>,
    gateway: Option<Arc<dyn NatGateway>>,
    local_ip_source: Option<Arc<dyn LocalIpSource>>,
    bootstrap: Option<Arc<dyn BootstrapSource>>,
    listen_on: Option<SocketAddr>,
    no_listener: bool,
}

impl NodeBuilder {
    pub fn new(cfg: P2pConfig) -> Self {
        Self {
            cfg,
            db: None,
            probe: None,
            gateway: None,
            local_ip_source: None,
            bootstrap: None,
            listen_on: None,
            no_listener: false,
        }
    }

    pub fn addr_db(mut self, db: Arc<dyn AddrDb>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn PeerProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn gateway(mut self, gateway: Arc<dyn NatGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn local_ip_source(mut self, source: Arc<dyn LocalIpSource>) -> Self {
        self.local_ip_source = Some(source);
        self
    }

    pub fn bootstrap(mut self, source: Arc<dyn BootstrapSource>) -> Self {
        self.bootstrap = Some(source);
        self
    }

    /// Bind the listener here instead of `0.0.0.0:default_port`
    pub fn listen_on(mut self, addr: SocketAddr) -> Self {
        self.listen_on = Some(addr);
        self
    }

    /// Run without accepting inbound connections even in server mode
    pub fn without_listener(mut self) -> Self {
        self.no_listener = true;
        self
    }

    pub fn build(self) -> Result<Node, NodeError> {
        let db: Arc<dyn AddrDb> = match self.db {
            Some(db) => db,
            None => Arc::new(JsonFileDb::open(&self.cfg.data_dir)?),
        };
        let addr_book = Arc::new(AddrBook::open(db)?);

        let probe: Arc<dyn PeerProbe> = self
            .probe
            .unwrap_or_else(|| Arc::new(TcpProbe::new(self.cfg.monitor.dial_timeout())));
        let gateway: Arc<dyn NatGateway> = match self.gateway {
            Some(gateway) => gateway,
            None if self.cfg.nat.enabled => Arc::new(UpnpGateway::new()),
            None => Arc::new(NoGateway),
        };
        let local_ip_source = self
            .local_ip_source
            .unwrap_or_else(|| Arc::new(RouteLocalIp));
        let bootstrap = match (self.bootstrap, &self.cfg.bootstrap_url) {
            (Some(source), _) => Some(source),
            (None, Some(url)) => {
                let timeout = self.cfg.monitor.bootstrap_timeout();
                let source: Arc<dyn BootstrapSource> =
                    Arc::new(HttpBootstrap::new(url.clone(), timeout)?);
                Some(source)
            }
            (None, None) => None,
        };

        let listen_on = self.listen_on.unwrap_or_else(|| {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.cfg.default_port)
        });
        let server_start = self.cfg.server_start;
        let node_info = Arc::new(NodeInfo::new(self.cfg, addr_book));

        let listener: Option<Arc<dyn Listener>> = if server_start && !self.no_listener {
            Some(Arc::new(ProbeListener::new(
                listen_on,
                node_info.clone(),
                probe.clone(),
            )))
        } else {
            None
        };

        Ok(Node {
            node_info,
            out_bound: Mutex::new(HashMap::new()),
            listener,
            closed: AtomicBool::new(false),
            probe,
            gateway,
            local_ip_source,
            bootstrap,
            tasks: TaskGroup::new(),
        })
    }
}

impl Node {
    /// Create a node with production boundaries
    pub fn new(cfg: P2pConfig) -> Result<Self, NodeError> {
        NodeBuilder::new(cfg).build()
    }

    pub fn builder(cfg: P2pConfig) -> NodeBuilder {
        NodeBuilder::new(cfg)
    }

    pub fn node_info(&self) -> Arc<NodeInfo> {
        self.node_info.clone()
    }

    pub fn cfg(&self) -> &P2pConfig {
        &self.node_info.cfg
    }

    fn out_bound(&self) -> MutexGuard<'_, HashMap<String, Arc<Peer>>> {
        self.out_bound.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Bring the node up: listener, address detection, monitor loops and
    /// background NAT negotiation. Does not wait for NAT.
    pub async fn start(self: &Arc<Self>) -> Result<(), NodeError> {
        if self.is_close() {
            return Err(NodeError::Closed);
        }

        if let Some(listener) = &self.listener {
            listener.start().await?;
        }

        self.detect_node_addr().await;
        self.monitor();

        let node = self.clone();
        self.tasks.spawn("do_nat", async move { node.do_nat().await });

        log::info!(
            "Node {} started, external {:?}",
            self.node_info.addr_book.node_name(),
            self.node_info.external_addr().map(|a| a.to_string())
        );
        Ok(())
    }

    /// Tear the node down. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Node shutting down...");

        if let Some(listener) = &self.listener {
            listener.close();
        }
        self.tasks.shutdown(SHUTDOWN_GRACE).await;

        self.node_info.addr_book.close();
        self.remove_all();
        self.node_info.filter.close();
        self.delete_nat_map_port().await;

        log::info!("Node stopped");
    }

    pub fn is_close(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_queue_client(&self, client: Arc<dyn QueueClient>) {
        self.node_info.set_queue_client(client);
    }

    // =========================================================================
    // Peer set
    // =========================================================================

    /// Register and start `peer`, evicting any peer already at its address.
    /// Rejected once the node is closed.
    pub fn add_peer(&self, peer: Arc<Peer>) -> bool {
        let addr = peer.addr();
        {
            let mut out_bound = self.out_bound();
            if self.is_close() {
                drop(out_bound);
                peer.close();
                return false;
            }

            if let Some(old) = out_bound.remove(&addr) {
                log::info!("Replacing existing peer {}", addr);
                self.node_info.addr_book.remove_addr(&addr);
                old.close();
            }

            out_bound.insert(addr.clone(), peer.clone());
            peer.start();
        }

        log::debug!("Peer {} added", addr);
        self.node_info.notify(NetworkEvent::PeerAdded(addr));
        true
    }

    /// Stop and drop the peer at `addr`
    pub fn remove(&self, addr: &str) -> bool {
        let removed = self.out_bound().remove(addr);
        match removed {
            Some(peer) => {
                peer.close();
                log::debug!("Peer {} removed", addr);
                self.node_info.notify(NetworkEvent::PeerRemoved(addr.to_string()));
                true
            }
            None => false,
        }
    }

    /// Remove the peer at `addr` only if it is still the one with `peer_id`
    pub(crate) fn remove_if(&self, addr: &str, peer_id: u64) -> bool {
        let removed = {
            let mut out_bound = self.out_bound();
            match out_bound.get(addr) {
                Some(peer) if peer.id() == peer_id => out_bound.remove(addr),
                _ => None,
            }
        };
        match removed {
            Some(peer) => {
                peer.close();
                self.node_info.notify(NetworkEvent::PeerRemoved(addr.to_string()));
                true
            }
            None => false,
        }
    }

    pub fn remove_all(&self) {
        let peers: Vec<(String, Arc<Peer>)> = self.out_bound().drain().collect();
        for (addr, peer) in peers {
            peer.close();
            self.node_info.notify(NetworkEvent::PeerRemoved(addr));
        }
    }

    pub fn size(&self) -> usize {
        self.out_bound().len()
    }

    pub fn has(&self, addr: &str) -> bool {
        self.out_bound().contains_key(addr)
    }

    pub fn get_register_peer(&self, addr: &str) -> Option<Arc<Peer>> {
        self.out_bound().get(addr).cloned()
    }

    pub fn get_register_peers(&self) -> Vec<Arc<Peer>> {
        self.out_bound().values().cloned().collect()
    }

    /// Peers that are both connected and have reported info
    pub fn get_active_peers(&self) -> (HashMap<String, Arc<Peer>>, HashMap<String, PeerInfo>) {
        let registered = self.out_bound().clone();
        let mut infos = self.node_info.peer_infos.get_peer_infos();

        infos.retain(|addr, _| registered.contains_key(addr));
        let peers = registered
            .into_iter()
            .filter(|(addr, _)| infos.contains_key(addr))
            .collect();
        (peers, infos)
    }

    /// Whether the dial scheduler should add peers
    pub fn need_more(&self) -> bool {
        let n = self.size();
        let cfg = &self.node_info.cfg;
        !(n > cfg.max_outbound || n > cfg.stable_outbound)
    }

    pub fn status(&self) -> NodeStatus {
        let info = &self.node_info;
        NodeStatus {
            node_name: info.addr_book.node_name(),
            external_addr: info.external_addr().map(|a| a.to_string()),
            listen_addr: info.listen_addr().map(|a| a.to_string()),
            outside: info.outside(),
            nat_done: info.is_nat_done(),
            services: info.service_ty(),
            outbound: self.size(),
            active: self.get_active_peers().0.len(),
            known_addrs: info.addr_book.size(),
        }
    }

    // =========================================================================
    // Address detection
    // =========================================================================

    /// Resolve local, external and listen addresses. Retries until the
    /// host has a usable local address or the node closes.
    pub async fn detect_node_addr(&self) {
        let info = &self.node_info;
        let cfg = &info.cfg;
        let retry = Duration::from_secs(cfg.monitor.detect_retry_secs);
        let token = self.tasks.token();

        loop {
            if self.is_close() {
                return;
            }

            let Some(local_ip) = self.local_ip_source.local_ip() else {
                log::error!("No local address available, retrying in {:?}", retry);
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(retry) => {}
                }
                continue;
            };
            info.set_local_ip(local_ip);

            let mut external_ip = None;
            if cfg.is_seed {
                info.set_net_side(true);
                external_ip = Some(local_ip.to_string());
            } else {
                for seed in &cfg.seeds {
                    // never ask ourselves
                    if seed.parse::<NetAddress>().map_or(false, |a| a.ip == local_ip) {
                        continue;
                    }
                    match self.probe.get_external_ip(seed, cfg.default_port).await {
                        Ok((ip, outside)) => {
                            log::info!("Seed {} sees us as {} (outside: {})", seed, ip, outside);
                            info.set_net_side(outside);
                            external_ip = Some(ip);
                            break;
                        }
                        Err(e) => log::debug!("External address query to {} failed: {}", seed, e),
                    }
                }
            }
            let external_ip = external_ip.unwrap_or_else(|| local_ip.to_string());

            let port = if cfg.is_seed || info.outside() {
                cfg.default_port
            } else {
                info.addr_book
                    .external_port()
                    .unwrap_or(cfg.default_nat_port)
            };

            match NetAddress::from_parts(&external_ip, port) {
                Ok(external) => {
                    info.blacklist.add(&external.to_string());
                    info.set_external_addr(external);
                }
                Err(e) => {
                    log::error!("Invalid external address {}: {}", external_ip, e);
                    info.blacklist.add(&format!("{}:{}", external_ip, port));
                }
            }
            info.set_listen_addr(NetAddress::new(local_ip, cfg.default_port));

            log::info!(
                "Local {}, external {:?}, listen {:?}, outside {}",
                local_ip,
                info.external_addr().map(|a| a.to_string()),
                info.listen_addr().map(|a| a.to_string()),
                info.outside()
            );
            return;
        }
    }

    /// Point the external address at `ext_port` and listen on `local_port`
    pub fn flush_node_port(&self, local_port: u16, ext_port: u16) {
        let info = &self.node_info;
        if let Some(external) = info.external_addr() {
            info.set_external_addr(external.with_port(ext_port));
        }
        if let Some(local_ip) = info.local_ip() {
            info.set_listen_addr(NetAddress::new(local_ip, local_port));
        }
    }

    // =========================================================================
    // NAT
    // =========================================================================

    /// Negotiate NAT traversal once per process and settle the service bits
    pub async fn do_nat(self: Arc<Self>) {
        let info = self.node_info.clone();
        let cfg = &info.cfg;

        if !info.outside() && !cfg.is_seed && cfg.server_start {
            match info.nat.begin() {
                None => log::warn!("NAT negotiation already started"),
                Some((notice, worker)) => {
                    let node = self.clone();
                    self.tasks
                        .spawn("nat_map_port", async move { node.nat_map_port(worker).await });

                    if notice.nat_ok().await {
                        info.notify(NetworkEvent::NatFinished(true));
                        self.confirm_reachable().await;
                    } else {
                        log::warn!("NAT mapping failed, running without inbound service");
                        info.clear_network_service();
                        info.notify(NetworkEvent::NatFinished(false));
                    }
                }
            }
        }

        info.set_nat_done();
        if let Some(external) = info.external_addr() {
            info.addr_book.add_our_address(external);
        }
        if let Some(listen) = info.listen_addr() {
            info.addr_book.add_our_address(listen);
            info.addr_book
                .add_our_address(NetAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), listen.port));
        }
        log::info!("NAT done, services {:?}", info.service_ty());
    }

    /// Ask known nodes whether our mapped address answers. The first
    /// verdict wins; no verdict at all revokes the network bit.
    async fn confirm_reachable(&self) {
        let info = &self.node_info;
        let Some(external) = info.external_addr() else {
            info.clear_network_service();
            return;
        };
        let target = external.to_string();

        let mut candidates = info.cfg.seeds.clone();
        candidates.extend(info.addr_book.get_addrs());

        let mut verdict = None;
        for addr in candidates {
            if self.is_close() {
                break;
            }
            match self.probe.check_peer_nat_ok(&addr, &target).await {
                Ok(ok) => {
                    log::info!("{} reports our mapping {} reachable: {}", addr, target, ok);
                    verdict = Some(ok);
                    break;
                }
                Err(e) => log::debug!("NAT check via {} failed: {}", addr, e),
            }
        }

        if verdict == Some(true) {
            info.set_service_ty(info.service_ty() | ServiceFlags::NODE_NETWORK);
        } else {
            info.clear_network_service();
        }
    }

    /// Map the external port on the router, then keep the lease alive
    pub(crate) async fn nat_map_port(self: Arc<Self>, mut worker: NatWorker) {
        if !worker.wait_notice().await {
            return;
        }

        let info = self.node_info.clone();
        let nat = &info.cfg.nat;
        let default_port = info.cfg.default_port;
        let token = self.tasks.token();
        let description: String = info
            .addr_book
            .get_priv_pub_key()
            .1
            .chars()
            .take(8)
            .collect();

        let Some(external) = info.external_addr() else {
            log::warn!("No external address, skipping port mapping");
            worker.report(false);
            return;
        };

        // Someone else already answers on our intended port
        let ext = external.to_string();
        if self.probe.is_routable(&ext).await {
            if let Ok(true) = self.probe.check_peer_nat_ok(&ext, &ext).await {
                let port = random_port();
                log::info!("External port {} already in use, trying {}", external.port, port);
                self.flush_node_port(default_port, port);
            }
        }

        let tries = nat.try_map_port_times.max(1);
        let mut mapped = None;
        for i in 0..tries {
            if token.is_cancelled() {
                break;
            }
            let Some(port) = info.external_addr().map(|a| a.port) else {
                break;
            };

            match self
                .gateway
                .add_mapping(NatProtocol::Tcp, port, default_port, &description, nat.lease())
                .await
            {
                Ok(()) => {
                    mapped = Some(port);
                    break;
                }
                Err(e) => {
                    log::warn!("Port mapping {} -> {} failed ({}/{}): {}", port, default_port, i + 1, tries, e);
                    if i + 1 > tries / 2 {
                        self.flush_node_port(default_port, random_port());
                    }
                }
            }
        }

        let Some(port) = mapped else {
            log::error!("Port mapping failed after {} attempts", tries);
            worker.report(false);
            return;
        };

        log::info!("Mapped external port {} -> {}", port, default_port);
        if let Err(e) = info.addr_book.set_external_port(port) {
            log::error!("Failed to persist external port: {}", e);
        }
        worker.report(true);

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(nat.renew_interval()) => {}
            }
            log::info!("Renewing port mapping {}", port);

            loop {
                match self
                    .gateway
                    .add_mapping(NatProtocol::Tcp, port, default_port, &description, nat.lease())
                    .await
                {
                    Ok(()) => break,
                    Err(e) => {
                        log::error!("Port mapping renewal failed: {}", e);
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = tokio::time::sleep(nat.renew_retry()) => {}
                        }
                    }
                }
            }
        }
    }

    /// Revoke the router mapping unless we never needed one
    pub async fn delete_nat_map_port(&self) {
        let info = &self.node_info;
        if info.outside() {
            return;
        }
        let Some(external) = info.external_addr() else {
            return;
        };

        match self
            .gateway
            .delete_mapping(NatProtocol::Tcp, external.port, info.cfg.default_port)
            .await
        {
            Ok(()) => log::info!("Removed port mapping {}", external.port),
            Err(e) => log::warn!("Failed to remove port mapping {}: {}", external.port, e),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
