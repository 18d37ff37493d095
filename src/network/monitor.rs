//! Monitor loops
//!
//! Eight independent maintenance loops run for the life of the node:
//! error-peer eviction, three discovery sources (connected peers, the
//! address book, the bootstrap list), peer-info refresh, the dial
//! scheduler, and blacklist/filter expiry. Every candidate address goes
//! through `try_dial`, the single admission path.

use crate::network::netaddr::NetAddress;
use crate::network::node::Node;
use crate::network::peer::Peer;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sleep for `period`; `false` once the node is shutting down
async fn tick(token: &CancellationToken, period: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(period) => true,
    }
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s.max(1))
}

impl Node {
    /// Launch every monitor loop into the node's task group
    pub(crate) fn monitor(self: &Arc<Self>) {
        let node = self.clone();
        let token = self.tasks.token();
        self.tasks
            .spawn("monitor_err_peer", async move { node.monitor_err_peer(token).await });

        let node = self.clone();
        let token = self.tasks.token();
        self.tasks
            .spawn("get_addr_from_online", async move { node.get_addr_from_online(token).await });

        let node = self.clone();
        let token = self.tasks.token();
        self.tasks
            .spawn("get_addr_from_offline", async move { node.get_addr_from_offline(token).await });

        let node = self.clone();
        let token = self.tasks.token();
        self.tasks.spawn("get_addr_from_bootstrap", async move {
            node.get_addr_from_bootstrap(token).await
        });

        let node = self.clone();
        let token = self.tasks.token();
        self.tasks
            .spawn("monitor_peer_info", async move { node.monitor_peer_info(token).await });

        let node = self.clone();
        let token = self.tasks.token();
        self.tasks
            .spawn("monitor_dial_peers", async move { node.monitor_dial_peers(token).await });

        let node = self.clone();
        let token = self.tasks.token();
        self.tasks
            .spawn("monitor_blacklist", async move { node.monitor_blacklist(token).await });

        let node = self.clone();
        let token = self.tasks.token();
        self.tasks
            .spawn("monitor_filter", async move { node.monitor_filter(token).await });
    }

    // =========================================================================
    // Admission
    // =========================================================================

    /// Admit and dial `addr`: blacklist reject, filter dedup, ping, then
    /// `add_peer`. Returns whether a peer was added.
    pub async fn try_dial(&self, addr: &str) -> bool {
        if self.is_close() {
            return false;
        }
        let info = self.node_info();

        let net: NetAddress = match addr.parse() {
            Ok(net) => net,
            Err(e) => {
                log::debug!("Skipping candidate: {}", e);
                return false;
            }
        };
        let key = net.to_string();

        if info.addr_book.is_our_address(&key) || info.blacklist.has(&key) || self.has(&key) {
            return false;
        }
        if !info.filter.register(&key, info.cfg.monitor.filter_ttl()) {
            return false;
        }

        let res = self.probe.ping(&key).await;
        info.filter.remove(&key);

        match res {
            Ok(()) => {
                info.addr_book.add_address(net);
                info.addr_book.set_addr_stat(&key, true);
                let peer = Arc::new(Peer::new(net, info.clone(), self.probe.clone()));
                self.add_peer(peer)
            }
            Err(e) => {
                log::debug!("Dial {} failed: {}", key, e);
                self.record_failure(&key);
                false
            }
        }
    }

    /// Count a failed contact; a bad address leaves the book and is banned
    fn record_failure(&self, addr: &str) {
        let info = self.node_info();
        if let Some(known) = info.addr_book.set_addr_stat(addr, false) {
            if known.is_bad() {
                log::info!("Banning {} after {} failed attempts", addr, known.attempts);
                info.addr_book.remove_addr(addr);
                info.blacklist.add_with_ttl(addr, info.cfg.monitor.ban());
            }
        }
    }

    /// Remember a discovered address and dial it if we want more peers
    async fn discover(&self, addr: &str) {
        let info = self.node_info();
        let Ok(net) = addr.parse::<NetAddress>() else {
            log::debug!("Ignoring malformed address {}", addr);
            return;
        };
        let key = net.to_string();
        if info.addr_book.is_our_address(&key) || info.blacklist.has(&key) {
            return;
        }

        info.addr_book.add_address(net);
        if self.need_more() {
            self.try_dial(&key).await;
        }
    }

    // =========================================================================
    // Loops
    // =========================================================================

    /// Evict peers whose heartbeat keeps failing
    async fn monitor_err_peer(&self, token: CancellationToken) {
        let info = self.node_info();
        let Some(mut rx) = info.take_monitor_rx() else {
            log::warn!("Error-peer monitor already running");
            return;
        };

        loop {
            let report = tokio::select! {
                _ = token.cancelled() => break,
                report = rx.recv() => report,
            };
            let Some((addr, peer_id)) = report else {
                break;
            };

            if !self.remove_if(&addr, peer_id) {
                continue;
            }
            log::info!("Dropped failing peer {}", addr);
            info.peer_infos.remove(&addr);
            self.record_failure(&addr);
            info.addr_book.remove_addr(&addr);
        }
    }

    /// Learn addresses from the peers we are connected to
    async fn get_addr_from_online(&self, token: CancellationToken) {
        let period = secs(self.cfg().monitor.online_discovery_secs);
        while tick(&token, period).await {
            for peer in self.get_register_peers() {
                if token.is_cancelled() {
                    return;
                }
                match self.probe.get_addr_list(&peer.addr()).await {
                    Ok(addrs) => {
                        log::debug!("{} sent {} addresses", peer.addr(), addrs.len());
                        for addr in addrs {
                            self.discover(&addr).await;
                        }
                    }
                    Err(e) => log::debug!("Address request to {} failed: {}", peer.addr(), e),
                }
            }
        }
    }

    /// Retry addresses we know but are not connected to
    async fn get_addr_from_offline(&self, token: CancellationToken) {
        let info = self.node_info();
        let period = secs(self.cfg().monitor.offline_discovery_secs);
        while tick(&token, period).await {
            if let Err(e) = info.addr_book.save() {
                log::warn!("Failed to save address book: {}", e);
            }

            for addr in info.addr_book.get_addrs() {
                if token.is_cancelled() || !self.need_more() {
                    break;
                }
                if !self.has(&addr) {
                    self.try_dial(&addr).await;
                }
            }
        }
    }

    /// Pull the remote bootstrap list, if one is configured
    async fn get_addr_from_bootstrap(&self, token: CancellationToken) {
        let Some(source) = self.bootstrap.clone() else {
            log::debug!("No bootstrap source configured");
            return;
        };
        let period = secs(self.cfg().monitor.bootstrap_discovery_secs);

        loop {
            let fetched = tokio::select! {
                _ = token.cancelled() => return,
                res = source.fetch() => res,
            };
            match fetched {
                Ok(addrs) => {
                    log::info!("Bootstrap list returned {} addresses", addrs.len());
                    for addr in addrs {
                        if token.is_cancelled() {
                            return;
                        }
                        self.discover(&addr).await;
                    }
                }
                Err(e) => log::warn!("Bootstrap fetch failed: {}", e),
            }

            if !tick(&token, period).await {
                return;
            }
        }
    }

    /// Refresh peer metadata and drop entries for peers we no longer hold
    async fn monitor_peer_info(&self, token: CancellationToken) {
        let info = self.node_info();
        let period = secs(self.cfg().monitor.peer_info_secs);
        while tick(&token, period).await {
            let peers = self.get_register_peers();
            let live: HashSet<String> = peers.iter().map(|p| p.addr()).collect();

            for peer in peers {
                if token.is_cancelled() {
                    return;
                }
                let addr = peer.addr();
                match self.probe.get_peer_info(&addr).await {
                    Ok(mut peer_info) => {
                        peer_info.addr = addr;
                        info.peer_infos.set_peer_info(peer_info);
                    }
                    Err(e) => {
                        log::debug!("Peer info from {} failed: {}", addr, e);
                        info.peer_infos.remove(&addr);
                    }
                }
            }

            for addr in info.peer_infos.get_peer_infos().into_keys() {
                if !live.contains(&addr) {
                    info.peer_infos.remove(&addr);
                }
            }
        }
    }

    /// Dial seeds and known addresses while below the stable target
    async fn monitor_dial_peers(&self, token: CancellationToken) {
        let info = self.node_info();
        let period = secs(self.cfg().monitor.dial_secs);
        loop {
            if self.need_more() {
                let wanted = self
                    .cfg()
                    .stable_outbound
                    .saturating_sub(self.size())
                    .max(1);

                let mut seen = HashSet::new();
                let candidates: Vec<String> = info
                    .cfg
                    .seeds
                    .iter()
                    .cloned()
                    .chain(info.addr_book.get_addrs())
                    .filter(|a| seen.insert(a.clone()))
                    .filter(|a| !self.has(a) && !info.blacklist.has(a))
                    .take(wanted)
                    .collect();

                if !candidates.is_empty() {
                    let added = join_all(candidates.iter().map(|a| self.try_dial(a)))
                        .await
                        .into_iter()
                        .filter(|ok| *ok)
                        .count();
                    log::debug!(
                        "Dialed {} candidates, {} added, {} peers",
                        candidates.len(),
                        added,
                        self.size()
                    );
                }
            }

            if !tick(&token, period).await {
                return;
            }
        }
    }

    async fn monitor_blacklist(&self, token: CancellationToken) {
        let period = secs(self.cfg().monitor.blacklist_secs);
        while tick(&token, period).await {
            let expired = self.node_info().blacklist.refresh();
            if expired > 0 {
                log::debug!("{} blacklist entries expired", expired);
            }
        }
    }

    async fn monitor_filter(&self, token: CancellationToken) {
        let period = secs(self.cfg().monitor.filter_secs);
        while tick(&token, period).await {
            self.node_info().filter.refresh();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
