//! Outbound peer
//!
//! One managed connection. A `Peer` goes created -> running -> closed and
//! never back; reconnecting means building a fresh `Peer`.

use crate::network::netaddr::NetAddress;
use crate::network::node_info::NodeInfo;
use crate::network::probe::PeerProbe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Peer lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Created,
    Running,
    Closed,
}

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

pub struct Peer {
    /// Distinguishes successive peers for the same address
    id: u64,
    addr: NetAddress,
    node_info: Arc<NodeInfo>,
    probe: Arc<dyn PeerProbe>,
    state: Mutex<PeerState>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    pub fn new(addr: NetAddress, node_info: Arc<NodeInfo>, probe: Arc<dyn PeerProbe>) -> Self {
        Self {
            id: NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            node_info,
            probe,
            state: Mutex::new(PeerState::Created),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    fn state_guard(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Address as used for map keys
    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub fn net_addr(&self) -> NetAddress {
        self.addr
    }

    pub fn state(&self) -> PeerState {
        *self.state_guard()
    }

    pub fn is_running(&self) -> bool {
        self.state() == PeerState::Running
    }

    /// Spawn the heartbeat task. Only a freshly created peer starts.
    pub fn start(&self) {
        let mut state = self.state_guard();
        if *state != PeerState::Created {
            log::warn!("Peer {} not started: state {:?}", self.addr, *state);
            return;
        }
        *state = PeerState::Running;

        let task = heartbeat(
            self.id,
            self.addr(),
            self.node_info.clone(),
            self.probe.clone(),
            self.cancel.clone(),
        );
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(tokio::spawn(task));
        log::debug!("Peer {} started", self.addr);
    }

    /// Stop the peer for good
    pub fn close(&self) {
        let mut state = self.state_guard();
        if *state == PeerState::Closed {
            return;
        }
        *state = PeerState::Closed;
        self.cancel.cancel();
        log::debug!("Peer {} closed", self.addr);
    }

    /// Whether the heartbeat task has exited
    pub fn is_finished(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(true, |h| h.is_finished())
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Ping the remote every heartbeat interval. After too many consecutive
/// failures the peer reports itself once and keeps going until closed.
async fn heartbeat(
    id: u64,
    addr: String,
    node_info: Arc<NodeInfo>,
    probe: Arc<dyn PeerProbe>,
    cancel: CancellationToken,
) {
    let interval = Duration::from_secs(node_info.cfg.monitor.heartbeat_secs);
    let max_errors = node_info.cfg.monitor.max_peer_errors;
    let mut errors = 0u32;
    let mut reported = false;

    loop {
        let res = tokio::select! {
            _ = cancel.cancelled() => break,
            res = probe.ping(&addr) => res,
        };
        match res {
            Ok(()) => {
                if errors > 0 {
                    log::debug!("Peer {} recovered after {} errors", addr, errors);
                }
                errors = 0;
                node_info.addr_book.set_addr_stat(&addr, true);
            }
            Err(e) => {
                errors += 1;
                log::debug!("Peer {} heartbeat failed ({}): {}", addr, errors, e);
                if errors >= max_errors && !reported {
                    log::info!("Peer {} unreachable, reporting", addr);
                    node_info.report_err_peer(&addr, id);
                    reported = true;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    log::debug!("Peer {} heartbeat stopped", addr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::peer_info::PeerInfo;
    use crate::network::probe::ProbeError;
    use crate::testing::{node_info_with, ScriptedProbe};

    #[tokio::test]
    async fn test_lifecycle_is_one_way() {
        let info = node_info_with(|cfg| cfg.monitor.heartbeat_secs = 60);
        let probe = Arc::new(ScriptedProbe::default());
        let peer = Peer::new("1.1.1.1:1".parse().unwrap(), info, probe);

        assert_eq!(peer.state(), PeerState::Created);
        peer.start();
        assert!(peer.is_running());

        peer.close();
        assert_eq!(peer.state(), PeerState::Closed);

        // closed peers are never restarted
        peer.start();
        assert_eq!(peer.state(), PeerState::Closed);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(peer.is_finished());
    }

    #[tokio::test]
    async fn test_failing_peer_reports_once() {
        let info = node_info_with(|cfg| {
            cfg.monitor.heartbeat_secs = 0;
            cfg.monitor.max_peer_errors = 2;
        });
        let mut rx = info.take_monitor_rx().unwrap();
        let probe = Arc::new(ScriptedProbe::default());
        probe.set_unreachable("1.1.1.1:1");

        let peer = Peer::new("1.1.1.1:1".parse().unwrap(), info, probe);
        peer.start();

        let reported = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(reported, Some(("1.1.1.1:1".to_string(), peer.id())));

        // still running until someone closes it
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(peer.is_running());
        assert!(rx.try_recv().is_err());
        peer.close();
    }

    /// Remote that accepts requests and never answers
    struct SilentProbe;

    #[async_trait::async_trait]
    impl PeerProbe for SilentProbe {
        async fn ping(&self, _addr: &str) -> Result<(), ProbeError> {
            std::future::pending().await
        }

        async fn get_external_ip(
            &self,
            _addr: &str,
            _listen_port: u16,
        ) -> Result<(String, bool), ProbeError> {
            std::future::pending().await
        }

        async fn check_peer_nat_ok(&self, _addr: &str, _target: &str) -> Result<bool, ProbeError> {
            std::future::pending().await
        }

        async fn get_peer_info(&self, _addr: &str) -> Result<PeerInfo, ProbeError> {
            std::future::pending().await
        }

        async fn get_addr_list(&self, _addr: &str) -> Result<Vec<String>, ProbeError> {
            std::future::pending().await
        }

        async fn is_routable(&self, _addr: &str) -> bool {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_close_interrupts_pending_ping() {
        let info = node_info_with(|_| {});
        let peer = Peer::new("1.1.1.1:1".parse().unwrap(), info.clone(), Arc::new(SilentProbe));
        peer.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!peer.is_finished());

        peer.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(peer.is_finished());
        assert!(info.addr_book.get_known("1.1.1.1:1").is_none());
    }
}
