//! NAT traversal
//!
//! Provides:
//! - The router boundary (`NatGateway`) with a UPnP implementation
//! - The one-shot handshake between NAT negotiation and the mapping task
//! - Random port fallback

use crate::network::netaddr::get_local_ip;
use async_trait::async_trait;
use rand::Rng;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

// =============================================================================
// Constants
// =============================================================================

/// Lowest port picked by the random fallback
pub const RANDOM_PORT_MIN: u16 = 1023;

/// Random fallback ports are below this
pub const RANDOM_PORT_MAX: u16 = 65535;

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug)]
pub enum NatError {
    #[error("UPnP gateway not found: {0}")]
    GatewayNotFound(String),
    #[error("Failed to add port mapping: {0}")]
    PortMappingError(String),
    #[error("Failed to remove port mapping: {0}")]
    RemoveMappingError(String),
    #[error("NAT traversal disabled")]
    NotSupported,
    #[error("Invalid local address")]
    InvalidLocalAddress,
}

// =============================================================================
// Gateway boundary
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatProtocol {
    Tcp,
    Udp,
}

impl NatProtocol {
    fn to_igd(self) -> igd_next::PortMappingProtocol {
        match self {
            NatProtocol::Tcp => igd_next::PortMappingProtocol::TCP,
            NatProtocol::Udp => igd_next::PortMappingProtocol::UDP,
        }
    }
}

/// A router that can forward an external port to us
#[async_trait]
pub trait NatGateway: Send + Sync {
    async fn add_mapping(
        &self,
        protocol: NatProtocol,
        external_port: u16,
        internal_port: u16,
        description: &str,
        lease: Duration,
    ) -> Result<(), NatError>;

    async fn delete_mapping(
        &self,
        protocol: NatProtocol,
        external_port: u16,
        internal_port: u16,
    ) -> Result<(), NatError>;
}

/// UPnP IGD gateway.
///
/// igd-next is blocking, so every request runs in `spawn_blocking`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UpnpGateway;

impl UpnpGateway {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NatGateway for UpnpGateway {
    async fn add_mapping(
        &self,
        protocol: NatProtocol,
        external_port: u16,
        internal_port: u16,
        description: &str,
        lease: Duration,
    ) -> Result<(), NatError> {
        let local_ip = get_local_ip().ok_or(NatError::InvalidLocalAddress)?;
        let local_addr = SocketAddr::V4(SocketAddrV4::new(local_ip, internal_port));
        let description = description.to_string();
        let lease_secs = u32::try_from(lease.as_secs()).unwrap_or(u32::MAX);

        tokio::task::spawn_blocking(move || {
            let gateway = igd_next::search_gateway(Default::default())
                .map_err(|e| NatError::GatewayNotFound(e.to_string()))?;

            gateway
                .add_port(
                    protocol.to_igd(),
                    external_port,
                    local_addr,
                    lease_secs,
                    &description,
                )
                .map_err(|e| NatError::PortMappingError(e.to_string()))?;

            log::info!(
                "Added UPnP port mapping {} -> {} via {}",
                external_port,
                local_addr,
                gateway.addr
            );
            Ok(())
        })
        .await
        .map_err(|e| NatError::PortMappingError(e.to_string()))?
    }

    async fn delete_mapping(
        &self,
        protocol: NatProtocol,
        external_port: u16,
        internal_port: u16,
    ) -> Result<(), NatError> {
        tokio::task::spawn_blocking(move || {
            let gateway = igd_next::search_gateway(Default::default())
                .map_err(|e| NatError::GatewayNotFound(e.to_string()))?;

            gateway
                .remove_port(protocol.to_igd(), external_port)
                .map_err(|e| NatError::RemoveMappingError(e.to_string()))?;

            log::info!(
                "Removed UPnP port mapping {} -> {}",
                external_port,
                internal_port
            );
            Ok(())
        })
        .await
        .map_err(|e| NatError::RemoveMappingError(e.to_string()))?
    }
}

/// Gateway used when NAT traversal is switched off
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGateway;

#[async_trait]
impl NatGateway for NoGateway {
    async fn add_mapping(
        &self,
        _protocol: NatProtocol,
        _external_port: u16,
        _internal_port: u16,
        _description: &str,
        _lease: Duration,
    ) -> Result<(), NatError> {
        Err(NatError::NotSupported)
    }

    async fn delete_mapping(
        &self,
        _protocol: NatProtocol,
        _external_port: u16,
        _internal_port: u16,
    ) -> Result<(), NatError> {
        Ok(())
    }
}

/// Random unprivileged port for the mapping fallback
pub fn random_port() -> u16 {
    rand::thread_rng().gen_range(RANDOM_PORT_MIN..RANDOM_PORT_MAX)
}

// =============================================================================
// Negotiation handshake
// =============================================================================

/// Guards the single NAT negotiation of a process.
///
/// `begin` hands out the two ends of the handshake exactly once; a second
/// negotiation gets `None` instead of a channel nobody answers.
#[derive(Debug, Default)]
pub struct NatHandshake {
    started: AtomicBool,
}

impl NatHandshake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> Option<(NatNotice, NatWorker)> {
        if self.started.swap(true, Ordering::SeqCst) {
            return None;
        }
        let (notice_tx, notice_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();
        Some((
            NatNotice {
                notice_tx,
                result_rx,
            },
            NatWorker {
                notice_rx: Some(notice_rx),
                result_tx: Some(result_tx),
            },
        ))
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

/// Negotiator's end
#[derive(Debug)]
pub struct NatNotice {
    notice_tx: oneshot::Sender<()>,
    result_rx: oneshot::Receiver<bool>,
}

impl NatNotice {
    /// Tell the mapping task to go ahead and wait for its verdict.
    /// A task that dies without answering counts as failure.
    pub async fn nat_ok(self) -> bool {
        if self.notice_tx.send(()).is_err() {
            return false;
        }
        self.result_rx.await.unwrap_or(false)
    }
}

/// Mapping task's end
#[derive(Debug)]
pub struct NatWorker {
    notice_rx: Option<oneshot::Receiver<()>>,
    result_tx: Option<oneshot::Sender<bool>>,
}

impl NatWorker {
    /// Wait for the negotiator; `false` if it went away
    pub async fn wait_notice(&mut self) -> bool {
        match self.notice_rx.take() {
            Some(rx) => rx.await.is_ok(),
            None => true,
        }
    }

    /// Deliver the result; later calls are ignored
    pub fn report(&mut self, ok: bool) {
        if let Some(tx) = self.result_tx.take() {
            let _ = tx.send(ok);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_port_range() {
        for _ in 0..1000 {
            let port = random_port();
            assert!(port >= RANDOM_PORT_MIN);
        }
    }

    #[test]
    fn test_handshake_only_once() {
        let hs = NatHandshake::new();
        assert!(!hs.is_started());
        assert!(hs.begin().is_some());
        assert!(hs.begin().is_none());
        assert!(hs.is_started());
    }

    #[tokio::test]
    async fn test_handshake_delivers_result() {
        let hs = NatHandshake::new();
        let (notice, mut worker) = hs.begin().unwrap();

        let task = tokio::spawn(async move {
            assert!(worker.wait_notice().await);
            worker.report(true);
            worker.report(false);
        });

        assert!(notice.nat_ok().await);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_worker_is_failure() {
        let hs = NatHandshake::new();
        let (notice, worker) = hs.begin().unwrap();
        drop(worker);
        assert!(!notice.nat_ok().await);
    }

    #[tokio::test]
    async fn test_no_gateway_fails_mapping() {
        let gw = NoGateway;
        let res = gw
            .add_mapping(NatProtocol::Tcp, 1, 1, "test", Duration::from_secs(1))
            .await;
        assert!(matches!(res, Err(NatError::NotSupported)));
        assert!(gw.delete_mapping(NatProtocol::Tcp, 1, 1).await.is_ok());
    }

    #[test]
    fn test_protocol_maps_to_igd() {
        assert!(matches!(
            NatProtocol::Tcp.to_igd(),
            igd_next::PortMappingProtocol::TCP
        ));
        assert!(matches!(
            NatProtocol::Udp.to_igd(),
            igd_next::PortMappingProtocol::UDP
        ));
    }
}
