//! Peer probe client
//!
//! Request/response calls made to a remote node: keep-alive, "what is my
//! external address", "is this mapping live", peer info and address gossip.

use crate::network::codec::MessageCodec;
use crate::network::message::Message;
use crate::network::peer_info::PeerInfo;
use async_trait::async_trait;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Connection to {0} failed: {1}")]
    ConnectionFailed(String, String),
    #[error("Request to {0} timed out")]
    Timeout(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Peer {0} disconnected")]
    Disconnected(String),
    #[error("Unexpected response {0}")]
    UnexpectedResponse(&'static str),
    #[error("Remote error: {0}")]
    Remote(String),
}

/// Client side of the probe protocol
#[async_trait]
pub trait PeerProbe: Send + Sync {
    /// Keep-alive round trip
    async fn ping(&self, addr: &str) -> Result<(), ProbeError>;

    /// Ask `addr` for our external IP and whether it can reach
    /// `listen_port` on that IP
    async fn get_external_ip(
        &self,
        addr: &str,
        listen_port: u16,
    ) -> Result<(String, bool), ProbeError>;

    /// Ask `addr` whether `target` accepts probe connections
    async fn check_peer_nat_ok(&self, addr: &str, target: &str) -> Result<bool, ProbeError>;

    async fn get_peer_info(&self, addr: &str) -> Result<PeerInfo, ProbeError>;

    async fn get_addr_list(&self, addr: &str) -> Result<Vec<String>, ProbeError>;

    /// Whether a plain TCP connection to `addr` succeeds
    async fn is_routable(&self, addr: &str) -> bool;
}

/// `PeerProbe` over TCP with the length-prefixed message codec
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn connect(&self, addr: &str) -> Result<TcpStream, ProbeError> {
        match timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ProbeError::ConnectionFailed(addr.to_string(), e.to_string())),
            Err(_) => Err(ProbeError::Timeout(addr.to_string())),
        }
    }

    /// One request, one response, then the connection is dropped
    async fn request(&self, addr: &str, msg: Message) -> Result<Message, ProbeError> {
        let stream = self.connect(addr).await?;
        let mut framed = Framed::new(stream, MessageCodec);

        log::trace!("Sending {} to {}", msg.type_name(), addr);
        timeout(self.timeout, framed.send(msg))
            .await
            .map_err(|_| ProbeError::Timeout(addr.to_string()))??;

        match timeout(self.timeout, framed.next()).await {
            Ok(Some(Ok(Message::Error(reason)))) => Err(ProbeError::Remote(reason)),
            Ok(Some(Ok(response))) => Ok(response),
            Ok(Some(Err(e))) => Err(ProbeError::IoError(e)),
            Ok(None) => Err(ProbeError::Disconnected(addr.to_string())),
            Err(_) => Err(ProbeError::Timeout(addr.to_string())),
        }
    }
}

#[async_trait]
impl PeerProbe for TcpProbe {
    async fn ping(&self, addr: &str) -> Result<(), ProbeError> {
        let nonce: u64 = rand::random();
        match self.request(addr, Message::Ping(nonce)).await? {
            Message::Pong(n) if n == nonce => Ok(()),
            other => Err(ProbeError::UnexpectedResponse(other.type_name())),
        }
    }

    async fn get_external_ip(
        &self,
        addr: &str,
        listen_port: u16,
    ) -> Result<(String, bool), ProbeError> {
        match self
            .request(addr, Message::GetExternalIp { listen_port })
            .await?
        {
            Message::ExternalIp { ip, outside } => Ok((ip, outside)),
            other => Err(ProbeError::UnexpectedResponse(other.type_name())),
        }
    }

    async fn check_peer_nat_ok(&self, addr: &str, target: &str) -> Result<bool, ProbeError> {
        let msg = Message::CheckNat {
            addr: target.to_string(),
        };
        match self.request(addr, msg).await? {
            Message::NatOk(ok) => Ok(ok),
            other => Err(ProbeError::UnexpectedResponse(other.type_name())),
        }
    }

    async fn get_peer_info(&self, addr: &str) -> Result<PeerInfo, ProbeError> {
        match self.request(addr, Message::GetPeerInfo).await? {
            Message::PeerInfo(info) => Ok(info),
            other => Err(ProbeError::UnexpectedResponse(other.type_name())),
        }
    }

    async fn get_addr_list(&self, addr: &str) -> Result<Vec<String>, ProbeError> {
        match self.request(addr, Message::GetAddrList).await? {
            Message::AddrList(addrs) => Ok(addrs),
            other => Err(ProbeError::UnexpectedResponse(other.type_name())),
        }
    }

    async fn is_routable(&self, addr: &str) -> bool {
        self.connect(addr).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_ping_roundtrip_against_echo_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, MessageCodec);
            if let Some(Ok(Message::Ping(n))) = framed.next().await {
                framed.send(Message::Pong(n)).await.unwrap();
            }
        });

        let probe = TcpProbe::new(Duration::from_secs(2));
        probe.ping(&addr).await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_address() {
        // bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let probe = TcpProbe::new(Duration::from_secs(1));
        assert!(!probe.is_routable(&addr).await);
        assert!(probe.ping(&addr).await.is_err());
    }
}
