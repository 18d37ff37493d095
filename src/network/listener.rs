//! Inbound listener
//!
//! Accepts probe-protocol connections from other nodes and answers them
//! from the shared `NodeInfo`. Blacklisted remotes are dropped on accept.

use crate::network::codec::MessageCodec;
use crate::network::message::{Message, MAX_ADDR_PER_MESSAGE, PROTOCOL_VERSION};
use crate::network::node_info::NodeInfo;
use crate::network::peer_info::PeerInfo;
use crate::network::probe::PeerProbe;
use async_trait::async_trait;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Listener: Send + Sync {
    async fn start(&self) -> Result<(), std::io::Error>;
    fn close(&self);
}

/// TCP listener for the probe protocol
pub struct ProbeListener {
    bind_addr: SocketAddr,
    node_info: Arc<NodeInfo>,
    probe: Arc<dyn PeerProbe>,
    token: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ProbeListener {
    pub fn new(bind_addr: SocketAddr, node_info: Arc<NodeInfo>, probe: Arc<dyn PeerProbe>) -> Self {
        Self {
            bind_addr,
            node_info,
            probe,
            token: CancellationToken::new(),
            local_addr: Mutex::new(None),
        }
    }

    /// Bound address once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Listener for ProbeListener {
    async fn start(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let local = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(local);
        log::info!("Listening on {}", local);

        let node_info = self.node_info.clone();
        let probe = self.probe.clone();
        let token = self.token.clone();

        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = token.cancelled() => break,
                    res = listener.accept() => res,
                };
                match accepted {
                    Ok((stream, remote)) => {
                        if node_info.blacklist.has_host(remote.ip()) {
                            log::debug!("Rejected blacklisted connection from {}", remote);
                            continue;
                        }
                        let node_info = node_info.clone();
                        let probe = probe.clone();
                        let token = token.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = token.cancelled() => {}
                                _ = handle_connection(stream, remote, node_info, probe) => {}
                            }
                        });
                    }
                    Err(e) => {
                        log::error!("Accept error: {}", e);
                    }
                }
            }
            log::info!("Listener on {} closed", local);
        });

        Ok(())
    }

    fn close(&self) {
        self.token.cancel();
    }
}

/// Serve requests on one connection until the remote hangs up
async fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    node_info: Arc<NodeInfo>,
    probe: Arc<dyn PeerProbe>,
) {
    let mut framed = Framed::new(stream, MessageCodec);

    while let Some(next) = framed.next().await {
        let request = match next {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("Bad frame from {}: {}", remote, e);
                break;
            }
        };
        log::trace!("Received {} from {}", request.type_name(), remote);

        let response = respond(request, remote, &node_info, probe.as_ref()).await;
        if let Err(e) = framed.send(response).await {
            log::debug!("Failed to answer {}: {}", remote, e);
            break;
        }
    }
}

async fn respond(
    request: Message,
    remote: SocketAddr,
    node_info: &NodeInfo,
    probe: &dyn PeerProbe,
) -> Message {
    match request {
        Message::Ping(nonce) => Message::Pong(nonce),

        Message::GetExternalIp { listen_port } => {
            let ip = remote.ip().to_string();
            let back = SocketAddr::new(remote.ip(), listen_port).to_string();
            let outside = probe.is_routable(&back).await;
            Message::ExternalIp { ip, outside }
        }

        Message::CheckNat { addr } => Message::NatOk(probe.ping(&addr).await.is_ok()),

        Message::GetPeerInfo => Message::PeerInfo(PeerInfo {
            addr: node_info
                .external_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            name: node_info.addr_book.node_name(),
            services: node_info.service_ty(),
            version: PROTOCOL_VERSION,
            updated_at: chrono::Utc::now().timestamp(),
        }),

        Message::GetAddrList => {
            let mut addrs: Vec<String> = node_info.peer_infos.get_peer_infos().into_keys().collect();
            for addr in node_info.addr_book.get_addrs() {
                if !addrs.contains(&addr) {
                    addrs.push(addr);
                }
            }
            addrs.truncate(MAX_ADDR_PER_MESSAGE);
            Message::AddrList(addrs)
        }

        other => Message::Error(format!("unexpected request {}", other.type_name())),
    }
}
