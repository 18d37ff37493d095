//! P2P Networking module
//!
//! Maintains a bounded set of outbound peers and negotiates NAT traversal
//! so the node can also serve inbound connections.
//!
//! # Features
//! - Address book with persisted node identity and mapped port
//! - Blacklist and connection filter admission
//! - Seed-assisted external address detection
//! - UPnP port mapping with random-port fallback and lease renewal
//! - Discovery from peers, the address book and a bootstrap list
//! - Structured shutdown of every background loop

pub mod addrbook;
pub mod admission;
pub mod bootstrap;
pub mod codec;
pub mod listener;
pub mod message;
mod monitor;
pub mod nat;
pub mod netaddr;
pub mod node;
pub mod node_info;
pub mod peer;
pub mod peer_info;
pub mod probe;
pub mod queue;
pub mod tasks;

pub use addrbook::{AddrBook, KnownAddress, EXTERNAL_PORT_TAG, MAX_FAILED_ATTEMPTS};
pub use admission::{Blacklist, ConnectionFilter};
pub use bootstrap::{BootstrapError, BootstrapSource, HttpBootstrap, StaticBootstrap};
pub use codec::MessageCodec;
pub use listener::{Listener, ProbeListener};
pub use message::{Message, ServiceFlags, MAGIC, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
pub use nat::{NatError, NatGateway, NatHandshake, NatProtocol, NoGateway, UpnpGateway};
pub use netaddr::{AddrError, FixedLocalIp, LocalIpSource, NetAddress, RouteLocalIp};
pub use node::{Node, NodeBuilder, NodeError, NodeStatus};
pub use node_info::NodeInfo;
pub use peer::{Peer, PeerState};
pub use peer_info::{PeerInfo, PeerInfoRegistry};
pub use probe::{PeerProbe, ProbeError, TcpProbe};
pub use queue::{NetworkEvent, QueueClient};
pub use tasks::TaskGroup;
