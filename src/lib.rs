//! P2P Node: the peer-to-peer networking layer of a blockchain client
//!
//! This crate provides:
//! - Peer discovery from seeds, connected peers and a bootstrap list
//! - Blacklist and connection-filter admission of candidate addresses
//! - A bounded, self-healing set of outbound peers
//! - External address detection and UPnP NAT traversal
//! - A persisted address book and secp256k1 node identity
//!
//! # Example
//!
//! ```no_run
//! use p2p_node::config::P2pConfig;
//! use p2p_node::network::Node;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = P2pConfig {
//!     seeds: vec!["203.0.113.10:13802".to_string()],
//!     ..Default::default()
//! };
//! let node = Arc::new(Node::new(cfg)?);
//! node.start().await?;
//! println!("{} outbound peers", node.size());
//! node.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod network;
pub mod storage;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use config::{MonitorConfig, NatConfig, P2pConfig};
pub use crypto::NodeKey;
pub use network::{NetAddress, Node, NodeError, ServiceFlags};
pub use storage::{AddrDb, JsonFileDb, MemoryDb};
