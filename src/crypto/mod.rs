//! Cryptographic identity of the node
//!
//! The secp256k1 node key whose public half names the node to its peers and
//! to the router when requesting a port mapping.

pub mod node_key;

pub use node_key::{KeyError, NodeKey};
