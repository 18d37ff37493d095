//! Network message types for the probe protocol
//!
//! The requests a node can make of a remote node about itself (external
//! address, NAT reachability), about the remote (info, known addresses),
//! plus keep-alive.

use crate::network::peer_info::PeerInfo;
use serde::{Deserialize, Serialize};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Magic bytes for message framing
pub const MAGIC: [u8; 4] = [0x50, 0x32, 0x50, 0x4E]; // "P2PN"

/// Largest accepted frame body
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Most addresses returned by one `GetAddrList`
pub const MAX_ADDR_PER_MESSAGE: usize = 1000;

/// Capability flags a node advertises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceFlags(u64);

bitflags::bitflags! {
    impl ServiceFlags: u64 {
        /// Relays network traffic and accepts inbound connections
        const NODE_NETWORK = 1;
        const NODE_GETUTXO = 1 << 1;
        const NODE_BLOOM = 1 << 2;
    }
}

impl ServiceFlags {
    /// Full service set of a reachable node
    pub const SERVICE: ServiceFlags = ServiceFlags(1 | (1 << 1) | (1 << 2));
}

/// Probe protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Keep-alive ping
    Ping(u64),

    /// Keep-alive pong response
    Pong(u64),

    /// Ask which address the remote sees us at; the remote also dials
    /// back `listen_port` to tell us whether we are reachable from outside
    GetExternalIp { listen_port: u16 },

    /// Response to `GetExternalIp`
    ExternalIp { ip: String, outside: bool },

    /// Ask the remote to check that `addr` accepts connections
    CheckNat { addr: String },

    /// Response to `CheckNat`
    NatOk(bool),

    /// Request the remote's own metadata
    GetPeerInfo,

    /// Response to `GetPeerInfo`
    PeerInfo(PeerInfo),

    /// Request the remote's known peer addresses
    GetAddrList,

    /// Response with peer addresses
    AddrList(Vec<String>),

    /// Request could not be served
    Error(String),
}

impl Message {
    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
            Message::GetExternalIp { .. } => "GetExternalIp",
            Message::ExternalIp { .. } => "ExternalIp",
            Message::CheckNat { .. } => "CheckNat",
            Message::NatOk(_) => "NatOk",
            Message::GetPeerInfo => "GetPeerInfo",
            Message::PeerInfo(_) => "PeerInfo",
            Message::GetAddrList => "GetAddrList",
            Message::AddrList(_) => "AddrList",
            Message::Error(_) => "Error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_flags_clear_network_bit() {
        let mut service = ServiceFlags::SERVICE;
        assert!(service.contains(ServiceFlags::NODE_NETWORK));

        service.remove(ServiceFlags::NODE_NETWORK);
        assert_eq!(service.bits(), 6);

        // clearing twice is still 6, never wraps
        service.remove(ServiceFlags::NODE_NETWORK);
        assert_eq!(service.bits(), 6);
    }

    #[test]
    fn test_service_flags_serialize_as_number() {
        let json = serde_json::to_string(&ServiceFlags::SERVICE).unwrap();
        assert_eq!(json, "7");
        let back: ServiceFlags = serde_json::from_str("6").unwrap();
        assert!(!back.contains(ServiceFlags::NODE_NETWORK));
    }

    #[test]
    fn test_message_serialization() {
        let msg = Message::GetExternalIp { listen_port: 13802 };
        let bytes = msg.to_bytes().unwrap();

        match Message::from_bytes(&bytes).unwrap() {
            Message::GetExternalIp { listen_port } => assert_eq!(listen_port, 13802),
            other => panic!("Wrong message type: {}", other.type_name()),
        }
    }
}
