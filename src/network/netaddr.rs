//! Network addresses
//!
//! `NetAddress` is the `ip:port` pair every other component keys on. Parsing
//! is all-or-nothing: a malformed string is an error, never a partial value.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddrError {
    #[error("invalid address {0:?}: expected ip:port")]
    Invalid(String),
}

/// A peer network address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetAddress {
    pub ip: IpAddr,
    pub port: u16,
}

impl NetAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Build from a host string and port, e.g. the detected external IP
    pub fn from_parts(ip: &str, port: u16) -> Result<Self, AddrError> {
        let parsed: IpAddr = ip
            .parse()
            .map_err(|_| AddrError::Invalid(format!("{}:{}", ip, port)))?;
        Ok(Self::new(parsed, port))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Same host with another port
    pub fn with_port(&self, port: u16) -> Self {
        Self::new(self.ip, port)
    }
}

impl FromStr for NetAddress {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sock: SocketAddr = s
            .trim()
            .parse()
            .map_err(|_| AddrError::Invalid(s.to_string()))?;
        Ok(sock.into())
    }
}

impl From<SocketAddr> for NetAddress {
    fn from(sock: SocketAddr) -> Self {
        Self::new(sock.ip(), sock.port())
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Source of the node's local (interface) address
pub trait LocalIpSource: Send + Sync {
    /// `None` while no usable interface exists yet
    fn local_ip(&self) -> Option<IpAddr>;
}

/// Resolves the local address from the default route
#[derive(Debug, Default, Clone, Copy)]
pub struct RouteLocalIp;

impl LocalIpSource for RouteLocalIp {
    fn local_ip(&self) -> Option<IpAddr> {
        get_local_ip().map(IpAddr::V4)
    }
}

/// A fixed local address
#[derive(Debug, Clone, Copy)]
pub struct FixedLocalIp(pub IpAddr);

impl LocalIpSource for FixedLocalIp {
    fn local_ip(&self) -> Option<IpAddr> {
        Some(self.0)
    }
}

/// Get local IP address by connecting a UDP socket towards a public host.
/// No packet is sent; this only asks the kernel which interface routes there.
pub fn get_local_ip() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;

    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_format() {
        let addrs = ["10.0.0.5:13802", "127.0.0.1:1", "[::1]:8080", "8.8.8.8:65535"];
        for s in addrs {
            let addr: NetAddress = s.parse().unwrap();
            assert_eq!(addr.to_string(), s);
            assert_eq!(addr.to_string().parse::<NetAddress>().unwrap(), addr);
        }
    }

    #[test]
    fn test_malformed_rejected() {
        let bad = ["", "10.0.0.5", "10.0.0.5:", ":80", "10.0.0.5:70000", "host:80", "1.2.3:4"];
        for s in bad {
            assert!(s.parse::<NetAddress>().is_err(), "{} should not parse", s);
        }
    }

    #[test]
    fn test_from_parts() {
        let addr = NetAddress::from_parts("10.0.0.5", 13802).unwrap();
        assert_eq!(addr.to_string(), "10.0.0.5:13802");
        assert_eq!(addr.with_port(1).port, 1);
        assert!(NetAddress::from_parts("nope", 1).is_err());
    }

    #[test]
    fn test_fixed_local_ip() {
        let src = FixedLocalIp("10.0.0.5".parse().unwrap());
        assert_eq!(src.local_ip().unwrap().to_string(), "10.0.0.5");
    }
}
