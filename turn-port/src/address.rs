// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Server addresses and the candidates exchanged with the ICE layer.

use std::net::{IpAddr, SocketAddr};

use stun_proto::types::TransportType;

/// The default port of a TURN server reached over UDP or TCP.
pub const TURN_DEFAULT_PORT: u16 = 3478;
/// The default port of a TURN server reached over TLS.
pub const TURNS_DEFAULT_PORT: u16 = 5349;

/// Type preference of a relayed candidate before any transport penalty.
const RELAY_TYPE_PREFERENCE: u32 = 2;

/// The transport protocol used to reach a TURN server or a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolType {
    /// UDP.
    Udp,
    /// TCP, optionally wrapped in TLS.
    Tcp,
}

impl ProtocolType {
    pub(crate) fn transport(self) -> TransportType {
        match self {
            Self::Udp => TransportType::Udp,
            Self::Tcp => TransportType::Tcp,
        }
    }
}

impl std::fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Udp => f.write_str("udp"),
            Self::Tcp => f.write_str("tcp"),
        }
    }
}

/// The address of a TURN server, either already resolved or as a DNS name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddress {
    /// A resolved socket address.
    Resolved(SocketAddr),
    /// A host name that must be resolved before use.
    Hostname {
        /// The DNS name.
        host: String,
        /// The port. `0` selects the default TURN port.
        port: u16,
    },
}

impl ServerAddress {
    /// The port of this address.
    pub fn port(&self) -> u16 {
        match self {
            Self::Resolved(addr) => addr.port(),
            Self::Hostname { port, .. } => *port,
        }
    }

    /// The resolved socket address, if any.
    pub fn resolved(&self) -> Option<SocketAddr> {
        match self {
            Self::Resolved(addr) => Some(*addr),
            Self::Hostname { .. } => None,
        }
    }

    fn set_port(&mut self, new_port: u16) {
        match self {
            Self::Resolved(addr) => addr.set_port(new_port),
            Self::Hostname { port, .. } => *port = new_port,
        }
    }
}

impl From<SocketAddr> for ServerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::Resolved(addr)
    }
}

impl std::fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resolved(addr) => write!(f, "{addr}"),
            Self::Hostname { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

/// The address of a TURN server together with how to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolAddress {
    /// The server address.
    pub address: ServerAddress,
    /// The transport used to reach the server.
    pub protocol: ProtocolType,
    /// Whether the TCP connection is wrapped in TLS.
    pub secure: bool,
}

impl ProtocolAddress {
    /// A TURN server reached over UDP.
    pub fn udp(address: impl Into<ServerAddress>) -> Self {
        Self {
            address: address.into(),
            protocol: ProtocolType::Udp,
            secure: false,
        }
    }

    /// A TURN server reached over TCP.
    pub fn tcp(address: impl Into<ServerAddress>) -> Self {
        Self {
            address: address.into(),
            protocol: ProtocolType::Tcp,
            secure: false,
        }
    }

    /// A TURN server reached over TLS.
    pub fn tls(address: impl Into<ServerAddress>) -> Self {
        Self {
            address: address.into(),
            protocol: ProtocolType::Tcp,
            secure: true,
        }
    }

    /// The port used when none is configured.
    pub fn default_port(&self) -> u16 {
        if self.secure {
            TURNS_DEFAULT_PORT
        } else {
            TURN_DEFAULT_PORT
        }
    }

    /// Replace an unset port with [`default_port`](Self::default_port).
    pub(crate) fn apply_default_port(&mut self) {
        if self.address.port() == 0 {
            let port = self.default_port();
            self.address.set_port(port);
        }
    }

    /// The type preference of a relayed candidate obtained through this server.
    ///
    /// Relaying over TCP costs one step of preference and TLS costs another.
    pub fn relay_preference(&self) -> u32 {
        let mut preference = RELAY_TYPE_PREFERENCE;
        if self.protocol == ProtocolType::Tcp {
            preference -= 1;
            if self.secure {
                preference -= 1;
            }
        }
        preference
    }
}

/// Whether two addresses belong to the same IP family.
pub(crate) fn is_compatible_address(local: IpAddr, remote: IpAddr) -> bool {
    local.is_ipv4() == remote.is_ipv4()
}

/// The kind of an ICE candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    /// An address on a local interface.
    Host,
    /// An address discovered through a STUN server.
    ServerReflexive,
    /// An address discovered from a connectivity check.
    PeerReflexive,
    /// An address on a TURN server.
    Relayed,
}

/// Where a remote candidate was learnt from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOrigin {
    /// Gathered by this port.
    ThisPort,
    /// Gathered by another local port.
    OtherPort,
    /// Received from the remote peer through signalling.
    Message,
}

/// An ICE candidate as produced or consumed by a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// The kind of candidate.
    pub kind: CandidateKind,
    /// The transport of the candidate.
    pub protocol: ProtocolType,
    /// The transport address.
    pub address: SocketAddr,
    /// The address this candidate was derived from.
    pub related_address: Option<SocketAddr>,
    /// The type preference assigned by the port that produced this candidate.
    pub type_preference: u32,
}

impl Candidate {
    /// Construct a new [`Candidate`] without a related address.
    pub fn new(kind: CandidateKind, protocol: ProtocolType, address: SocketAddr) -> Self {
        Self {
            kind,
            protocol,
            address,
            related_address: None,
            type_preference: 0,
        }
    }

    /// Set the related address.
    pub fn with_related_address(mut self, related: SocketAddr) -> Self {
        self.related_address = Some(related);
        self
    }

    /// Set the type preference.
    pub fn with_type_preference(mut self, preference: u32) -> Self {
        self.type_preference = preference;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_preference_by_transport() {
        let _log = crate::tests::test_init_log();
        let addr: SocketAddr = "127.0.0.1:3478".parse().unwrap();
        assert_eq!(ProtocolAddress::udp(addr).relay_preference(), 2);
        assert_eq!(ProtocolAddress::tcp(addr).relay_preference(), 1);
        assert_eq!(ProtocolAddress::tls(addr).relay_preference(), 0);
    }

    #[test]
    fn default_port_applied() {
        let _log = crate::tests::test_init_log();
        let mut udp = ProtocolAddress::udp("10.0.0.1:0".parse::<SocketAddr>().unwrap());
        udp.apply_default_port();
        assert_eq!(udp.address.port(), TURN_DEFAULT_PORT);

        let mut tls = ProtocolAddress::tls(ServerAddress::Hostname {
            host: "turn.example.com".to_string(),
            port: 0,
        });
        tls.apply_default_port();
        assert_eq!(tls.address.port(), TURNS_DEFAULT_PORT);

        let mut explicit = ProtocolAddress::tcp("10.0.0.1:443".parse::<SocketAddr>().unwrap());
        explicit.apply_default_port();
        assert_eq!(explicit.address.port(), 443);
    }

    #[test]
    fn address_family_compatibility() {
        let _log = crate::tests::test_init_log();
        let v4: IpAddr = "192.168.0.1".parse().unwrap();
        let v6: IpAddr = "fd00::1".parse().unwrap();
        assert!(is_compatible_address(v4, "10.0.0.1".parse().unwrap()));
        assert!(!is_compatible_address(v4, v6));
        assert!(is_compatible_address(v6, "::1".parse().unwrap()));
    }
}
