//! Peer identity.
//!
//! A peer is addressed by `(host, port, transport)`. Host comparison is
//! case-insensitive per the DiameterIdentity rules; negotiated
//! capabilities ride along but do not participate in equality, so the
//! persistent-peer set and connection lookups key on the address alone.

use crate::capabilities::Capability;
use crate::transport::TransportKind;
use std::fmt;
use std::hash::{Hash, Hasher};

/// The default Diameter port (RFC 3588 section 2.1).
pub const DEFAULT_PORT: u16 = 3868;

/// A remote Diameter node.
#[derive(Clone, Debug)]
pub struct Peer {
    host: String,
    port: u16,
    transport: TransportKind,
    /// Negotiated capabilities; empty until capability exchange finishes.
    pub capabilities: Capability,
}

impl Peer {
    /// Create a TCP peer on the default port.
    pub fn new(host: &str) -> Self {
        Self::with_transport(host, DEFAULT_PORT, TransportKind::Tcp)
    }

    /// Create a TCP peer on an explicit port.
    pub fn with_port(host: &str, port: u16) -> Self {
        Self::with_transport(host, port, TransportKind::Tcp)
    }

    pub fn with_transport(host: &str, port: u16, transport: TransportKind) -> Self {
        Self {
            host: host.to_string(),
            port,
            transport,
            capabilities: Capability::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Replace the host identity, e.g. once the peer's Origin-Host is
    /// learned from CER/CEA.
    pub fn set_host(&mut self, host: &str) {
        self.host = host.to_string();
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.port == other.port
            && self.transport == other.transport
            && self.host.eq_ignore_ascii_case(&other.host)
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.host.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
        self.port.hash(state);
        self.transport.hash(state);
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn equality_is_case_insensitive_on_host() {
        let a = Peer::with_port("Peer.Example", 3868);
        let b = Peer::with_port("peer.example", 3868);
        let c = Peer::with_port("peer.example", 3869);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn equality_ignores_capabilities() {
        let a = Peer::new("peer.example");
        let mut b = Peer::new("peer.example");
        b.capabilities.add_auth_app(4);
        assert_eq!(a, b);
    }

    #[test]
    fn transport_distinguishes_peers() {
        let tcp = Peer::with_transport("peer.example", 3868, TransportKind::Tcp);
        let sctp = Peer::with_transport("peer.example", 3868, TransportKind::Sctp);
        assert_ne!(tcp, sctp);
    }

    #[test]
    fn hash_agrees_with_eq() {
        let mut set = HashSet::new();
        set.insert(Peer::with_port("Peer.Example", 3868));
        assert!(set.contains(&Peer::with_port("PEER.EXAMPLE", 3868)));
        assert!(!set.contains(&Peer::with_port("other.example", 3868)));
    }
}
