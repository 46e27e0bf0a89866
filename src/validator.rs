//! Peer authentication and authorization seam.
//!
//! The validator is consulted twice during capability exchange: once to
//! decide whether the peer's claimed Origin-Host is known at all
//! (before the election, so a rogue node cannot trick us into closing a
//! legitimate connection), and once to narrow the peer's reported
//! capabilities down to what it is actually allowed to use.

use crate::capabilities::Capability;
use crate::config::NodeSettings;
use crate::transport::TransportKind;
use std::net::SocketAddr;

/// Transport-level facts about a connection, available before any
/// capability exchange.
#[derive(Clone, Debug)]
pub struct NodeAuthInfo {
    pub remote_addr: Option<SocketAddr>,
    pub transport: TransportKind,
}

/// Outcome of authenticating a peer's claimed identity.
#[derive(Clone, Debug)]
pub struct AuthenticationResult {
    /// Whether the peer is known. Unknown peers are rejected.
    pub known: bool,
    /// Result-Code for the rejection CEA; UNKNOWN_PEER when absent.
    pub result_code: Option<u32>,
    /// Optional Error-Message AVP content for the rejection.
    pub error_message: Option<String>,
}

impl AuthenticationResult {
    pub fn known() -> Self {
        Self {
            known: true,
            result_code: None,
            error_message: None,
        }
    }

    pub fn unknown() -> Self {
        Self {
            known: false,
            result_code: None,
            error_message: None,
        }
    }
}

/// Authenticates peers and narrows negotiated capabilities.
pub trait NodeValidator: Send + Sync {
    /// Is the node claiming `host_id` on this transport connection one
    /// we are willing to talk to?
    fn authenticate_node(&self, host_id: &str, info: &NodeAuthInfo) -> AuthenticationResult;

    /// Narrow the peer's reported capabilities. Returning an empty
    /// capability set rejects the peer with NO_COMMON_APPLICATION.
    fn authorize_node(&self, host_id: &str, settings: &NodeSettings, reported: &Capability) -> Capability;
}

/// Validator that accepts every peer and grants the plain intersection
/// of the local declaration with what the peer reported.
#[derive(Debug, Default)]
pub struct DefaultNodeValidator;

impl NodeValidator for DefaultNodeValidator {
    fn authenticate_node(&self, _host_id: &str, _info: &NodeAuthInfo) -> AuthenticationResult {
        AuthenticationResult::known()
    }

    fn authorize_node(&self, _host_id: &str, settings: &NodeSettings, reported: &Capability) -> Capability {
        Capability::intersect(settings.capabilities(), reported)
    }
}
