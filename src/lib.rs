//! diapeer: a Diameter base-protocol peer node (RFC 3588).
//!
//! The node manages transport connections to remote Diameter peers: it
//! performs the capabilities-exchange handshake, runs the
//! device-watchdog keepalive, enforces peer-routing invariants (loop
//! detection, application filtering, election on duplicate
//! connections), reconnects persistent peers, and shuts down
//! gracefully with DPR/DPA. Application messages are routed to a
//! [`MessageDispatcher`]; connection transitions go to a
//! [`ConnectionListener`]; peer admission is delegated to a
//! [`NodeValidator`].

pub mod capabilities;
pub mod config;
pub mod dispatcher;
pub mod listener;
pub mod message;
pub mod node;
pub mod peer;
pub mod transport;
pub mod validator;

// Re-export capability types
pub use capabilities::{Capability, VendorApplication};

// Re-export config types
pub use config::{Config, ConfigError, JitterPrng, NodeSettings, TransportPolicy};

// Re-export codec types
pub use message::{Avp, CodecError, Message, MessageHeader, VendorSpecificApplicationId};

// Re-export node types
pub use node::{ConnState, ConnectionKey, Node, NodeError, NodeState};

// Re-export peer types
pub use peer::Peer;

// Re-export collaborator seams
pub use dispatcher::{DefaultMessageDispatcher, MessageDispatcher};
pub use listener::{ConnectionListener, DefaultConnectionListener};
pub use validator::{AuthenticationResult, DefaultNodeValidator, NodeAuthInfo, NodeValidator};

// Re-export transport types
pub use transport::{TransportDriver, TransportError, TransportKind};
