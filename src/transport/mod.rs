//! Transport drivers.
//!
//! A driver owns the sockets for one transport protocol and runs one
//! I/O thread: accept, connect, frame incoming bytes, flush outbound
//! buffers, and call back into the node for message handling and timer
//! processing. The protocol engine never touches a socket.
//!
//! Driver availability is decided at compile time: the factory registry
//! maps each `TransportKind` to a constructor, with SCTP behind the
//! `sctp` cargo feature. At start the controller queries availability
//! per its `{required, disabled, optional}` policy instead of probing.

pub(crate) mod net;
pub(crate) mod pollset;
pub(crate) mod stream;
pub mod tcp;
#[cfg(feature = "sctp")]
pub mod sctp;

use crate::config::NodeSettings;
use crate::node::{Connection, ConnectionTimers, Node};
use crate::peer::Peer;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Transport protocols a peer can be reached over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    Sctp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Sctp => "sctp",
        };
        write!(f, "{}", s)
    }
}

/// Errors related to transport drivers.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{kind} support is not compiled into this build")]
    NotAvailable { kind: TransportKind },

    #[error("driver already started")]
    AlreadyStarted,

    #[error("failed to bind {kind} listener on port {port}: {source}")]
    Bind {
        kind: TransportKind,
        port: u16,
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The contract every transport driver exposes to the node.
///
/// `Connection` records are owned by the peer registry; the driver owns
/// the underlying socket resources and outlives its connections (it is
/// joined only after every connection is closed).
pub trait TransportDriver: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Bind listeners and allocate I/O resources. Failure here is what
    /// makes a `Required` transport fatal on start.
    fn open_io(&self) -> Result<(), TransportError>;

    /// Release I/O resources after the event loop has been joined.
    fn close_io(&self);

    /// Spawn the event loop thread.
    fn start(self: Arc<Self>, core: Node) -> Result<(), TransportError>;

    /// Stop accepting and drain until the deadline.
    fn initiate_stop(&self, deadline: Instant);

    /// Unblock the event loop so it observes new commands or state.
    fn wakeup(&self);

    /// Join the event loop thread.
    fn join(&self);

    /// Allocate an outbound connection handle owned by this driver,
    /// in state `Connecting`.
    fn new_connection(self: Arc<Self>, timers: ConnectionTimers) -> Connection;

    /// Begin a nonblocking connect to the peer. Returns false when the
    /// peer is immediately unroutable (resolution or socket failure).
    fn initiate_connection(&self, conn: &mut Connection, peer: &Peer) -> bool;

    /// Close the connection's socket: flush-or-abort. `reset` aborts
    /// with an RST instead of flushing.
    fn close(&self, conn: &Connection, reset: bool);

    /// Local addresses to advertise as Host-IP-Address in CER/CEA.
    fn local_addresses(&self, conn: &Connection) -> Vec<IpAddr> {
        conn.local_addr().map(|a| vec![a.ip()]).into_iter().flatten().collect()
    }
}

/// Construct the driver for a transport, or `None` when support is not
/// compiled in.
pub(crate) fn create_driver(kind: TransportKind, settings: &NodeSettings) -> Option<Arc<dyn TransportDriver>> {
    match kind {
        TransportKind::Tcp => Some(tcp::driver(settings)),
        #[cfg(feature = "sctp")]
        TransportKind::Sctp => Some(sctp::driver(settings)),
        #[cfg(not(feature = "sctp"))]
        TransportKind::Sctp => None,
    }
}
