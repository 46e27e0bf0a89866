//! The Diameter peer node.
//!
//! `Node` manages transport connections and peers: it runs the
//! capabilities-exchange handshake, answers device watchdogs, enforces
//! the peer-routing invariants (loop detection, application filtering,
//! election on duplicate connections), and hands everything else to the
//! configured `MessageDispatcher`. Connection up/down transitions go to
//! the `ConnectionListener`. No per-message state is kept.
//!
//! The handle is cheap to clone; transport driver threads, the
//! reconnect worker, and application threads all share one node.

mod connection;
mod engine;
mod lifecycle;
mod registry;
mod state;
mod timers;
#[cfg(test)]
mod tests;

pub use connection::{ConnState, Connection, ConnectionKey, SendHandle};
pub use state::NodeState;
pub use timers::{ConnectionTimers, JitterSource, TimerAction};

use crate::config::NodeSettings;
use crate::dispatcher::{DefaultMessageDispatcher, MessageDispatcher};
use crate::listener::{ConnectionListener, DefaultConnectionListener};
use crate::message::Message;
use crate::node::registry::PeerRegistry;
use crate::peer::Peer;
use crate::transport::{TransportDriver, TransportError};
use crate::validator::{DefaultNodeValidator, NodeValidator};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{trace, warn};

/// Errors surfaced to node callers.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node is already running")]
    AlreadyRunning,

    #[error("node is not running")]
    NotRunning,

    #[error("connection is stale")]
    StaleConnection,

    #[error("no connection was established within {0:?}")]
    ConnectionTimeout(Duration),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Condvar pair announcing "a connection became ready" (or the node is
/// stopping). Never acquired while the registry mutex is held.
pub(crate) struct ConnWait {
    pub(crate) lock: Mutex<()>,
    pub(crate) cond: Condvar,
}

pub(crate) struct NodeInner {
    pub(crate) settings: NodeSettings,
    pub(crate) dispatcher: Box<dyn MessageDispatcher>,
    pub(crate) listener: Box<dyn ConnectionListener>,
    pub(crate) validator: Box<dyn NodeValidator>,
    pub(crate) ids: NodeState,
    pub(crate) registry: PeerRegistry,
    pub(crate) conn_wait: ConnWait,
    pub(crate) drivers: Mutex<Vec<Arc<dyn TransportDriver>>>,
    pub(crate) reconnect_thread: Mutex<Option<JoinHandle<()>>>,
    pub(crate) running: AtomicBool,
}

/// A Diameter node handle.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Create a node with the default dispatcher (declines everything),
    /// listener (logs), and validator (accepts everyone).
    pub fn new(settings: NodeSettings) -> Self {
        Self::with_parts(
            settings,
            Box::new(DefaultMessageDispatcher),
            Box::new(DefaultConnectionListener),
            Box::new(DefaultNodeValidator),
        )
    }

    /// Create a node with explicit collaborators. The node is not
    /// started; call [`Node::start`].
    pub fn with_parts(
        settings: NodeSettings,
        dispatcher: Box<dyn MessageDispatcher>,
        listener: Box<dyn ConnectionListener>,
        validator: Box<dyn NodeValidator>,
    ) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                settings,
                dispatcher,
                listener,
                validator,
                ids: NodeState::new(),
                registry: PeerRegistry::new(),
                conn_wait: ConnWait {
                    lock: Mutex::new(()),
                    cond: Condvar::new(),
                },
                drivers: Mutex::new(Vec::new()),
                reconnect_thread: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &NodeInner {
        &self.inner
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.inner.settings
    }

    /// Send a message on a connection. Fails with
    /// [`NodeError::StaleConnection`] when the key is unknown or the
    /// connection is not open for traffic.
    pub fn send_message(&self, msg: &Message, key: &ConnectionKey) -> Result<(), NodeError> {
        let reg = self.inner.registry.lock();
        let conn = reg.lookup(key).ok_or(NodeError::StaleConnection)?;
        if !conn.state().is_ready() {
            return Err(NodeError::StaleConnection);
        }
        trace!(command = msg.header.command_code, peer = %conn.display_name(), "Sending message");
        let raw = msg.encode();
        if !conn.send_handle().queue(&raw) {
            warn!(peer = %conn.display_name(), "Outbound buffer full; dropping frame");
        }
        conn.driver().wakeup();
        Ok(())
    }

    /// Connection key for a peer, if a connection in the Open state
    /// (RFC 3588 section 5.6) exists.
    pub fn find_connection(&self, peer: &Peer) -> Option<ConnectionKey> {
        self.inner.registry.lock().find_by_peer(peer)
    }

    /// Whether the key still refers to a live connection. Usually it is
    /// easier to just call `send_message` and handle the error.
    pub fn is_connection_key_valid(&self, key: &ConnectionKey) -> bool {
        self.inner.registry.lock().is_valid(key)
    }

    /// The peer on a connection, if known yet.
    pub fn connection_key_to_peer(&self, key: &ConnectionKey) -> Option<Peer> {
        self.inner.registry.lock().lookup(key).and_then(|c| c.peer().cloned())
    }

    /// Next hop-by-hop identifier for a connection, sampled under the
    /// registry lock.
    pub fn next_hop_by_hop_identifier(&self, key: &ConnectionKey) -> Result<u32, NodeError> {
        let mut reg = self.inner.registry.lock();
        let conn = reg.lookup_mut(key).ok_or(NodeError::StaleConnection)?;
        Ok(conn.next_hop_by_hop())
    }

    /// A process-unique end-to-end identifier (RFC 3588 section 3).
    pub fn next_end_to_end_identifier(&self) -> u32 {
        self.inner.ids.next_end_to_end_identifier()
    }

    /// The node's Origin-State-Id.
    pub fn state_id(&self) -> u32 {
        self.inner.ids.state_id()
    }

    /// Generate a Session-Id: `<host-id>;<high>;<low>`.
    pub fn make_new_session_id(&self) -> String {
        self.make_new_session_id_with(None)
    }

    /// Generate a Session-Id with an optional implementation-specific
    /// part appended: `<host-id>;<high>;<low>[;<optional>]`.
    pub fn make_new_session_id_with(&self, optional_part: Option<&str>) -> String {
        let mandatory = format!(
            "{};{}",
            self.inner.settings.host_id(),
            self.inner.ids.next_session_id_second_part()
        );
        match optional_part {
            Some(opt) => format!("{mandatory};{opt}"),
            None => mandatory,
        }
    }

    /// Add Origin-Host and Origin-Realm AVPs for this node.
    pub fn add_our_host_and_realm(&self, msg: &mut Message) {
        use crate::message::constants::avp;
        use crate::message::Avp;
        msg.add(Avp::utf8(avp::ORIGIN_HOST, self.inner.settings.host_id()));
        msg.add(Avp::utf8(avp::ORIGIN_REALM, self.inner.settings.realm()));
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("host_id", &self.inner.settings.host_id())
            .field("running", &self.inner.running.load(std::sync::atomic::Ordering::Relaxed))
            .field("connections", &self.inner.registry.lock().len())
            .finish()
    }
}
