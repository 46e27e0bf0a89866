//! Per-peer connection records.
//!
//! A `Connection` is the protocol-level state for one transport
//! connection: lifecycle state, learned peer identity, timers, and the
//! hop-by-hop counter. The record lives in the peer registry; the
//! owning transport driver holds the socket and shares the outbound
//! byte buffer through `SendHandle`.

use crate::node::timers::ConnectionTimers;
use crate::peer::Peer;
use crate::transport::{TransportDriver, TransportKind};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Outbound bytes a driver will accept per connection before sends are
/// dropped. A peer this far behind is effectively dead.
pub const MAX_OUT_BUFFER: usize = 4 * 1024 * 1024;

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Opaque handle identifying a connection for its lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionKey(u64);

impl ConnectionKey {
    fn next() -> Self {
        Self(NEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn:{}", self.0)
    }
}

/// Connection lifecycle state.
///
/// `Tls` is reserved for in-band security negotiation, which this node
/// does not perform; connections never enter it, and every state walk
/// matches it explicitly so the hole stays visible.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// Outbound socket connect in progress.
    Connecting,
    /// Accepted; waiting for the peer's CER.
    ConnectedIn,
    /// Connected; our CER sent, waiting for CEA.
    ConnectedOut,
    /// Reserved, never entered.
    Tls,
    /// Capability exchange done; open for traffic.
    Ready,
    /// DPR sent; waiting for DPA or the shutdown deadline.
    Closing,
    /// Gone. Terminal.
    Closed,
}

impl ConnState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnState::Ready)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnState::Closed)
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnState::Connecting => "connecting",
            ConnState::ConnectedIn => "connected_in",
            ConnState::ConnectedOut => "connected_out",
            ConnState::Tls => "tls",
            ConnState::Ready => "ready",
            ConnState::Closing => "closing",
            ConnState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Default)]
struct OutBuffer {
    data: Vec<u8>,
    closed: bool,
}

/// Shared outbound byte buffer between the registry-side connection
/// record and the driver's socket entry.
#[derive(Clone, Debug, Default)]
pub struct SendHandle {
    buf: Arc<Mutex<OutBuffer>>,
}

impl SendHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue encoded bytes for the driver to flush. Returns false when
    /// the buffer is closed or full; the frame is then dropped.
    pub fn queue(&self, bytes: &[u8]) -> bool {
        let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        if buf.closed || buf.data.len() + bytes.len() > MAX_OUT_BUFFER {
            return false;
        }
        buf.data.extend_from_slice(bytes);
        true
    }

    /// Bytes currently queued.
    pub fn pending(&self) -> usize {
        self.buf.lock().unwrap_or_else(|e| e.into_inner()).data.len()
    }

    /// Driver side: run `write` over the queued bytes and drop however
    /// many it reports written.
    pub fn flush_with<F>(&self, write: F) -> std::io::Result<usize>
    where
        F: FnOnce(&[u8]) -> std::io::Result<usize>,
    {
        let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        if buf.data.is_empty() {
            return Ok(0);
        }
        let written = write(&buf.data)?;
        buf.data.drain(..written);
        Ok(written)
    }

    /// Refuse further queueing; pending bytes stay for a final flush.
    pub fn close(&self) {
        self.buf.lock().unwrap_or_else(|e| e.into_inner()).closed = true;
    }
}

/// Protocol-level record for one transport connection.
pub struct Connection {
    key: ConnectionKey,
    pub(crate) state: ConnState,
    pub(crate) host_id: Option<String>,
    pub(crate) peer: Option<Peer>,
    pub(crate) timers: ConnectionTimers,
    hop_by_hop: u32,
    driver: Arc<dyn TransportDriver>,
    send: SendHandle,
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

impl Connection {
    /// Create a record owned by `driver`, in the given initial state.
    pub fn new(driver: Arc<dyn TransportDriver>, state: ConnState, timers: ConnectionTimers) -> Self {
        Self {
            key: ConnectionKey::next(),
            state,
            host_id: None,
            peer: None,
            timers,
            hop_by_hop: rand::random(),
            driver,
            send: SendHandle::new(),
            remote_addr: None,
            local_addr: None,
        }
    }

    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// The peer's advertised Origin-Host, once a CER/CEA has been seen
    /// (or the configured host for outbound attempts).
    pub fn host_id(&self) -> Option<&str> {
        self.host_id.as_deref()
    }

    pub fn peer(&self) -> Option<&Peer> {
        self.peer.as_ref()
    }

    pub fn timers(&self) -> &ConnectionTimers {
        &self.timers
    }

    pub fn timers_mut(&mut self) -> &mut ConnectionTimers {
        &mut self.timers
    }

    pub fn driver(&self) -> &Arc<dyn TransportDriver> {
        &self.driver
    }

    pub fn transport(&self) -> TransportKind {
        self.driver.kind()
    }

    pub fn send_handle(&self) -> SendHandle {
        self.send.clone()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn set_remote_addr(&mut self, addr: SocketAddr) {
        self.remote_addr = Some(addr);
    }

    /// Local socket addresses, used for the Host-IP-Address AVPs of
    /// CER/CEA. Captured when the socket is created.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn set_local_addr(&mut self, addr: SocketAddr) {
        self.local_addr = Some(addr);
    }

    /// Next hop-by-hop identifier. Callers sample this under the
    /// registry lock so identifiers on a connection are strictly ordered
    /// with the sends that carry them.
    pub fn next_hop_by_hop(&mut self) -> u32 {
        let id = self.hop_by_hop;
        self.hop_by_hop = self.hop_by_hop.wrapping_add(1);
        id
    }

    /// Name for logs: the peer if fully known, otherwise whatever
    /// identity we have.
    pub fn display_name(&self) -> String {
        match (&self.peer, &self.host_id) {
            (Some(peer), _) => peer.to_string(),
            (None, Some(host)) => host.clone(),
            (None, None) => self.key.to_string(),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("host_id", &self.host_id)
            .field("peer", &self.peer)
            .field("transport", &self.driver.kind())
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}
