//! Connection registry.
//!
//! One mutex guards the connection map, every connection's mutable
//! protocol state, and the stop flags; its condvar paces the reconnect
//! worker. The persistent-peer set has its own lock, always taken
//! BEFORE the registry mutex when both are needed.
//!
//! The connection-available condvar lives on the node, not here: it must
//! never be acquired while the registry mutex is held.

use crate::node::connection::{ConnState, Connection, ConnectionKey};
use crate::peer::Peer;
use crate::transport::TransportKind;
use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// State under the registry mutex.
#[derive(Default)]
pub(crate) struct RegistryInner {
    conns: HashMap<ConnectionKey, Connection>,
    pub(crate) please_stop: bool,
    pub(crate) shutdown_deadline: Option<Instant>,
}

impl RegistryInner {
    pub(crate) fn insert(&mut self, conn: Connection) {
        self.conns.insert(conn.key(), conn);
    }

    pub(crate) fn remove(&mut self, key: &ConnectionKey) -> Option<Connection> {
        self.conns.remove(key)
    }

    pub(crate) fn lookup(&self, key: &ConnectionKey) -> Option<&Connection> {
        self.conns.get(key)
    }

    pub(crate) fn lookup_mut(&mut self, key: &ConnectionKey) -> Option<&mut Connection> {
        self.conns.get_mut(key)
    }

    pub(crate) fn is_valid(&self, key: &ConnectionKey) -> bool {
        self.conns.contains_key(key)
    }

    /// Connection key for a peer. Only `Ready` connections count
    /// (RFC 3588 section 5.6 "Open").
    pub(crate) fn find_by_peer(&self, peer: &Peer) -> Option<ConnectionKey> {
        self.conns
            .values()
            .find(|c| c.state().is_ready() && c.peer().is_some_and(|p| p == peer))
            .map(|c| c.key())
    }

    /// Any connection (in any live state) to the peer, for idempotent
    /// connection initiation.
    pub(crate) fn any_to_peer(&self, peer: &Peer) -> bool {
        self.conns.values().any(|c| c.peer().is_some_and(|p| p == peer))
    }

    pub(crate) fn any_ready(&self) -> bool {
        self.conns.values().any(|c| c.state().is_ready())
    }

    /// A `Ready` connection to the given origin-host, for the election.
    pub(crate) fn ready_to_host(&self, host_id: &str) -> Option<ConnectionKey> {
        self.conns
            .values()
            .find(|c| c.state().is_ready() && c.host_id().is_some_and(|h| h == host_id))
            .map(|c| c.key())
    }

    /// Keys of every connection owned by the given transport.
    pub(crate) fn snapshot_for_driver(&self, kind: TransportKind) -> Vec<ConnectionKey> {
        self.conns
            .values()
            .filter(|c| c.transport() == kind)
            .map(|c| c.key())
            .collect()
    }

    pub(crate) fn keys(&self) -> Vec<ConnectionKey> {
        self.conns.keys().copied().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.conns.len()
    }

    /// Earliest timer deadline across this driver's connections, capped
    /// by the shutdown deadline once stopping.
    pub(crate) fn next_timeout_for_driver(&self, kind: TransportKind) -> Option<Instant> {
        let mut timeout: Option<Instant> = None;
        for conn in self.conns.values() {
            if conn.transport() != kind || conn.state() == ConnState::Tls {
                continue;
            }
            let t = conn.timers().calc_next_timeout(conn.state().is_ready());
            timeout = Some(match timeout {
                Some(cur) => cur.min(t),
                None => t,
            });
        }
        if self.please_stop {
            if let Some(deadline) = self.shutdown_deadline {
                timeout = Some(timeout.map_or(deadline, |t| t.min(deadline)));
            }
        }
        timeout
    }
}

/// The registry: connection map plus the persistent-peer set.
pub(crate) struct PeerRegistry {
    inner: Mutex<RegistryInner>,
    reconnect_cond: Condvar,
    persistent: Mutex<HashSet<Peer>>,
}

impl PeerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            reconnect_cond: Condvar::new(),
            persistent: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wake the reconnect worker (and anyone else pacing on the
    /// registry condvar).
    pub(crate) fn notify(&self) {
        self.reconnect_cond.notify_all();
    }

    /// Timed wait on the registry condvar. Spurious wakeups are fine;
    /// callers re-check their predicate.
    pub(crate) fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, RegistryInner>,
        timeout: Duration,
    ) -> MutexGuard<'a, RegistryInner> {
        let (guard, _) = self
            .reconnect_cond
            .wait_timeout(guard, timeout)
            .unwrap_or_else(|e| e.into_inner());
        guard
    }

    /// Record a peer as persistent. Membership is additive for the life
    /// of the node.
    pub(crate) fn add_persistent(&self, peer: &Peer) {
        self.persistent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer.clone());
    }

    /// Snapshot of the persistent peers. Cloning keeps the
    /// persistent-set lock strictly before (and never nested inside)
    /// the registry mutex.
    pub(crate) fn persistent_peers(&self) -> Vec<Peer> {
        self.persistent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}
