//! Node lifecycle: start, graceful stop, reconnection, and waiting for
//! connectivity.

use crate::config::TransportPolicy;
use crate::message::constants::disconnect_cause;
use crate::node::connection::ConnState;
use crate::node::{Node, NodeError};
use crate::peer::Peer;
use crate::transport::{create_driver, TransportDriver, TransportError, TransportKind};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// How long the reconnect worker sleeps between passes when nothing
/// wakes it sooner.
const RECONNECT_PERIOD: Duration = Duration::from_secs(30);

impl Node {
    /// Start the node: load transport drivers per their policies, begin
    /// accepting and connecting, and launch the reconnect worker.
    ///
    /// A `Required` transport that cannot initialize fails the start; an
    /// `Optional` one is logged and skipped. With no transports at all
    /// the node runs connectivity-less.
    pub fn start(&self) -> Result<(), NodeError> {
        let inner = self.inner();
        if inner.running.swap(true, Ordering::SeqCst) {
            return Err(NodeError::AlreadyRunning);
        }
        info!(host_id = %inner.settings.host_id(), "Starting diameter node");
        {
            let mut reg = inner.registry.lock();
            reg.please_stop = false;
            reg.shutdown_deadline = None;
        }

        let policies = [
            (TransportKind::Tcp, inner.settings.use_tcp()),
            (TransportKind::Sctp, inner.settings.use_sctp()),
        ];
        let mut drivers: Vec<Arc<dyn TransportDriver>> = Vec::new();
        for (kind, policy) in policies {
            if policy == TransportPolicy::Disabled {
                info!(%kind, "Transport disabled by configuration");
                continue;
            }
            let driver = match create_driver(kind, &inner.settings) {
                Some(driver) => driver,
                None => {
                    if policy == TransportPolicy::Required {
                        self.abort_start(&drivers);
                        return Err(NodeError::Transport(TransportError::NotAvailable { kind }));
                    }
                    info!(%kind, "Transport support not compiled in; skipped");
                    continue;
                }
            };
            match driver.open_io() {
                Ok(()) => {
                    info!(%kind, "Transport loaded");
                    drivers.push(driver);
                }
                Err(e) => {
                    if policy == TransportPolicy::Required {
                        self.abort_start(&drivers);
                        return Err(NodeError::Transport(e));
                    }
                    warn!(%kind, error = %e, "Optional transport failed to initialize; skipped");
                }
            }
        }
        if drivers.is_empty() {
            warn!("No transport drivers loaded; the node is running without connectivity");
        }

        for driver in &drivers {
            if let Err(e) = driver.clone().start(self.clone()) {
                self.abort_start(&drivers);
                return Err(NodeError::Transport(e));
            }
        }
        *inner.drivers.lock().unwrap_or_else(|e| e.into_inner()) = drivers;

        let worker = self.clone();
        let handle = std::thread::Builder::new()
            .name("diapeer-reconnect".to_string())
            .spawn(move || worker.reconnect_loop())
            .map_err(|e| NodeError::Transport(TransportError::Io(e)))?;
        *inner.reconnect_thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        info!("Diameter node started");
        Ok(())
    }

    fn abort_start(&self, drivers: &[Arc<dyn TransportDriver>]) {
        let now = Instant::now();
        for driver in drivers {
            driver.initiate_stop(now);
            driver.wakeup();
            driver.join();
            driver.close_io();
        }
        self.inner().running.store(false, Ordering::SeqCst);
    }

    /// Stop the node. Every `Ready` peer gets a DPR with cause
    /// REBOOTING (buffer space permitting); drivers drain until
    /// `grace` elapses, then sockets drop regardless. The DPA is not
    /// awaited past the deadline. Threads blocked in
    /// [`Node::wait_for_connection`] are woken.
    pub fn stop(&self, grace: Duration) -> Result<(), NodeError> {
        let inner = self.inner();
        if !inner.running.load(Ordering::SeqCst) {
            return Err(NodeError::NotRunning);
        }
        info!("Stopping diameter node");
        let deadline = Instant::now() + grace;
        let drivers: Vec<Arc<dyn TransportDriver>> =
            inner.drivers.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for driver in &drivers {
            driver.initiate_stop(deadline);
        }

        // Hard-close everything short of ready; DPR the ready ones.
        let mut hard_close = Vec::new();
        let mut graceful = Vec::new();
        {
            let mut reg = inner.registry.lock();
            reg.please_stop = true;
            reg.shutdown_deadline = Some(deadline);
            for key in reg.keys() {
                let Some(conn) = reg.lookup(&key) else { continue };
                match conn.state() {
                    ConnState::Connecting | ConnState::ConnectedIn | ConnState::ConnectedOut => {
                        trace!(peer = %conn.display_name(), "Closing pre-ready connection for shutdown");
                        hard_close.push(key);
                    }
                    ConnState::Ready => graceful.push(key),
                    // Tls is a reserved state nothing enters; nothing to do.
                    ConnState::Tls | ConnState::Closing | ConnState::Closed => {}
                }
            }
        }
        for key in hard_close {
            self.close_connection(&key, false);
        }
        for key in graceful {
            self.initiate_connection_close(&key, disconnect_cause::REBOOTING);
        }

        for driver in &drivers {
            driver.wakeup();
        }
        inner.registry.notify();

        for driver in &drivers {
            driver.join();
        }
        let worker = inner.reconnect_thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = worker {
            let _ = handle.join();
        }

        // Close whatever survived the drain.
        let leftover = inner.registry.lock().keys();
        for key in leftover {
            self.close_connection(&key, false);
        }

        inner.running.store(false, Ordering::SeqCst);
        self.notify_connection_waiters();

        for driver in &drivers {
            driver.close_io();
        }
        inner.drivers.lock().unwrap_or_else(|e| e.into_inner()).clear();
        info!("Diameter node stopped");
        Ok(())
    }

    /// Initiate a connection to a peer unless one already exists. With
    /// `persistent` the peer is also recorded for automatic
    /// reconnection; persistence cannot be revoked.
    ///
    /// Returns before the connection is established; peers on an
    /// unloaded transport are ignored.
    pub fn initiate_connection(&self, peer: &Peer, persistent: bool) -> Result<(), NodeError> {
        let inner = self.inner();
        if !inner.running.load(Ordering::SeqCst) {
            return Err(NodeError::NotRunning);
        }
        if persistent {
            inner.registry.add_persistent(peer);
        }
        let driver = inner
            .drivers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|d| d.kind() == peer.transport())
            .cloned();

        let mut reg = inner.registry.lock();
        if reg.please_stop {
            return Ok(());
        }
        if reg.any_to_peer(peer) {
            return Ok(());
        }
        let Some(driver) = driver else {
            info!(
                %peer,
                transport = %peer.transport(),
                "Cannot connect: transport protocol is not loaded"
            );
            return Ok(());
        };
        info!(%peer, "Initiating connection");
        let timers = self.new_timers(Instant::now());
        let mut conn = driver.clone().new_connection(timers);
        conn.host_id = Some(peer.host().to_string());
        conn.peer = Some(peer.clone());
        if driver.initiate_connection(&mut conn, peer) {
            trace!(%peer, key = %conn.key(), "Connection attempt registered");
            reg.insert(conn);
        }
        Ok(())
    }

    /// The reconnect worker: every pass, re-initiate a connection to
    /// each persistent peer without one. Paced by the registry condvar
    /// with a 30 second timeout; woken early on stop.
    fn reconnect_loop(&self) {
        debug!("Reconnect worker running");
        loop {
            {
                let reg = self.inner().registry.lock();
                if reg.please_stop {
                    break;
                }
                let reg = self.inner().registry.wait_timeout(reg, RECONNECT_PERIOD);
                if reg.please_stop {
                    break;
                }
            }
            for peer in self.inner().registry.persistent_peers() {
                // Idempotent: skipped when a connection already exists.
                if let Err(e) = self.initiate_connection(&peer, false) {
                    debug!(%peer, error = %e, "Reconnect attempt failed");
                }
            }
        }
        debug!("Reconnect worker stopped");
    }

    /// Whether any connection is open for traffic.
    pub fn any_ready_connection(&self) -> bool {
        self.inner().registry.lock().any_ready()
    }

    pub(crate) fn notify_connection_waiters(&self) {
        let _guard = self.inner().conn_wait.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.inner().conn_wait.cond.notify_all();
    }

    /// Block until at least one connection has completed capability
    /// exchange. Returns [`NodeError::NotRunning`] if the node stops
    /// while waiting.
    pub fn wait_for_connection(&self) -> Result<(), NodeError> {
        let inner = self.inner();
        let mut guard = inner.conn_wait.lock.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if self.any_ready_connection() {
                return Ok(());
            }
            if !inner.running.load(Ordering::SeqCst) {
                return Err(NodeError::NotRunning);
            }
            guard = inner.conn_wait.cond.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Like [`Node::wait_for_connection`] but gives up after `timeout`,
    /// failing with [`NodeError::ConnectionTimeout`].
    pub fn wait_for_connection_timeout(&self, timeout: Duration) -> Result<(), NodeError> {
        let inner = self.inner();
        let deadline = Instant::now() + timeout;
        let mut guard = inner.conn_wait.lock.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if self.any_ready_connection() {
                return Ok(());
            }
            if !inner.running.load(Ordering::SeqCst) {
                return Err(NodeError::NotRunning);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(NodeError::ConnectionTimeout(timeout));
            }
            let (g, _) = inner
                .conn_wait
                .cond
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            guard = g;
        }
    }
}
