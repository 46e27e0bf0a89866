//! Engine and lifecycle tests, driven through a mock transport driver.
//!
//! The mock driver records closes and connection attempts; frames the
//! engine queues are decoded straight off the shared send buffers, so
//! no sockets are involved.

use crate::capabilities::Capability;
use crate::config::NodeSettings;
use crate::dispatcher::MessageDispatcher;
use crate::listener::ConnectionListener;
use crate::message::constants::{avp, command, APPLICATION_COMMON};
use crate::message::{Avp, Message};
use crate::node::connection::{ConnState, Connection, ConnectionKey, SendHandle};
use crate::node::{Node, NodeError};
use crate::peer::Peer;
use crate::transport::{TransportDriver, TransportError, TransportKind};
use crate::validator::{AuthenticationResult, NodeAuthInfo, NodeValidator};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

mod disconnect;
mod routing;
mod watchdog;

// ============================================================================
// Mock transport driver
// ============================================================================

pub(super) struct MockDriver {
    kind: TransportKind,
    /// Every close the node asked for: (key, reset).
    pub(super) closed: Mutex<Vec<(ConnectionKey, bool)>>,
    /// Peers the node asked to connect to.
    pub(super) initiated: Mutex<Vec<Peer>>,
    /// What initiate_connection reports back.
    pub(super) accept_connects: bool,
}

impl MockDriver {
    pub(super) fn new() -> Arc<Self> {
        Arc::new(Self {
            kind: TransportKind::Tcp,
            closed: Mutex::new(Vec::new()),
            initiated: Mutex::new(Vec::new()),
            accept_connects: true,
        })
    }

    pub(super) fn closed_keys(&self) -> Vec<ConnectionKey> {
        self.closed.lock().unwrap().iter().map(|(k, _)| *k).collect()
    }
}

impl TransportDriver for MockDriver {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn open_io(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn close_io(&self) {}

    fn start(self: Arc<Self>, _core: Node) -> Result<(), TransportError> {
        Ok(())
    }

    fn initiate_stop(&self, _deadline: Instant) {}

    fn wakeup(&self) {}

    fn join(&self) {}

    fn new_connection(self: Arc<Self>, timers: crate::node::ConnectionTimers) -> Connection {
        Connection::new(self, ConnState::Connecting, timers)
    }

    fn initiate_connection(&self, _conn: &mut Connection, peer: &Peer) -> bool {
        self.initiated.lock().unwrap().push(peer.clone());
        self.accept_connects
    }

    fn close(&self, conn: &Connection, reset: bool) {
        conn.send_handle().close();
        self.closed.lock().unwrap().push((conn.key(), reset));
    }
}

// ============================================================================
// Recording collaborators
// ============================================================================

#[derive(Default)]
pub(super) struct ListenerLog {
    pub(super) events: Mutex<Vec<(ConnectionKey, bool)>>,
}

impl ListenerLog {
    pub(super) fn ups(&self) -> usize {
        self.events.lock().unwrap().iter().filter(|(_, up)| *up).count()
    }

    pub(super) fn downs_for(&self, key: &ConnectionKey) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, up)| k == key && !*up)
            .count()
    }
}

struct RecordingListener(Arc<ListenerLog>);

impl ConnectionListener for RecordingListener {
    fn connection(&self, key: &ConnectionKey, _peer: Option<&Peer>, up: bool) {
        self.0.events.lock().unwrap().push((*key, up));
    }
}

#[derive(Default)]
pub(super) struct DispatchLog {
    pub(super) commands: Mutex<Vec<u32>>,
}

struct RecordingDispatcher {
    log: Arc<DispatchLog>,
    accept: bool,
}

impl MessageDispatcher for RecordingDispatcher {
    fn handle(&self, msg: &Message, _key: &ConnectionKey, _peer: Option<&Peer>) -> bool {
        self.log.commands.lock().unwrap().push(msg.header.command_code);
        self.accept
    }
}

/// Validator rejecting everyone, with an optional custom result code
/// and error message.
pub(super) struct RejectingValidator {
    pub(super) result_code: Option<u32>,
    pub(super) error_message: Option<String>,
}

impl NodeValidator for RejectingValidator {
    fn authenticate_node(&self, _host_id: &str, _info: &NodeAuthInfo) -> AuthenticationResult {
        AuthenticationResult {
            known: false,
            result_code: self.result_code,
            error_message: self.error_message.clone(),
        }
    }

    fn authorize_node(&self, _host_id: &str, settings: &NodeSettings, reported: &Capability) -> Capability {
        Capability::intersect(settings.capabilities(), reported)
    }
}

// ============================================================================
// Test bed
// ============================================================================

pub(super) struct TestBed {
    pub(super) node: Node,
    pub(super) driver: Arc<MockDriver>,
    pub(super) listener: Arc<ListenerLog>,
    pub(super) dispatched: Arc<DispatchLog>,
}

pub(super) fn test_settings() -> NodeSettings {
    let mut caps = Capability::new();
    caps.add_auth_app(4);
    let mut settings = NodeSettings::new("a.example", "example", 0, 0, "diapeer-test", caps).unwrap();
    settings.set_watchdog_interval(Duration::from_secs(6)).unwrap();
    settings
}

pub(super) fn bed() -> TestBed {
    bed_with(test_settings(), Box::new(crate::validator::DefaultNodeValidator), false)
}

pub(super) fn bed_with(settings: NodeSettings, validator: Box<dyn NodeValidator>, dispatcher_accepts: bool) -> TestBed {
    let listener = Arc::new(ListenerLog::default());
    let dispatched = Arc::new(DispatchLog::default());
    let node = Node::with_parts(
        settings,
        Box::new(RecordingDispatcher {
            log: dispatched.clone(),
            accept: dispatcher_accepts,
        }),
        Box::new(RecordingListener(listener.clone())),
        validator,
    );
    TestBed {
        node,
        driver: MockDriver::new(),
        listener,
        dispatched,
    }
}

impl TestBed {
    /// Install a connection in the given state. `host` also seeds the
    /// peer identity, as a completed CER/CEA would have.
    pub(super) fn add_conn(&self, state: ConnState, host: Option<&str>) -> (ConnectionKey, SendHandle) {
        self.add_conn_at(state, host, Instant::now())
    }

    /// Same, with the timers born at `timer_epoch` (in the past to make
    /// deadlines due).
    pub(super) fn add_conn_at(
        &self,
        state: ConnState,
        host: Option<&str>,
        timer_epoch: Instant,
    ) -> (ConnectionKey, SendHandle) {
        let timers = self.node.new_timers(timer_epoch);
        let mut conn = Connection::new(self.driver.clone(), state, timers);
        conn.set_remote_addr("192.0.2.9:49152".parse().unwrap());
        conn.set_local_addr("192.0.2.1:3868".parse().unwrap());
        if let Some(host) = host {
            conn.host_id = Some(host.to_string());
            conn.peer = Some(Peer::with_port(host, 3868));
        }
        let key = conn.key();
        let send = conn.send_handle();
        self.node.inner().registry.lock().insert(conn);
        (key, send)
    }

    pub(super) fn set_peer_caps(&self, key: &ConnectionKey, caps: Capability) {
        let mut reg = self.node.inner().registry.lock();
        let conn = reg.lookup_mut(key).expect("connection exists");
        conn.peer.as_mut().expect("peer set").capabilities = caps;
    }

    pub(super) fn state_of(&self, key: &ConnectionKey) -> Option<ConnState> {
        self.node.inner().registry.lock().lookup(key).map(|c| c.state())
    }

    pub(super) fn dwa_outstanding(&self, key: &ConnectionKey) -> bool {
        self.node
            .inner()
            .registry
            .lock()
            .lookup(key)
            .map(|c| c.timers().dwa_outstanding())
            .unwrap_or(false)
    }

    pub(super) fn mark_running(&self) {
        self.node
            .inner()
            .running
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub(super) fn stop(&self, grace: Duration) -> Result<(), NodeError> {
        self.node.stop(grace)
    }
}

// ============================================================================
// Frame helpers
// ============================================================================

/// Decode every frame queued on a send handle, draining it.
pub(super) fn drain_sent(send: &SendHandle) -> Vec<Message> {
    let mut bytes = Vec::new();
    let _ = send.flush_with(|data| {
        bytes.extend_from_slice(data);
        Ok(data.len())
    });
    let mut messages = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let len = Message::peek_length(&bytes[offset..])
            .expect("valid frame")
            .expect("complete frame");
        messages.push(Message::decode(&bytes[offset..offset + len]).expect("decodable frame"));
        offset += len;
    }
    messages
}

pub(super) fn result_code(msg: &Message) -> Option<u32> {
    msg.find(avp::RESULT_CODE).and_then(|a| a.as_u32().ok())
}

pub(super) fn origin_host(msg: &Message) -> Option<String> {
    msg.find(avp::ORIGIN_HOST).and_then(|a| a.as_utf8().ok().map(String::from))
}

/// A CER from `b.example` advertising the given auth applications.
pub(super) fn cer_with(origin_host: Option<&str>, auth_apps: &[u32]) -> Message {
    let mut msg = Message::request(command::CAPABILITIES_EXCHANGE, APPLICATION_COMMON);
    msg.header.hop_by_hop_identifier = 0x1111;
    msg.header.end_to_end_identifier = 0x2222;
    if let Some(host) = origin_host {
        msg.add(Avp::utf8(avp::ORIGIN_HOST, host));
    }
    msg.add(Avp::utf8(avp::ORIGIN_REALM, "example"));
    for app in auth_apps {
        msg.add(Avp::u32(avp::AUTH_APPLICATION_ID, *app));
    }
    msg
}

pub(super) fn cer() -> Message {
    cer_with(Some("b.example"), &[4])
}

/// A successful CEA from `b.example` advertising auth application 4.
pub(super) fn cea(result: u32) -> Message {
    let mut msg = Message::new(command::CAPABILITIES_EXCHANGE, APPLICATION_COMMON);
    msg.header.hop_by_hop_identifier = 0x1111;
    msg.header.end_to_end_identifier = 0x2222;
    msg.add(Avp::u32(avp::RESULT_CODE, result));
    msg.add(Avp::utf8(avp::ORIGIN_HOST, "b.example"));
    msg.add(Avp::utf8(avp::ORIGIN_REALM, "example"));
    msg.add(Avp::u32(avp::AUTH_APPLICATION_ID, 4));
    msg
}

/// An application request (command 9000001) on the given auth app.
pub(super) fn app_request(auth_app: Option<u32>) -> Message {
    let mut msg = Message::request(9_000_001, 4);
    msg.header.hop_by_hop_identifier = 0x3333;
    msg.header.end_to_end_identifier = 0x4444;
    msg.add(Avp::utf8(avp::ORIGIN_HOST, "b.example"));
    msg.add(Avp::utf8(avp::ORIGIN_REALM, "example"));
    if let Some(app) = auth_app {
        msg.add(Avp::u32(avp::AUTH_APPLICATION_ID, app));
    }
    msg
}
