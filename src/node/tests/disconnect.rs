//! Disconnect handling and node lifecycle: DPR/DPA, idempotent close,
//! graceful stop, and connection initiation.

use super::*;
use crate::message::constants::{disconnect_cause, result};
use std::sync::atomic::Ordering;

fn dpr_from_peer(cause: u32) -> Message {
    let mut msg = Message::request(command::DISCONNECT_PEER, APPLICATION_COMMON);
    msg.header.hop_by_hop_identifier = 0x7777;
    msg.add(Avp::utf8(avp::ORIGIN_HOST, "b.example"));
    msg.add(Avp::utf8(avp::ORIGIN_REALM, "example"));
    msg.add(Avp::u32(avp::DISCONNECT_CAUSE, cause));
    msg
}

fn dpa_from_peer() -> Message {
    let mut msg = Message::new(command::DISCONNECT_PEER, APPLICATION_COMMON);
    msg.add(Avp::u32(avp::RESULT_CODE, result::SUCCESS));
    msg.add(Avp::utf8(avp::ORIGIN_HOST, "b.example"));
    msg.add(Avp::utf8(avp::ORIGIN_REALM, "example"));
    msg
}

#[test]
fn dpr_answered_with_dpa_then_closed() {
    let bed = bed();
    let (key, send) = bed.add_conn(ConnState::Ready, Some("b.example"));

    // false tells the driver to close once the DPA is flushed.
    assert!(!bed.node.handle_message(dpr_from_peer(disconnect_cause::REBOOTING), &key));

    let sent = drain_sent(&send);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].header.command_code, command::DISCONNECT_PEER);
    assert!(!sent[0].header.is_request());
    assert_eq!(sent[0].header.hop_by_hop_identifier, 0x7777);
    assert_eq!(result_code(&sent[0]), Some(result::SUCCESS));
}

#[test]
fn dpa_closes_a_closing_connection() {
    let bed = bed();
    let (key, _send) = bed.add_conn(ConnState::Closing, Some("b.example"));
    assert!(!bed.node.handle_message(dpa_from_peer(), &key));

    // A DPA out of the blue also closes.
    let (key, _send) = bed.add_conn(ConnState::Ready, Some("b.example"));
    assert!(!bed.node.handle_message(dpa_from_peer(), &key));
}

#[test]
fn close_is_idempotent_and_notifies_listener_once() {
    let bed = bed();
    let (key, _send) = bed.add_conn(ConnState::Ready, Some("b.example"));

    bed.node.close_connection(&key, false);
    bed.node.close_connection(&key, false);

    assert_eq!(bed.listener.downs_for(&key), 1);
    assert_eq!(bed.driver.closed_keys().iter().filter(|k| **k == key).count(), 1);
    assert!(!bed.node.is_connection_key_valid(&key));
}

#[test]
fn send_message_on_stale_or_non_ready_connection_fails() {
    let bed = bed();
    let msg = app_request(Some(4));

    // Unknown key.
    let (key, _send) = bed.add_conn(ConnState::Ready, Some("b.example"));
    bed.node.close_connection(&key, false);
    assert!(matches!(
        bed.node.send_message(&msg, &key),
        Err(NodeError::StaleConnection)
    ));

    // Known but not open for traffic.
    let (key, _send) = bed.add_conn(ConnState::ConnectedIn, None);
    assert!(matches!(
        bed.node.send_message(&msg, &key),
        Err(NodeError::StaleConnection)
    ));
}

#[test]
fn send_message_queues_on_ready_connection() {
    let bed = bed();
    let (key, send) = bed.add_conn(ConnState::Ready, Some("b.example"));
    let mut msg = app_request(Some(4));
    msg.header.hop_by_hop_identifier = bed.node.next_hop_by_hop_identifier(&key).unwrap();
    bed.node.send_message(&msg, &key).unwrap();
    let sent = drain_sent(&send);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].header.command_code, 9_000_001);
}

#[test]
fn stop_sends_dpr_with_cause_rebooting() {
    let bed = bed();
    bed.mark_running();
    let (ready_key, ready_send) = bed.add_conn(ConnState::Ready, Some("b.example"));
    let (pending_key, pending_send) = bed.add_conn(ConnState::ConnectedIn, None);

    bed.stop(Duration::from_millis(100)).unwrap();

    // The ready peer got a DPR with Disconnect-Cause=REBOOTING before
    // its socket closed.
    let sent = drain_sent(&ready_send);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].header.is_request());
    assert_eq!(sent[0].header.command_code, command::DISCONNECT_PEER);
    assert_eq!(
        sent[0].find(avp::DISCONNECT_CAUSE).unwrap().as_u32().unwrap(),
        disconnect_cause::REBOOTING
    );
    // The pre-ready connection was closed without any farewell.
    assert!(drain_sent(&pending_send).is_empty());

    // Everything is gone from the registry and the driver was told to
    // close both sockets.
    assert!(!bed.node.is_connection_key_valid(&ready_key));
    assert!(!bed.node.is_connection_key_valid(&pending_key));
    assert!(bed.driver.closed_keys().contains(&ready_key));
    assert!(bed.driver.closed_keys().contains(&pending_key));
    assert!(!bed.node.inner().running.load(Ordering::SeqCst));
}

#[test]
fn stop_without_start_reports_not_running() {
    let bed = bed();
    assert!(matches!(bed.stop(Duration::ZERO), Err(NodeError::NotRunning)));
}

#[test]
fn wait_for_connection_times_out_and_unblocks_on_stop() {
    let bed = bed();
    bed.mark_running();
    assert!(matches!(
        bed.node.wait_for_connection_timeout(Duration::from_millis(20)),
        Err(NodeError::ConnectionTimeout(_))
    ));

    // A stopping node releases waiters with NotRunning.
    let node = bed.node.clone();
    let waiter = std::thread::spawn(move || node.wait_for_connection());
    std::thread::sleep(Duration::from_millis(20));
    bed.stop(Duration::ZERO).unwrap();
    assert!(matches!(waiter.join().unwrap(), Err(NodeError::NotRunning)));
}

#[test]
fn initiate_connection_is_idempotent() {
    let bed = bed();
    bed.mark_running();
    bed.node
        .inner()
        .drivers
        .lock()
        .unwrap()
        .push(bed.driver.clone());

    let peer = Peer::with_port("b.example", 3868);
    bed.node.initiate_connection(&peer, true).unwrap();
    assert_eq!(bed.driver.initiated.lock().unwrap().len(), 1);
    assert_eq!(bed.node.inner().registry.lock().len(), 1);

    // A second call sees the existing connection and does nothing.
    bed.node.initiate_connection(&peer, false).unwrap();
    assert_eq!(bed.driver.initiated.lock().unwrap().len(), 1);
    assert_eq!(bed.node.inner().registry.lock().len(), 1);

    // The peer was recorded as persistent.
    assert_eq!(bed.node.inner().registry.persistent_peers(), vec![peer]);
}

#[test]
fn initiate_connection_on_unloaded_transport_is_ignored() {
    let bed = bed();
    bed.mark_running();
    let peer = Peer::with_transport("b.example", 3868, TransportKind::Sctp);
    bed.node.initiate_connection(&peer, false).unwrap();
    assert_eq!(bed.node.inner().registry.lock().len(), 0);
}

#[test]
fn unroutable_peer_leaves_no_connection_behind() {
    let mut bed = bed();
    bed.mark_running();
    // A driver that refuses every connect attempt.
    let driver = Arc::new(MockDriver {
        kind: TransportKind::Tcp,
        closed: Mutex::new(Vec::new()),
        initiated: Mutex::new(Vec::new()),
        accept_connects: false,
    });
    bed.driver = driver.clone();
    bed.node.inner().drivers.lock().unwrap().push(driver.clone());

    bed.node
        .initiate_connection(&Peer::with_port("nowhere.example", 3868), false)
        .unwrap();
    assert_eq!(driver.initiated.lock().unwrap().len(), 1);
    assert_eq!(bed.node.inner().registry.lock().len(), 0);
}

#[test]
fn inbound_accept_registers_connection_until_shutdown() {
    let bed = bed();
    let remote = "192.0.2.7:49000".parse().unwrap();
    let (key, _send) = bed
        .node
        .accept_connection(bed.driver.clone(), remote, None)
        .expect("accepted");
    assert_eq!(bed.state_of(&key), Some(ConnState::ConnectedIn));

    bed.node.inner().registry.lock().please_stop = true;
    assert!(bed.node.accept_connection(bed.driver.clone(), remote, None).is_none());
}
