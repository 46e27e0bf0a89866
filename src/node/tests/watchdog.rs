//! Device-watchdog behavior: DWR/DWA exchange and the timer walk.

use super::*;
use crate::message::constants::result;
use crate::node::TimerAction;

fn dwr_from_peer() -> Message {
    let mut msg = Message::request(command::DEVICE_WATCHDOG, APPLICATION_COMMON);
    msg.header.hop_by_hop_identifier = 0x5555;
    msg.add(Avp::utf8(avp::ORIGIN_HOST, "b.example"));
    msg.add(Avp::utf8(avp::ORIGIN_REALM, "example"));
    msg
}

fn dwa_from_peer() -> Message {
    let mut msg = Message::new(command::DEVICE_WATCHDOG, APPLICATION_COMMON);
    msg.add(Avp::u32(avp::RESULT_CODE, result::SUCCESS));
    msg.add(Avp::utf8(avp::ORIGIN_HOST, "b.example"));
    msg.add(Avp::utf8(avp::ORIGIN_REALM, "example"));
    msg
}

#[test]
fn dwr_answered_with_dwa() {
    let bed = bed();
    let (key, send) = bed.add_conn(ConnState::Ready, Some("b.example"));

    assert!(bed.node.handle_message(dwr_from_peer(), &key));

    let sent = drain_sent(&send);
    assert_eq!(sent.len(), 1);
    let dwa = &sent[0];
    assert!(!dwa.header.is_request());
    assert_eq!(dwa.header.command_code, command::DEVICE_WATCHDOG);
    assert_eq!(dwa.header.hop_by_hop_identifier, 0x5555);
    assert_eq!(result_code(dwa), Some(result::SUCCESS));
    assert_eq!(origin_host(dwa).as_deref(), Some("a.example"));
    assert_eq!(
        dwa.find(avp::ORIGIN_STATE_ID).unwrap().as_u32().unwrap(),
        bed.node.state_id()
    );
    assert_eq!(bed.state_of(&key), Some(ConnState::Ready));
}

#[test]
fn dwa_clears_outstanding_watchdog() {
    let bed = bed();
    let (key, _send) = bed.add_conn(ConnState::Ready, Some("b.example"));
    {
        let mut reg = bed.node.inner().registry.lock();
        reg.lookup_mut(&key).unwrap().timers_mut().mark_dwr_sent(Instant::now());
    }
    assert!(bed.dwa_outstanding(&key));
    assert!(bed.node.handle_message(dwa_from_peer(), &key));
    assert!(!bed.dwa_outstanding(&key));
}

#[test]
fn timer_walk_sends_dwr_on_ready_connection() {
    let bed = bed();
    // Timers born 10 s ago with a 6 s watchdog: the jittered deadline
    // (6 +/- 2 s) has passed.
    let epoch = Instant::now() - Duration::from_secs(10);
    let (key, send) = bed.add_conn_at(ConnState::Ready, Some("b.example"), epoch);

    bed.node.run_timers(TransportKind::Tcp);

    let sent = drain_sent(&send);
    assert_eq!(sent.len(), 1);
    let dwr = &sent[0];
    assert!(dwr.header.is_request());
    assert_eq!(dwr.header.command_code, command::DEVICE_WATCHDOG);
    assert_eq!(origin_host(dwr).as_deref(), Some("a.example"));
    assert!(dwr.find(avp::ORIGIN_STATE_ID).is_some());
    assert!(bed.dwa_outstanding(&key));
    assert_eq!(bed.state_of(&key), Some(ConnState::Ready));
}

#[test]
fn no_dwr_on_connections_that_are_not_ready() {
    let bed = bed();
    let epoch = Instant::now() - Duration::from_secs(60);
    for state in [ConnState::ConnectedIn, ConnState::ConnectedOut, ConnState::Closing] {
        let (key, send) = bed.add_conn_at(state, Some("b.example"), epoch);
        bed.node.run_timers(TransportKind::Tcp);
        // The overdue pre-ready connection is torn down, never watchdogged.
        assert!(drain_sent(&send).is_empty());
        assert_eq!(bed.state_of(&key), None);
        assert!(bed.driver.closed_keys().contains(&key));
    }
}

#[test]
fn silent_peer_with_outstanding_dwr_is_hard_closed() {
    let bed = bed();
    let (key, send) = bed.add_conn(ConnState::Ready, Some("b.example"));
    {
        let mut reg = bed.node.inner().registry.lock();
        let timers = reg.lookup_mut(&key).unwrap().timers_mut();
        // DWR went out over one watchdog interval ago; no DWA since.
        timers.mark_dwr_sent(Instant::now() - Duration::from_secs(7));
    }

    bed.node.run_timers(TransportKind::Tcp);

    assert_eq!(bed.state_of(&key), None);
    assert_eq!(bed.driver.closed.lock().unwrap().as_slice(), &[(key, false)]);
    assert_eq!(bed.listener.downs_for(&key), 1);
    // Hard close: no DPR was sent.
    assert!(drain_sent(&send).is_empty());
}

#[test]
fn missing_cer_times_out_within_watchdog_interval() {
    let bed = bed();
    let epoch = Instant::now() - Duration::from_secs(7);
    let (key, _send) = bed.add_conn_at(ConnState::ConnectedIn, None, epoch);
    bed.node.run_timers(TransportKind::Tcp);
    assert_eq!(bed.state_of(&key), None);
    assert!(bed.driver.closed_keys().contains(&key));
}

#[test]
fn idle_connection_gets_graceful_dpr_with_cause_busy() {
    let mut settings = test_settings();
    settings.set_idle_timeout(Duration::from_secs(30));
    let bed = bed_with(settings, Box::new(crate::validator::DefaultNodeValidator), false);
    let epoch = Instant::now() - Duration::from_secs(31);
    let (key, send) = bed.add_conn_at(ConnState::Ready, Some("b.example"), epoch);
    // Keep the watchdog quiet so only the idle cutoff is due.
    {
        let mut reg = bed.node.inner().registry.lock();
        reg.lookup_mut(&key).unwrap().timers_mut().mark_activity(Instant::now());
    }

    bed.node.run_timers(TransportKind::Tcp);

    assert_eq!(bed.state_of(&key), Some(ConnState::Closing));
    let sent = drain_sent(&send);
    assert_eq!(sent.len(), 1);
    let dpr = &sent[0];
    assert!(dpr.header.is_request());
    assert_eq!(dpr.header.command_code, command::DISCONNECT_PEER);
    assert_eq!(dpr.find(avp::DISCONNECT_CAUSE).unwrap().as_u32().unwrap(), 1);
}

#[test]
fn timer_actions_by_state() {
    // calc_next_timeout/calc_action glue: a ready connection with
    // nothing due reports None and a future deadline.
    let bed = bed();
    let (key, _send) = bed.add_conn(ConnState::Ready, Some("b.example"));
    let deadline = bed.node.calc_next_timeout(TransportKind::Tcp).unwrap();
    assert!(deadline > Instant::now());
    {
        let reg = bed.node.inner().registry.lock();
        let conn = reg.lookup(&key).unwrap();
        assert_eq!(conn.timers().calc_action(true, Instant::now()), TimerAction::None);
    }
}
