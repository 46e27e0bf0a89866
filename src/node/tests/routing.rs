//! Inbound routing of application messages: loop detection, the
//! application filter, and dispatcher hand-off.

use super::*;
use crate::message::constants::result;
use crate::message::VendorSpecificApplicationId;

fn ready_conn_with_auth4(bed: &TestBed) -> (ConnectionKey, SendHandle) {
    let (key, send) = bed.add_conn(ConnState::Ready, Some("b.example"));
    let mut caps = Capability::new();
    caps.add_auth_app(4);
    bed.set_peer_caps(&key, caps);
    (key, send)
}

#[test]
fn looped_request_rejected_and_never_dispatched() {
    let bed = bed();
    let (key, send) = ready_conn_with_auth4(&bed);

    let mut msg = app_request(Some(4));
    msg.add(Avp::utf8(avp::ROUTE_RECORD, "x.example"));
    msg.add(Avp::utf8(avp::ROUTE_RECORD, "a.example"));

    assert!(bed.node.handle_message(msg, &key));

    let sent = drain_sent(&send);
    assert_eq!(sent.len(), 1);
    assert_eq!(result_code(&sent[0]), Some(result::LOOP_DETECTED));
    assert!(sent[0].header.is_error());
    assert!(bed.dispatched.commands.lock().unwrap().is_empty());
    // The connection stays up.
    assert_eq!(bed.state_of(&key), Some(ConnState::Ready));
}

#[test]
fn route_records_of_other_hosts_pass() {
    let bed = bed();
    let (key, send) = ready_conn_with_auth4(&bed);

    let mut msg = app_request(Some(4));
    msg.add(Avp::utf8(avp::ROUTE_RECORD, "x.example"));
    msg.add(Avp::utf8(avp::ROUTE_RECORD, "y.example"));

    assert!(bed.node.handle_message(msg, &key));
    // Declined by the recording dispatcher, so answered UNABLE_TO_DELIVER.
    assert_eq!(result_code(&drain_sent(&send)[0]), Some(result::UNABLE_TO_DELIVER));
    assert_eq!(bed.dispatched.commands.lock().unwrap().as_slice(), &[9_000_001]);
}

#[test]
fn unnegotiated_application_rejected() {
    let bed = bed();
    let (key, send) = ready_conn_with_auth4(&bed);

    assert!(bed.node.handle_message(app_request(Some(9)), &key));

    let sent = drain_sent(&send);
    assert_eq!(result_code(&sent[0]), Some(result::APPLICATION_UNSUPPORTED));
    assert!(sent[0].header.is_error());
    assert!(bed.dispatched.commands.lock().unwrap().is_empty());
    assert_eq!(bed.state_of(&key), Some(ConnState::Ready));
}

#[test]
fn missing_application_id_rejected() {
    let bed = bed();
    let (key, send) = ready_conn_with_auth4(&bed);
    assert!(bed.node.handle_message(app_request(None), &key));
    assert_eq!(
        result_code(&drain_sent(&send)[0]),
        Some(result::APPLICATION_UNSUPPORTED)
    );
}

#[test]
fn plain_auth_app_matches_3gpp_vendor_advertisement() {
    // The peer advertised the app inside Vendor-Specific-Application-Id
    // (vendor 10415) but sends requests with a plain
    // Auth-Application-Id, as 3GPP IMS stacks do.
    let bed = bed();
    let (key, send) = bed.add_conn(ConnState::Ready, Some("b.example"));
    let mut caps = Capability::new();
    caps.add_vendor_auth_app(10415, 4);
    bed.set_peer_caps(&key, caps);

    assert!(bed.node.handle_message(app_request(Some(4)), &key));
    // Passed the filter: the declining dispatcher answered 3002, not 3007.
    assert_eq!(result_code(&drain_sent(&send)[0]), Some(result::UNABLE_TO_DELIVER));
    assert_eq!(bed.dispatched.commands.lock().unwrap().len(), 1);
}

#[test]
fn vendor_specific_application_id_filtering() {
    let bed = bed();
    let (key, send) = bed.add_conn(ConnState::Ready, Some("b.example"));
    let mut caps = Capability::new();
    caps.add_vendor_acct_app(9, 3);
    bed.set_peer_caps(&key, caps);

    let mut msg = app_request(None);
    msg.avps.retain(|a| a.code != avp::AUTH_APPLICATION_ID);
    msg.add(
        VendorSpecificApplicationId {
            vendor_id: 9,
            auth_app_id: None,
            acct_app_id: Some(3),
        }
        .to_avp(),
    );
    assert!(bed.node.handle_message(msg, &key));
    assert_eq!(result_code(&drain_sent(&send)[0]), Some(result::UNABLE_TO_DELIVER));

    // Wrong vendor: denied.
    let mut msg = app_request(None);
    msg.add(
        VendorSpecificApplicationId {
            vendor_id: 10,
            auth_app_id: None,
            acct_app_id: Some(3),
        }
        .to_avp(),
    );
    assert!(bed.node.handle_message(msg, &key));
    assert_eq!(
        result_code(&drain_sent(&send)[0]),
        Some(result::APPLICATION_UNSUPPORTED)
    );
}

#[test]
fn malformed_application_id_denied() {
    let bed = bed();
    let (key, send) = ready_conn_with_auth4(&bed);
    let mut msg = app_request(None);
    msg.add(Avp::new(avp::AUTH_APPLICATION_ID, vec![1, 2]));
    assert!(bed.node.handle_message(msg, &key));
    assert_eq!(
        result_code(&drain_sent(&send)[0]),
        Some(result::APPLICATION_UNSUPPORTED)
    );
}

#[test]
fn accepted_request_is_not_answered_by_the_node() {
    let bed = bed_with(test_settings(), Box::new(crate::validator::DefaultNodeValidator), true);
    let (key, send) = ready_conn_with_auth4(&bed);
    assert!(bed.node.handle_message(app_request(Some(4)), &key));
    assert!(drain_sent(&send).is_empty());
    assert_eq!(bed.dispatched.commands.lock().unwrap().len(), 1);
}

#[test]
fn answers_bypass_loop_and_application_checks() {
    let bed = bed();
    let (key, send) = ready_conn_with_auth4(&bed);
    // An answer with our own host in Route-Record and no application id:
    // still dispatched, never rejected.
    let mut msg = app_request(None);
    msg.header.set_request(false);
    msg.add(Avp::utf8(avp::ROUTE_RECORD, "a.example"));

    assert!(bed.node.handle_message(msg, &key));
    assert!(drain_sent(&send).is_empty());
    assert_eq!(bed.dispatched.commands.lock().unwrap().len(), 1);
}

#[test]
fn rejections_copy_proxy_info() {
    let bed = bed();
    let (key, send) = ready_conn_with_auth4(&bed);
    let mut msg = app_request(Some(9));
    msg.add(Avp::new(avp::PROXY_INFO, vec![9, 9, 9, 9]));
    assert!(bed.node.handle_message(msg, &key));
    let sent = drain_sent(&send);
    assert!(sent[0].find(avp::PROXY_INFO).is_some());
}

#[test]
fn message_on_stale_key_is_refused() {
    let bed = bed();
    let (key, _send) = ready_conn_with_auth4(&bed);
    bed.node.close_connection(&key, false);
    assert!(!bed.node.handle_message(app_request(Some(4)), &key));
}
