//! The per-connection protocol engine.
//!
//! Transport drivers deliver every decoded frame here. Base-protocol
//! commands (CER/CEA, DWR/DWA, DPR/DPA) are handled internally; other
//! messages pass the loop and application checks and go to the
//! dispatcher. Handlers return false when the driver should close the
//! connection.
//!
//! Locking: handlers snapshot what they need from a connection under
//! the registry mutex, release it, and re-acquire for mutations. The
//! dispatcher and listener are always called with no node locks held so
//! they can call back into the node.

use crate::capabilities::Capability;
use crate::message::constants::{avp, command, disconnect_cause, result, APPLICATION_COMMON, VENDOR_3GPP};
use crate::message::{failed_avp, Avp, CodecError, Message, VendorSpecificApplicationId};
use crate::node::connection::{ConnState, Connection, ConnectionKey, SendHandle};
use crate::node::timers::{ConnectionTimers, JitterSource, TimerAction};
use crate::node::Node;
use crate::peer::{Peer, DEFAULT_PORT};
use crate::transport::{TransportDriver, TransportKind};
use crate::validator::NodeAuthInfo;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Snapshot of a connection taken under the registry lock, so handlers
/// can work without holding it.
pub(crate) struct ConnView {
    pub(crate) key: ConnectionKey,
    pub(crate) state: ConnState,
    pub(crate) peer: Option<Peer>,
    pub(crate) send: SendHandle,
    pub(crate) driver: Arc<dyn TransportDriver>,
    pub(crate) remote_addr: Option<SocketAddr>,
    pub(crate) local_addrs: Vec<IpAddr>,
    pub(crate) name: String,
}

/// How capability-exchange parsing failed.
enum CexFailure {
    InvalidLength(Avp),
    InvalidValue(Avp),
}

impl Node {
    pub(crate) fn new_timers(&self, now: Instant) -> ConnectionTimers {
        let settings = &self.inner().settings;
        ConnectionTimers::new(
            settings.watchdog_interval(),
            settings.idle_timeout(),
            JitterSource::new(settings.jitter_prng()),
            now,
        )
    }

    fn view_of(conn: &Connection) -> ConnView {
        ConnView {
            key: conn.key(),
            state: conn.state(),
            peer: conn.peer().cloned(),
            send: conn.send_handle(),
            driver: conn.driver().clone(),
            remote_addr: conn.remote_addr(),
            local_addrs: conn.driver().local_addresses(conn),
            name: conn.display_name(),
        }
    }

    /// Encode and queue a message, then wake the owning driver. Safe to
    /// call with or without the registry lock held.
    fn send_on(&self, view: &ConnView, msg: &Message) {
        trace!(command = msg.header.command_code, peer = %view.name, "Sending message");
        let raw = msg.encode();
        if !view.send.queue(&raw) {
            warn!(peer = %view.name, "Outbound buffer full; dropping frame");
        }
        view.driver.wakeup();
    }

    // ==== inbound routing ====

    /// Handle one decoded frame from a driver. Returns false when the
    /// driver should close the connection.
    pub(crate) fn handle_message(&self, msg: Message, key: &ConnectionKey) -> bool {
        let now = Instant::now();
        let view = {
            let mut reg = self.inner().registry.lock();
            let conn = match reg.lookup_mut(key) {
                Some(conn) => conn,
                None => return false,
            };
            conn.timers_mut().mark_activity(now);
            Self::view_of(conn)
        };
        trace!(
            command = msg.header.command_code,
            application = msg.header.application_id,
            state = %view.state,
            peer = %view.name,
            "Frame received"
        );

        match view.state {
            ConnState::ConnectedIn => {
                if !msg.header.is_request()
                    || msg.header.command_code != command::CAPABILITIES_EXCHANGE
                    || msg.header.application_id != APPLICATION_COMMON
                {
                    warn!(peer = %view.name, "Expected a CER; got something else");
                    return false;
                }
                self.mark_real_activity(key, now);
                self.handle_cer(&msg, &view)
            }
            ConnState::ConnectedOut => {
                if msg.header.is_request()
                    || msg.header.command_code != command::CAPABILITIES_EXCHANGE
                    || msg.header.application_id != APPLICATION_COMMON
                {
                    warn!(peer = %view.name, "Expected a CEA; got something else");
                    return false;
                }
                self.mark_real_activity(key, now);
                self.handle_cea(&msg, &view)
            }
            ConnState::Ready | ConnState::Closing => match msg.header.command_code {
                command::CAPABILITIES_EXCHANGE => {
                    warn!(peer = %view.name, "CER/CEA after initial capability exchange");
                    false
                }
                command::DEVICE_WATCHDOG => {
                    if msg.header.is_request() {
                        self.handle_dwr(&msg, &view, now)
                    } else {
                        self.handle_dwa(&view, now)
                    }
                }
                command::DISCONNECT_PEER => {
                    if msg.header.is_request() {
                        self.handle_dpr(&msg, &view)
                    } else {
                        self.handle_dpa(&view)
                    }
                }
                _ => {
                    self.mark_real_activity(key, now);
                    if msg.header.is_request() {
                        if self.is_looped_message(&msg) {
                            warn!(peer = %view.name, command = msg.header.command_code, "Rejecting looped request");
                            self.reject_request(&msg, &view, result::LOOP_DETECTED);
                            return true;
                        }
                        if !self.is_allowed_application(&msg, view.peer.as_ref()) {
                            warn!(
                                peer = %view.name,
                                command = msg.header.command_code,
                                "Rejecting request for an application the peer did not negotiate"
                            );
                            self.reject_request(&msg, &view, result::APPLICATION_UNSUPPORTED);
                            return true;
                        }
                    }
                    let handled = self.inner().dispatcher.handle(&msg, key, view.peer.as_ref());
                    if !handled && msg.header.is_request() {
                        info!(peer = %view.name, command = msg.header.command_code, "Request not handled by dispatcher");
                        self.reject_request(&msg, &view, result::UNABLE_TO_DELIVER);
                    }
                    true
                }
            },
            ConnState::Tls => {
                warn!(peer = %view.name, "Message on a connection in the unsupported tls state");
                false
            }
            ConnState::Connecting | ConnState::Closed => {
                warn!(peer = %view.name, state = %view.state, "Message on a connection in an unexpected state");
                false
            }
        }
    }

    fn mark_real_activity(&self, key: &ConnectionKey, now: Instant) {
        let mut reg = self.inner().registry.lock();
        if let Some(conn) = reg.lookup_mut(key) {
            conn.timers_mut().mark_real_activity(now);
        }
    }

    // ==== loop detection (RFC 3588 section 6.1.3) ====

    fn is_looped_message(&self, msg: &Message) -> bool {
        msg.subset(avp::ROUTE_RECORD)
            .any(|a| a.as_utf8().is_ok_and(|host| host == self.inner().settings.host_id()))
    }

    // ==== application filtering ====

    /// Whether the peer negotiated the application this message carries.
    pub(crate) fn is_allowed_application(&self, msg: &Message, peer: Option<&Peer>) -> bool {
        let caps = match peer {
            Some(peer) => &peer.capabilities,
            None => return false,
        };

        if let Some(a) = msg.find(avp::AUTH_APPLICATION_ID) {
            let app = match a.as_u32() {
                Ok(app) => app,
                Err(e) => {
                    info!(error = %e, "Malformed Auth-Application-Id");
                    return false;
                }
            };
            trace!(auth_app = app, "Checking application");
            // 3GPP wrinkle: CER/CEA advertises the app inside a
            // Vendor-Specific-Application-Id, but the actual messages
            // carry a plain Auth-Application-Id.
            return caps.is_allowed_auth_app(app) || caps.is_allowed_vendor_auth_app(VENDOR_3GPP, app);
        }

        if let Some(a) = msg.find(avp::ACCT_APPLICATION_ID) {
            return match a.as_u32() {
                Ok(app) => caps.is_allowed_acct_app(app),
                Err(e) => {
                    info!(error = %e, "Malformed Acct-Application-Id");
                    false
                }
            };
        }

        if let Some(a) = msg.find(avp::VENDOR_SPECIFIC_APPLICATION_ID) {
            let vsai = match VendorSpecificApplicationId::from_avp(a) {
                Ok(vsai) => vsai,
                Err(e) => {
                    info!(error = %e, "Malformed Vendor-Specific-Application-Id");
                    return false;
                }
            };
            if let Some(auth_app) = vsai.auth_app_id {
                return caps.is_allowed_vendor_auth_app(vsai.vendor_id, auth_app);
            }
            if let Some(acct_app) = vsai.acct_app_id {
                return caps.is_allowed_vendor_acct_app(vsai.vendor_id, acct_app);
            }
            return false;
        }

        warn!("No Auth-Application-Id, Acct-Application-Id nor Vendor-Specific-Application-Id in request");
        false
    }

    /// Answer a request with an error Result-Code, keeping the
    /// connection open. Proxy-Info is copied back per RFC 3588.
    fn reject_request(&self, msg: &Message, view: &ConnView, result_code: u32) {
        let mut answer = Message::answer_to(msg);
        if result::is_protocol_error(result_code) {
            answer.header.set_error(true);
        }
        answer.add(Avp::u32(avp::RESULT_CODE, result_code));
        self.add_our_host_and_realm(&mut answer);
        answer.copy_proxy_info(msg);
        self.send_on(view, &answer);
    }

    // ==== capability exchange ====

    fn handle_cer(&self, msg: &Message, view: &ConnView) -> bool {
        trace!(peer = %view.name, "CER received");
        let host_avp = match msg.find(avp::ORIGIN_HOST) {
            Some(a) => a,
            None => {
                trace!(peer = %view.name, "CER is missing Origin-Host; rejecting");
                let mut answer = Message::answer_to(msg);
                answer.add(Avp::u32(avp::RESULT_CODE, result::MISSING_AVP));
                self.add_our_host_and_realm(&mut answer);
                answer.add(failed_avp(&Avp::utf8(avp::ORIGIN_HOST, "")));
                self.send_on(view, &answer);
                return false;
            }
        };
        let host_id = match host_avp.as_utf8() {
            Ok(host) => host.to_string(),
            Err(_) => {
                let mut answer = Message::answer_to(msg);
                answer.add(Avp::u32(avp::RESULT_CODE, result::INVALID_AVP_VALUE));
                self.add_our_host_and_realm(&mut answer);
                answer.add(failed_avp(host_avp));
                self.send_on(view, &answer);
                return false;
            }
        };
        trace!(peer_host = %host_id, "Peer identified itself");

        // Authenticate before the election; otherwise a rogue node could
        // trick us into disconnecting a legitimate peer.
        let auth_info = NodeAuthInfo {
            remote_addr: view.remote_addr,
            transport: view.driver.kind(),
        };
        let auth = self.inner().validator.authenticate_node(&host_id, &auth_info);
        if !auth.known {
            trace!(peer_host = %host_id, "Validator does not know this peer; rejecting");
            let mut answer = Message::answer_to(msg);
            answer.add(Avp::u32(
                avp::RESULT_CODE,
                auth.result_code.unwrap_or(result::UNKNOWN_PEER),
            ));
            self.add_our_host_and_realm(&mut answer);
            if let Some(text) = &auth.error_message {
                answer.add(Avp::utf8(avp::ERROR_MESSAGE, text));
            }
            self.send_on(view, &answer);
            return false;
        }

        if !self.do_election(&host_id) {
            trace!(peer_host = %host_id, "CER lost the election; rejecting");
            let mut answer = Message::answer_to(msg);
            answer.add(Avp::u32(avp::RESULT_CODE, result::ELECTION_LOST));
            self.add_our_host_and_realm(&mut answer);
            self.send_on(view, &answer);
            return false;
        }

        // Adopt the advertised identity.
        {
            let mut reg = self.inner().registry.lock();
            let conn = match reg.lookup_mut(&view.key) {
                Some(conn) => conn,
                None => return false,
            };
            let port = conn.remote_addr().map_or(DEFAULT_PORT, |a| a.port());
            conn.peer = Some(Peer::with_transport(&host_id, port, conn.transport()));
            conn.host_id = Some(host_id.clone());
        }

        let caps = match self.negotiate_capabilities(msg, &host_id, view) {
            Some(caps) => caps,
            None => return false,
        };

        let mut cea = Message::answer_to(msg);
        cea.add(Avp::u32(avp::RESULT_CODE, result::SUCCESS));
        self.add_ce_payload(&mut cea, &caps, &view.local_addrs);
        self.send_on(view, &cea);

        self.mark_ready(&view.key)
    }

    fn handle_cea(&self, msg: &Message, view: &ConnView) -> bool {
        trace!(peer = %view.name, "CEA received");
        let result_code = match msg.find(avp::RESULT_CODE) {
            Some(a) => match a.as_u32() {
                Ok(code) => code,
                Err(_) => {
                    info!(peer = %view.name, "CEA carried an ill-formed Result-Code; dropping connection");
                    return false;
                }
            },
            None => {
                warn!(peer = %view.name, "CEA without Result-Code (RFC 3588 section 5.3.2); dropping connection");
                return false;
            }
        };
        if result_code != result::SUCCESS {
            info!(peer = %view.name, result_code, "Peer rejected our CER; dropping connection");
            return false;
        }

        let host_id = match msg.find(avp::ORIGIN_HOST).map(|a| a.as_utf8()) {
            Some(Ok(host)) => host.to_string(),
            _ => {
                warn!(peer = %view.name, "CEA without usable Origin-Host (RFC 3588 section 5.3.2); dropping connection");
                return false;
            }
        };
        trace!(peer_host = %host_id, expected = %view.name, "Peer identified itself in CEA");

        {
            let mut reg = self.inner().registry.lock();
            let conn = match reg.lookup_mut(&view.key) {
                Some(conn) => conn,
                None => return false,
            };
            match conn.peer.as_mut() {
                Some(peer) => peer.set_host(&host_id),
                None => {
                    let port = conn.remote_addr().map_or(DEFAULT_PORT, |a| a.port());
                    conn.peer = Some(Peer::with_transport(&host_id, port, conn.transport()));
                }
            }
            conn.host_id = Some(host_id.clone());
        }

        if self.negotiate_capabilities(msg, &host_id, view).is_none() {
            return false;
        }
        self.mark_ready(&view.key)
    }

    /// Election on a duplicate CER (RFC 3588 section 5.6.4): identities
    /// compare as unsigned byte strings. Returns false when this CER
    /// must be rejected.
    fn do_election(&self, cer_host_id: &str) -> bool {
        use std::cmp::Ordering;
        let ours = self.inner().settings.host_id();
        match ours.as_bytes().cmp(cer_host_id.as_bytes()) {
            Ordering::Equal => {
                warn!(host_id = %cer_host_id, "CER carries our own identity; suspecting a connection to ourselves");
                false
            }
            winner => {
                let existing = self.inner().registry.lock().ready_to_host(cer_host_id);
                match existing {
                    None => true,
                    Some(other_key) => {
                        info!(peer_host = %cer_host_id, "Duplicate connection to a peer we already talk to");
                        if winner == Ordering::Greater {
                            // Our identity wins: the new connection
                            // survives, the old one goes.
                            self.close_connection(&other_key, false);
                            true
                        } else {
                            false
                        }
                    }
                }
            }
        }
    }

    /// Parse the peer's advertised capabilities, run them through the
    /// validator, and store the result. `None` means the connection must
    /// be dropped (an error answer has been sent when appropriate).
    fn negotiate_capabilities(&self, msg: &Message, host_id: &str, view: &ConnView) -> Option<Capability> {
        trace!("Processing capability exchange");
        let reported = match self.parse_reported_capabilities(msg) {
            Ok(reported) => reported,
            Err(failure) => {
                let (code, offender) = match failure {
                    CexFailure::InvalidLength(a) => (result::INVALID_AVP_LENGTH, a),
                    CexFailure::InvalidValue(a) => (result::INVALID_AVP_VALUE, a),
                };
                warn!(peer_host = %host_id, "Invalid AVP in CER/CEA");
                if msg.header.is_request() {
                    let mut answer = Message::answer_to(msg);
                    answer.add(Avp::u32(avp::RESULT_CODE, code));
                    self.add_our_host_and_realm(&mut answer);
                    answer.add(failed_avp(&offender));
                    self.send_on(view, &answer);
                }
                return None;
            }
        };

        let granted = self
            .inner()
            .validator
            .authorize_node(host_id, &self.inner().settings, &reported);
        if granted.is_empty() {
            warn!(peer_host = %host_id, "No application in common with peer");
            if msg.header.is_request() {
                let mut answer = Message::answer_to(msg);
                answer.add(Avp::u32(avp::RESULT_CODE, result::NO_COMMON_APPLICATION));
                self.add_our_host_and_realm(&mut answer);
                self.send_on(view, &answer);
            }
            return None;
        }

        let mut reg = self.inner().registry.lock();
        let conn = reg.lookup_mut(&view.key)?;
        if let Some(peer) = conn.peer.as_mut() {
            peer.capabilities = granted.clone();
        }
        Some(granted)
    }

    fn parse_reported_capabilities(&self, msg: &Message) -> Result<Capability, CexFailure> {
        let mut reported = Capability::new();
        for a in msg.subset(avp::SUPPORTED_VENDOR_ID) {
            let vendor = a.as_u32().map_err(|_| CexFailure::InvalidLength(a.clone()))?;
            trace!(vendor, "Peer supports vendor");
            reported.add_supported_vendor(vendor);
        }
        for a in msg.subset(avp::AUTH_APPLICATION_ID) {
            let app = a.as_u32().map_err(|_| CexFailure::InvalidLength(a.clone()))?;
            trace!(auth_app = app, "Peer supports auth application");
            if app != APPLICATION_COMMON {
                reported.add_auth_app(app);
            }
        }
        for a in msg.subset(avp::ACCT_APPLICATION_ID) {
            let app = a.as_u32().map_err(|_| CexFailure::InvalidLength(a.clone()))?;
            trace!(acct_app = app, "Peer supports acct application");
            if app != APPLICATION_COMMON {
                reported.add_acct_app(app);
            }
        }
        for a in msg.subset(avp::VENDOR_SPECIFIC_APPLICATION_ID) {
            let vsai = VendorSpecificApplicationId::from_avp(a).map_err(|e| match e {
                CodecError::InvalidAvpLength { .. } => CexFailure::InvalidLength(a.clone()),
                _ => CexFailure::InvalidValue(a.clone()),
            })?;
            if let Some(auth_app) = vsai.auth_app_id {
                reported.add_vendor_auth_app(vsai.vendor_id, auth_app);
            }
            if let Some(acct_app) = vsai.acct_app_id {
                reported.add_vendor_acct_app(vsai.vendor_id, acct_app);
            }
        }
        Ok(reported)
    }

    /// Transition to `Ready`, notify the listener, and release
    /// `wait_for_connection` waiters, strictly in that order.
    fn mark_ready(&self, key: &ConnectionKey) -> bool {
        let peer = {
            let mut reg = self.inner().registry.lock();
            let conn = match reg.lookup_mut(key) {
                Some(conn) => conn,
                None => return false,
            };
            conn.state = ConnState::Ready;
            conn.peer.clone()
        };
        match &peer {
            Some(peer) => info!(%peer, "Connection is now ready"),
            None => info!(%key, "Connection is now ready"),
        }
        self.inner().listener.connection(key, peer.as_ref(), true);
        self.notify_connection_waiters();
        true
    }

    /// The common CER/CEA payload: identity, addresses, and the
    /// capability block. Every AVP carries the M bit.
    fn add_ce_payload(&self, msg: &mut Message, caps: &Capability, local_addrs: &[IpAddr]) {
        let settings = &self.inner().settings;
        self.add_our_host_and_realm(msg);
        for ip in local_addrs {
            msg.add(Avp::address(avp::HOST_IP_ADDRESS, *ip));
        }
        msg.add(Avp::u32(avp::VENDOR_ID, settings.vendor_id()));
        msg.add(Avp::utf8(avp::PRODUCT_NAME, settings.product_name()));
        msg.add(Avp::u32(avp::ORIGIN_STATE_ID, self.inner().ids.state_id()));

        // Sorted for a deterministic wire image.
        let mut vendors: Vec<u32> = caps.supported_vendors.iter().copied().collect();
        vendors.sort_unstable();
        for vendor in vendors {
            msg.add(Avp::u32(avp::SUPPORTED_VENDOR_ID, vendor));
        }
        let mut auth_apps: Vec<u32> = caps.auth_apps.iter().copied().collect();
        auth_apps.sort_unstable();
        for app in auth_apps {
            msg.add(Avp::u32(avp::AUTH_APPLICATION_ID, app));
        }
        let mut acct_apps: Vec<u32> = caps.acct_apps.iter().copied().collect();
        acct_apps.sort_unstable();
        for app in acct_apps {
            msg.add(Avp::u32(avp::ACCT_APPLICATION_ID, app));
        }
        let mut auth_vendor: Vec<_> = caps.auth_vendor_apps.iter().copied().collect();
        auth_vendor.sort_unstable_by_key(|va| (va.vendor_id, va.application_id));
        for va in auth_vendor {
            msg.add(
                VendorSpecificApplicationId {
                    vendor_id: va.vendor_id,
                    auth_app_id: Some(va.application_id),
                    acct_app_id: None,
                }
                .to_avp(),
            );
        }
        let mut acct_vendor: Vec<_> = caps.acct_vendor_apps.iter().copied().collect();
        acct_vendor.sort_unstable_by_key(|va| (va.vendor_id, va.application_id));
        for va in acct_vendor {
            msg.add(
                VendorSpecificApplicationId {
                    vendor_id: va.vendor_id,
                    auth_app_id: None,
                    acct_app_id: Some(va.application_id),
                }
                .to_avp(),
            );
        }
        if settings.firmware_revision() != 0 {
            msg.add(Avp::u32(avp::FIRMWARE_REVISION, settings.firmware_revision()));
        }
    }

    // ==== watchdog ====

    fn handle_dwr(&self, msg: &Message, view: &ConnView, now: Instant) -> bool {
        info!(peer = %view.name, "DWR received");
        {
            let mut reg = self.inner().registry.lock();
            if let Some(conn) = reg.lookup_mut(&view.key) {
                conn.timers_mut().mark_dwr_received(now);
            }
        }
        let mut dwa = Message::answer_to(msg);
        dwa.add(Avp::u32(avp::RESULT_CODE, result::SUCCESS));
        self.add_our_host_and_realm(&mut dwa);
        dwa.add(Avp::u32(avp::ORIGIN_STATE_ID, self.inner().ids.state_id()));
        self.send_on(view, &dwa);
        true
    }

    fn handle_dwa(&self, view: &ConnView, now: Instant) -> bool {
        trace!(peer = %view.name, "DWA received");
        let mut reg = self.inner().registry.lock();
        if let Some(conn) = reg.lookup_mut(&view.key) {
            conn.timers_mut().mark_dwa_received(now);
        }
        true
    }

    /// Send a DWR with a fresh hop-by-hop identifier and open the
    /// answer window. Only `Ready` connections watchdog.
    fn send_dwr(&self, key: &ConnectionKey, now: Instant) {
        let mut reg = self.inner().registry.lock();
        let conn = match reg.lookup_mut(key) {
            Some(conn) => conn,
            None => return,
        };
        if conn.state != ConnState::Ready {
            return;
        }
        trace!(peer = %conn.display_name(), "Sending DWR");
        let mut dwr = Message::request(command::DEVICE_WATCHDOG, APPLICATION_COMMON);
        dwr.header.hop_by_hop_identifier = conn.next_hop_by_hop();
        dwr.header.end_to_end_identifier = self.inner().ids.next_end_to_end_identifier();
        self.add_our_host_and_realm(&mut dwr);
        dwr.add(Avp::u32(avp::ORIGIN_STATE_ID, self.inner().ids.state_id()));
        let view = Self::view_of(conn);
        self.send_on(&view, &dwr);
        conn.timers_mut().mark_dwr_sent(now);
    }

    // ==== disconnect ====

    fn handle_dpr(&self, msg: &Message, view: &ConnView) -> bool {
        trace!(peer = %view.name, "DPR received");
        let mut dpa = Message::answer_to(msg);
        dpa.add(Avp::u32(avp::RESULT_CODE, result::SUCCESS));
        self.add_our_host_and_realm(&mut dpa);
        self.send_on(view, &dpa);
        // The driver closes after flushing the DPA.
        false
    }

    fn handle_dpa(&self, view: &ConnView) -> bool {
        if view.state == ConnState::Closing {
            info!(peer = %view.name, "DPA received");
        } else {
            warn!(peer = %view.name, state = %view.state, "Unexpected DPA");
        }
        // Close either way.
        false
    }

    /// Graceful close: send a DPR and move to `Closing`. No-op unless
    /// the connection is `Ready`.
    pub(crate) fn initiate_connection_close(&self, key: &ConnectionKey, cause: u32) {
        let mut reg = self.inner().registry.lock();
        let conn = match reg.lookup_mut(key) {
            Some(conn) => conn,
            None => return,
        };
        if conn.state != ConnState::Ready {
            return;
        }
        conn.state = ConnState::Closing;
        trace!(peer = %conn.display_name(), cause, "Sending DPR");
        let mut dpr = Message::request(command::DISCONNECT_PEER, APPLICATION_COMMON);
        dpr.header.hop_by_hop_identifier = conn.next_hop_by_hop();
        dpr.header.end_to_end_identifier = self.inner().ids.next_end_to_end_identifier();
        self.add_our_host_and_realm(&mut dpr);
        dpr.add(Avp::u32(avp::DISCONNECT_CAUSE, cause));
        let view = Self::view_of(conn);
        self.send_on(&view, &dpr);
    }

    /// Hard close: tell the driver to drop the socket, remove the
    /// record, and notify the listener. Idempotent; the listener fires
    /// exactly once per connection.
    pub(crate) fn close_connection(&self, key: &ConnectionKey, reset: bool) {
        // Removal under the lock makes the close idempotent: a second
        // call finds nothing, so the listener fires exactly once, after
        // the registry no longer knows the connection.
        let removed = self.inner().registry.lock().remove(key);
        let mut conn = match removed {
            Some(conn) => conn,
            None => return,
        };
        info!(peer = %conn.display_name(), "Closing connection");
        conn.driver().close(&conn, reset);
        conn.state = ConnState::Closed;
        self.inner().listener.connection(key, conn.peer(), false);
    }

    // ==== driver entry points ====

    /// An inbound socket was accepted. Registers a `ConnectedIn`
    /// connection, or refuses it when the node is shutting down.
    pub(crate) fn accept_connection(
        &self,
        driver: Arc<dyn TransportDriver>,
        remote: SocketAddr,
        local: Option<SocketAddr>,
    ) -> Option<(ConnectionKey, SendHandle)> {
        let now = Instant::now();
        let timers = self.new_timers(now);
        let mut reg = self.inner().registry.lock();
        if reg.please_stop {
            debug!(%remote, "Refusing inbound connection during shutdown");
            return None;
        }
        let mut conn = Connection::new(driver, ConnState::ConnectedIn, timers);
        conn.set_remote_addr(remote);
        if let Some(local) = local {
            conn.set_local_addr(local);
        }
        let key = conn.key();
        let send = conn.send_handle();
        reg.insert(conn);
        Some((key, send))
    }

    /// An outbound connect completed: move to `ConnectedOut` and send
    /// our CER.
    pub(crate) fn connection_established(&self, key: &ConnectionKey, local: Option<SocketAddr>) {
        let now = Instant::now();
        let mut reg = self.inner().registry.lock();
        let conn = match reg.lookup_mut(key) {
            Some(conn) => conn,
            None => return,
        };
        if conn.state != ConnState::Connecting {
            return;
        }
        if let Some(local) = local {
            conn.set_local_addr(local);
        }
        conn.state = ConnState::ConnectedOut;
        conn.timers_mut().mark_activity(now);
        info!(peer = %conn.display_name(), "Connected; sending CER");

        let mut cer = Message::request(command::CAPABILITIES_EXCHANGE, APPLICATION_COMMON);
        cer.header.hop_by_hop_identifier = conn.next_hop_by_hop();
        cer.header.end_to_end_identifier = self.inner().ids.next_end_to_end_identifier();
        let view = Self::view_of(conn);
        let our_caps = self.inner().settings.capabilities().clone();
        self.add_ce_payload(&mut cer, &our_caps, &view.local_addrs);
        self.send_on(&view, &cer);
    }

    /// An outbound connect failed before any capability exchange; the
    /// record is dropped without a listener notification (the
    /// connection was never announced up).
    pub(crate) fn connect_failed(&self, key: &ConnectionKey, error: &std::io::Error) {
        let mut reg = self.inner().registry.lock();
        if let Some(conn) = reg.remove(key) {
            info!(peer = %conn.display_name(), %error, "Connect failed");
        }
    }

    // ==== timer walk ====

    /// Earliest timer deadline among this driver's connections; capped
    /// by the shutdown deadline while stopping.
    pub(crate) fn calc_next_timeout(&self, kind: TransportKind) -> Option<Instant> {
        self.inner().registry.lock().next_timeout_for_driver(kind)
    }

    /// Run due timer actions for this driver's connections.
    pub(crate) fn run_timers(&self, kind: TransportKind) {
        let now = Instant::now();
        let due: Vec<(ConnectionKey, TimerAction)> = {
            let reg = self.inner().registry.lock();
            reg.snapshot_for_driver(kind)
                .into_iter()
                .filter_map(|key| {
                    let conn = reg.lookup(&key)?;
                    if conn.state() == ConnState::Tls {
                        return None;
                    }
                    let action = conn.timers().calc_action(conn.state().is_ready(), now);
                    (action != TimerAction::None).then_some((key, action))
                })
                .collect()
        };
        for (key, action) in due {
            match action {
                TimerAction::None => {}
                TimerAction::DisconnectNoCer => {
                    warn!(%key, "Disconnecting: no CER/CEA within the watchdog interval");
                    self.close_connection(&key, false);
                }
                TimerAction::DisconnectNoDw => {
                    warn!(%key, "Disconnecting: DWR went unanswered");
                    self.close_connection(&key, false);
                }
                TimerAction::DisconnectIdle => {
                    // BUSY is the closest cause to "no traffic for a
                    // long time; no point keeping the connection".
                    warn!(%key, "Disconnecting: idle timeout");
                    self.initiate_connection_close(&key, disconnect_cause::BUSY);
                }
                TimerAction::Dwr => self.send_dwr(&key, now),
            }
        }
    }
}
