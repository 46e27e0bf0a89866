//! Message dispatch seam.
//!
//! The node handles base-protocol commands itself; every other decoded
//! message is offered to the application through `MessageDispatcher`.

use crate::message::Message;
use crate::node::ConnectionKey;
use crate::peer::Peer;
use tracing::debug;

/// Receives non-base messages from the node.
///
/// Implementations run on the transport driver's I/O thread with no node
/// locks held, so they may call back into the node (e.g. `send_message`)
/// but should hand long work to their own threads.
pub trait MessageDispatcher: Send + Sync {
    /// Handle a message. Return false to decline; the node then answers
    /// requests with UNABLE_TO_DELIVER.
    fn handle(&self, msg: &Message, key: &ConnectionKey, peer: Option<&Peer>) -> bool;
}

/// Dispatcher that declines everything. A node wired with this rejects
/// all application traffic, which is rarely what you want outside tests.
#[derive(Debug, Default)]
pub struct DefaultMessageDispatcher;

impl MessageDispatcher for DefaultMessageDispatcher {
    fn handle(&self, msg: &Message, key: &ConnectionKey, _peer: Option<&Peer>) -> bool {
        debug!(
            command = msg.header.command_code,
            %key,
            "No dispatcher configured; declining message"
        );
        false
    }
}
