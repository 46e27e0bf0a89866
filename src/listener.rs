//! Connection up/down notifications.

use crate::node::ConnectionKey;
use crate::peer::Peer;
use tracing::info;

/// Observes connections reaching `Ready` and closing.
///
/// `up = true` fires after capability exchange completes, before waiters
/// in `wait_for_connection` are released. `up = false` fires exactly once
/// per connection, after it has been removed from the registry.
pub trait ConnectionListener: Send + Sync {
    fn connection(&self, key: &ConnectionKey, peer: Option<&Peer>, up: bool);
}

/// Listener that just logs the transition.
#[derive(Debug, Default)]
pub struct DefaultConnectionListener;

impl ConnectionListener for DefaultConnectionListener {
    fn connection(&self, key: &ConnectionKey, peer: Option<&Peer>, up: bool) {
        match peer {
            Some(peer) => info!(%key, %peer, up, "Connection state changed"),
            None => info!(%key, up, "Connection state changed"),
        }
    }
}
