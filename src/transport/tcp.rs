//! TCP transport driver.

use crate::config::NodeSettings;
use crate::transport::stream::StreamDriver;
use crate::transport::{TransportDriver, TransportKind};
use std::sync::Arc;

/// Build the TCP driver from the node settings: listen port, and the
/// outbound source-port range if one is configured.
pub(crate) fn driver(settings: &NodeSettings) -> Arc<dyn TransportDriver> {
    StreamDriver::new(
        TransportKind::Tcp,
        0,
        settings.port(),
        settings.port_range().cloned(),
    )
}
