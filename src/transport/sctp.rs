//! SCTP transport driver (one-to-one socket style).
//!
//! Uses `IPPROTO_SCTP` stream sockets, which behave like TCP at the fd
//! level while the kernel handles multi-homing and association
//! management. Only built with the `sctp` cargo feature; the factory
//! registry reports the transport unavailable otherwise.

use crate::config::NodeSettings;
use crate::transport::stream::StreamDriver;
use crate::transport::{TransportDriver, TransportKind};
use std::sync::Arc;

pub(crate) fn driver(settings: &NodeSettings) -> Arc<dyn TransportDriver> {
    StreamDriver::new(TransportKind::Sctp, libc::IPPROTO_SCTP, settings.port(), None)
}
