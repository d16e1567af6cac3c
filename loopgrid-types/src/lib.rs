//! Shared wire types for the Loopgrid interconnect fabric
//!
//! This crate carries everything both ends of a control channel must agree
//! on: the generic event envelope, the wire error taxonomy, socket endpoint
//! descriptions and the monitoring event definitions.

pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod monitor;

pub use endpoint::{Endpoint, SocketKind};
pub use envelope::{Envelope, WireError, ENVELOPE_VERSION};
pub use error::{ErrorCode, TypesError};
pub use monitor::{MonitorEvent, MonitorRecord, MonitorSink, NullSink};
