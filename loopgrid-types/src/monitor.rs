//! Monitoring event definitions
//!
//! The interconnect node reports lifecycle changes through a [`MonitorSink`]
//! so operators can watch the fabric without scraping logs. The node only
//! calls `emit`; delivery is the sink implementation's business.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A monitoring event with its payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// A media session was installed in both node maps
    SessionCreated {
        peer: String,
        signaling: String,
        media: String,
    },
    /// A media session was dropped from both node maps
    SessionClosed { peer: String },
    /// DTLS handshake finished and SRTP contexts are installed
    SrtpReady { peer: String },
    /// A loop was bound into a session
    LoopBound {
        peer: String,
        loop_name: String,
        remote_ssrc: u32,
    },
    /// A mixer registered on the mixer listener
    MixerRegistered { remote: String },
    /// A mixer connection went away
    MixerLost { remote: String },
}

/// Envelope stamped by the emitting node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorRecord {
    /// Name of the emitting interconnect node
    pub node: String,
    /// Emission time
    pub timestamp: DateTime<Utc>,
    /// The event itself
    #[serde(flatten)]
    pub event: MonitorEvent,
}

impl MonitorRecord {
    pub fn new(node: impl Into<String>, event: MonitorEvent) -> Self {
        MonitorRecord {
            node: node.into(),
            timestamp: Utc::now(),
            event,
        }
    }
}

/// Receiver of monitoring events
pub trait MonitorSink: Send + Sync {
    fn emit(&self, record: MonitorRecord);
}

/// Sink that discards everything, for nodes running without monitoring
#[derive(Debug, Default)]
pub struct NullSink;

impl MonitorSink for NullSink {
    fn emit(&self, _record: MonitorRecord) {}
}
