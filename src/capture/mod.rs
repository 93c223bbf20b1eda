//! Per-interface packet capture
//!
//! Each monitored interface gets a `Capture`: a state machine worker plus
//! a packet-processing task, talking over command and error channels. The
//! `CaptureManager` owns the fleet, applies configuration diffs and fans
//! out status and rotation requests.

pub mod manager;
pub mod source;
pub mod worker;

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use manager::{CaptureManager, TaggedAggFlowMap};
pub use source::{
    default_source_init, CaptureSource, CaptureStats, MockSource, MockSourceHandle, PcapSource,
    RawPacket, SourceError, SourceInitFn, POLL_TIMEOUT, SNAPLEN,
};
pub use worker::{Capture, CaptureHandle, CaptureStatus, RotateResult};

/// Maximum number of consecutive decode failures before an interface is
/// taken out of service
pub const ERROR_THRESHOLD: u64 = 10_000;

/// Activity state of a capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// The capture is setting up its packet source
    Initializing,
    /// The capture is actively capturing packets
    Capturing,
    /// The capture hit the error threshold or failed to initialize and
    /// waits for a configuration update
    Error,
    /// The capture is terminating and its resources are being released
    Closing,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Initializing => write!(f, "StateInitializing"),
            State::Capturing => write!(f, "StateCapturing"),
            State::Error => write!(f, "StateError"),
            State::Closing => write!(f, "StateClosing"),
        }
    }
}

/// Decode errors by message, with occurrence counts
pub type ErrorMap = HashMap<String, u64>;

/// Per-interface counters exposed to the status API and CLI.
///
/// `*_total` counters run since source creation, the plain variants are
/// deltas since the last rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceStats {
    pub received_total: u64,
    pub received: u64,
    pub processed_total: u64,
    pub processed: u64,
    pub dropped: u64,
    pub started_at: DateTime<Utc>,
}

impl Default for InterfaceStats {
    fn default() -> Self {
        Self {
            received_total: 0,
            received: 0,
            processed_total: 0,
            processed: 0,
            dropped: 0,
            started_at: DateTime::UNIX_EPOCH,
        }
    }
}
