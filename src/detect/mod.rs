//! Anomaly detection and alert lifecycle.
//!
//! Pipeline per category: daily metrics -> baseline -> CUSUM -> gates ->
//! candidates -> lifecycle. Phase skips replace the middle three stages with
//! an event-driven wait reconstruction.

pub mod baseline;
pub mod category;
pub mod cusum;
pub mod engine;
pub mod lifecycle;
pub mod metrics;
pub mod phase_skip;

use thiserror::Error;

use crate::model::DeviceId;

pub use engine::{AlertEngine, CategoryOutcome, RunInputs, RunOutcome, RunState};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DetectError {
    /// Not enough usable history. Degrades to "no alert" for the key.
    #[error("invalid baseline: {have} of {needed} required days, std dev {std_dev}")]
    InvalidBaseline { needed: usize, have: usize, std_dev: f64 },

    /// A wait, cycle or preemption event could not be paired. The interval is skipped.
    #[error("malformed event pair for device {device_id} (event {event_id}): {reason}")]
    MalformedEventPair {
        device_id: DeviceId,
        event_id: i32,
        reason: String,
    },

    /// Required column absent. Fails every category that reads the table.
    #[error("table '{table}' is missing required column '{column}'")]
    SchemaMismatch { table: String, column: String },

    /// Header was fine but rows could not be read.
    #[error("table '{table}' could not be read: {reason}")]
    UnreadableTable { table: String, reason: String },

    #[error("table '{table}' is empty")]
    EmptyInput { table: String },
}
