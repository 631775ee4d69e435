//! Serializable checkpoint of a running scheduler.

use serde::{Deserialize, Serialize};

use crate::bootstrap::BootstrapProgress;
use crate::events::EventPayload;
use crate::models::CommittedOp;
use crate::resource::{ResourceSnapshot, RestoreError, ScheduledOp};
use crate::sampler::SimRng;
use crate::types::SimTime;

use super::metrics::SchedulerMetrics;

/// A queued event, in processing order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    pub time: SimTime,
    pub payload: EventPayload,
}

/// Everything needed to continue a run from a point in time.
///
/// Ops in flight keep their OP_END and phase hooks, so a restored scheduler
/// replays the same trace as one that never stopped. The address sampler is
/// not captured: restore into a scheduler whose sampler saw the same OP_ENDs.
/// The RNG travels with in-process snapshots only; a snapshot decoded from
/// JSON leaves the restoring scheduler's RNG as it is.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub resource: ResourceSnapshot,
    pub now: SimTime,
    /// Committed operations whose OP_END is pending.
    pub live: Vec<ScheduledOp>,
    pub events: Vec<PendingEvent>,
    pub committed: Vec<CommittedOp>,
    pub metrics: SchedulerMetrics,
    pub refill_cursor: u64,
    pub bootstrap: Option<BootstrapProgress>,
    #[serde(skip)]
    pub rng: Option<SimRng>,
}

impl SchedulerSnapshot {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, RestoreError> {
        Ok(serde_json::from_str(text)?)
    }
}
