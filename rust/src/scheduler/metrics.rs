//! Per-run counters of the scheduler.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::proposer::ProposeDiagnostics;
use crate::resource::{RejectReason, ResumeError};

/// Why a hook produced no commit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SkipReason {
    NoCandidates,
    NoFeasible,
    Reserve(RejectReason),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoCandidates => write!(f, "no_candidates"),
            SkipReason::NoFeasible => write!(f, "no_feasible"),
            SkipReason::Reserve(reason) => write!(f, "reserve_fail:{}", reason.as_str()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    pub ticks: u64,
    pub hooks: u64,
    pub refills: u64,
    pub op_starts: u64,
    pub op_ends: u64,
    pub committed_batches: u64,
    pub committed_ops: u64,
    pub suspends: u64,
    pub resumes: u64,
    pub resume_failures: u64,
    /// OP_END events that fired at a time other than the op's recorded end.
    pub end_mismatches: u64,
    pub skips: BTreeMap<String, u64>,
    /// Proposer attempt outcomes by name (`ok`, `sample_none`, ...).
    pub attempts: BTreeMap<String, u64>,
    pub last_resume_error: Option<ResumeError>,
    #[serde(skip)]
    pub last_diagnostics: Option<ProposeDiagnostics>,
}

impl SchedulerMetrics {
    pub fn record_skip(&mut self, reason: SkipReason) {
        *self.skips.entry(reason.to_string()).or_insert(0) += 1;
    }

    pub fn record_diagnostics(&mut self, diagnostics: ProposeDiagnostics) {
        for attempt in &diagnostics.attempts {
            *self
                .attempts
                .entry(attempt.outcome.as_str().to_string())
                .or_insert(0) += 1;
        }
        self.last_diagnostics = Some(diagnostics);
    }

    pub fn skip_count(&self, reason: &str) -> u64 {
        self.skips.get(reason).copied().unwrap_or(0)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_reasons_render_with_prefix() {
        assert_eq!(
            SkipReason::Reserve(RejectReason::Bus).to_string(),
            "reserve_fail:bus"
        );
        assert_eq!(SkipReason::NoFeasible.to_string(), "no_feasible");
    }

    #[test]
    fn test_record_skip_counts() {
        let mut metrics = SchedulerMetrics::default();
        metrics.record_skip(SkipReason::Reserve(RejectReason::WindowExceed));
        metrics.record_skip(SkipReason::Reserve(RejectReason::WindowExceed));
        metrics.record_skip(SkipReason::NoCandidates);
        assert_eq!(metrics.skip_count("reserve_fail:window_exceed"), 2);
        assert_eq!(metrics.skip_count("no_candidates"), 1);
        assert_eq!(metrics.skip_count("no_feasible"), 0);
        assert!(metrics.to_json().unwrap().contains("\"committed_ops\":0"));
    }
}
