//! Value types owned by the resource manager.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::catalog::{BaseId, NameId, StateSegment};
use crate::types::{Address, Axis, LatchKind, Multiplicity, OpUid, Scope, SimTime};

use super::spans::Span;

/// Closed set of reasons a feasibility check or reservation is rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RejectReason {
    PlaneScope,
    Bus,
    ExclusionMulti,
    Latch,
    StateForbidSuspend,
    StateForbidOdt,
    StateForbidCache,
    EprDep,
    WindowExceed,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::PlaneScope => "planescope",
            RejectReason::Bus => "bus",
            RejectReason::ExclusionMulti => "exclusion_multi",
            RejectReason::Latch => "latch",
            RejectReason::StateForbidSuspend => "state_forbid_suspend",
            RejectReason::StateForbidOdt => "state_forbid_odt",
            RejectReason::StateForbidCache => "state_forbid_cache",
            RejectReason::EprDep => "epr_dep",
            RejectReason::WindowExceed => "window_exceed",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A successful reservation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Reservation {
    pub uid: OpUid,
    pub start: SimTime,
    pub end: SimTime,
}

/// Occupancy of one plane or of the shared bus by one operation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub start: SimTime,
    pub end: SimTime,
    pub uid: OpUid,
}

impl Span for Window {
    fn start(&self) -> SimTime {
        self.start
    }
    fn end(&self) -> SimTime {
        self.end
    }
    fn set_end(&mut self, end: SimTime) {
        self.end = end;
    }
}

/// Token carried by an exclusion window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExclusionToken {
    Base(BaseId),
    Class(Multiplicity),
}

/// Time-bounded die-level (or global) exclusion created by a committed op.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExclusionWindow {
    pub start: SimTime,
    pub end: SimTime,
    pub uid: OpUid,
    /// `None` for a global window.
    pub die: Option<u32>,
    pub tokens: Vec<ExclusionToken>,
}

impl ExclusionWindow {
    pub fn class(&self) -> Multiplicity {
        self.tokens
            .iter()
            .find_map(|t| match t {
                ExclusionToken::Class(c) => Some(*c),
                _ => None,
            })
            .unwrap_or(Multiplicity::Multi)
    }

    pub fn base(&self) -> Option<BaseId> {
        self.tokens.iter().find_map(|t| match t {
            ExclusionToken::Base(b) => Some(*b),
            _ => None,
        })
    }
}

impl Span for ExclusionWindow {
    fn start(&self) -> SimTime {
        self.start
    }
    fn end(&self) -> SimTime {
        self.end
    }
    fn set_end(&mut self, end: SimTime) {
        self.end = end;
    }
}

/// Latch held on a (die, plane). `end = None` means held until released.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatchEntry {
    pub kind: LatchKind,
    pub start: SimTime,
    pub end: Option<SimTime>,
}

impl LatchEntry {
    pub fn active_at(&self, t: SimTime) -> bool {
        self.start <= t && self.end.map_or(true, |e| t < e)
    }
}

/// One state of one operation on one plane.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateInterval {
    pub uid: OpUid,
    pub die: u32,
    pub plane: u32,
    pub base: BaseId,
    pub state: String,
    pub start: SimTime,
    pub end: SimTime,
}

/// A reserved operation as the resource manager remembers it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduledOp {
    pub uid: OpUid,
    pub name: NameId,
    pub base: BaseId,
    pub targets: Vec<Address>,
    pub scope: Scope,
    pub multiplicity: Multiplicity,
    pub celltype: Option<String>,
    pub start: SimTime,
    pub end: SimTime,
    pub states: Vec<StateSegment>,
}

impl ScheduledOp {
    /// Die of the first target.
    pub fn die(&self) -> u32 {
        self.targets.first().map_or(0, |a| a.die)
    }
}

/// Metadata of an operation parked on a suspend axis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SuspendedOp {
    pub die: u32,
    pub uid: OpUid,
    pub name: NameId,
    pub base: BaseId,
    pub targets: Vec<Address>,
    pub scope: Scope,
    pub multiplicity: Multiplicity,
    pub celltype: Option<String>,
    pub suspended_at: SimTime,
    /// Total duration of the run that was interrupted.
    pub total_duration: SimTime,
    pub consumed_duration: SimTime,
    pub remaining_duration: SimTime,
    pub remaining_states: Vec<StateSegment>,
    /// Bus-active sub-intervals of the remaining work, relative to resume.
    pub remaining_bus: Vec<(SimTime, SimTime)>,
}

/// Suspend axis state window; `end = None` while still suspended.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AxisWindow {
    pub start: SimTime,
    pub end: Option<SimTime>,
}

impl AxisWindow {
    pub fn covers(&self, t: SimTime) -> bool {
        self.start <= t && self.end.map_or(true, |e| t < e)
    }
}

/// Bookkeeping for one suspend axis of one die.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisTrack {
    pub windows: Vec<AxisWindow>,
    pub ongoing: Vec<ScheduledOp>,
    pub suspended: Vec<SuspendedOp>,
}

impl AxisTrack {
    pub fn is_open(&self) -> bool {
        self.windows.last().is_some_and(|w| w.end.is_none())
    }
}

/// Both suspend axes of one die.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DieAxes {
    pub erase: AxisTrack,
    pub program: AxisTrack,
}

impl DieAxes {
    pub fn axis(&self, axis: Axis) -> &AxisTrack {
        match axis {
            Axis::Erase => &self.erase,
            Axis::Program => &self.program,
        }
    }

    pub fn axis_mut(&mut self, axis: Axis) -> &mut AxisTrack {
        match axis {
            Axis::Erase => &mut self.erase,
            Axis::Program => &mut self.program,
        }
    }
}

/// Why a resume attempt was refused.
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResumeFailure {
    #[error("nothing suspended")]
    NothingSuspended,
    #[error("plane reserved in the interim")]
    PlaneConflict,
    #[error("bus reserved in the interim")]
    BusConflict,
    #[error("die exclusion reserved in the interim")]
    ExclusionConflict,
}

/// Structured record of the last failed resume.
#[derive(Error, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[error("resume on die {die} ({axis:?} axis) at {at} failed: {reason}")]
pub struct ResumeError {
    pub reason: ResumeFailure,
    pub axis: Axis,
    pub die: u32,
    pub uid: Option<OpUid>,
    pub at: SimTime,
}

/// What a commit did beyond merging the staged structures.
#[derive(Clone, Debug, Default)]
pub struct CommitReport {
    /// Operations in reservation order.
    pub committed: Vec<ScheduledOp>,
    /// Ongoing operations moved to a suspended stack by this commit.
    pub suspended: Vec<OpUid>,
    /// Suspended operations re-reserved by a resume in this commit.
    pub resumed: Vec<ScheduledOp>,
    pub resume_failures: Vec<ResumeError>,
}
