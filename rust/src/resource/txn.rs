//! Staging area for reservations that become visible only on commit.

use rustc_hash::FxHashMap;

use crate::types::{Axis, LatchKind, OpUid, SimTime};

use super::overlay::AddressOverlay;
use super::spans::Span;
use super::types::{ExclusionWindow, LatchEntry, ScheduledOp, StateInterval, Window};

/// Remainder of a suspended op held for a staged resume.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct ResumeHold {
    pub die: u32,
    pub axis: Axis,
    pub uid: OpUid,
}

/// An in-progress batch of reservations.
///
/// Every check made while reserving consults the committed state plus what
/// this transaction has already staged. Dropping a transaction is a rollback.
#[derive(Debug)]
pub struct Transaction {
    pub(crate) now: SimTime,
    pub(crate) next_uid: u64,
    pub(crate) plane_windows: Vec<(u32, u32, Window)>,
    pub(crate) avail: FxHashMap<(u32, u32), SimTime>,
    pub(crate) bus: Vec<Window>,
    pub(crate) exclusions: Vec<ExclusionWindow>,
    pub(crate) latches: Vec<((u32, u32, LatchKind), LatchEntry)>,
    pub(crate) timeline: Vec<StateInterval>,
    pub(crate) overlay: AddressOverlay,
    pub(crate) ops: Vec<ScheduledOp>,
    pub(crate) resumes: Vec<ResumeHold>,
}

impl Transaction {
    pub(crate) fn new(now: SimTime, next_uid: u64) -> Self {
        Self {
            now,
            next_uid,
            plane_windows: Vec::new(),
            avail: FxHashMap::default(),
            bus: Vec::new(),
            exclusions: Vec::new(),
            latches: Vec::new(),
            timeline: Vec::new(),
            overlay: AddressOverlay::default(),
            ops: Vec::new(),
            resumes: Vec::new(),
        }
    }

    /// Earliest start the next reservation may take.
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Move the earliest-start hint forward; it never moves back.
    pub fn advance_to(&mut self, t: SimTime) {
        self.now = self.now.max(t);
    }

    /// Operations reserved so far, in reservation order.
    pub fn reserved(&self) -> &[ScheduledOp] {
        &self.ops
    }

    pub fn overlay(&self) -> &AddressOverlay {
        &self.overlay
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn avail(&self, die: u32, plane: u32) -> Option<SimTime> {
        self.avail.get(&(die, plane)).copied()
    }

    pub(crate) fn plane_overlap(&self, die: u32, plane: u32, start: SimTime, end: SimTime) -> bool {
        self.plane_windows
            .iter()
            .any(|(d, p, w)| *d == die && *p == plane && w.overlaps(start, end))
    }

    pub(crate) fn bus_overlap(&self, start: SimTime, end: SimTime) -> bool {
        self.bus.iter().any(|w| w.overlaps(start, end))
    }

    pub(crate) fn exclusions_overlapping(
        &self,
        start: SimTime,
        end: SimTime,
    ) -> impl Iterator<Item = &ExclusionWindow> + '_ {
        self.exclusions
            .iter()
            .filter(move |x| x.overlaps(start, end))
    }

    pub(crate) fn holds_resume(&self, die: u32, axis: Axis) -> bool {
        self.resumes.iter().any(|h| h.die == die && h.axis == axis)
    }

    pub(crate) fn latch_active(&self, die: u32, plane: u32, kind: LatchKind, t: SimTime) -> bool {
        self.latches
            .iter()
            .any(|(key, entry)| *key == (die, plane, kind) && entry.active_at(t))
    }
}
