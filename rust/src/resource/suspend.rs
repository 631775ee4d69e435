//! Suspend and resume of long-running operations.
//!
//! Suspending cuts the committed footprint of the most recent ongoing
//! operation at the suspend instant and parks the rest on a per-die stack.
//! Resuming re-reserves that remainder once the resume command completes,
//! atomically: either every structure accepts it or nothing changes. A
//! transaction that stages a resume holds the remainder's windows so the
//! rest of its batch cannot take them.

use crate::catalog::{segment_offsets, StateSegment};
use crate::types::{Axis, OpUid, SimTime};
use crate::{log_changes, log_checks};

use super::txn::{ResumeHold, Transaction};
use super::types::{
    AxisWindow, LatchEntry, RejectReason, ResumeError, ResumeFailure, ScheduledOp, StateInterval,
    SuspendedOp, Window,
};
use super::{target_dies, ResourceManager};

/// Segments left after `consumed` time units of `states` have run.
pub(crate) fn slice_states(states: &[StateSegment], consumed: SimTime) -> Vec<StateSegment> {
    segment_offsets(states)
        .filter(|(_, _, end)| *end > consumed)
        .map(|(seg, start, end)| StateSegment {
            name: seg.name.clone(),
            duration: if start < consumed { end - consumed } else { seg.duration },
            bus: seg.bus,
        })
        .collect()
}

impl ResourceManager {
    /// Move the most recent ongoing op of `axis` on `die` that is running at
    /// `t` onto the suspended stack. Returns its uid.
    pub fn move_to_suspended_axis(&mut self, die: u32, axis: Axis, t: SimTime) -> Option<OpUid> {
        let track = self.axes.get_mut(die as usize)?.axis_mut(axis);
        let pos = track
            .ongoing
            .iter()
            .rposition(|op| op.start <= t && t < op.end)?;
        let op = track.ongoing.remove(pos);

        let consumed = t - op.start;
        let remaining_states = slice_states(&op.states, consumed);
        let remaining_bus = segment_offsets(&remaining_states)
            .filter(|(seg, _, _)| seg.bus)
            .map(|(_, s, e)| (s, e))
            .collect();
        track.suspended.push(SuspendedOp {
            die,
            uid: op.uid,
            name: op.name,
            base: op.base,
            targets: op.targets.clone(),
            scope: op.scope,
            multiplicity: op.multiplicity,
            celltype: op.celltype.clone(),
            suspended_at: t,
            total_duration: op.end - op.start,
            consumed_duration: consumed,
            remaining_duration: op.end - t,
            remaining_states,
            remaining_bus,
        });
        if !track.is_open() {
            track.windows.push(AxisWindow { start: t, end: None });
        }

        self.cut_footprint(&op, t);
        log_changes!(
            self.verbosity,
            "{} suspended on d{} ({} axis) at {:.3}, {:.3} remaining",
            op.uid,
            die,
            axis.as_str(),
            t,
            op.end - t
        );
        Some(op.uid)
    }

    /// Remove everything `op` holds from `t` on.
    fn cut_footprint(&mut self, op: &ScheduledOp, t: SimTime) {
        let uid = op.uid;
        for (die, plane) in self.scope_planes(&op.targets, op.scope) {
            let idx = self.pidx(die, plane);
            self.plane_windows[idx].cut_from(t, |w| w.uid == uid);
            self.avail[idx] = self.plane_windows[idx].max_end().unwrap_or(0.0);
        }
        self.bus.cut_from(t, |w| w.uid == uid);
        for index in self.die_exclusions.iter_mut() {
            index.cut_from(t, |x| x.uid == uid);
        }
        self.global_exclusions.cut_from(t, |x| x.uid == uid);
        if let Some(kind) = self.catalog.base(op.base).latch {
            for a in &op.targets {
                let key = (a.die, a.plane, kind);
                if self.latches.get(&key).is_some_and(|e| e.start > t) {
                    self.latches.remove(&key);
                }
            }
        }
        self.timeline.truncate_op(uid, t);
    }

    pub(super) fn close_axis_window(&mut self, die: u32, axis: Axis, t: SimTime) {
        let Some(axes) = self.axes.get_mut(die as usize) else {
            return;
        };
        if let Some(window) = axes.axis_mut(axis).windows.last_mut() {
            if window.end.is_none() {
                window.end = Some(t.max(window.start));
            }
        }
    }

    fn resume_failed(
        &mut self,
        reason: ResumeFailure,
        die: u32,
        axis: Axis,
        uid: Option<OpUid>,
        t: SimTime,
    ) -> ResumeError {
        let err = ResumeError {
            reason,
            axis,
            die,
            uid,
            at: t,
        };
        // The op is still parked; keep the axis reporting suspended
        if let Some(axes) = self.axes.get_mut(die as usize) {
            let track = axes.axis_mut(axis);
            if !track.suspended.is_empty() && !track.is_open() {
                track.windows.push(AxisWindow { start: t, end: None });
            }
        }
        log_checks!(self.verbosity, "{}", err);
        self.last_error = Some(err.clone());
        err
    }

    /// Check that a resume finishing at `t` can restart the parked remainder.
    ///
    /// With nothing parked the resume is left to the state rules; the commit
    /// then records the failure. A batch resumes an axis at most once.
    pub(super) fn resume_fits(
        &self,
        txn: Option<&Transaction>,
        die: u32,
        axis: Axis,
        t: SimTime,
    ) -> Result<(), RejectReason> {
        if txn.is_some_and(|txn| txn.holds_resume(die, axis)) {
            return Err(RejectReason::StateForbidSuspend);
        }
        let Some(parked) = self
            .axes
            .get(die as usize)
            .and_then(|d| d.axis(axis).suspended.last())
        else {
            return Ok(());
        };

        let end = t + parked.remaining_duration;
        for (d, p) in self.scope_planes(&parked.targets, parked.scope) {
            if self.plane_windows[self.pidx(d, p)].any_overlap(t, end)
                || txn.is_some_and(|txn| txn.plane_overlap(d, p, t, end))
            {
                return Err(RejectReason::PlaneScope);
            }
        }
        let bus_taken = |s: SimTime, e: SimTime| {
            self.bus.any_overlap(t + s, t + e)
                || txn.is_some_and(|txn| txn.bus_overlap(t + s, t + e))
        };
        if parked.remaining_bus.iter().any(|&(s, e)| bus_taken(s, e)) {
            return Err(RejectReason::Bus);
        }
        let dies = target_dies(&parked.targets);
        if self.exclusion_conflict(txn, parked.base, parked.multiplicity, &dies, t, end) {
            return Err(RejectReason::ExclusionMulti);
        }
        Ok(())
    }

    /// Stage the parked remainder's windows into `txn` from `t`.
    pub(super) fn stage_resume_hold(
        &self,
        txn: &mut Transaction,
        die: u32,
        axis: Axis,
        t: SimTime,
    ) {
        let Some(parked) = self
            .axes
            .get(die as usize)
            .and_then(|d| d.axis(axis).suspended.last())
        else {
            return;
        };

        let uid = parked.uid;
        let end = t + parked.remaining_duration;
        for (d, p) in self.scope_planes(&parked.targets, parked.scope) {
            txn.plane_windows.push((d, p, Window { start: t, end, uid }));
            let slot = txn.avail.entry((d, p)).or_insert(end);
            *slot = slot.max(end);
        }
        txn.bus.extend(parked.remaining_bus.iter().map(|&(s, e)| Window {
            start: t + s,
            end: t + e,
            uid,
        }));
        txn.exclusions.extend(self.exclusion_footprint(
            parked.base,
            parked.multiplicity,
            &parked.targets,
            t,
            end,
            uid,
        ));
        txn.resumes.push(ResumeHold { die, axis, uid });
    }

    /// Re-reserve the most recently suspended op of `axis` on `die` from `t`.
    ///
    /// Fails without any change when the remainder would collide with plane,
    /// bus or exclusion windows reserved in the interim.
    pub fn resume_from_suspended_axis(
        &mut self,
        die: u32,
        axis: Axis,
        t: SimTime,
    ) -> Result<ScheduledOp, ResumeError> {
        let Some(parked) = self
            .axes
            .get(die as usize)
            .and_then(|d| d.axis(axis).suspended.last())
            .cloned()
        else {
            return Err(self.resume_failed(ResumeFailure::NothingSuspended, die, axis, None, t));
        };

        let uid = parked.uid;
        let end = t + parked.remaining_duration;
        let planes = self.scope_planes(&parked.targets, parked.scope);
        let dies = target_dies(&parked.targets);

        if planes
            .iter()
            .any(|&(d, p)| self.plane_windows[self.pidx(d, p)].any_overlap(t, end))
        {
            return Err(self.resume_failed(ResumeFailure::PlaneConflict, die, axis, Some(uid), t));
        }
        if parked
            .remaining_bus
            .iter()
            .any(|&(s, e)| self.bus.any_overlap(t + s, t + e))
        {
            return Err(self.resume_failed(ResumeFailure::BusConflict, die, axis, Some(uid), t));
        }
        if self.exclusion_conflict(None, parked.base, parked.multiplicity, &dies, t, end) {
            return Err(self.resume_failed(
                ResumeFailure::ExclusionConflict,
                die,
                axis,
                Some(uid),
                t,
            ));
        }

        let (affect_state, latch) = {
            let spec = self.catalog.base(parked.base);
            (spec.affect_state, spec.latch)
        };
        for &(d, p) in &planes {
            let idx = self.pidx(d, p);
            self.plane_windows[idx].insert(Window { start: t, end, uid });
            self.avail[idx] = self.avail[idx].max(end);
        }
        for &(s, e) in &parked.remaining_bus {
            self.bus.insert(Window {
                start: t + s,
                end: t + e,
                uid,
            });
        }
        for window in
            self.exclusion_footprint(parked.base, parked.multiplicity, &parked.targets, t, end, uid)
        {
            self.insert_exclusion(window);
        }
        if let Some(kind) = latch {
            for a in &parked.targets {
                self.latches.insert(
                    (a.die, a.plane, kind),
                    LatchEntry {
                        kind,
                        start: end,
                        end: None,
                    },
                );
            }
        }
        if affect_state {
            for &(d, p) in &planes {
                for (seg, s, e) in segment_offsets(&parked.remaining_states) {
                    self.timeline.insert(StateInterval {
                        uid,
                        die: d,
                        plane: p,
                        base: parked.base,
                        state: seg.name.clone(),
                        start: t + s,
                        end: t + e,
                    });
                }
            }
        }

        let resumed = ScheduledOp {
            uid,
            name: parked.name,
            base: parked.base,
            targets: parked.targets,
            scope: parked.scope,
            multiplicity: parked.multiplicity,
            celltype: parked.celltype,
            start: t,
            end,
            states: parked.remaining_states,
        };
        let track = self.axes[die as usize].axis_mut(axis);
        track.suspended.pop();
        track.ongoing.push(resumed.clone());
        self.close_axis_window(die, axis, t);
        log_changes!(
            self.verbosity,
            "{} resumed on d{} ({} axis) at {:.3}, ends {:.3}",
            uid,
            die,
            axis.as_str(),
            t,
            end
        );
        Ok(resumed)
    }
}
