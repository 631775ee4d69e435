//! Resource manager: the authoritative model of plane, bus, die exclusion,
//! latch and per-plane state occupancy.
//!
//! Reservations are staged in a `Transaction` and become visible to later
//! checks only when the transaction is committed. Suspend and resume move
//! the remaining footprint of an operation out of, and back into, the
//! committed structures.

mod overlay;
mod rules;
mod snapshot;
mod spans;
mod suspend;
mod timeline;
mod txn;
mod types;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::catalog::{BaseId, OpCatalog, Operation};
use crate::types::{Address, Axis, BaseRole, ExclusionScope, LatchKind, Multiplicity, OpUid, Scope, SimTime};
use crate::{log_changes, log_checks, log_debug};

pub use overlay::{AddressOverlay, EprFailure, EprPolicy, EprQuery, EprVerdict, OverlayBlock};
pub use snapshot::{ResourceSnapshot, RestoreError};
pub use spans::{Span, SpanIndex};
pub use timeline::StateTimeline;
pub use txn::Transaction;
pub use types::{
    AxisTrack, AxisWindow, CommitReport, DieAxes, ExclusionToken, ExclusionWindow, LatchEntry,
    RejectReason, Reservation, ResumeError, ResumeFailure, ScheduledOp, StateInterval,
    SuspendedOp, Window,
};

/// One step of a chain checked by `feasible_chain`.
#[derive(Clone, Copy, Debug)]
pub struct ChainStep<'a> {
    pub op: &'a Operation,
    pub targets: &'a [Address],
    pub scope: Scope,
}

#[derive(Debug)]
pub struct ResourceManager {
    catalog: Arc<OpCatalog>,
    dies: u32,
    planes: u32,
    avail: Vec<SimTime>,
    plane_windows: Vec<SpanIndex<Window>>,
    bus: SpanIndex<Window>,
    die_exclusions: Vec<SpanIndex<ExclusionWindow>>,
    global_exclusions: SpanIndex<ExclusionWindow>,
    latches: BTreeMap<(u32, u32, LatchKind), LatchEntry>,
    timeline: StateTimeline,
    axes: Vec<DieAxes>,
    odt_disabled: bool,
    cache_read: BTreeMap<(u32, u32), SimTime>,
    cache_program: BTreeMap<u32, SimTime>,
    next_uid: u64,
    last_error: Option<ResumeError>,
    verbosity: u8,
}

impl ResourceManager {
    pub fn new(catalog: Arc<OpCatalog>) -> Self {
        let dies = catalog.topology.dies;
        let planes = catalog.topology.planes;
        let verbosity = catalog.policies.verbosity;
        let plane_count = (dies * planes) as usize;
        Self {
            catalog,
            dies,
            planes,
            avail: vec![0.0; plane_count],
            plane_windows: (0..plane_count).map(|_| SpanIndex::new()).collect(),
            bus: SpanIndex::new(),
            die_exclusions: (0..dies).map(|_| SpanIndex::new()).collect(),
            global_exclusions: SpanIndex::new(),
            latches: BTreeMap::new(),
            timeline: StateTimeline::new(dies, planes),
            axes: (0..dies).map(|_| DieAxes::default()).collect(),
            odt_disabled: false,
            cache_read: BTreeMap::new(),
            cache_program: BTreeMap::new(),
            next_uid: 0,
            last_error: None,
            verbosity,
        }
    }

    pub fn catalog(&self) -> &OpCatalog {
        &self.catalog
    }

    pub fn dies(&self) -> u32 {
        self.dies
    }

    pub fn planes(&self) -> u32 {
        self.planes
    }

    #[inline]
    fn pidx(&self, die: u32, plane: u32) -> usize {
        (die * self.planes + plane) as usize
    }

    /// Planes an operation occupies under `scope`, sorted and deduplicated.
    pub fn scope_planes(&self, targets: &[Address], scope: Scope) -> Vec<(u32, u32)> {
        let mut out: Vec<(u32, u32)> = match scope {
            Scope::DieWide => targets
                .iter()
                .flat_map(|a| (0..self.planes).map(move |p| (a.die, p)))
                .collect(),
            Scope::PlaneSet | Scope::None => targets.iter().map(|a| (a.die, a.plane)).collect(),
        };
        out.sort_unstable();
        out.dedup();
        out
    }

    fn valid_targets(&self, targets: &[Address]) -> bool {
        !targets.is_empty()
            && targets
                .iter()
                .all(|a| a.die < self.dies && a.plane < self.planes)
    }

    /// Earliest start at or after `start_hint` for which every check passes
    /// against the committed state, or `None`.
    pub fn feasible_at(
        &self,
        op: &Operation,
        targets: &[Address],
        start_hint: SimTime,
        scope: Scope,
        epr: Option<&dyn EprPolicy>,
    ) -> Option<SimTime> {
        self.evaluate(None, op, targets, scope, start_hint, epr)
            .ok()
            .map(|(start, _)| start)
    }

    /// Run every check for one operation. Returns the `(start, end)` it would
    /// take, or the first failing check.
    ///
    /// The start is the earliest instant no earlier than `start_hint` and the
    /// availability of every plane in scope; instant and scope-less
    /// operations skip plane availability and exclusion.
    pub fn evaluate(
        &self,
        txn: Option<&Transaction>,
        op: &Operation,
        targets: &[Address],
        scope: Scope,
        start_hint: SimTime,
        epr: Option<&dyn EprPolicy>,
    ) -> Result<(SimTime, SimTime), RejectReason> {
        if !self.valid_targets(targets) {
            return Err(RejectReason::PlaneScope);
        }
        let spec = self.catalog.base(op.base);
        let bypass = spec.instant || scope == Scope::None;
        let planes = self.scope_planes(targets, scope);

        let mut start = start_hint;
        if !bypass {
            for &(die, plane) in &planes {
                start = start.max(self.avail[self.pidx(die, plane)]);
                if let Some(t) = txn.and_then(|t| t.avail(die, plane)) {
                    start = start.max(t);
                }
            }
        }
        let end = start + op.total_duration();

        if !bypass {
            for &(die, plane) in &planes {
                if self.plane_windows[self.pidx(die, plane)].any_overlap(start, end)
                    || txn.is_some_and(|t| t.plane_overlap(die, plane, start, end))
                {
                    return Err(RejectReason::PlaneScope);
                }
            }
        }

        for (rel_start, rel_end) in op.bus_offsets() {
            let (bs, be) = (start + rel_start, start + rel_end);
            if self.bus.any_overlap(bs, be) || txn.is_some_and(|t| t.bus_overlap(bs, be)) {
                return Err(RejectReason::Bus);
            }
        }

        if !bypass {
            let target_planes = self.scope_planes(targets, Scope::PlaneSet).len();
            let class = self.catalog.multiplicity(op.name, scope, target_planes);
            let dies = target_dies(targets);
            if self.exclusion_conflict(txn, op.base, class, &dies, start, end) {
                return Err(RejectReason::ExclusionMulti);
            }
        }

        self.check_latches(txn, op.base, targets, start)?;
        self.check_rules(txn, op, targets, start, epr)?;
        if let Some(axis) = spec.role.resume_axis() {
            for die in target_dies(targets) {
                self.resume_fits(txn, die, axis, end)?;
            }
        }
        log_debug!(
            self.verbosity,
            "feasible {} at {:.3}..{:.3}",
            spec.name,
            start,
            end
        );
        Ok((start, end))
    }

    /// Exclusion windows an operation of `base` holds over `[start, end)`.
    fn exclusion_footprint(
        &self,
        base: BaseId,
        class: Multiplicity,
        targets: &[Address],
        start: SimTime,
        end: SimTime,
        uid: OpUid,
    ) -> Vec<ExclusionWindow> {
        let tokens = vec![ExclusionToken::Base(base), ExclusionToken::Class(class)];
        match self.catalog.base(base).exclusion {
            ExclusionScope::Global => vec![ExclusionWindow {
                start,
                end,
                uid,
                die: None,
                tokens,
            }],
            ExclusionScope::Die => target_dies(targets)
                .into_iter()
                .map(|die| ExclusionWindow {
                    start,
                    end,
                    uid,
                    die: Some(die),
                    tokens: tokens.clone(),
                })
                .collect(),
        }
    }

    fn insert_exclusion(&mut self, window: ExclusionWindow) {
        match window.die {
            Some(die) => self.die_exclusions[die as usize].insert(window),
            None => self.global_exclusions.insert(window),
        }
    }

    /// Whether an exclusion window blocks an incoming operation.
    fn exclusion_blocks(&self, base: BaseId, class: Multiplicity, window: &ExclusionWindow) -> bool {
        match (class, window.class()) {
            (Multiplicity::Single, Multiplicity::Single) => {
                !(self.catalog.is_plane_parallel(base)
                    && window
                        .base()
                        .is_some_and(|b| self.catalog.is_plane_parallel(b)))
            }
            _ => true,
        }
    }

    fn exclusion_conflict(
        &self,
        txn: Option<&Transaction>,
        base: BaseId,
        class: Multiplicity,
        dies: &[u32],
        start: SimTime,
        end: SimTime,
    ) -> bool {
        let global = self.catalog.base(base).exclusion == ExclusionScope::Global;
        let in_scope = |die: Option<u32>| match die {
            None => true,
            Some(d) => global || dies.contains(&d),
        };
        let committed = self
            .die_exclusions
            .iter()
            .enumerate()
            .filter(|(d, _)| in_scope(Some(*d as u32)))
            .flat_map(|(_, idx)| idx.overlapping(start, end))
            .chain(self.global_exclusions.overlapping(start, end))
            .any(|x| self.exclusion_blocks(base, class, x));
        committed
            || txn.is_some_and(|t| {
                t.exclusions_overlapping(start, end)
                    .any(|x| in_scope(x.die) && self.exclusion_blocks(base, class, x))
            })
    }

    fn check_latches(
        &self,
        txn: Option<&Transaction>,
        base: BaseId,
        targets: &[Address],
        start: SimTime,
    ) -> Result<(), RejectReason> {
        for (die, plane) in self.scope_planes(targets, Scope::PlaneSet) {
            for kind in LatchKind::ALL {
                if !self.catalog.forbidden_by_latch(kind, base) {
                    continue;
                }
                let held = self
                    .latches
                    .get(&(die, plane, kind))
                    .is_some_and(|e| e.active_at(start))
                    || txn.is_some_and(|t| t.latch_active(die, plane, kind, start));
                if held {
                    return Err(RejectReason::Latch);
                }
            }
        }
        Ok(())
    }

    /// Check that a chain of operations fits back to back, each no earlier
    /// than the previous end plus `gap`, without touching committed state.
    pub fn feasible_chain(
        &self,
        now: SimTime,
        steps: &[ChainStep<'_>],
        gap: SimTime,
        epr: Option<&dyn EprPolicy>,
    ) -> Result<Vec<Reservation>, RejectReason> {
        let mut txn = self.begin(now);
        let mut out = Vec::with_capacity(steps.len());
        for step in steps {
            let r = self.reserve(&mut txn, step.op, step.targets, step.scope, epr)?;
            txn.advance_to(r.end + gap);
            out.push(r);
        }
        Ok(out)
    }

    /// Open a transaction whose earliest start is `now`.
    pub fn begin(&self, now: SimTime) -> Transaction {
        Transaction::new(now, self.next_uid)
    }

    /// Stage a reservation at the earliest feasible start in the transaction.
    pub fn reserve(
        &self,
        txn: &mut Transaction,
        op: &Operation,
        targets: &[Address],
        scope: Scope,
        epr: Option<&dyn EprPolicy>,
    ) -> Result<Reservation, RejectReason> {
        let spec = self.catalog.base(op.base);
        let (start, end) = match self.evaluate(Some(txn), op, targets, scope, txn.now, epr) {
            Ok(window) => window,
            Err(reason) => {
                log_checks!(
                    self.verbosity,
                    "reserve {} rejected at {:.3}: {}",
                    spec.name,
                    txn.now,
                    reason
                );
                return Err(reason);
            }
        };

        let uid = OpUid(txn.next_uid);
        txn.next_uid += 1;
        let bypass = spec.instant || scope == Scope::None;
        let planes = self.scope_planes(targets, scope);
        let target_planes = self.scope_planes(targets, Scope::PlaneSet);
        let multiplicity = self.catalog.multiplicity(op.name, scope, target_planes.len());

        if !bypass {
            for &(die, plane) in &planes {
                txn.plane_windows.push((die, plane, Window { start, end, uid }));
                let slot = txn.avail.entry((die, plane)).or_insert(end);
                *slot = slot.max(end);
            }
            txn.exclusions
                .extend(self.exclusion_footprint(op.base, multiplicity, targets, start, end, uid));
        }

        for (rel_start, rel_end) in op.bus_offsets() {
            txn.bus.push(Window {
                start: start + rel_start,
                end: start + rel_end,
                uid,
            });
        }

        if let Some(kind) = spec.latch {
            for &(die, plane) in &target_planes {
                txn.latches.push((
                    (die, plane, kind),
                    LatchEntry {
                        kind,
                        start: end,
                        end: None,
                    },
                ));
            }
        }

        if spec.affect_state {
            for &(die, plane) in &planes {
                for (seg, rel_start, rel_end) in crate::catalog::segment_offsets(&op.states) {
                    txn.timeline.push(StateInterval {
                        uid,
                        die,
                        plane,
                        base: op.base,
                        state: seg.name.clone(),
                        start: start + rel_start,
                        end: start + rel_end,
                    });
                }
            }
        }

        if let Some(axis) = spec.role.resume_axis() {
            for die in target_dies(targets) {
                self.stage_resume_hold(txn, die, axis, end);
            }
        }

        txn.overlay
            .record(spec.family, targets, op.celltype.as_deref());
        txn.ops.push(ScheduledOp {
            uid,
            name: op.name,
            base: op.base,
            targets: targets.to_vec(),
            scope,
            multiplicity,
            celltype: op.celltype.clone(),
            start,
            end,
            states: op.states.clone(),
        });
        log_checks!(
            self.verbosity,
            "reserved {} {} at {:.3}..{:.3}",
            uid,
            spec.name,
            start,
            end
        );
        Ok(Reservation { uid, start, end })
    }

    /// Discard a transaction.
    pub fn rollback(&self, txn: Transaction) {
        log_checks!(
            self.verbosity,
            "rollback of {} staged reservations",
            txn.ops.len()
        );
        drop(txn);
    }

    /// Atomically apply a transaction to the committed state.
    pub fn commit(&mut self, txn: Transaction) -> CommitReport {
        let Transaction {
            next_uid,
            plane_windows,
            bus,
            exclusions,
            latches,
            timeline,
            ops,
            resumes,
            ..
        } = txn;

        // Held remainders are reserved by the resume itself in apply_role
        let held = |uid: OpUid| resumes.iter().any(|h| h.uid == uid);
        for (die, plane, window) in plane_windows {
            if held(window.uid) {
                continue;
            }
            let idx = self.pidx(die, plane);
            self.avail[idx] = self.avail[idx].max(window.end);
            self.plane_windows[idx].insert(window);
        }
        for window in bus.into_iter().filter(|w| !held(w.uid)) {
            self.bus.insert(window);
        }
        for window in exclusions.into_iter().filter(|x| !held(x.uid)) {
            self.insert_exclusion(window);
        }

        // Suspend truncation runs before this batch's own states land on the timeline
        let mut report = CommitReport::default();
        for op in &ops {
            self.apply_role(op, &mut report);
        }
        for (key, entry) in latches {
            self.latches.insert(key, entry);
        }
        for interval in timeline {
            self.timeline.insert(interval);
        }
        self.next_uid = self.next_uid.max(next_uid);

        log_changes!(
            self.verbosity,
            "commit {} ops, {} suspended, {} resumed",
            ops.len(),
            report.suspended.len(),
            report.resumed.len()
        );
        report.committed = ops;
        report
    }

    /// Commit-time bookkeeping for bases with a role.
    fn apply_role(&mut self, op: &ScheduledOp, report: &mut CommitReport) {
        let role = self.catalog.base(op.base).role;
        if let Some(axis) = role.suspend_axis() {
            for die in target_dies(&op.targets) {
                if let Some(uid) = self.move_to_suspended_axis(die, axis, op.start) {
                    report.suspended.push(uid);
                }
            }
            return;
        }
        if let Some(axis) = role.resume_axis() {
            // The remainder restarts when the resume command completes
            for die in target_dies(&op.targets) {
                match self.resume_from_suspended_axis(die, axis, op.end) {
                    Ok(resumed) => report.resumed.push(resumed),
                    Err(err) => report.resume_failures.push(err),
                }
            }
            return;
        }
        match role {
            BaseRole::OdtDisable => self.odt_disabled = true,
            BaseRole::OdtEnable => self.odt_disabled = false,
            BaseRole::CacheReadStart => {
                for a in &op.targets {
                    self.cache_read.insert((a.die, a.plane), op.start);
                }
            }
            BaseRole::CacheReadEnd => {
                for a in &op.targets {
                    self.cache_read.remove(&(a.die, a.plane));
                }
            }
            BaseRole::CacheProgramStart => {
                for die in target_dies(&op.targets) {
                    self.cache_program.insert(die, op.start);
                }
            }
            BaseRole::CacheProgramEnd => {
                for die in target_dies(&op.targets) {
                    self.cache_program.remove(&die);
                }
            }
            _ => {}
        }
    }

    /// Release the read latch of a plane when its data-out finishes.
    pub fn release_on_dout_end(&mut self, die: u32, plane: u32, t: SimTime) -> bool {
        let released = self.latches.remove(&(die, plane, LatchKind::Read)).is_some();
        if released {
            log_changes!(self.verbosity, "read latch released on d{}p{} at {:.3}", die, plane, t);
        }
        released
    }

    /// Release every program latch of a die when the final program step ends.
    pub fn release_on_exec_msb_end(&mut self, die: u32, t: SimTime) -> usize {
        let before = self.latches.len();
        self.latches
            .retain(|(d, _, kind), _| !(*d == die && kind.is_program()));
        let released = before - self.latches.len();
        if released > 0 {
            log_changes!(
                self.verbosity,
                "{} program latches released on d{} at {:.3}",
                released,
                die,
                t
            );
        }
        released
    }

    /// Track a committed operation that suspend may interrupt.
    pub fn register_ongoing(&mut self, op: ScheduledOp) -> bool {
        let Some(axis) = self.catalog.base(op.base).family.and_then(|f| f.axis()) else {
            return false;
        };
        let die = op.die();
        self.axes[die as usize].axis_mut(axis).ongoing.push(op);
        true
    }

    /// Forget an ongoing operation that finished.
    pub fn complete_op(&mut self, uid: OpUid) -> bool {
        let mut found = false;
        for die in self.axes.iter_mut() {
            for axis in [Axis::Erase, Axis::Program] {
                let track = die.axis_mut(axis);
                let before = track.ongoing.len();
                track.ongoing.retain(|op| op.uid != uid);
                found |= track.ongoing.len() != before;
            }
        }
        found
    }

    pub fn is_op_suspended(&self, uid: OpUid) -> bool {
        self.axes.iter().any(|die| {
            [Axis::Erase, Axis::Program]
                .iter()
                .any(|axis| die.axis(*axis).suspended.iter().any(|s| s.uid == uid))
        })
    }

    /// `"<BASE>.<STATE>"` of the interval covering `t` on a plane.
    pub fn op_state(&self, die: u32, plane: u32, t: SimTime) -> Option<String> {
        if die >= self.dies || plane >= self.planes {
            return None;
        }
        self.timeline
            .state_at(die, plane, t)
            .map(|iv| format!("{}.{}", self.catalog.base(iv.base).name, iv.state))
    }

    /// Phase key for proposal: the current state, else `"<BASE>.END"` of the
    /// most recent interval, else `None`.
    pub fn phase_key_at(&self, die: u32, plane: u32, t: SimTime) -> Option<String> {
        if die >= self.dies || plane >= self.planes {
            return None;
        }
        self.op_state(die, plane, t).or_else(|| {
            self.timeline
                .last_before(die, plane, t)
                .map(|iv| format!("{}.END", self.catalog.base(iv.base).name))
        })
    }

    pub fn odt_state(&self) -> &'static str {
        if self.odt_disabled {
            "ODT_DISABLE"
        } else {
            "ODT_ENABLE"
        }
    }

    /// Cache state of a plane; a die-level cache program takes precedence.
    pub fn cache_state(&self, die: u32, plane: u32, t: SimTime) -> Option<&'static str> {
        if self.cache_program.get(&die).is_some_and(|s| *s <= t) {
            Some("ON_CACHE_PROGRAM")
        } else if self.cache_read.get(&(die, plane)).is_some_and(|s| *s <= t) {
            Some("ON_CACHE_READ")
        } else {
            None
        }
    }

    pub fn suspend_state(&self, die: u32, axis: Axis, t: SimTime) -> &'static str {
        let suspended = self
            .axes
            .get(die as usize)
            .is_some_and(|d| d.axis(axis).windows.iter().any(|w| w.covers(t)));
        if suspended {
            axis.suspended_state()
        } else {
            axis.idle_state()
        }
    }

    pub fn erase_suspend_state(&self, die: u32, t: SimTime) -> &'static str {
        self.suspend_state(die, Axis::Erase, t)
    }

    pub fn program_suspend_state(&self, die: u32, t: SimTime) -> &'static str {
        self.suspend_state(die, Axis::Program, t)
    }

    pub fn availability(&self, die: u32, plane: u32) -> SimTime {
        self.avail[self.pidx(die, plane)]
    }

    pub fn plane_windows(&self, die: u32, plane: u32) -> impl Iterator<Item = &Window> + '_ {
        self.plane_windows[self.pidx(die, plane)].iter()
    }

    pub fn bus_windows(&self) -> impl Iterator<Item = &Window> + '_ {
        self.bus.iter()
    }

    pub fn exclusion_windows(&self, die: u32) -> impl Iterator<Item = &ExclusionWindow> + '_ {
        self.die_exclusions[die as usize]
            .iter()
            .chain(self.global_exclusions.iter())
    }

    pub fn latch(&self, die: u32, plane: u32, kind: LatchKind) -> Option<&LatchEntry> {
        self.latches.get(&(die, plane, kind))
    }

    pub fn timeline(&self) -> &StateTimeline {
        &self.timeline
    }

    pub fn ongoing_ops(&self, die: u32, axis: Axis) -> &[ScheduledOp] {
        &self.axes[die as usize].axis(axis).ongoing
    }

    pub fn suspended_ops(&self, die: u32, axis: Axis) -> &[SuspendedOp] {
        &self.axes[die as usize].axis(axis).suspended
    }

    /// Structured record of the most recent failed resume.
    pub fn last_error(&self) -> Option<&ResumeError> {
        self.last_error.as_ref()
    }
}

/// Distinct dies of a target list, sorted.
pub(crate) fn target_dies(targets: &[Address]) -> Vec<u32> {
    let mut dies: Vec<u32> = targets.iter().map(|a| a.die).collect();
    dies.sort_unstable();
    dies.dedup();
    dies
}
