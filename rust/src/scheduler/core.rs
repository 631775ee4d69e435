//! Event-driven scheduler loop.

use rand::SeedableRng;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::bootstrap::{Bootstrap, BootstrapProgress, StagedBootstrap};
use crate::catalog::{segment_offsets, ConfigError, OpCatalog};
use crate::config::SimConfig;
use crate::events::{EventHandle, EventKind, EventPayload, EventQueue, PhaseHook};
use crate::models::CommittedOp;
use crate::proposer::{propose, ProposedBatch};
use crate::resource::{target_dies, RejectReason, ResourceManager, RestoreError, ScheduledOp};
use crate::sampler::{AddressSampler, SimRng};
use crate::types::{BaseRole, Family, OpUid, SimTime};
use crate::{log_changes, log_checks, log_debug};

use super::metrics::{SchedulerMetrics, SkipReason};
use super::snapshot::{PendingEvent, SchedulerSnapshot};

/// States that never produce phase hooks.
const SILENT_STATES: [&str; 3] = ["ISSUE", "DATA_IN", "DATA_OUT"];

/// Tolerance for comparing an OP_END time with the op's recorded end.
const END_TOLERANCE: SimTime = 1e-9;

/// Errors that can occur while setting up or restoring a scheduler.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to restore snapshot: {0}")]
    Restore(#[from] RestoreError),
}

/// Why `run` stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStop {
    /// No event at or before `until` remains.
    Until,
    /// The phase-hook budget was spent.
    HookBudget,
    /// The event queue ran dry.
    Drained,
}

/// Single owner of the clock, event queue, resource manager and sampler.
pub struct Scheduler<S: AddressSampler> {
    catalog: Arc<OpCatalog>,
    rm: ResourceManager,
    sampler: S,
    bootstrap: Option<Box<dyn Bootstrap>>,
    queue: EventQueue,
    rng: SimRng,
    now: SimTime,
    /// Committed operations whose OP_END is pending.
    live: FxHashMap<OpUid, ScheduledOp>,
    end_handles: FxHashMap<OpUid, EventHandle>,
    committed: Vec<CommittedOp>,
    metrics: SchedulerMetrics,
    refill_cursor: u64,
    verbosity: u8,
}

impl<S: AddressSampler> Scheduler<S> {
    /// Build a scheduler and seed a phase hook on every plane at time zero.
    pub fn new(config: &SimConfig, sampler: S, seed: u64) -> Result<Self, SchedulerError> {
        let catalog = Arc::new(OpCatalog::build(config)?);
        let bootstrap: Option<Box<dyn Bootstrap>> = match &config.bootstrap {
            Some(cfg) => Some(Box::new(StagedBootstrap::new(cfg, &catalog)?)),
            None => None,
        };
        let verbosity = catalog.policies.verbosity;
        let mut scheduler = Self {
            rm: ResourceManager::new(Arc::clone(&catalog)),
            catalog,
            sampler,
            bootstrap,
            queue: EventQueue::new(),
            rng: SimRng::seed_from_u64(seed),
            now: 0.0,
            live: FxHashMap::default(),
            end_handles: FxHashMap::default(),
            committed: Vec::new(),
            metrics: SchedulerMetrics::default(),
            refill_cursor: 0,
            verbosity,
        };
        scheduler.seed_events(0.0);
        Ok(scheduler)
    }

    /// Replace the bootstrap overlay.
    pub fn with_bootstrap(mut self, bootstrap: Box<dyn Bootstrap>) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    fn seed_events(&mut self, t: SimTime) {
        let topology = &self.catalog.topology;
        for die in 0..topology.dies {
            for plane in 0..topology.planes {
                self.queue.push(
                    t,
                    EventPayload::PhaseHook(PhaseHook {
                        die,
                        plane,
                        label: None,
                    }),
                );
            }
        }
        let period = self.catalog.policies.queue_refill_period;
        if period > 0.0 {
            self.queue.push(t + period, EventPayload::QueueRefill);
        }
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    pub fn resource(&self) -> &ResourceManager {
        &self.rm
    }

    pub fn catalog(&self) -> &OpCatalog {
        &self.catalog
    }

    pub fn sampler(&self) -> &S {
        &self.sampler
    }

    pub fn committed(&self) -> &[CommittedOp] {
        &self.committed
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    pub fn bootstrap_progress(&self) -> Option<BootstrapProgress> {
        self.bootstrap
            .as_ref()
            .map(|b| b.progress_snapshot(&self.catalog.topology))
    }

    /// Queue an extra phase hook.
    pub fn push_hook(&mut self, t: SimTime, die: u32, plane: u32, label: Option<String>) {
        self.queue.push(
            t.max(self.now),
            EventPayload::PhaseHook(PhaseHook { die, plane, label }),
        );
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let mut live: Vec<ScheduledOp> = self.live.values().cloned().collect();
        live.sort_by_key(|op| op.uid);
        SchedulerSnapshot {
            resource: self.rm.snapshot(),
            now: self.now,
            live,
            events: self
                .queue
                .pending()
                .into_iter()
                .map(|e| PendingEvent {
                    time: e.time,
                    payload: e.payload.clone(),
                })
                .collect(),
            committed: self.committed.clone(),
            metrics: self.metrics.clone(),
            refill_cursor: self.refill_cursor,
            bootstrap: self.bootstrap_progress(),
            rng: Some(self.rng.clone()),
        }
    }

    /// Continue from `snapshot`: clock, queue, ops in flight and trace.
    ///
    /// Fails without any change when an OP_END in the snapshot has no
    /// matching op in flight or the resource state does not fit.
    pub fn restore(&mut self, snapshot: &SchedulerSnapshot) -> Result<(), SchedulerError> {
        for event in &snapshot.events {
            if let EventPayload::OpEnd(uid) = event.payload {
                if !snapshot.live.iter().any(|op| op.uid == uid) {
                    return Err(RestoreError::Inconsistent(format!(
                        "OP_END for {} has no op in flight",
                        uid
                    ))
                    .into());
                }
            }
        }
        self.rm.restore(&snapshot.resource)?;

        self.now = snapshot.now;
        self.queue = EventQueue::new();
        self.end_handles.clear();
        for event in &snapshot.events {
            let handle = self.queue.push(event.time, event.payload.clone());
            if let EventPayload::OpEnd(uid) = event.payload {
                self.end_handles.insert(uid, handle);
            }
        }
        self.live = snapshot
            .live
            .iter()
            .map(|op| (op.uid, op.clone()))
            .collect();
        self.committed.clone_from(&snapshot.committed);
        self.metrics = snapshot.metrics.clone();
        self.refill_cursor = snapshot.refill_cursor;
        if let (Some(bootstrap), Some(progress)) = (self.bootstrap.as_mut(), &snapshot.bootstrap) {
            bootstrap.restore_progress(progress);
        }
        if let Some(rng) = &snapshot.rng {
            self.rng = rng.clone();
        }
        log_changes!(
            self.verbosity,
            "restored {} pending events and {} ops in flight at {:.3}",
            snapshot.events.len(),
            snapshot.live.len(),
            self.now
        );
        Ok(())
    }

    /// Process events up to `until`, or until `max_hooks` phase hooks ran.
    pub fn run(&mut self, until: SimTime, max_hooks: Option<u64>) -> RunStop {
        let start_hooks = self.metrics.hooks;
        loop {
            if max_hooks.is_some_and(|max| self.metrics.hooks - start_hooks >= max) {
                return RunStop::HookBudget;
            }
            match self.queue.peek_time() {
                None => return RunStop::Drained,
                Some(t) if t > until => return RunStop::Until,
                Some(_) => {}
            }
            self.tick();
        }
    }

    /// Pop one time batch and process it. Returns the batch time.
    pub fn tick(&mut self) -> Option<SimTime> {
        let (time, events) = self.queue.pop_time_batch()?;
        if time > self.now {
            log_debug!(self.verbosity, "clock {:.3} -> {:.3}", self.now, time);
            self.now = time;
        }
        self.metrics.ticks += 1;

        // The batch is already in kind priority order
        for event in events {
            match event.payload {
                EventPayload::OpEnd(uid) => self.handle_op_end(uid),
                EventPayload::PhaseHook(hook) => {
                    self.metrics.hooks += 1;
                    self.propose_and_schedule(hook);
                }
                EventPayload::QueueRefill => self.handle_refill(),
                EventPayload::OpStart(uid) => {
                    self.metrics.op_starts += 1;
                    log_debug!(self.verbosity, "{} started at {:.3}", uid, self.now);
                }
            }
        }
        Some(time)
    }

    fn handle_refill(&mut self) {
        self.metrics.refills += 1;
        let topology = &self.catalog.topology;
        let slots = u64::from(topology.dies) * u64::from(topology.planes);
        let slot = self.refill_cursor % slots;
        self.refill_cursor += 1;
        let hook = PhaseHook {
            die: (slot / u64::from(topology.planes)) as u32,
            plane: (slot % u64::from(topology.planes)) as u32,
            label: None,
        };
        self.propose_and_schedule(hook);
        let period = self.catalog.policies.queue_refill_period;
        if period > 0.0 {
            self.queue.push(self.now + period, EventPayload::QueueRefill);
        }
    }

    fn handle_op_end(&mut self, uid: OpUid) {
        self.end_handles.remove(&uid);
        let Some(op) = self.live.remove(&uid) else {
            log_checks!(self.verbosity, "OP_END for unknown {} at {:.3}", uid, self.now);
            return;
        };
        self.metrics.op_ends += 1;
        if (op.end - self.now).abs() > END_TOLERANCE {
            self.metrics.end_mismatches += 1;
            log_checks!(
                self.verbosity,
                "{} ended at {:.3}, expected {:.3}",
                uid,
                self.now,
                op.end
            );
        }

        let spec = self.catalog.base(op.base);
        let (role, family) = (spec.role, spec.family);
        match role {
            BaseRole::Dout => {
                for a in &op.targets {
                    self.rm.release_on_dout_end(a.die, a.plane, self.now);
                }
            }
            BaseRole::ExecMsb => {
                for die in target_dies(&op.targets) {
                    self.rm.release_on_exec_msb_end(die, self.now);
                }
            }
            _ => {}
        }

        if !self.rm.is_op_suspended(uid) {
            let celltype = op.celltype.as_deref();
            match family {
                Some(Family::Erase) => self.sampler.apply_erase(&op.targets, celltype),
                Some(Family::Program) if self.catalog.is_program_sync(op.base) => {
                    self.sampler.apply_pgm(&op.targets, celltype)
                }
                _ => {}
            }
        }
        self.rm.complete_op(uid);
    }

    /// Ask the proposer for a batch at `hook` and commit it atomically.
    fn propose_and_schedule(&mut self, hook: PhaseHook) {
        let now = self.now;
        if let Some(bootstrap) = self.bootstrap.as_mut() {
            if bootstrap.maybe_advance() {
                log_changes!(self.verbosity, "bootstrap stage {}", bootstrap.stage());
            }
        }
        let weights = self
            .bootstrap
            .as_ref()
            .and_then(|b| b.overlay_weights())
            .unwrap_or_else(|| self.catalog.weights());
        let outcome = propose(now, &hook, weights, &self.rm, &self.sampler, &mut self.rng);
        let failure = outcome.diagnostics.failure();
        self.metrics.record_diagnostics(outcome.diagnostics);

        let Some(batch) = outcome.batch else {
            let reason = if failure == "no_candidates" {
                SkipReason::NoCandidates
            } else {
                SkipReason::NoFeasible
            };
            log_checks!(
                self.verbosity,
                "hook d{}p{} at {:.3}: {}",
                hook.die,
                hook.plane,
                now,
                reason
            );
            self.metrics.record_skip(reason);
            return;
        };

        if let Err(reason) = self.reserve_batch(now, &batch) {
            log_checks!(
                self.verbosity,
                "batch at {:.3} rolled back: {}",
                now,
                reason
            );
            self.metrics.record_skip(SkipReason::Reserve(reason));
        }
    }

    fn reserve_batch(&mut self, now: SimTime, batch: &ProposedBatch) -> Result<(), RejectReason> {
        let policies = &self.catalog.policies;
        let mut txn = self.rm.begin(now);
        for (i, proposed) in batch.ops.iter().enumerate() {
            let reserved = self.rm.reserve(
                &mut txn,
                &proposed.op,
                &proposed.targets,
                proposed.scope,
                Some(&self.sampler),
            );
            let r = match reserved {
                Ok(r) => r,
                Err(reason) => {
                    self.rm.rollback(txn);
                    return Err(reason);
                }
            };
            let instant = self.catalog.base(proposed.base).instant;
            if i == 0 && !instant && r.start >= now + policies.admission_window {
                self.rm.rollback(txn);
                return Err(RejectReason::WindowExceed);
            }
            txn.advance_to(r.end + policies.sequence_gap);
        }

        let report = self.rm.commit(txn);
        for uid in &report.suspended {
            self.metrics.suspends += 1;
            self.live.remove(uid);
            if let Some(handle) = self.end_handles.remove(uid) {
                self.queue.remove(handle, Some(EventKind::OpEnd));
            }
        }
        // Remainders restart without a second OP_START
        for resumed in &report.resumed {
            self.metrics.resumes += 1;
            self.emit(resumed, false);
            self.live.insert(resumed.uid, resumed.clone());
        }
        for err in &report.resume_failures {
            self.metrics.resume_failures += 1;
            log_checks!(self.verbosity, "{}", err);
            self.metrics.last_resume_error = Some(err.clone());
        }
        for (position, op) in report.committed.iter().enumerate() {
            self.rm.register_ongoing(op.clone());
            self.emit(op, true);
            self.committed.push(CommittedOp::from_scheduled(
                op,
                &self.catalog,
                &batch.phase_key,
                now,
                position as u32,
            ));
            self.live.insert(op.uid, op.clone());
        }
        if let Some(bootstrap) = self.bootstrap.as_mut() {
            bootstrap.record_committed(&report.committed);
            if bootstrap.maybe_advance() {
                log_changes!(self.verbosity, "bootstrap stage {}", bootstrap.stage());
            }
        }
        self.metrics.committed_batches += 1;
        self.metrics.committed_ops += report.committed.len() as u64;
        log_changes!(
            self.verbosity,
            "committed {} ops for {} at {:.3}",
            report.committed.len(),
            batch.phase_key,
            now
        );
        Ok(())
    }

    /// Push OP_START (optionally), OP_END and segment phase hooks of `op`.
    fn emit(&mut self, op: &ScheduledOp, with_start: bool) {
        if with_start {
            self.queue.push(op.start, EventPayload::OpStart(op.uid));
        }
        let handle = self.queue.push(op.end, EventPayload::OpEnd(op.uid));
        self.end_handles.insert(op.uid, handle);

        let spec = self.catalog.base(op.base);
        if !spec.affect_state {
            return;
        }
        let epsilon = self.catalog.policies.hook_epsilon;
        let mut planes: Vec<(u32, u32)> = op.targets.iter().map(|a| (a.die, a.plane)).collect();
        planes.sort_unstable();
        planes.dedup();
        for (seg, rel_start, rel_end) in segment_offsets(&op.states) {
            if SILENT_STATES.contains(&seg.name.as_str()) {
                continue;
            }
            let label = format!("{}.{}", spec.name, seg.name);
            let boundary = op.start + rel_end;
            let early = (boundary - epsilon).max(op.start + rel_start);
            for &(die, plane) in &planes {
                for t in [early, boundary] {
                    self.queue.push(
                        t,
                        EventPayload::PhaseHook(PhaseHook {
                            die,
                            plane,
                            label: Some(label.clone()),
                        }),
                    );
                }
            }
        }
    }
}
