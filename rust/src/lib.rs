//! NAND operation-sequence scheduling core.
//!
//! A discrete-event simulator that proposes, times and commits erase, program
//! and read-family operations on a multi-die, multi-plane device under plane,
//! bus, exclusion, latch and suspend/resume constraints.

// Allow clippy warning triggered by PyO3 macro expansion
#![allow(clippy::useless_conversion)]

use pyo3::prelude::*;

pub mod bootstrap;
pub mod catalog;
pub mod config;
pub mod events;
pub mod interner;
pub mod logging;
mod models;
pub mod proposer;
pub mod resource;
pub mod sampler;
pub mod scheduler;
pub mod types;

pub use bootstrap::{Bootstrap, BootstrapConfig, BootstrapProgress, StageConfig, StagedBootstrap};
pub use catalog::{BaseId, ConfigError, NameId, OpCatalog, Operation, PhaseWeights, StateSegment};
pub use config::{Features, OpBaseConfig, OpNameConfig, Policies, SimConfig, StateConfig, Topology};
pub use events::{Event, EventHandle, EventKind, EventPayload, EventQueue, PhaseHook};
pub use models::CommittedOp;
pub use proposer::{propose, AttemptOutcome, ProposeDiagnostics, ProposedBatch, ProposedOp};
pub use resource::{
    CommitReport, EprPolicy, RejectReason, Reservation, ResourceManager, ResourceSnapshot,
    ResumeError,
};
pub use sampler::{AddressSampler, BlockStateSampler, SampleRequest, SamplerConfig, SimRng};
pub use scheduler::{
    PendingEvent, RunStop, Scheduler, SchedulerError, SchedulerMetrics, SchedulerSnapshot,
    SkipReason,
};
pub use types::{Address, Axis, Family, Multiplicity, OpUid, Scope, SimTime};

fn value_error(err: impl std::fmt::Display) -> PyErr {
    pyo3::exceptions::PyValueError::new_err(err.to_string())
}

/// A scheduler run with the block-state sampler, driven from Python.
#[pyclass(unsendable)]
pub struct Simulation {
    inner: Scheduler<BlockStateSampler>,
}

#[pymethods]
impl Simulation {
    /// Build a simulation from a JSON configuration.
    ///
    /// # Raises
    /// * ValueError if the configuration is malformed or fails validation
    #[new]
    #[pyo3(signature = (config_json, seed=0))]
    fn new(config_json: &str, seed: u64) -> PyResult<Self> {
        let config = SimConfig::from_json_str(config_json).map_err(value_error)?;
        let sampler =
            BlockStateSampler::new(&config.sampler, &config.topology).map_err(value_error)?;
        let inner = Scheduler::new(&config, sampler, seed).map_err(value_error)?;
        Ok(Self { inner })
    }

    /// Process events up to `until`; returns why the run stopped.
    #[pyo3(signature = (until, max_hooks=None))]
    fn run(&mut self, until: f64, max_hooks: Option<u64>) -> &'static str {
        match self.inner.run(until, max_hooks) {
            RunStop::Until => "until",
            RunStop::HookBudget => "hook_budget",
            RunStop::Drained => "drained",
        }
    }

    #[getter]
    fn now(&self) -> f64 {
        self.inner.now()
    }

    fn committed_ops(&self) -> Vec<CommittedOp> {
        self.inner.committed().to_vec()
    }

    /// Run counters as a JSON string.
    fn metrics(&self) -> PyResult<String> {
        self.inner.metrics().to_json().map_err(value_error)
    }

    fn snapshot_json(&self) -> PyResult<String> {
        self.inner.snapshot().to_json().map_err(value_error)
    }

    /// The RNG is not serialized; the simulation keeps drawing from its own.
    ///
    /// # Raises
    /// * ValueError if the snapshot does not decode or does not fit the topology
    fn restore_json(&mut self, snapshot_json: &str) -> PyResult<()> {
        let snapshot = SchedulerSnapshot::from_json(snapshot_json).map_err(value_error)?;
        self.inner.restore(&snapshot).map_err(value_error)
    }

    fn __repr__(&self) -> String {
        format!(
            "Simulation(now={}, committed={})",
            self.inner.now(),
            self.inner.committed().len()
        )
    }
}

/// The nandseq.rust Python module.
#[pymodule]
fn rust(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<CommittedOp>()?;
    m.add_class::<Simulation>()?;
    Ok(())
}
