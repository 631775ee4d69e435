//! Trace records handed to hosts.

use pyo3::prelude::*;
use serde::{Deserialize, Serialize};

use crate::catalog::OpCatalog;
use crate::resource::ScheduledOp;

/// One committed operation, in commit order.
#[pyclass]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommittedOp {
    #[pyo3(get)]
    pub uid: u64,
    #[pyo3(get)]
    pub name: String,
    #[pyo3(get)]
    pub base: String,
    #[pyo3(get)]
    pub die: u32,
    /// `(die, plane, block, page)` per target.
    #[pyo3(get)]
    pub targets: Vec<(u32, u32, u32, Option<u32>)>,
    #[pyo3(get)]
    pub start: f64,
    #[pyo3(get)]
    pub end: f64,
    /// Phase key the proposal was drawn for.
    #[pyo3(get)]
    pub phase_key: String,
    /// Time of the hook that proposed it.
    #[pyo3(get)]
    pub proposed_at: f64,
    /// Index within its batch; chained dependents are 1.
    #[pyo3(get)]
    pub position: u32,
}

impl CommittedOp {
    pub fn from_scheduled(
        op: &ScheduledOp,
        catalog: &OpCatalog,
        phase_key: &str,
        proposed_at: f64,
        position: u32,
    ) -> Self {
        Self {
            uid: op.uid.0,
            name: catalog.name(op.name).name.clone(),
            base: catalog.base(op.base).name.clone(),
            die: op.die(),
            targets: op
                .targets
                .iter()
                .map(|a| (a.die, a.plane, a.block, a.page))
                .collect(),
            start: op.start,
            end: op.end,
            phase_key: phase_key.to_string(),
            proposed_at,
            position,
        }
    }

    /// Distinct planes of the targets.
    pub fn planes(&self) -> Vec<u32> {
        let mut planes: Vec<u32> = self.targets.iter().map(|t| t.1).collect();
        planes.sort_unstable();
        planes.dedup();
        planes
    }
}

#[pymethods]
impl CommittedOp {
    fn __repr__(&self) -> String {
        format!(
            "CommittedOp(uid={}, name={:?}, die={}, start={}, end={})",
            self.uid, self.name, self.die, self.start, self.end
        )
    }
}
