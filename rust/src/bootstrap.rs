//! Staged bootstrap overlay.
//!
//! A fresh device has nothing programmed, so early proposals are restricted to
//! a sequence of stages (typically erase first, then program, then
//! everything). Each stage names the bases it allows and how many committed
//! operations of those bases complete it.

use serde::{Deserialize, Serialize};

use crate::catalog::{BaseId, ConfigError, OpCatalog, PhaseWeights};
use crate::config::Topology;
use crate::resource::ScheduledOp;

/// One bootstrap stage.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Operation bases proposable during the stage.
    pub bases: Vec<String>,
    /// Committed operations of those bases needed to leave the stage.
    pub quota: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    pub stages: Vec<StageConfig>,
}

/// Progress report of a bootstrap overlay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BootstrapProgress {
    pub active: bool,
    pub stage: usize,
    pub stages: usize,
    pub committed: u64,
    pub quota: u64,
    /// Qualifying commits of the current stage per die.
    pub per_die: Vec<u64>,
}

/// Restricts which operations the proposer may draw while active.
pub trait Bootstrap {
    fn active(&self) -> bool;

    fn stage(&self) -> usize;

    /// Move past every stage whose quota is met; returns whether the stage changed.
    fn maybe_advance(&mut self) -> bool;

    /// Weights to propose from while active, `None` once finished.
    fn overlay_weights(&self) -> Option<&PhaseWeights>;

    /// Account a committed batch.
    fn record_committed(&mut self, ops: &[ScheduledOp]);

    fn progress_snapshot(&self, topology: &Topology) -> BootstrapProgress;

    /// Rewind or fast-forward to a saved progress report.
    fn restore_progress(&mut self, progress: &BootstrapProgress);
}

#[derive(Debug)]
struct Stage {
    bases: Vec<BaseId>,
    quota: u64,
    weights: PhaseWeights,
}

/// Stage list with a commit quota per stage.
#[derive(Debug)]
pub struct StagedBootstrap {
    stages: Vec<Stage>,
    current: usize,
    committed: u64,
    per_die: Vec<u64>,
}

impl StagedBootstrap {
    pub fn new(config: &BootstrapConfig, catalog: &OpCatalog) -> Result<Self, ConfigError> {
        let mut stages = Vec::with_capacity(config.stages.len());
        for (i, stage) in config.stages.iter().enumerate() {
            let mut bases = Vec::with_capacity(stage.bases.len());
            for name in &stage.bases {
                let id = catalog.base_id(name).ok_or_else(|| ConfigError::UnknownBase {
                    base: name.clone(),
                    context: format!("bootstrap stage {}", i),
                })?;
                bases.push(id);
            }
            let weights = catalog
                .weights()
                .filtered(|name| bases.contains(&catalog.name(name).base));
            stages.push(Stage {
                bases,
                quota: stage.quota,
                weights,
            });
        }
        let mut bootstrap = Self {
            stages,
            current: 0,
            committed: 0,
            per_die: vec![0; catalog.topology.dies as usize],
        };
        // Zero-quota stages are already complete
        bootstrap.maybe_advance();
        Ok(bootstrap)
    }
}

impl Bootstrap for StagedBootstrap {
    fn active(&self) -> bool {
        self.current < self.stages.len()
    }

    fn stage(&self) -> usize {
        self.current
    }

    fn maybe_advance(&mut self) -> bool {
        let before = self.current;
        while let Some(stage) = self.stages.get(self.current) {
            if self.committed < stage.quota {
                break;
            }
            self.current += 1;
            self.committed = 0;
            self.per_die.iter_mut().for_each(|n| *n = 0);
        }
        self.current != before
    }

    fn overlay_weights(&self) -> Option<&PhaseWeights> {
        self.stages.get(self.current).map(|s| &s.weights)
    }

    fn record_committed(&mut self, ops: &[ScheduledOp]) {
        let Some(stage) = self.stages.get(self.current) else {
            return;
        };
        for op in ops.iter().filter(|op| stage.bases.contains(&op.base)) {
            self.committed += 1;
            if let Some(n) = self.per_die.get_mut(op.die() as usize) {
                *n += 1;
            }
        }
    }

    fn progress_snapshot(&self, topology: &Topology) -> BootstrapProgress {
        let mut per_die = self.per_die.clone();
        per_die.resize(topology.dies as usize, 0);
        BootstrapProgress {
            active: self.active(),
            stage: self.current,
            stages: self.stages.len(),
            committed: self.committed,
            quota: self.stages.get(self.current).map_or(0, |s| s.quota),
            per_die,
        }
    }

    fn restore_progress(&mut self, progress: &BootstrapProgress) {
        self.current = progress.stage.min(self.stages.len());
        self.committed = progress.committed;
        self.per_die.clone_from(&progress.per_die);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::types::{Address, Multiplicity, OpUid, Scope};

    fn catalog() -> OpCatalog {
        OpCatalog::build(&SimConfig::reference()).unwrap()
    }

    fn staged(catalog: &OpCatalog) -> StagedBootstrap {
        let config = BootstrapConfig {
            stages: vec![
                StageConfig {
                    bases: vec!["ERASE".to_string()],
                    quota: 2,
                },
                StageConfig {
                    bases: vec!["ERASE".to_string(), "PROGRAM_SLC".to_string()],
                    quota: 1,
                },
            ],
        };
        StagedBootstrap::new(&config, catalog).unwrap()
    }

    fn committed(catalog: &OpCatalog, name: &str, die: u32) -> ScheduledOp {
        let id = catalog.name_id(name).unwrap();
        ScheduledOp {
            uid: OpUid(0),
            name: id,
            base: catalog.name(id).base,
            targets: vec![Address::block(die, 0, 0)],
            scope: Scope::PlaneSet,
            multiplicity: Multiplicity::Single,
            celltype: None,
            start: 0.0,
            end: 1.0,
            states: Vec::new(),
        }
    }

    #[test]
    fn test_first_stage_allows_only_erase() {
        let catalog = catalog();
        let bootstrap = staged(&catalog);
        let weights = bootstrap.overlay_weights().unwrap();
        let dist = weights.lookup(PhaseWeights::DEFAULT_KEY).unwrap();
        let erase = catalog.name_id("Erase").unwrap();
        assert_eq!(dist, &[(erase, 1.0)]);
        // Keys without an erase candidate fall back to the filtered default
        assert_eq!(weights.lookup("READ.END").unwrap(), dist);
    }

    #[test]
    fn test_stages_advance_on_quota() {
        let catalog = catalog();
        let mut bootstrap = staged(&catalog);
        let topology = catalog.topology.clone();

        bootstrap.record_committed(&[committed(&catalog, "Read_SLC", 0)]);
        assert!(!bootstrap.maybe_advance());
        bootstrap.record_committed(&[committed(&catalog, "Erase", 0)]);
        assert_eq!(bootstrap.progress_snapshot(&topology).per_die, vec![1]);
        bootstrap.record_committed(&[committed(&catalog, "Erase", 0)]);
        assert!(bootstrap.maybe_advance());
        assert_eq!(bootstrap.stage(), 1);

        bootstrap.record_committed(&[committed(&catalog, "Program_SLC", 0)]);
        assert!(bootstrap.maybe_advance());
        assert!(!bootstrap.active());
        assert!(bootstrap.overlay_weights().is_none());
        let progress = bootstrap.progress_snapshot(&topology);
        assert_eq!(progress.stage, 2);
        assert_eq!(progress.quota, 0);
    }

    #[test]
    fn test_unknown_base_is_rejected() {
        let catalog = catalog();
        let config = BootstrapConfig {
            stages: vec![StageConfig {
                bases: vec!["NOPE".to_string()],
                quota: 1,
            }],
        };
        assert!(matches!(
            StagedBootstrap::new(&config, &catalog),
            Err(ConfigError::UnknownBase { .. })
        ));
    }
}
