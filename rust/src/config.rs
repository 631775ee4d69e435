//! Configuration types for the simulation core.
//!
//! `SimConfig` is the language-agnostic configuration surface. It is plain
//! data; `OpCatalog::build` validates it and compiles the lookup tables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::bootstrap::BootstrapConfig;
use crate::catalog::ConfigError;
use crate::sampler::SamplerConfig;
use crate::types::{BaseRole, ExclusionScope, Family, Inherit, LatchKind, Scope, SimTime};

/// Device geometry seen by the scheduling core.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub dies: u32,
    pub planes: u32,
}

impl Default for Topology {
    fn default() -> Self {
        Self { dies: 1, planes: 2 }
    }
}

/// One named state of an operation base.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateConfig {
    pub name: String,
    #[serde(default)]
    pub bus: bool,
}

impl StateConfig {
    pub fn new(name: &str, bus: bool) -> Self {
        Self {
            name: name.to_string(),
            bus,
        }
    }
}

/// Per-base configuration: scope, flags and the ordered state list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpBaseConfig {
    pub scope: Scope,
    #[serde(default)]
    pub affect_state: bool,
    #[serde(default)]
    pub instant_resv: bool,
    pub states: Vec<StateConfig>,
    /// Address family; inferred from the base name when absent.
    #[serde(default)]
    pub family: Option<Family>,
    #[serde(default)]
    pub role: BaseRole,
    /// Latch taken on the target planes when the operation ends.
    #[serde(default)]
    pub latch: Option<LatchKind>,
    #[serde(default)]
    pub exclusion: ExclusionScope,
}

/// Per-operation-name configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpNameConfig {
    pub base: String,
    /// Explicit multiplicity; structural classification applies when absent.
    #[serde(default)]
    pub multi: Option<bool>,
    #[serde(default)]
    pub celltype: Option<String>,
    /// Duration per state name of the base.
    pub durations: BTreeMap<String, SimTime>,
}

/// Scheduling and proposal policies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policies {
    /// Maximum delay between proposal time and the first op's start.
    pub admission_window: SimTime,
    /// Period of the QUEUE_REFILL event; 0 disables refills, which lets a
    /// run drain once every die idles past the admission window.
    pub queue_refill_period: SimTime,
    /// Number of candidate names drawn per proposal.
    pub top_n: usize,
    /// Probability of exploring candidates uniformly instead of by weight.
    pub epsilon_greedy: f64,
    /// Maximum number of candidates evaluated per proposal.
    pub maxtry_candidate: usize,
    /// Upper bound on planes requested by a multi-plane operation.
    pub maxplanes: u32,
    /// Smallest plane set the proposer shrinks to before giving up.
    pub min_planes: u32,
    /// Gap inserted between chained operations of one batch.
    pub sequence_gap: SimTime,
    /// Offset of the early PHASE_HOOK before a segment boundary.
    pub hook_epsilon: SimTime,
    /// Program bases whose completion is applied to the address sampler.
    pub program_sync_bases: Vec<String>,
    /// Verbosity level: 0=silent, 1=changes, 2=checks, 3=debug.
    pub verbosity: u8,
}

impl Default for Policies {
    fn default() -> Self {
        Self {
            admission_window: 1.0,
            queue_refill_period: 50.0,
            top_n: 4,
            epsilon_greedy: 0.0,
            maxtry_candidate: 8,
            maxplanes: 4,
            min_planes: 1,
            sequence_gap: 0.0,
            hook_epsilon: 0.1,
            program_sync_bases: Vec::new(),
            verbosity: 0,
        }
    }
}

/// Switches for the optional rule checks of the resource manager.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Features {
    pub suspend_rules: bool,
    pub odt_rules: bool,
    pub cache_rules: bool,
    pub epr_rules: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            suspend_rules: true,
            odt_rules: true,
            cache_rules: true,
            epr_rules: true,
        }
    }
}

/// Follow-up operation table for one base.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceConfig {
    /// Candidate follow-up op names and their probabilities.
    pub probs: BTreeMap<String, f64>,
    /// Attributes each follow-up inherits from its predecessor.
    #[serde(default)]
    pub inherit: BTreeMap<String, Vec<Inherit>>,
}

/// Full configuration consumed by the core.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    pub topology: Topology,
    pub op_bases: BTreeMap<String, OpBaseConfig>,
    pub op_names: BTreeMap<String, OpNameConfig>,
    pub phase_conditional: BTreeMap<String, BTreeMap<String, f64>>,
    #[serde(default)]
    pub exclusion_groups: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub exclusions_by_suspend_state: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub exclusions_by_odt_state: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub exclusions_by_cache_state: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub exclusions_by_latch_state: BTreeMap<String, Vec<String>>,
    /// Bases allowed to run single-plane on different planes of one die concurrently.
    #[serde(default)]
    pub plane_parallel_read: Vec<String>,
    #[serde(default)]
    pub policies: Policies,
    #[serde(default)]
    pub sequences: BTreeMap<String, SequenceConfig>,
    #[serde(default)]
    pub features: Features,
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub bootstrap: Option<BootstrapConfig>,
}

impl SimConfig {
    /// Parse a configuration from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// A small but complete operation table: erase, SLC program, single and
    /// multi-plane read with data-out, status read, erase/program suspend and
    /// resume, and ODT toggles.
    pub fn reference() -> Self {
        let mut op_bases = BTreeMap::new();

        op_bases.insert(
            "ERASE".to_string(),
            base(Scope::DieWide, true, false, &[("ISSUE", true), ("CORE_BUSY", false)]),
        );
        op_bases.insert(
            "PROGRAM_SLC".to_string(),
            base(
                Scope::PlaneSet,
                true,
                false,
                &[("ISSUE", true), ("DATA_IN", true), ("CORE_BUSY", false)],
            ),
        );
        let mut read = base(Scope::PlaneSet, true, false, &[("ISSUE", true), ("CORE_BUSY", false)]);
        read.latch = Some(LatchKind::Read);
        op_bases.insert("READ".to_string(), read);

        let mut dout = base(Scope::PlaneSet, false, false, &[("ISSUE", true), ("DATA_OUT", true)]);
        dout.role = BaseRole::Dout;
        op_bases.insert("DOUT".to_string(), dout);

        op_bases.insert(
            "SR".to_string(),
            base(Scope::None, false, true, &[("ISSUE", true), ("DATA_OUT", true)]),
        );

        for (name, role, affect) in [
            ("ERASE_SUSPEND", BaseRole::EraseSuspend, true),
            ("ERASE_RESUME", BaseRole::EraseResume, false),
            ("PROGRAM_SUSPEND", BaseRole::ProgramSuspend, true),
            ("PROGRAM_RESUME", BaseRole::ProgramResume, false),
        ] {
            let states: &[(&str, bool)] = if affect {
                &[("ISSUE", true), ("CORE_BUSY", false)]
            } else {
                &[("ISSUE", true)]
            };
            let mut b = base(Scope::DieWide, affect, true, states);
            b.role = role;
            op_bases.insert(name.to_string(), b);
        }

        for (name, role) in [
            ("ODTDISABLE", BaseRole::OdtDisable),
            ("ODTENABLE", BaseRole::OdtEnable),
        ] {
            let mut b = base(Scope::None, false, true, &[("ISSUE", true)]);
            b.role = role;
            op_bases.insert(name.to_string(), b);
        }

        let mut op_names = BTreeMap::new();
        op_names.insert(
            "Erase".to_string(),
            name("ERASE", None, Some("SLC"), &[("ISSUE", 0.5), ("CORE_BUSY", 1000.0)]),
        );
        op_names.insert(
            "Program_SLC".to_string(),
            name(
                "PROGRAM_SLC",
                Some(false),
                Some("SLC"),
                &[("ISSUE", 0.5), ("DATA_IN", 8.0), ("CORE_BUSY", 200.0)],
            ),
        );
        op_names.insert(
            "Read_SLC".to_string(),
            name("READ", Some(false), Some("SLC"), &[("ISSUE", 0.5), ("CORE_BUSY", 40.0)]),
        );
        op_names.insert(
            "Multi_Read_SLC".to_string(),
            name("READ", Some(true), Some("SLC"), &[("ISSUE", 0.5), ("CORE_BUSY", 40.0)]),
        );
        op_names.insert(
            "Dout".to_string(),
            name("DOUT", Some(false), None, &[("ISSUE", 0.5), ("DATA_OUT", 8.0)]),
        );
        op_names.insert(
            "SR".to_string(),
            name("SR", Some(false), None, &[("ISSUE", 0.25), ("DATA_OUT", 0.25)]),
        );
        op_names.insert(
            "Erase_Suspend".to_string(),
            name("ERASE_SUSPEND", None, None, &[("ISSUE", 0.5), ("CORE_BUSY", 20.0)]),
        );
        op_names.insert(
            "Erase_Resume".to_string(),
            name("ERASE_RESUME", None, None, &[("ISSUE", 0.5)]),
        );
        op_names.insert(
            "Program_Suspend".to_string(),
            name("PROGRAM_SUSPEND", None, None, &[("ISSUE", 0.5), ("CORE_BUSY", 20.0)]),
        );
        op_names.insert(
            "Program_Resume".to_string(),
            name("PROGRAM_RESUME", None, None, &[("ISSUE", 0.5)]),
        );
        op_names.insert(
            "ODT_Disable".to_string(),
            name("ODTDISABLE", None, None, &[("ISSUE", 0.5)]),
        );
        op_names.insert(
            "ODT_Enable".to_string(),
            name("ODTENABLE", None, None, &[("ISSUE", 0.5)]),
        );

        let mut phase_conditional = BTreeMap::new();
        phase_conditional.insert(
            "DEFAULT".to_string(),
            weights(&[
                ("Erase", 0.2),
                ("Program_SLC", 0.35),
                ("Read_SLC", 0.3),
                ("Multi_Read_SLC", 0.1),
                ("SR", 0.05),
            ]),
        );
        phase_conditional.insert(
            "ERASE.CORE_BUSY".to_string(),
            weights(&[("Erase_Suspend", 0.3), ("SR", 0.7)]),
        );
        phase_conditional.insert(
            "ERASE_SUSPEND.END".to_string(),
            weights(&[("Erase_Resume", 0.4), ("Read_SLC", 0.4), ("Program_SLC", 0.2)]),
        );
        phase_conditional.insert(
            "PROGRAM_SLC.CORE_BUSY".to_string(),
            weights(&[("Program_Suspend", 0.3), ("SR", 0.7)]),
        );
        phase_conditional.insert(
            "PROGRAM_SUSPEND.END".to_string(),
            weights(&[("Program_Resume", 0.6), ("Read_SLC", 0.4)]),
        );
        phase_conditional.insert(
            "READ.END".to_string(),
            weights(&[("Dout", 0.7), ("Read_SLC", 0.3)]),
        );

        let exclusion_groups = groups(&[
            ("after_erase_suspend", &["ERASE", "ERASE_SUSPEND"]),
            (
                "after_program_suspend",
                &["ERASE", "PROGRAM_SLC", "PROGRAM_SUSPEND", "ERASE_SUSPEND"],
            ),
            ("erase_resume", &["ERASE_RESUME"]),
            ("program_resume", &["PROGRAM_RESUME"]),
            ("after_read", &["ERASE", "PROGRAM_SLC", "READ"]),
            ("odt_sensitive", &["DOUT", "ODTDISABLE"]),
            ("odt_enable", &["ODTENABLE"]),
        ]);
        let exclusions_by_suspend_state = groups(&[
            ("ERASE_SUSPENDED", &["after_erase_suspend"]),
            ("NOT_ERASE_SUSPENDED", &["erase_resume"]),
            ("PROGRAM_SUSPENDED", &["after_program_suspend"]),
            ("NOT_PROGRAM_SUSPENDED", &["program_resume"]),
        ]);
        let exclusions_by_odt_state = groups(&[
            ("ODT_DISABLE", &["odt_sensitive"]),
            ("ODT_ENABLE", &["odt_enable"]),
        ]);
        let exclusions_by_latch_state = groups(&[("LATCH_ON_READ", &["after_read"])]);

        let mut sequences = BTreeMap::new();
        sequences.insert(
            "READ".to_string(),
            SequenceConfig {
                probs: [("Dout".to_string(), 1.0)].into_iter().collect(),
                inherit: [(
                    "Dout".to_string(),
                    vec![Inherit::SameBlock, Inherit::SamePage, Inherit::SameCelltype],
                )]
                .into_iter()
                .collect(),
            },
        );

        Self {
            topology: Topology::default(),
            op_bases,
            op_names,
            phase_conditional,
            exclusion_groups,
            exclusions_by_suspend_state,
            exclusions_by_odt_state,
            exclusions_by_cache_state: BTreeMap::new(),
            exclusions_by_latch_state,
            plane_parallel_read: vec!["READ".to_string(), "DOUT".to_string()],
            policies: Policies {
                program_sync_bases: vec!["PROGRAM_SLC".to_string()],
                ..Policies::default()
            },
            sequences,
            features: Features::default(),
            sampler: SamplerConfig::default(),
            bootstrap: None,
        }
    }
}

fn base(
    scope: Scope,
    affect_state: bool,
    instant_resv: bool,
    states: &[(&str, bool)],
) -> OpBaseConfig {
    OpBaseConfig {
        scope,
        affect_state,
        instant_resv,
        states: states.iter().map(|(n, b)| StateConfig::new(n, *b)).collect(),
        family: None,
        role: BaseRole::Plain,
        latch: None,
        exclusion: ExclusionScope::Die,
    }
}

fn name(
    base: &str,
    multi: Option<bool>,
    celltype: Option<&str>,
    durations: &[(&str, f64)],
) -> OpNameConfig {
    OpNameConfig {
        base: base.to_string(),
        multi,
        celltype: celltype.map(str::to_string),
        durations: durations.iter().map(|(s, v)| (s.to_string(), *v)).collect(),
    }
}

fn weights(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
    pairs.iter().map(|(n, w)| (n.to_string(), *w)).collect()
}

fn groups(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policies_default() {
        let p = Policies::default();
        assert_eq!(p.top_n, 4);
        assert_eq!(p.min_planes, 1);
        assert_eq!(p.queue_refill_period, 50.0);
    }

    #[test]
    fn test_reference_round_trips_through_json() {
        let config = SimConfig::reference();
        let text = serde_json::to_string(&config).unwrap();
        let parsed = SimConfig::from_json_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_sparse_json_uses_defaults() {
        let text = r#"{
            "topology": {"dies": 1, "planes": 2},
            "op_bases": {
                "ERASE": {"scope": "DIE_WIDE", "affect_state": true,
                          "states": [{"name": "ISSUE", "bus": true}, {"name": "CORE_BUSY"}]}
            },
            "op_names": {
                "Erase": {"base": "ERASE", "durations": {"ISSUE": 0.5, "CORE_BUSY": 10.0}}
            },
            "phase_conditional": {"DEFAULT": {"Erase": 1.0}}
        }"#;
        let config = SimConfig::from_json_str(text).unwrap();
        assert_eq!(config.policies, Policies::default());
        assert!(config.features.epr_rules);
        assert!(config.op_bases["ERASE"].family.is_none());
        assert_eq!(config.op_bases["ERASE"].role, BaseRole::Plain);
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(SimConfig::from_json_str("{\"topology\": 3}").is_err());
    }
}
