//! Immutable operation catalog compiled from `SimConfig`.
//!
//! Bases and operation names are interned once; every lookup the core makes
//! afterwards is an index into a dense table. Validation happens here so that
//! configuration errors fail fast at setup time.

use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::config::{Features, Policies, SimConfig, Topology};
use crate::interner::{Symbol, SymbolTable};
use crate::types::{
    BaseRole, ExclusionScope, Family, Inherit, LatchKind, Multiplicity, Scope, SimTime,
};

/// Errors raised while validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),
    #[error("Unknown operation base {base:?} referenced by {context}")]
    UnknownBase { base: String, context: String },
    #[error("Unknown operation name {name:?} referenced by {context}")]
    UnknownOpName { name: String, context: String },
    #[error("Unknown exclusion group {group:?} referenced by {context}")]
    UnknownGroup { group: String, context: String },
    #[error("Operation base {0:?} has no states")]
    EmptyStates(String),
    #[error("Operation {name:?} has no duration for state {state:?}")]
    MissingDuration { name: String, state: String },
    #[error("Operation {name:?} has invalid duration {value} for state {state:?}")]
    InvalidDuration {
        name: String,
        state: String,
        value: f64,
    },
    #[error("Phase {key:?} has invalid weight {weight} for {name:?}")]
    InvalidWeight { key: String, name: String, weight: f64 },
    #[error("Phase {0:?} weights cannot be normalized")]
    NonNormalizableWeights(String),
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),
    #[error("Bad block {block} on die {die} is out of range")]
    BadBlockOutOfRange { die: u32, block: u32 },
    #[error("Invalid sampler configuration: {0}")]
    InvalidSampler(String),
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Interned operation base identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct BaseId(pub u32);

/// Interned operation name identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct NameId(pub u32);

impl Symbol for BaseId {
    fn from_index(index: u32) -> Self {
        BaseId(index)
    }
    fn index(self) -> u32 {
        self.0
    }
}

impl Symbol for NameId {
    fn from_index(index: u32) -> Self {
        NameId(index)
    }
    fn index(self) -> u32 {
        self.0
    }
}

/// One state segment of a concrete operation.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StateSegment {
    pub name: String,
    pub duration: SimTime,
    pub bus: bool,
}

/// Concrete operation descriptor: a name, its base and timed state segments.
#[derive(Clone, Debug, PartialEq)]
pub struct Operation {
    pub name: NameId,
    pub base: BaseId,
    pub celltype: Option<String>,
    pub states: Vec<StateSegment>,
}

impl Operation {
    /// Sum of all segment durations.
    pub fn total_duration(&self) -> SimTime {
        self.states.iter().map(|s| s.duration).sum()
    }

    /// Bus-active sub-intervals, relative to the operation start.
    pub fn bus_offsets(&self) -> Vec<(SimTime, SimTime)> {
        segment_offsets(&self.states)
            .filter(|(seg, _, _)| seg.bus)
            .map(|(_, s, e)| (s, e))
            .collect()
    }
}

/// Iterate `(segment, relative_start, relative_end)` over a segment list.
pub fn segment_offsets(
    states: &[StateSegment],
) -> impl Iterator<Item = (&StateSegment, SimTime, SimTime)> {
    let mut offset = 0.0;
    states.iter().map(move |seg| {
        let start = offset;
        offset += seg.duration;
        (seg, start, offset)
    })
}

/// Compiled per-base definition.
#[derive(Clone, Debug)]
pub struct BaseSpec {
    pub id: BaseId,
    pub name: String,
    pub scope: Scope,
    pub affect_state: bool,
    pub instant: bool,
    pub states: Vec<(String, bool)>,
    pub family: Option<Family>,
    pub role: BaseRole,
    pub latch: Option<LatchKind>,
    pub exclusion: ExclusionScope,
}

/// Compiled per-name definition; durations are aligned with the base states.
#[derive(Clone, Debug)]
pub struct NameSpec {
    pub id: NameId,
    pub name: String,
    pub base: BaseId,
    pub multi: Option<bool>,
    pub celltype: Option<String>,
    pub durations: Vec<SimTime>,
}

/// Compiled follow-up table for one base.
#[derive(Clone, Debug, Default)]
pub struct SequenceSpec {
    pub choices: Vec<(NameId, f64)>,
    pub inherit: FxHashMap<NameId, Vec<Inherit>>,
}

/// Normalized phase-conditional candidate distributions.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PhaseWeights {
    table: BTreeMap<String, Vec<(NameId, f64)>>,
}

impl PhaseWeights {
    pub const DEFAULT_KEY: &'static str = "DEFAULT";

    /// Distribution for `key`, falling back to `DEFAULT`.
    pub fn lookup(&self, key: &str) -> Option<&[(NameId, f64)]> {
        self.table
            .get(key)
            .or_else(|| self.table.get(Self::DEFAULT_KEY))
            .map(|v| v.as_slice())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.table.keys().map(|k| k.as_str())
    }

    /// Keep only names accepted by `keep`, renormalizing what remains.
    /// Keys left without candidates are dropped.
    pub fn filtered(&self, mut keep: impl FnMut(NameId) -> bool) -> PhaseWeights {
        let mut table = BTreeMap::new();
        for (key, dist) in &self.table {
            let kept: Vec<(NameId, f64)> = dist.iter().copied().filter(|(n, _)| keep(*n)).collect();
            let total: f64 = kept.iter().map(|(_, w)| w).sum();
            if total > 0.0 {
                table.insert(
                    key.clone(),
                    kept.into_iter().map(|(n, w)| (n, w / total)).collect(),
                );
            }
        }
        PhaseWeights { table }
    }
}

/// Immutable lookup tables for the simulation core.
#[derive(Debug)]
pub struct OpCatalog {
    pub topology: Topology,
    pub policies: Policies,
    pub features: Features,
    bases: Vec<BaseSpec>,
    names: Vec<NameSpec>,
    base_ids: SymbolTable<BaseId>,
    name_ids: SymbolTable<NameId>,
    suspend_forbid: FxHashMap<String, FxHashSet<BaseId>>,
    odt_forbid: FxHashMap<String, FxHashSet<BaseId>>,
    cache_forbid: FxHashMap<String, FxHashSet<BaseId>>,
    latch_forbid: FxHashMap<LatchKind, FxHashSet<BaseId>>,
    plane_parallel: FxHashSet<BaseId>,
    program_sync: FxHashSet<BaseId>,
    sequences: FxHashMap<BaseId, SequenceSpec>,
    weights: PhaseWeights,
}

impl OpCatalog {
    /// Validate `config` and compile the catalog.
    pub fn build(config: &SimConfig) -> Result<Self, ConfigError> {
        let topology = config.topology.clone();
        if topology.dies == 0 || topology.planes == 0 {
            return Err(ConfigError::InvalidTopology(format!(
                "dies={} planes={} (both must be positive)",
                topology.dies, topology.planes
            )));
        }
        validate_policies(&config.policies)?;

        let mut base_ids = SymbolTable::with_capacity(config.op_bases.len());
        let mut bases = Vec::with_capacity(config.op_bases.len());
        for (name, cfg) in &config.op_bases {
            if cfg.states.is_empty() {
                return Err(ConfigError::EmptyStates(name.clone()));
            }
            let id: BaseId = base_ids.intern(name);
            bases.push(BaseSpec {
                id,
                name: name.clone(),
                scope: cfg.scope,
                affect_state: cfg.affect_state,
                instant: cfg.instant_resv,
                states: cfg.states.iter().map(|s| (s.name.clone(), s.bus)).collect(),
                family: cfg.family.or_else(|| Family::infer(name)),
                role: cfg.role,
                latch: cfg.latch,
                exclusion: cfg.exclusion,
            });
        }

        let mut name_ids = SymbolTable::with_capacity(config.op_names.len());
        let mut names = Vec::with_capacity(config.op_names.len());
        for (name, cfg) in &config.op_names {
            let base = base_ids
                .lookup(&cfg.base)
                .ok_or_else(|| ConfigError::UnknownBase {
                    base: cfg.base.clone(),
                    context: format!("op_names.{}", name),
                })?;
            let spec = &bases[base.0 as usize];
            let mut durations = Vec::with_capacity(spec.states.len());
            for (state, _) in &spec.states {
                let value = *cfg.durations.get(state).ok_or_else(|| {
                    ConfigError::MissingDuration {
                        name: name.clone(),
                        state: state.clone(),
                    }
                })?;
                if !value.is_finite() || value < 0.0 {
                    return Err(ConfigError::InvalidDuration {
                        name: name.clone(),
                        state: state.clone(),
                        value,
                    });
                }
                durations.push(value);
            }
            let id: NameId = name_ids.intern(name);
            names.push(NameSpec {
                id,
                name: name.clone(),
                base,
                multi: cfg.multi,
                celltype: cfg.celltype.clone(),
                durations,
            });
        }

        let resolve_base = |base: &str, context: &str| -> Result<BaseId, ConfigError> {
            base_ids
                .lookup(base)
                .ok_or_else(|| ConfigError::UnknownBase {
                    base: base.to_string(),
                    context: context.to_string(),
                })
        };
        let resolve_name = |name: &str, context: &str| -> Result<NameId, ConfigError> {
            name_ids
                .lookup(name)
                .ok_or_else(|| ConfigError::UnknownOpName {
                    name: name.to_string(),
                    context: context.to_string(),
                })
        };

        let mut groups: FxHashMap<&str, FxHashSet<BaseId>> = FxHashMap::default();
        for (group, members) in &config.exclusion_groups {
            let context = format!("exclusion_groups.{}", group);
            let set = members
                .iter()
                .map(|b| resolve_base(b, &context))
                .collect::<Result<FxHashSet<_>, _>>()?;
            groups.insert(group.as_str(), set);
        }
        let compile_states = |table: &BTreeMap<String, Vec<String>>,
                              section: &str|
         -> Result<FxHashMap<String, FxHashSet<BaseId>>, ConfigError> {
            let mut out = FxHashMap::default();
            for (state, group_names) in table {
                let mut set = FxHashSet::default();
                for group in group_names {
                    let members =
                        groups
                            .get(group.as_str())
                            .ok_or_else(|| ConfigError::UnknownGroup {
                                group: group.clone(),
                                context: format!("{}.{}", section, state),
                            })?;
                    set.extend(members.iter().copied());
                }
                out.insert(state.clone(), set);
            }
            Ok(out)
        };
        let suspend_forbid = compile_states(
            &config.exclusions_by_suspend_state,
            "exclusions_by_suspend_state",
        )?;
        let odt_forbid = compile_states(&config.exclusions_by_odt_state, "exclusions_by_odt_state")?;
        let cache_forbid =
            compile_states(&config.exclusions_by_cache_state, "exclusions_by_cache_state")?;
        let latch_by_name =
            compile_states(&config.exclusions_by_latch_state, "exclusions_by_latch_state")?;
        let mut latch_forbid = FxHashMap::default();
        for kind in LatchKind::ALL {
            if let Some(set) = latch_by_name.get(kind.state_name()) {
                latch_forbid.insert(kind, set.clone());
            }
        }

        let plane_parallel = config
            .plane_parallel_read
            .iter()
            .map(|b| resolve_base(b, "plane_parallel_read"))
            .collect::<Result<FxHashSet<_>, _>>()?;
        let program_sync = config
            .policies
            .program_sync_bases
            .iter()
            .map(|b| resolve_base(b, "policies.program_sync_bases"))
            .collect::<Result<FxHashSet<_>, _>>()?;

        let mut sequences = FxHashMap::default();
        for (base_name, seq) in &config.sequences {
            let context = format!("sequences.{}", base_name);
            let base = resolve_base(base_name, &context)?;
            let mut spec = SequenceSpec::default();
            for (next, prob) in &seq.probs {
                if !prob.is_finite() || *prob < 0.0 {
                    return Err(ConfigError::InvalidWeight {
                        key: context.clone(),
                        name: next.clone(),
                        weight: *prob,
                    });
                }
                spec.choices.push((resolve_name(next, &context)?, *prob));
            }
            for (next, rules) in &seq.inherit {
                spec.inherit
                    .insert(resolve_name(next, &context)?, rules.clone());
            }
            sequences.insert(base, spec);
        }

        let mut table = BTreeMap::new();
        for (key, dist) in &config.phase_conditional {
            let context = format!("phase_conditional.{}", key);
            let mut entries = Vec::with_capacity(dist.len());
            for (name, weight) in dist {
                if !weight.is_finite() || *weight < 0.0 {
                    return Err(ConfigError::InvalidWeight {
                        key: key.clone(),
                        name: name.clone(),
                        weight: *weight,
                    });
                }
                entries.push((resolve_name(name, &context)?, *weight));
            }
            let total: f64 = entries.iter().map(|(_, w)| w).sum();
            if total <= 0.0 {
                return Err(ConfigError::NonNormalizableWeights(key.clone()));
            }
            table.insert(
                key.clone(),
                entries.into_iter().map(|(n, w)| (n, w / total)).collect(),
            );
        }

        Ok(Self {
            topology,
            policies: config.policies.clone(),
            features: config.features.clone(),
            bases,
            names,
            base_ids,
            name_ids,
            suspend_forbid,
            odt_forbid,
            cache_forbid,
            latch_forbid,
            plane_parallel,
            program_sync,
            sequences,
            weights: PhaseWeights { table },
        })
    }

    #[inline]
    pub fn base(&self, id: BaseId) -> &BaseSpec {
        &self.bases[id.0 as usize]
    }

    #[inline]
    pub fn name(&self, id: NameId) -> &NameSpec {
        &self.names[id.0 as usize]
    }

    /// Base spec of an operation name.
    #[inline]
    pub fn base_of(&self, id: NameId) -> &BaseSpec {
        self.base(self.name(id).base)
    }

    pub fn base_id(&self, name: &str) -> Option<BaseId> {
        self.base_ids.lookup(name)
    }

    pub fn name_id(&self, name: &str) -> Option<NameId> {
        self.name_ids.lookup(name)
    }

    pub fn bases(&self) -> &[BaseSpec] {
        &self.bases
    }

    pub fn weights(&self) -> &PhaseWeights {
        &self.weights
    }

    /// Build a fresh operation descriptor for `name`.
    pub fn build_op(&self, name: NameId) -> Operation {
        let spec = self.name(name);
        let base = self.base(spec.base);
        let states = base
            .states
            .iter()
            .zip(&spec.durations)
            .map(|((state, bus), duration)| StateSegment {
                name: state.clone(),
                duration: *duration,
                bus: *bus,
            })
            .collect();
        Operation {
            name,
            base: spec.base,
            celltype: spec.celltype.clone(),
            states,
        }
    }

    /// Multiplicity from explicit name configuration, else structural.
    pub fn multiplicity(&self, name: NameId, scope: Scope, plane_count: usize) -> Multiplicity {
        match self.name(name).multi {
            Some(true) => Multiplicity::Multi,
            Some(false) => Multiplicity::Single,
            None if scope == Scope::DieWide || plane_count > 1 => Multiplicity::Multi,
            None => Multiplicity::Single,
        }
    }

    pub fn is_plane_parallel(&self, base: BaseId) -> bool {
        self.plane_parallel.contains(&base)
    }

    pub fn is_program_sync(&self, base: BaseId) -> bool {
        self.program_sync.contains(&base)
    }

    pub fn sequence(&self, base: BaseId) -> Option<&SequenceSpec> {
        self.sequences.get(&base)
    }

    pub fn forbidden_by_suspend(&self, state: &str, base: BaseId) -> bool {
        self.suspend_forbid
            .get(state)
            .is_some_and(|set| set.contains(&base))
    }

    pub fn forbidden_by_odt(&self, state: &str, base: BaseId) -> bool {
        self.odt_forbid.get(state).is_some_and(|set| set.contains(&base))
    }

    pub fn forbidden_by_cache(&self, state: &str, base: BaseId) -> bool {
        self.cache_forbid
            .get(state)
            .is_some_and(|set| set.contains(&base))
    }

    pub fn forbidden_by_latch(&self, kind: LatchKind, base: BaseId) -> bool {
        self.latch_forbid
            .get(&kind)
            .is_some_and(|set| set.contains(&base))
    }
}

fn validate_policies(p: &Policies) -> Result<(), ConfigError> {
    if !(p.admission_window >= 0.0) {
        return Err(ConfigError::InvalidPolicy(format!(
            "admission_window must be non-negative, got {}",
            p.admission_window
        )));
    }
    if !(p.queue_refill_period >= 0.0) {
        return Err(ConfigError::InvalidPolicy(format!(
            "queue_refill_period must be non-negative, got {}",
            p.queue_refill_period
        )));
    }
    if !(0.0..=1.0).contains(&p.epsilon_greedy) {
        return Err(ConfigError::InvalidPolicy(format!(
            "epsilon_greedy must be within [0, 1], got {}",
            p.epsilon_greedy
        )));
    }
    if p.top_n == 0 || p.maxtry_candidate == 0 {
        return Err(ConfigError::InvalidPolicy(
            "top_n and maxtry_candidate must be positive".to_string(),
        ));
    }
    if p.min_planes == 0 || p.min_planes > p.maxplanes {
        return Err(ConfigError::InvalidPolicy(format!(
            "min_planes must be within [1, maxplanes={}], got {}",
            p.maxplanes, p.min_planes
        )));
    }
    if !(p.sequence_gap >= 0.0) || !(p.hook_epsilon >= 0.0) {
        return Err(ConfigError::InvalidPolicy(
            "sequence_gap and hook_epsilon must be non-negative".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_catalog_builds() {
        let catalog = OpCatalog::build(&SimConfig::reference()).unwrap();
        let erase = catalog.name_id("Erase").unwrap();
        let op = catalog.build_op(erase);
        assert_eq!(op.states.len(), 2);
        assert_eq!(op.total_duration(), 1000.5);
        assert_eq!(op.bus_offsets(), vec![(0.0, 0.5)]);
        assert_eq!(catalog.base_of(erase).family, Some(Family::Erase));
        assert_eq!(
            catalog.multiplicity(erase, Scope::DieWide, 1),
            Multiplicity::Multi
        );
    }

    #[test]
    fn test_weights_are_normalized() {
        let mut config = SimConfig::reference();
        config
            .phase_conditional
            .insert("X".to_string(), [("Erase".to_string(), 3.0), ("SR".to_string(), 1.0)].into());
        let catalog = OpCatalog::build(&config).unwrap();
        let dist = catalog.weights().lookup("X").unwrap();
        let total: f64 = dist.iter().map(|(_, w)| w).sum();
        assert!((total - 1.0).abs() < 1e-12);
        // Unknown keys fall back to DEFAULT
        assert!(catalog.weights().lookup("NOPE").is_some());
    }

    #[test]
    fn test_negative_weight_rejected() {
        let mut config = SimConfig::reference();
        config
            .phase_conditional
            .get_mut("DEFAULT")
            .unwrap()
            .insert("SR".to_string(), -1.0);
        assert!(matches!(
            OpCatalog::build(&config),
            Err(ConfigError::InvalidWeight { .. })
        ));
    }

    #[test]
    fn test_zero_sum_weights_rejected() {
        let mut config = SimConfig::reference();
        config
            .phase_conditional
            .insert("EMPTY".to_string(), [("SR".to_string(), 0.0)].into());
        assert!(matches!(
            OpCatalog::build(&config),
            Err(ConfigError::NonNormalizableWeights(k)) if k == "EMPTY"
        ));
    }

    #[test]
    fn test_invalid_topology_rejected() {
        let mut config = SimConfig::reference();
        config.topology.planes = 0;
        assert!(matches!(
            OpCatalog::build(&config),
            Err(ConfigError::InvalidTopology(_))
        ));
    }

    #[test]
    fn test_missing_duration_rejected() {
        let mut config = SimConfig::reference();
        config
            .op_names
            .get_mut("Erase")
            .unwrap()
            .durations
            .remove("CORE_BUSY");
        assert!(matches!(
            OpCatalog::build(&config),
            Err(ConfigError::MissingDuration { .. })
        ));
    }

    #[test]
    fn test_unknown_group_rejected() {
        let mut config = SimConfig::reference();
        config
            .exclusions_by_odt_state
            .insert("ODT_DISABLE".to_string(), vec!["no_such_group".to_string()]);
        assert!(matches!(
            OpCatalog::build(&config),
            Err(ConfigError::UnknownGroup { .. })
        ));
    }

    #[test]
    fn test_forbid_tables() {
        let catalog = OpCatalog::build(&SimConfig::reference()).unwrap();
        let erase = catalog.base_id("ERASE").unwrap();
        let resume = catalog.base_id("ERASE_RESUME").unwrap();
        let read = catalog.base_id("READ").unwrap();
        assert!(catalog.forbidden_by_suspend("ERASE_SUSPENDED", erase));
        assert!(catalog.forbidden_by_suspend("NOT_ERASE_SUSPENDED", resume));
        assert!(!catalog.forbidden_by_suspend("ERASE_SUSPENDED", read));
        assert!(catalog.forbidden_by_latch(LatchKind::Read, read));
        assert!(catalog.is_plane_parallel(read));
    }

    #[test]
    fn test_filtered_weights_renormalize() {
        let catalog = OpCatalog::build(&SimConfig::reference()).unwrap();
        let erase = catalog.name_id("Erase").unwrap();
        let only_erase = catalog.weights().filtered(|n| n == erase);
        assert_eq!(only_erase.lookup("DEFAULT"), Some(&[(erase, 1.0)][..]));
        // Keys without erase disappear entirely
        assert!(only_erase.keys().all(|k| k == "DEFAULT"));
    }
}
