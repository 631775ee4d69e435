//! Phase-conditional operation proposer.
//!
//! `propose` is a pure function of the committed resource view, the address
//! sampler and the RNG: it never reserves anything. For the (die, plane) of a
//! hook it looks up the phase-conditional distribution, draws up to `top_n`
//! candidate names without replacement, and for each candidate samples
//! targets, checks feasibility and the admission window, and optionally
//! chains one dependent operation from the sequence table. The feasible
//! candidate with the earliest start becomes the proposed batch.

use rand::Rng;
use std::cmp::Ordering;

use crate::catalog::{BaseId, NameId, OpCatalog, Operation, PhaseWeights};
use crate::events::PhaseHook;
use crate::resource::{ChainStep, EprPolicy, RejectReason, ResourceManager};
use crate::sampler::{AddressSampler, SampleRequest, SimRng};
use crate::types::{Address, Inherit, Scope, SimTime};
use crate::{log_checks, log_debug};

/// One operation of a proposed batch.
#[derive(Clone, Debug, PartialEq)]
pub struct ProposedOp {
    pub name: NameId,
    pub base: BaseId,
    pub op: Operation,
    pub targets: Vec<Address>,
    pub scope: Scope,
    /// Start predicted against the committed state.
    pub start: SimTime,
}

/// Operations to reserve in order within one transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct ProposedBatch {
    pub ops: Vec<ProposedOp>,
    pub phase_key: String,
}

impl ProposedBatch {
    pub fn first_start(&self) -> Option<SimTime> {
        self.ops.first().map(|op| op.start)
    }
}

/// How evaluating one candidate went.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AttemptOutcome {
    Ok,
    StateBlock(RejectReason),
    SampleNone,
    FeasibleNone(RejectReason),
    WindowExceed,
    PreflightFail(RejectReason),
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Ok => "ok",
            AttemptOutcome::StateBlock(_) => "state_block",
            AttemptOutcome::SampleNone => "sample_none",
            AttemptOutcome::FeasibleNone(_) => "feasible_none",
            AttemptOutcome::WindowExceed => "window_exceed",
            AttemptOutcome::PreflightFail(_) => "preflight_fail",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Attempt {
    pub name: String,
    pub outcome: AttemptOutcome,
    pub start: Option<SimTime>,
}

/// Everything the proposer considered for one hook.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProposeDiagnostics {
    pub now: SimTime,
    pub die: u32,
    pub plane: u32,
    pub phase_key: String,
    pub explored: bool,
    pub candidates: Vec<String>,
    pub attempts: Vec<Attempt>,
    pub chosen: Option<String>,
}

impl ProposeDiagnostics {
    /// Why no batch came out, for skip accounting.
    pub fn failure(&self) -> &'static str {
        if self.candidates.is_empty() {
            "no_candidates"
        } else {
            "no_feasible"
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProposeOutcome {
    pub batch: Option<ProposedBatch>,
    pub diagnostics: ProposeDiagnostics,
}

/// Efraimidis–Spirakis weighted sampling without replacement.
///
/// With probability `epsilon` every positive-weight candidate is drawn
/// uniformly instead. Keys that tie keep distribution order, which is name
/// order. If no key is positive the heaviest `top_n` names are taken.
pub fn sample_candidates(
    dist: &[(NameId, f64)],
    top_n: usize,
    epsilon: f64,
    rng: &mut SimRng,
) -> (Vec<(NameId, f64)>, bool) {
    let explore = epsilon > 0.0 && rng.gen::<f64>() < epsilon;
    let mut keyed: Vec<(f64, NameId, f64)> = Vec::with_capacity(dist.len());
    for &(name, weight) in dist {
        if !(weight > 0.0) {
            continue;
        }
        let u: f64 = rng.gen();
        let key = if explore { u } else { u.powf(1.0 / weight) };
        keyed.push((key, name, weight));
    }
    keyed.sort_by(|a, b| b.0.total_cmp(&a.0));
    let mut picked: Vec<(NameId, f64)> = keyed
        .into_iter()
        .filter(|(key, _, _)| *key > 0.0)
        .take(top_n)
        .map(|(_, name, weight)| (name, weight))
        .collect();

    if picked.is_empty() {
        let mut fallback: Vec<(NameId, f64)> = dist.to_vec();
        fallback.sort_by(|a, b| b.1.total_cmp(&a.1));
        fallback.truncate(top_n);
        picked = fallback;
    }
    (picked, explore)
}

/// `count` planes starting at `first`, wrapping around the die.
fn plane_set(first: u32, count: u32, planes: u32) -> Vec<u32> {
    (0..count.min(planes)).map(|i| (first + i) % planes).collect()
}

/// Targets for an operation, shrinking the plane set on sampling failure.
fn sample_targets<S: AddressSampler>(
    catalog: &OpCatalog,
    name: NameId,
    hook: &PhaseHook,
    sampler: &S,
    rng: &mut SimRng,
) -> Option<Vec<Address>> {
    let spec = catalog.name(name);
    let base = catalog.base(spec.base);
    let planes = catalog.topology.planes;
    let policies = &catalog.policies;
    let Some(family) = base.family else {
        return Some(vec![Address::block(hook.die, hook.plane, 0)]);
    };
    let (want, floor) = if spec.multi == Some(true) {
        let want = policies.maxplanes.min(planes).max(1);
        (want, policies.min_planes.clamp(1, want))
    } else {
        (1, 1)
    };
    for count in (floor..=want).rev() {
        let req = SampleRequest {
            die: hook.die,
            planes: plane_set(hook.plane, count, planes),
            celltype: spec.celltype.clone(),
        };
        if let Some(targets) = sampler.sample(family, &req, rng) {
            return Some(targets);
        }
    }
    None
}

/// Targets of a dependent operation derived from its predecessor.
fn inherit_targets(prev: &[Address], rules: &[Inherit]) -> Vec<Address> {
    let same_block = rules.contains(&Inherit::SameBlock);
    prev.iter()
        .map(|a| {
            let page = if rules.contains(&Inherit::SamePage) {
                a.page
            } else if rules.contains(&Inherit::IncPage) {
                a.page.map(|p| p + 1)
            } else {
                None
            };
            let block = if same_block { a.block } else { 0 };
            Address::new(a.die, a.plane, block, page)
        })
        .collect()
}

/// Draw the dependent of `base`, if its sequence table picks one.
fn pick_dependent(
    catalog: &OpCatalog,
    base: BaseId,
    rng: &mut SimRng,
) -> Option<(NameId, Vec<Inherit>)> {
    let seq = catalog.sequence(base)?;
    if seq.choices.is_empty() {
        return None;
    }
    let r: f64 = rng.gen();
    let mut acc = 0.0;
    for &(name, p) in &seq.choices {
        acc += p;
        if r < acc {
            let rules = seq.inherit.get(&name).cloned().unwrap_or_default();
            return Some((name, rules));
        }
    }
    None
}

struct Candidate {
    batch: ProposedBatch,
    start: SimTime,
    weight: f64,
}

/// Evaluate one candidate name; `Err` carries the outcome to record.
fn evaluate_candidate<S: AddressSampler>(
    now: SimTime,
    hook: &PhaseHook,
    name: NameId,
    phase_key: &str,
    rm: &ResourceManager,
    sampler: &S,
    rng: &mut SimRng,
) -> Result<ProposedBatch, AttemptOutcome> {
    let catalog = rm.catalog();
    let policies = &catalog.policies;
    let base = catalog.base_of(name);
    let epr: Option<&dyn EprPolicy> = Some(sampler);

    let probe = [Address::block(hook.die, hook.plane, 0)];
    if let Some(reason) = rm.state_block(base.id, &probe, now) {
        return Err(AttemptOutcome::StateBlock(reason));
    }

    let targets = sample_targets(catalog, name, hook, sampler, rng).ok_or(AttemptOutcome::SampleNone)?;
    let op = catalog.build_op(name);
    let (start, end) = rm
        .evaluate(None, &op, &targets, base.scope, now, epr)
        .map_err(AttemptOutcome::FeasibleNone)?;
    if !base.instant && start >= now + policies.admission_window {
        return Err(AttemptOutcome::WindowExceed);
    }

    let mut ops = vec![ProposedOp {
        name,
        base: base.id,
        op,
        targets,
        scope: base.scope,
        start,
    }];

    if let Some((dep_name, rules)) = pick_dependent(catalog, base.id, rng) {
        let dep_base = catalog.base_of(dep_name);
        let mut dep_op = catalog.build_op(dep_name);
        if rules.contains(&Inherit::SameCelltype) {
            dep_op.celltype = ops[0].op.celltype.clone();
        }
        let dep_targets = if rules.contains(&Inherit::SameBlock) || dep_base.family.is_none() {
            inherit_targets(&ops[0].targets, &rules)
        } else {
            let dep_hook = PhaseHook {
                die: hook.die,
                plane: hook.plane,
                label: None,
            };
            sample_targets(catalog, dep_name, &dep_hook, sampler, rng)
                .ok_or(AttemptOutcome::SampleNone)?
        };
        let steps = [
            ChainStep {
                op: &ops[0].op,
                targets: &ops[0].targets,
                scope: ops[0].scope,
            },
            ChainStep {
                op: &dep_op,
                targets: &dep_targets,
                scope: dep_base.scope,
            },
        ];
        let chain = rm
            .feasible_chain(now, &steps, policies.sequence_gap, epr)
            .map_err(AttemptOutcome::PreflightFail)?;
        let dep_start = chain.get(1).map_or(end, |r| r.start);
        ops.push(ProposedOp {
            name: dep_name,
            base: dep_base.id,
            op: dep_op,
            targets: dep_targets,
            scope: dep_base.scope,
            start: dep_start,
        });
    }

    Ok(ProposedBatch {
        ops,
        phase_key: phase_key.to_string(),
    })
}

/// Propose a batch for the (die, plane) of `hook` at `now`.
pub fn propose<S: AddressSampler>(
    now: SimTime,
    hook: &PhaseHook,
    weights: &PhaseWeights,
    rm: &ResourceManager,
    sampler: &S,
    rng: &mut SimRng,
) -> ProposeOutcome {
    let catalog = rm.catalog();
    let policies = &catalog.policies;
    let verbosity = policies.verbosity;

    let phase_key = rm
        .phase_key_at(hook.die, hook.plane, now)
        .or_else(|| hook.label.clone())
        .unwrap_or_else(|| PhaseWeights::DEFAULT_KEY.to_string());
    let mut diagnostics = ProposeDiagnostics {
        now,
        die: hook.die,
        plane: hook.plane,
        phase_key: phase_key.clone(),
        ..ProposeDiagnostics::default()
    };

    let Some(dist) = weights.lookup(&phase_key) else {
        log_checks!(verbosity, "no distribution for phase {}", phase_key);
        return ProposeOutcome {
            batch: None,
            diagnostics,
        };
    };
    let (candidates, explored) =
        sample_candidates(dist, policies.top_n, policies.epsilon_greedy, rng);
    diagnostics.explored = explored;
    diagnostics.candidates = candidates
        .iter()
        .map(|(n, _)| catalog.name(*n).name.clone())
        .collect();

    let mut best: Option<Candidate> = None;
    let mut tied_weight = 0.0;
    for &(name, weight) in candidates.iter().take(policies.maxtry_candidate) {
        let label = &catalog.name(name).name;
        match evaluate_candidate(now, hook, name, &phase_key, rm, sampler, rng) {
            Ok(batch) => {
                let start = batch.first_start().unwrap_or(now);
                log_debug!(verbosity, "candidate {} feasible at {:.3}", label, start);
                diagnostics.attempts.push(Attempt {
                    name: label.clone(),
                    outcome: AttemptOutcome::Ok,
                    start: Some(start),
                });
                let replace = match &best {
                    None => true,
                    Some(current) => match start.total_cmp(&current.start) {
                        Ordering::Less => true,
                        Ordering::Greater => false,
                        Ordering::Equal => {
                            let total = tied_weight + weight;
                            total > 0.0 && rng.gen::<f64>() < weight / total
                        }
                    },
                };
                let ties = best.as_ref().is_some_and(|c| c.start == start);
                if replace {
                    tied_weight = if ties { tied_weight + weight } else { weight };
                    best = Some(Candidate {
                        batch,
                        start,
                        weight,
                    });
                } else if ties {
                    tied_weight += weight;
                }
            }
            Err(outcome) => {
                log_checks!(verbosity, "candidate {} rejected: {}", label, outcome.as_str());
                diagnostics.attempts.push(Attempt {
                    name: label.clone(),
                    outcome,
                    start: None,
                });
            }
        }
    }

    let batch = best.map(|c| {
        log_checks!(
            verbosity,
            "proposed {} at {:.3} (weight {:.3})",
            catalog.name(c.batch.ops[0].name).name,
            c.start,
            c.weight
        );
        diagnostics.chosen = Some(catalog.name(c.batch.ops[0].name).name.clone());
        c.batch
    });
    ProposeOutcome { batch, diagnostics }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::resource::Reservation;
    use crate::sampler::BlockStateSampler;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn setup(config: SimConfig) -> (ResourceManager, BlockStateSampler) {
        let catalog = crate::catalog::OpCatalog::build(&config).unwrap();
        let sampler = BlockStateSampler::new(&config.sampler, &config.topology).unwrap();
        (ResourceManager::new(Arc::new(catalog)), sampler)
    }

    fn hook(plane: u32) -> PhaseHook {
        PhaseHook {
            die: 0,
            plane,
            label: None,
        }
    }

    fn only(config: &mut SimConfig, key: &str, names: &[(&str, f64)]) {
        config.phase_conditional.clear();
        config.phase_conditional.insert(
            key.to_string(),
            names.iter().map(|(n, w)| (n.to_string(), *w)).collect(),
        );
    }

    #[test]
    fn test_sample_candidates_respects_top_n_and_zero_weights() {
        let dist = [(NameId(0), 0.5), (NameId(1), 0.0), (NameId(2), 0.5)];
        let mut rng = SimRng::seed_from_u64(7);
        let (picked, explored) = sample_candidates(&dist, 5, 0.0, &mut rng);
        assert!(!explored);
        assert_eq!(picked.len(), 2);
        assert!(picked.iter().all(|(n, _)| *n != NameId(1)));

        let (picked, _) = sample_candidates(&dist, 1, 0.0, &mut rng);
        assert_eq!(picked.len(), 1);
    }

    #[test]
    fn test_sample_candidates_falls_back_to_heaviest() {
        let dist = [(NameId(0), 0.0), (NameId(1), 0.0)];
        let mut rng = SimRng::seed_from_u64(1);
        let (picked, _) = sample_candidates(&dist, 1, 0.0, &mut rng);
        assert_eq!(picked, vec![(NameId(0), 0.0)]);
    }

    #[test]
    fn test_propose_erase_on_idle_die() {
        let mut config = SimConfig::reference();
        only(&mut config, "DEFAULT", &[("Erase", 1.0)]);
        let (rm, sampler) = setup(config);
        let mut rng = SimRng::seed_from_u64(3);
        let out = propose(0.0, &hook(0), rm.catalog().weights(), &rm, &sampler, &mut rng);
        let batch = out.batch.unwrap();
        assert_eq!(batch.phase_key, "DEFAULT");
        assert_eq!(batch.ops.len(), 1);
        assert_eq!(batch.ops[0].start, 0.0);
        assert_eq!(batch.ops[0].scope, Scope::DieWide);
        assert_eq!(out.diagnostics.chosen.as_deref(), Some("Erase"));
    }

    #[test]
    fn test_read_chains_a_dout_on_the_same_page() {
        let mut config = SimConfig::reference();
        only(&mut config, "DEFAULT", &[("Read_SLC", 1.0)]);
        let (rm, mut sampler) = setup(config);
        sampler.apply_pgm(&[Address::new(0, 1, 3, Some(0))], Some("SLC"));
        let mut rng = SimRng::seed_from_u64(11);
        let out = propose(0.0, &hook(1), rm.catalog().weights(), &rm, &sampler, &mut rng);
        let batch = out.batch.unwrap();
        assert_eq!(batch.ops.len(), 2);
        assert_eq!(batch.ops[0].targets, vec![Address::new(0, 1, 3, Some(0))]);
        assert_eq!(batch.ops[1].targets, batch.ops[0].targets);
        assert_eq!(rm.catalog().name(batch.ops[1].name).name, "Dout");
        // The dependent starts after its predecessor ends
        assert!(batch.ops[1].start >= batch.ops[0].start + batch.ops[0].op.total_duration());
    }

    #[test]
    fn test_read_without_programmed_pages_is_sample_none() {
        let mut config = SimConfig::reference();
        only(&mut config, "DEFAULT", &[("Read_SLC", 1.0)]);
        let (rm, sampler) = setup(config);
        let mut rng = SimRng::seed_from_u64(5);
        let out = propose(0.0, &hook(0), rm.catalog().weights(), &rm, &sampler, &mut rng);
        assert!(out.batch.is_none());
        assert_eq!(out.diagnostics.attempts.len(), 1);
        assert_eq!(out.diagnostics.attempts[0].outcome, AttemptOutcome::SampleNone);
        assert_eq!(out.diagnostics.failure(), "no_feasible");
    }

    #[test]
    fn test_busy_plane_exceeds_admission_window() {
        let mut config = SimConfig::reference();
        only(&mut config, "DEFAULT", &[("Program_SLC", 1.0)]);
        let (mut rm, sampler) = setup(config);
        let erase = rm.catalog().build_op(rm.catalog().name_id("Erase").unwrap());
        let mut txn = rm.begin(0.0);
        let r: Reservation = rm
            .reserve(&mut txn, &erase, &[Address::block(0, 0, 5)], Scope::DieWide, None)
            .unwrap();
        rm.commit(txn);
        assert!(r.end > 1.0);

        let mut rng = SimRng::seed_from_u64(9);
        let out = propose(0.0, &hook(0), rm.catalog().weights(), &rm, &sampler, &mut rng);
        assert!(out.batch.is_none());
        assert_eq!(out.diagnostics.attempts[0].outcome, AttemptOutcome::WindowExceed);
    }

    #[test]
    fn test_resume_is_state_blocked_without_suspend() {
        let mut config = SimConfig::reference();
        only(&mut config, "DEFAULT", &[("Erase_Resume", 1.0)]);
        let (rm, sampler) = setup(config);
        let mut rng = SimRng::seed_from_u64(2);
        let out = propose(0.0, &hook(0), rm.catalog().weights(), &rm, &sampler, &mut rng);
        assert!(out.batch.is_none());
        assert_eq!(
            out.diagnostics.attempts[0].outcome,
            AttemptOutcome::StateBlock(RejectReason::StateForbidSuspend)
        );
    }

    #[test]
    fn test_multi_plane_read_shrinks_to_readable_planes() {
        let mut config = SimConfig::reference();
        only(&mut config, "DEFAULT", &[("Multi_Read_SLC", 1.0)]);
        let (rm, mut sampler) = setup(config);
        // Only plane 0 has programmed data
        sampler.apply_pgm(&[Address::new(0, 0, 2, Some(0))], Some("SLC"));
        let mut rng = SimRng::seed_from_u64(4);
        let out = propose(0.0, &hook(0), rm.catalog().weights(), &rm, &sampler, &mut rng);
        let batch = out.batch.unwrap();
        assert_eq!(batch.ops[0].targets, vec![Address::new(0, 0, 2, Some(0))]);
    }

    #[test]
    fn test_propose_is_deterministic_per_seed() {
        let (rm, sampler) = setup(SimConfig::reference());
        let run = |seed| {
            let mut rng = SimRng::seed_from_u64(seed);
            propose(0.0, &hook(0), rm.catalog().weights(), &rm, &sampler, &mut rng)
        };
        assert_eq!(run(42), run(42));
    }
}
