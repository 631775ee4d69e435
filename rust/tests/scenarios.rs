//! End-to-end scenarios and run-wide properties.

use std::collections::BTreeMap;
use std::sync::Arc;

use nandseq_rust::{
    Address, Axis, BlockStateSampler, CommitReport, OpCatalog, Operation, ResourceManager,
    Scheduler, Scope, SimConfig,
};

fn manager(config: &SimConfig) -> ResourceManager {
    ResourceManager::new(Arc::new(OpCatalog::build(config).unwrap()))
}

fn op(rm: &ResourceManager, name: &str) -> Operation {
    let catalog = rm.catalog();
    catalog.build_op(catalog.name_id(name).unwrap())
}

fn commit(
    rm: &mut ResourceManager,
    name: &str,
    targets: &[Address],
    scope: Scope,
    now: f64,
) -> CommitReport {
    let op = op(rm, name);
    let mut txn = rm.begin(now);
    rm.reserve(&mut txn, &op, targets, scope, None).unwrap();
    let report = rm.commit(txn);
    for scheduled in &report.committed {
        rm.register_ongoing(scheduled.clone());
    }
    report
}

fn scheduler(config: &SimConfig, seed: u64) -> Scheduler<BlockStateSampler> {
    let sampler = BlockStateSampler::new(&config.sampler, &config.topology).unwrap();
    Scheduler::new(config, sampler, seed).unwrap()
}

fn erase_only() -> SimConfig {
    let mut config = SimConfig::reference();
    config.phase_conditional = BTreeMap::from([(
        "DEFAULT".to_string(),
        BTreeMap::from([("Erase".to_string(), 1.0)]),
    )]);
    config
}

/// Reference operations on two dies.
fn busy_config() -> SimConfig {
    let mut config = SimConfig::reference();
    config.topology.dies = 2;
    config
}

#[test]
fn scenario_a_single_die_wide_erase() {
    let mut s = scheduler(&erase_only(), 7);
    s.run(0.0, None);

    assert_eq!(s.committed().len(), 1);
    let erase = &s.committed()[0];
    assert_eq!(erase.base, "ERASE");
    assert_eq!(erase.start, 0.0);
    assert_eq!(erase.end, 0.5 + 1000.0);
    for plane in 0..2 {
        let windows: Vec<_> = s.resource().plane_windows(0, plane).collect();
        assert_eq!(windows.len(), 1);
        assert_eq!((windows[0].start, windows[0].end), (0.0, 1000.5));
    }
}

#[test]
fn scenario_b_nothing_starts_on_the_die_before_erase_end() {
    let mut s = scheduler(&erase_only(), 7);
    s.run(0.0, None);
    let end = s.committed()[0].end;
    let rm = s.resource();

    let targets = [Address::new(0, 1, 3, Some(0))];
    for (name, scope) in [
        ("Read_SLC", Scope::PlaneSet),
        ("Program_SLC", Scope::PlaneSet),
        ("Erase", Scope::DieWide),
    ] {
        let candidate = op(rm, name);
        for hint in [0.0, 10.0, end - 1.0] {
            let start = rm.feasible_at(&candidate, &targets, hint, scope, None);
            assert!(
                start.map_or(true, |t| t >= end),
                "{} at hint {} got {:?}",
                name,
                hint,
                start
            );
        }
    }
}

#[test]
fn scenario_c_plane_parallel_reads_overlap() {
    let config = SimConfig::reference();
    let rm = manager(&config);
    let read = op(&rm, "Read_SLC");
    let mut txn = rm.begin(0.0);
    let first = rm
        .reserve(&mut txn, &read, &[Address::new(0, 0, 2, Some(0))], Scope::PlaneSet, None)
        .unwrap();
    // Next free bus slot is after the first read's ISSUE
    txn.advance_to(0.5);
    let second = rm
        .reserve(&mut txn, &read, &[Address::new(0, 1, 3, Some(0))], Scope::PlaneSet, None)
        .unwrap();
    assert!(second.start < first.end);
    assert!(first.start < second.end);

    let mut rm = rm;
    let report = rm.commit(txn);
    assert_eq!(report.committed.len(), 2);
}

#[test]
fn scenario_d_program_suspend_resume_conserves_time() {
    let config = SimConfig::reference();
    let mut rm = manager(&config);
    let target = [Address::new(0, 0, 4, Some(0))];
    commit(&mut rm, "Program_SLC", &target, Scope::PlaneSet, 0.0);
    let total = op(&rm, "Program_SLC").total_duration();
    let suspend_at = total * 0.25;

    commit(&mut rm, "Program_Suspend", &target, Scope::DieWide, suspend_at);
    let parked = rm.suspended_ops(0, Axis::Program)[0].clone();
    assert_eq!(parked.consumed_duration, suspend_at);
    assert_eq!(parked.consumed_duration + parked.remaining_duration, total);
    let remaining_states: f64 = parked.remaining_states.iter().map(|s| s.duration).sum();
    assert!((remaining_states - parked.remaining_duration).abs() < 1e-9);
    assert_eq!(rm.program_suspend_state(0, suspend_at + 1.0), "PROGRAM_SUSPENDED");

    let report = commit(&mut rm, "Program_Resume", &target, Scope::DieWide, 400.0);
    let resume_end = report.committed[0].end;
    assert!(report.resume_failures.is_empty());
    let resumed = report.resumed[0].clone();
    assert_eq!(resumed.uid, parked.uid);
    assert_eq!(resumed.start, resume_end);
    assert_eq!(resumed.end - resumed.start, parked.remaining_duration);
    assert!(rm.suspended_ops(0, Axis::Program).is_empty());
    // Suspended until the resume command completes
    assert_eq!(rm.program_suspend_state(0, resume_end - 0.25), "PROGRAM_SUSPENDED");
    assert_eq!(rm.program_suspend_state(0, resume_end + 1.0), "NOT_PROGRAM_SUSPENDED");

    let charged: f64 = rm
        .plane_windows(0, 0)
        .filter(|w| w.uid == parked.uid)
        .map(|w| w.end - w.start)
        .sum();
    assert!((charged - total).abs() < 1e-9);
    assert_eq!(
        charged,
        parked.consumed_duration + (resumed.end - resumed.start)
    );
}

#[test]
fn failed_resume_leaves_suspended_entry_untouched() {
    let mut config = SimConfig::reference();
    config.features.suspend_rules = false;
    let mut rm = manager(&config);
    let target = [Address::new(0, 0, 4, Some(0))];
    commit(&mut rm, "Program_SLC", &target, Scope::PlaneSet, 0.0);
    commit(&mut rm, "Program_Suspend", &target, Scope::DieWide, 50.0);
    let before = rm.suspended_ops(0, Axis::Program).to_vec();

    // A read on the suspended plane occupies the window the remainder needs
    commit(
        &mut rm,
        "Read_SLC",
        &[Address::new(0, 0, 2, Some(0))],
        Scope::PlaneSet,
        100.0,
    );
    let windows_before: Vec<_> = rm.plane_windows(0, 0).copied().collect();
    let err = rm
        .resume_from_suspended_axis(0, Axis::Program, 110.0)
        .unwrap_err();
    assert_eq!(err.axis, Axis::Program);
    assert_eq!(rm.suspended_ops(0, Axis::Program), before.as_slice());
    assert_eq!(rm.plane_windows(0, 0).copied().collect::<Vec<_>>(), windows_before);
    assert_eq!(rm.last_error(), Some(&err));
}

#[test]
fn committed_ops_never_double_book_a_plane() {
    let config = busy_config();
    let mut s = scheduler(&config, 11);
    s.run(20_000.0, None);
    assert!(s.committed().len() > 10);

    let rm = s.resource();
    for die in 0..config.topology.dies {
        for plane in 0..config.topology.planes {
            let windows: Vec<_> = rm.plane_windows(die, plane).collect();
            for pair in windows.windows(2) {
                assert!(
                    pair[0].end <= pair[1].start,
                    "d{}p{}: {:?} overlaps {:?}",
                    die,
                    plane,
                    pair[0],
                    pair[1]
                );
            }
        }
    }
}

#[test]
fn first_op_of_every_batch_starts_inside_admission_window() {
    let config = busy_config();
    let mut s = scheduler(&config, 3);
    s.run(20_000.0, None);
    let catalog = s.catalog();
    let window = catalog.policies.admission_window;
    for op in s.committed().iter().filter(|op| op.position == 0) {
        let base = catalog.base(catalog.base_id(&op.base).unwrap());
        if base.instant {
            continue;
        }
        assert!(
            op.start < op.proposed_at + window,
            "{} proposed at {} starts {}",
            op.name,
            op.proposed_at,
            op.start
        );
    }
}

#[test]
fn chained_ops_start_after_their_predecessor() {
    let config = busy_config();
    let mut s = scheduler(&config, 5);
    s.run(20_000.0, None);
    let ops = s.committed();
    for pair in ops.windows(2) {
        if pair[1].position == 1 {
            assert!(pair[1].start >= pair[0].end);
            assert_eq!(pair[1].targets, pair[0].targets);
        }
    }
}

#[test]
fn identical_seed_and_config_reproduce_the_run() {
    let config = busy_config();
    let mut a = scheduler(&config, 99);
    let mut b = scheduler(&config, 99);
    a.run(15_000.0, None);
    b.run(15_000.0, None);
    assert_eq!(a.committed(), b.committed());
    assert_eq!(a.snapshot(), b.snapshot());
    assert_eq!(a.metrics(), b.metrics());
}

#[test]
fn bootstrap_restricts_early_proposals() {
    let mut config = SimConfig::reference();
    config.bootstrap = Some(nandseq_rust::BootstrapConfig {
        stages: vec![nandseq_rust::StageConfig {
            bases: vec!["ERASE".to_string()],
            quota: 3,
        }],
    });
    let mut s = scheduler(&config, 1);
    s.run(2_500.0, None);
    let first: Vec<_> = s.committed().iter().take(3).map(|op| op.base.as_str()).collect();
    assert_eq!(first, vec!["ERASE"; 3]);
    let progress = s.bootstrap_progress().unwrap();
    assert!(!progress.active);
}

#[test]
fn invalid_configuration_fails_fast() {
    let mut config = SimConfig::reference();
    config
        .phase_conditional
        .get_mut("DEFAULT")
        .unwrap()
        .insert("Erase".to_string(), -1.0);
    let sampler = BlockStateSampler::new(&config.sampler, &config.topology).unwrap();
    assert!(Scheduler::new(&config, sampler, 0).is_err());
}
