use pretty_assertions::assert_eq;
use proptest::prelude::*;
use relay_chain::prelude::*;
use relay_chain::{
    degrees_contiguous, NetworkSelection, PerformanceCheck, PerformanceConfig, PerformanceMethod,
    PERFORMANCE_CHECK_REASON, PREMATURE_EXIT_REASON,
};
use relay_jobs::{SupervisorConfig, TimeoutSupervisor, EXCEPTION_PREFIX, RESPONSE_TIMEOUT_REASON};
use relay_store::{EntityRef, Failable, JobDescriptor, Network, NetworkId, NewNode, Participant, StoreError};
use relay_test_utils::{across_config, Harness, HarnessBuilder, FAILING_JOB, OK_JOB};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn expect_trial(outcome: TrialOutcome) -> TrialId {
    match outcome {
        TrialOutcome::Trial(trial) => trial,
        other => panic!("expected a trial, got {other:?}"),
    }
}

#[test]
fn test_chain_grows_to_target_then_stops() {
    let h = Harness::new(across_config(1, 3));
    let network = h.networks()[0];

    let first = h.participant();
    let trial = expect_trial(h.scheduler.prepare_trial(first).unwrap());
    let finalized = h.scheduler.finalize_trial(json!(0.4), trial, first).unwrap();
    assert!(finalized.growth.grew());
    assert_eq!(h.alive_nodes(network).len(), 2);

    let second = h.participant();
    let trial = expect_trial(h.scheduler.prepare_trial(second).unwrap());
    let node = h.store.read(|t| t.trial(trial).unwrap().node_id);
    assert_eq!(node, h.alive_nodes(network)[1].id);
    let finalized = h.scheduler.finalize_trial(json!(0.6), trial, second).unwrap();
    assert!(finalized.growth.grew());

    assert!(h.store.read(|t| t.network(network).unwrap().full));
    assert_eq!(h.scheduler.grow_network(network).unwrap(), Growth::Full);

    let third = h.participant();
    assert_eq!(
        h.scheduler.prepare_trial(third).unwrap(),
        TrialOutcome::Exit { performance: None }
    );
    let degrees: Vec<u32> = h.alive_nodes(network).iter().map(|n| n.degree).collect();
    assert_eq!(degrees, vec![0, 1, 2]);
}

#[test]
fn test_seed_is_passed_down_the_chain() {
    let h = Harness::new(across_config(1, 3));
    let network = h.networks()[0];
    let p = h.participant();
    h.answer(p, json!(0.75)).unwrap();

    let nodes = h.alive_nodes(network);
    assert_eq!(nodes[1].seed, json!(0.75));
    assert_eq!(nodes[1].definition, json!(0.75));
}

#[test]
fn test_growth_is_idempotent() {
    let h = Harness::new(across_config(1, 5));
    let network = h.networks()[0];
    let p = h.participant();
    h.answer(p, json!(0.1)).unwrap();

    let before = h.alive_nodes(network).len();
    for _ in 0..3 {
        assert_eq!(h.scheduler.grow_network(network).unwrap(), Growth::NotReady);
    }
    assert_eq!(h.alive_nodes(network).len(), before);
}

#[test]
fn test_failed_post_processing_prunes_child_and_chain_regrows() {
    let config = TrialMakerConfig {
        async_post_trial: Some(OK_JOB.into()),
        ..across_config(1, 4)
    };
    let h = Harness::new(config);
    let network = h.networks()[0];

    let p = h.participant();
    let trial = expect_trial(h.scheduler.prepare_trial(p).unwrap());
    let finalized = h.scheduler.finalize_trial(json!(0.3), trial, p).unwrap();
    // the trial is still being processed
    assert_eq!(finalized.growth, Growth::NotReady);

    // completion re-attempts growth
    h.drain();
    let nodes = h.alive_nodes(network);
    assert_eq!(nodes.len(), 2);
    let child = nodes[1].id;

    h.jobs
        .queue_job(EntityRef::Trial(trial), JobDescriptor::new(FAILING_JOB), Duration::from_secs(60))
        .unwrap();
    h.drain();

    h.store.read(|t| {
        let record = t.trial(trial).unwrap();
        assert!(record.failed());
        let reason = record.failure.failed_reason.as_deref().unwrap();
        assert!(reason.starts_with(EXCEPTION_PREFIX), "{reason}");
        assert!(t.node(child).unwrap().failed());
    });

    // the source is the head again and takes a fresh trial
    let next = h.participant();
    let retry = expect_trial(h.scheduler.prepare_trial(next).unwrap());
    let source = h.alive_nodes(network)[0].id;
    assert_eq!(h.store.read(|t| t.trial(retry).unwrap().node_id), source);
    assert!(degrees_contiguous(&h.store.snapshot(), network));
}

#[test]
fn test_balancing_spreads_trials_evenly() {
    let chains = 3;
    let k = 2;
    let config = TrialMakerConfig::across(chains).with_growth(10, 5).with_seed(3);
    let h = Harness::new(config);

    for _ in 0..(k * chains) {
        let p = h.participant();
        h.answer(p, json!(0.5)).unwrap();
    }

    let counts: Vec<usize> = h
        .networks()
        .into_iter()
        .map(|n| h.store.read(|t| t.trials_of_network(n).count()))
        .collect();
    assert_eq!(counts, vec![k as usize; chains as usize]);
}

#[test]
fn test_busy_networks_mean_wait_or_exit() {
    for wait in [true, false] {
        let config = TrialMakerConfig {
            async_post_trial: Some(OK_JOB.into()),
            wait_for_networks: wait,
            ..across_config(1, 3)
        };
        let h = Harness::new(config);

        let first = h.participant();
        let trial = expect_trial(h.scheduler.prepare_trial(first).unwrap());
        h.scheduler.finalize_trial(json!(0.2), trial, first).unwrap();

        let second = h.participant();
        let outcome = h.scheduler.prepare_trial(second).unwrap();
        if wait {
            assert_eq!(outcome, TrialOutcome::Wait);
            h.drain();
            expect_trial(h.scheduler.prepare_trial(second).unwrap());
        } else {
            assert_eq!(outcome, TrialOutcome::Exit { performance: None });
        }
    }
}

#[test]
fn test_post_grow_job_blocks_network_until_done() {
    let config = TrialMakerConfig {
        async_post_grow: Some(OK_JOB.into()),
        wait_for_networks: true,
        ..across_config(1, 3)
    };
    let h = Harness::new(config);
    let network = h.networks()[0];

    let first = h.participant();
    let trial = expect_trial(h.scheduler.prepare_trial(first).unwrap());
    let finalized = h.scheduler.finalize_trial(json!(0.9), trial, first).unwrap();
    assert!(finalized.growth.grew());
    assert!(h.store.read(|t| t.network(network).unwrap().awaiting_async_process()));

    let second = h.participant();
    h.scheduler.init_participant(second).unwrap();
    let selection = h.store.read(|t| h.scheduler.find_networks(t, second)).unwrap();
    assert_eq!(selection, NetworkSelection::Wait);
    let dirty = h.store.read(|t| h.scheduler.find_node(t, network));
    assert!(matches!(dirty, Err(SchedulerError::DirtyNetwork(n)) if n == network));

    h.drain();
    expect_trial(h.scheduler.prepare_trial(second).unwrap());
}

#[test]
fn test_duplicate_heads_are_repaired_on_growth() {
    let h = Harness::new(across_config(1, 5));
    let network = h.networks()[0];
    let p = h.participant();
    h.answer(p, json!(0.5)).unwrap();

    let nodes = h.alive_nodes(network);
    let (source, kept) = (nodes[0].id, nodes[1].id);
    let duplicate = h
        .store
        .transaction(|t| {
            t.insert_node(NewNode {
                network_id: network,
                degree: 1,
                parent: Some(source),
                seed: Value::Null,
                definition: Value::Null,
                propagate_failure: true,
            })
        })
        .unwrap();

    assert_eq!(h.scheduler.grow_network(network).unwrap(), Growth::NotReady);
    h.store.read(|t| {
        assert!(!t.node(kept).unwrap().failed());
        assert!(t.node(duplicate).unwrap().failed());
        assert_eq!(t.node(source).unwrap().child, Some(kept));
    });
    assert!(degrees_contiguous(&h.store.snapshot(), network));
}

#[test]
fn test_concurrent_participants_keep_chains_contiguous() {
    let config = TrialMakerConfig::across(2).with_growth(1, 12).with_seed(9);
    let h = Harness::new(config);

    std::thread::scope(|scope| {
        for i in 0..8 {
            let scheduler = Arc::clone(&h.scheduler);
            scope.spawn(move || {
                let p = scheduler.create_participant("default");
                for _ in 0..2 {
                    if let TrialOutcome::Trial(trial) = scheduler.prepare_trial(p).unwrap() {
                        scheduler.finalize_trial(json!(f64::from(i) / 8.0), trial, p).unwrap();
                    }
                }
            });
        }
    });

    let snapshot = h.store.snapshot();
    for network in h.networks() {
        h.scheduler.grow_network(network).unwrap();
        assert!(degrees_contiguous(&h.store.snapshot(), network));
        assert!(snapshot.num_alive_nodes(network) >= 1);
    }
}

#[test]
fn test_response_timeout_frees_head_capacity() {
    let h = Harness::new(across_config(1, 3));
    let idle = h.participant();
    let abandoned = expect_trial(h.scheduler.prepare_trial(idle).unwrap());

    let waiting = h.participant();
    assert_eq!(
        h.scheduler.prepare_trial(waiting).unwrap(),
        TrialOutcome::Exit { performance: None }
    );

    let supervisor = TimeoutSupervisor::new(
        Arc::clone(&h.store),
        SupervisorConfig::default().with_response_timeout(Duration::from_secs(60)),
    );
    let report = supervisor.run_timeout_checks_at(chrono::Utc::now() + chrono::Duration::minutes(5));
    assert_eq!(report.response_timeouts, vec![abandoned]);
    assert_eq!(
        h.store.read(|t| t.trial(abandoned).unwrap().failure.failed_reason.clone()),
        Some(RESPONSE_TIMEOUT_REASON.to_string())
    );

    let latecomer = h.participant();
    expect_trial(h.scheduler.prepare_trial(latecomer).unwrap());
}

#[test]
fn test_premature_exit_fails_trials_and_descendants() {
    let h = Harness::new(across_config(1, 4));
    let network = h.networks()[0];
    let p = h.participant();
    let trial = h.answer(p, json!(0.2)).unwrap();
    let child = h.alive_nodes(network)[1].id;

    let report = h.scheduler.on_premature_exit(p).unwrap();
    assert_eq!(report.failed, vec![EntityRef::Trial(trial), EntityRef::Node(child)]);
    h.store.read(|t| {
        assert!(t.participant(p).unwrap().failed());
        assert_eq!(
            t.trial(trial).unwrap().failure.failed_reason.as_deref(),
            Some(PREMATURE_EXIT_REASON)
        );
    });
    assert_eq!(
        h.scheduler.prepare_trial(p).unwrap(),
        TrialOutcome::Exit { performance: None }
    );
}

#[test]
fn test_finalize_rejects_foreign_and_repeated_answers() {
    let h = Harness::new(across_config(2, 3));
    let owner = h.participant();
    let other = h.participant();
    let trial = expect_trial(h.scheduler.prepare_trial(owner).unwrap());

    let err = h.scheduler.finalize_trial(json!(1), trial, other).unwrap_err();
    assert!(matches!(err, SchedulerError::TrialNotOwned { .. }));

    h.scheduler.finalize_trial(json!(1), trial, owner).unwrap();
    let err = h.scheduler.finalize_trial(json!(2), trial, owner).unwrap_err();
    assert!(matches!(err, SchedulerError::TrialAlreadyFinalized(t) if t == trial));
}

fn repeat_config(threshold: f64) -> TrialMakerConfig {
    TrialMakerConfig {
        num_repeat_trials: 2,
        max_trials_per_participant: Some(3),
        check_performance_at_end: true,
        performance: PerformanceConfig {
            method: PerformanceMethod::Consistency,
            threshold,
            resamples: 20,
            ..PerformanceConfig::default()
        },
        ..TrialMakerConfig::across(3).with_growth(1, 10).with_seed(21)
    }
}

/// Answer three originals, then both repeats with `repeat_answer(original)`
fn run_repeat_phase(h: &Harness, p: ParticipantId, repeat_answer: impl Fn(f64) -> f64) -> TrialOutcome {
    for answer in [0.1, 0.5, 0.9] {
        h.answer(p, json!(answer)).unwrap();
    }
    for _ in 0..2 {
        let trial = expect_trial(h.scheduler.prepare_trial(p).unwrap());
        let original = h.store.read(|t| {
            let repeat = t.trial(trial).unwrap();
            assert!(repeat.is_repeat_trial);
            let original = t.trial(repeat.parent_trial.unwrap()).unwrap();
            original.answer.as_ref().and_then(Value::as_f64).unwrap()
        });
        h.scheduler
            .finalize_trial(json!(repeat_answer(original)), trial, p)
            .unwrap();
    }
    h.scheduler.prepare_trial(p).unwrap()
}

#[test]
fn test_consistent_repeats_pass_end_of_phase_check() {
    let h = Harness::new(repeat_config(0.5));
    let p = h.participant();

    let outcome = run_repeat_phase(&h, p, |original| original);
    let TrialOutcome::Exit { performance: Some(result) } = outcome else {
        panic!("expected exit with a performance result, got {outcome:?}");
    };
    assert!(result.passed);
    assert!((result.score.unwrap() - 1.0).abs() < 1e-9);
    assert!(!h.store.read(|t| t.participant(p).unwrap().failed()));
}

#[test]
fn test_inconsistent_repeats_fail_participant_and_trials() {
    let h = Harness::new(repeat_config(0.5));
    let p = h.participant();

    let outcome = run_repeat_phase(&h, p, |original| 1.0 - original);
    let TrialOutcome::Exit { performance: Some(result) } = outcome else {
        panic!("expected exit with a performance result, got {outcome:?}");
    };
    assert!(!result.passed);

    h.store.read(|t| {
        assert!(t.participant(p).unwrap().failed());
        let trials: Vec<_> = t.trials_of_participant(p).collect();
        assert_eq!(trials.len(), 5);
        for trial in trials {
            assert_eq!(trial.failure.failed_reason.as_deref(), Some(PERFORMANCE_CHECK_REASON));
        }
    });
}

#[test]
fn test_within_chains_are_private() {
    let config = TrialMakerConfig {
        target_num_participants: Some(2),
        ..TrialMakerConfig::within(2).with_growth(1, 3).with_seed(4)
    };
    let h = Harness::new(config);
    assert!(h.networks().is_empty());

    let alice = h.participant();
    let bob = h.participant();
    h.answer(alice, json!(0.1)).unwrap();
    h.answer(bob, json!(0.2)).unwrap();

    h.store.read(|t| {
        let owned = |p: ParticipantId| t.networks().filter(|n| n.participant_id == Some(p)).count();
        assert_eq!(owned(alice), 2);
        assert_eq!(owned(bob), 2);
        for trial in t.trials() {
            let network = t.network(trial.network_id).unwrap();
            assert_eq!(network.participant_id, Some(trial.participant_id));
        }
    });
    assert_eq!(h.scheduler.num_trials_still_required(), 0);
}

#[test]
fn test_network_filter_excludes_networks() {
    let h = HarnessBuilder::new(TrialMakerConfig::across(2).with_growth(5, 3).with_seed(1))
        .network_filter(Arc::new(|network: &Network, _: &Participant| network.id.get() % 2 == 0))
        .build();

    for _ in 0..3 {
        let p = h.participant();
        let trial = h.answer(p, json!(0.5)).unwrap();
        let network = h.store.read(|t| t.trial(trial).unwrap().network_id);
        assert_eq!(network.get() % 2, 0);
    }
}

#[test]
fn test_recruitment_tracks_remaining_trials() {
    let h = Harness::new(across_config(1, 3));
    assert!(h.scheduler.needs_recruitment());
    assert_eq!(h.scheduler.num_trials_still_required(), 2);

    for answer in [0.3, 0.6] {
        let p = h.participant();
        h.answer(p, json!(answer)).unwrap();
    }
    assert_eq!(h.scheduler.num_trials_still_required(), 0);
    assert!(!h.scheduler.needs_recruitment());
}

fn two_blocks() -> TrialMakerConfig {
    TrialMakerConfig {
        blocks: vec!["b1".into(), "b2".into()],
        async_post_trial: Some(OK_JOB.into()),
        wait_for_networks: true,
        ..across_config(1, 5)
    }
}

fn block_of(h: &Harness, trial: TrialId) -> String {
    h.store.read(|t| {
        let network = t.trial(trial).unwrap().network_id;
        t.network(network).unwrap().block.clone()
    })
}

fn set_block_order(h: &Harness, p: ParticipantId, order: &[&str]) {
    h.store
        .transaction(|t| {
            t.participant_mut(p)?.block_order = order.iter().map(ToString::to_string).collect();
            Ok::<_, StoreError>(())
        })
        .unwrap();
}

#[test]
fn test_blocks_are_visited_in_order() {
    let h = Harness::new(two_blocks());
    assert_eq!(h.networks().len(), 2);

    let first = h.participant();
    let trial = expect_trial(h.scheduler.prepare_trial(first).unwrap());
    assert_eq!(block_of(&h, trial), "b1");
    h.scheduler.finalize_trial(json!(0.5), trial, first).unwrap();

    // b1 is busy; b2 is free but not yet reached
    let second = h.participant();
    assert_eq!(h.scheduler.prepare_trial(second).unwrap(), TrialOutcome::Wait);

    h.drain();
    let trial = expect_trial(h.scheduler.prepare_trial(second).unwrap());
    assert_eq!(block_of(&h, trial), "b1");
    h.scheduler.finalize_trial(json!(0.5), trial, second).unwrap();
    h.drain();

    // b1 visited, so the participant moves on and b1 is dropped
    let trial = expect_trial(h.scheduler.prepare_trial(second).unwrap());
    assert_eq!(block_of(&h, trial), "b2");
    assert_eq!(
        h.store.read(|t| t.participant(second).unwrap().block_order.clone()),
        vec!["b2".to_string()]
    );
    h.scheduler.finalize_trial(json!(0.5), trial, second).unwrap();
    h.drain();

    assert_eq!(
        h.scheduler.prepare_trial(second).unwrap(),
        TrialOutcome::Exit { performance: None }
    );
}

#[test]
fn test_custom_block_order_is_respected() {
    let h = Harness::new(two_blocks());

    let first = h.participant();
    set_block_order(&h, first, &["b2", "b1"]);
    let trial = expect_trial(h.scheduler.prepare_trial(first).unwrap());
    assert_eq!(block_of(&h, trial), "b2");
    h.scheduler.finalize_trial(json!(0.5), trial, first).unwrap();

    // same order: b2 is busy, so wait rather than skip ahead to b1
    let second = h.participant();
    set_block_order(&h, second, &["b2", "b1"]);
    assert_eq!(h.scheduler.prepare_trial(second).unwrap(), TrialOutcome::Wait);

    // default order starts in the idle b1
    let third = h.participant();
    let trial = expect_trial(h.scheduler.prepare_trial(third).unwrap());
    assert_eq!(block_of(&h, trial), "b1");

    // a block outside the participant's order is never offered
    let fourth = h.participant();
    set_block_order(&h, fourth, &["b3"]);
    assert_eq!(
        h.scheduler.prepare_trial(fourth).unwrap(),
        TrialOutcome::Exit { performance: None }
    );
}

#[test]
fn test_participant_groups_are_kept_apart() {
    let config = TrialMakerConfig {
        participant_groups: vec!["red".into(), "blue".into()],
        ..TrialMakerConfig::across(2).with_growth(5, 3).with_seed(2)
    };
    let h = Harness::new(config);
    assert_eq!(h.networks().len(), 4);

    for _ in 0..3 {
        let p = h.scheduler.create_participant("blue");
        let trial = h.answer(p, json!(0.5)).unwrap();
        let group = h.store.read(|t| {
            let network = t.trial(trial).unwrap().network_id;
            t.network(network).unwrap().participant_group.clone()
        });
        assert_eq!(group, "blue");
    }

    let stranger = h.scheduler.create_participant("green");
    assert_eq!(
        h.scheduler.prepare_trial(stranger).unwrap(),
        TrialOutcome::Exit { performance: None }
    );
}

#[test]
fn test_candidates_ranked_by_trial_counts() {
    let h = Harness::new(TrialMakerConfig::across(3).with_growth(10, 5).with_seed(5));
    let busiest = {
        let p = h.participant();
        let trial = h.answer(p, json!(0.5)).unwrap();
        h.store.read(|t| t.trial(trial).unwrap().network_id)
    };

    let p = h.participant();
    h.scheduler.init_participant(p).unwrap();
    let NetworkSelection::Candidates(candidates) = h.store.read(|t| h.scheduler.find_networks(t, p)).unwrap()
    else {
        panic!("expected candidates");
    };
    let mut idle: Vec<NetworkId> = h.networks().into_iter().filter(|&n| n != busiest).collect();
    idle.sort();
    // equal counts fall back to creation order
    assert_eq!(candidates, vec![idle[0], idle[1], busiest]);
}

fn accuracy_config(threshold: f64) -> PerformanceConfig {
    PerformanceConfig {
        method: PerformanceMethod::Accuracy,
        threshold,
        ..PerformanceConfig::default()
    }
}

/// Answer a trial with exactly what it showed, for a perfect score
fn answer_exactly(h: &Harness, p: ParticipantId) -> (TrialId, relay_chain::Finalized) {
    let trial = expect_trial(h.scheduler.prepare_trial(p).unwrap());
    let shown = h.store.read(|t| t.trial(trial).unwrap().definition.clone());
    let finalized = h.scheduler.finalize_trial(shown, trial, p).unwrap();
    (trial, finalized)
}

#[test]
fn test_every_trial_check_does_not_settle_end_of_phase() {
    let config = TrialMakerConfig {
        max_trials_per_participant: Some(1),
        check_performance_every_trial: true,
        check_performance_at_end: true,
        performance: accuracy_config(0.5),
        ..TrialMakerConfig::across(2).with_growth(1, 10).with_seed(12)
    };
    let h = Harness::new(config);
    let p = h.participant();

    let (trial, finalized) = answer_exactly(&h, p);
    let early = finalized.performance.unwrap();
    assert!(early.passed);
    assert!((early.score.unwrap() - 1.0).abs() < 1e-9);

    // failed elsewhere after the every-trial check
    h.store
        .transaction(|t| t.fail(EntityRef::Trial(trial), "rejected by reviewer"))
        .unwrap();

    let outcome = h.scheduler.prepare_trial(p).unwrap();
    let TrialOutcome::Exit { performance: Some(result) } = outcome else {
        panic!("expected exit with a performance result, got {outcome:?}");
    };
    assert_eq!(result.score, Some(0.0));
    assert!(!result.passed);
    assert!(h.store.read(|t| t.participant(p).unwrap().failed()));
}

#[test]
fn test_failed_post_processing_counts_against_accuracy() {
    let config = TrialMakerConfig {
        async_post_trial: Some(FAILING_JOB.into()),
        performance: PerformanceConfig {
            wait_for_async: false,
            ..accuracy_config(0.5)
        },
        ..across_config(1, 4)
    };
    let h = Harness::new(config);
    let p = h.participant();

    let (trial, _) = answer_exactly(&h, p);
    assert_eq!(h.store.read(|t| t.trial(trial).unwrap().score), Some(1.0));
    h.drain();
    assert!(h.store.read(|t| t.trial(trial).unwrap().failed()));

    let PerformanceCheck::Done(result) = h.scheduler.check_performance(p).unwrap() else {
        panic!("check should not wait");
    };
    assert_eq!(result.score, Some(0.0));
    assert!(!result.passed);
}

#[derive(Debug, Clone)]
enum Step {
    Answer(u8),
    FailNode(usize),
    FailTrial(usize),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => any::<u8>().prop_map(Step::Answer),
        1 => (0usize..8).prop_map(Step::FailNode),
        1 => (0usize..8).prop_map(Step::FailTrial),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_degrees_stay_contiguous(steps in prop::collection::vec(step(), 1..25)) {
        let config = TrialMakerConfig::across(2).with_growth(1, 6).with_seed(17);
        let h = Harness::new(config);

        for step in steps {
            match step {
                Step::Answer(a) => {
                    let p = h.participant();
                    h.answer(p, json!(f64::from(a) / 255.0));
                }
                Step::FailNode(i) => {
                    let nodes: Vec<_> = h.store.read(|t| t.nodes().map(|n| n.id).collect());
                    if let Some(&node) = nodes.get(i % nodes.len().max(1)) {
                        h.store.transaction(|t| t.fail(EntityRef::Node(node), "pruned")).unwrap();
                    }
                }
                Step::FailTrial(i) => {
                    let trials: Vec<_> = h.store.read(|t| t.trials().map(|tr| tr.id).collect());
                    if let Some(&trial) = trials.get(i % trials.len().max(1)) {
                        h.store.transaction(|t| t.fail(EntityRef::Trial(trial), "rejected")).unwrap();
                    }
                }
            }
            let snapshot = h.store.snapshot();
            for network in h.networks() {
                prop_assert!(degrees_contiguous(&snapshot, network));
            }
        }
    }
}
