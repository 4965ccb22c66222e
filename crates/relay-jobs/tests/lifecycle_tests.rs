use chrono::Utc;
use pretty_assertions::assert_eq;
use relay_jobs::prelude::*;
use relay_jobs::{JobOutcome, ASYNC_TIMEOUT_REASON, EXCEPTION_PREFIX, RESPONSE_TIMEOUT_REASON};
use relay_store::{
    ChainScope, Failable, NetworkId, NewNetwork, NewNode, NewTrial, NodeId, Store, StoreError,
    TrialId,
};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    store: Arc<Store>,
    network: NetworkId,
    nodes: Vec<NodeId>,
    trial: TrialId,
}

/// Two-node chain with one trial on the first node
fn fixture() -> Fixture {
    let store = Arc::new(Store::new());
    let (network, nodes, trial) = store
        .transaction(|t| {
            let network = t.insert_network(NewNetwork {
                trial_maker_id: "tm".into(),
                paradigm: "transmission".into(),
                scope: ChainScope::Across,
                trials_per_node: 1,
                target_num_nodes: 3,
                block: "default".into(),
                participant_group: "default".into(),
                participant_id: None,
                id_within_participant: None,
                definition: Value::Null,
            });
            let a = t.insert_node(NewNode {
                network_id: network,
                degree: 0,
                parent: None,
                seed: Value::Null,
                definition: Value::Null,
                propagate_failure: true,
            })?;
            let b = t.insert_node(NewNode {
                network_id: network,
                degree: 1,
                parent: Some(a),
                seed: Value::Null,
                definition: Value::Null,
                propagate_failure: true,
            })?;
            let participant = t.create_participant("default");
            let trial = t.insert_trial(NewTrial {
                node_id: a,
                participant_id: participant,
                trial_maker_id: "tm".into(),
                is_repeat_trial: false,
                parent_trial: None,
                propagate_failure: true,
                definition: Value::Null,
            })?;
            Ok::<_, StoreError>((network, vec![a, b], trial))
        })
        .unwrap();
    Fixture {
        store,
        network,
        nodes,
        trial,
    }
}

fn registry(counter: Arc<AtomicUsize>) -> JobRegistry {
    JobRegistry::new()
        .with("count", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .with("boom", |_| anyhow::bail!("analysis crashed"))
        .with("purge_self", |ctx| {
            ctx.store
                .transaction(|t| t.fail_async_processes(ctx.owner, "purged", Utc::now()))?;
            Ok(())
        })
}

const TIMEOUT: Duration = Duration::from_secs(60);

#[test]
fn test_local_dispatch_runs_job_and_clears_pending() {
    let f = fixture();
    let counter = Arc::new(AtomicUsize::new(0));
    let jobs = JobManager::new(Arc::clone(&f.store), registry(Arc::clone(&counter)), DispatchMode::Local);
    let owner = EntityRef::Trial(f.trial);

    jobs.queue_job(owner, JobDescriptor::new("count"), TIMEOUT).unwrap();
    let outcomes = jobs.wait_idle();

    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].is_completed());
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(!f.store.read(|t| t.trial(f.trial).unwrap().awaiting_async_process()));
}

#[test]
fn test_trial_post_processing_error_fails_trial_and_child_node() {
    let f = fixture();
    let jobs = JobManager::new(
        Arc::clone(&f.store),
        registry(Arc::new(AtomicUsize::new(0))),
        DispatchMode::Local,
    );

    jobs.queue_job(EntityRef::Trial(f.trial), JobDescriptor::new("boom"), TIMEOUT)
        .unwrap();
    jobs.wait_idle();

    f.store.read(|t| {
        let trial = t.trial(f.trial).unwrap();
        assert!(trial.failed());
        let reason = trial.failure.failed_reason.as_deref().unwrap();
        assert!(reason.starts_with(EXCEPTION_PREFIX), "{reason}");
        assert!(reason.contains("analysis crashed"));
        assert!(t.node(f.nodes[1]).unwrap().failed());
        assert!(!t.node(f.nodes[0]).unwrap().failed());
    });
}

#[test]
fn test_distributed_workers_drain_the_queue() {
    let f = fixture();
    let counter = Arc::new(AtomicUsize::new(0));
    let jobs = JobManager::new(
        Arc::clone(&f.store),
        registry(Arc::clone(&counter)),
        DispatchMode::Distributed { workers: 3 },
    );

    for node in &f.nodes {
        for _ in 0..5 {
            jobs.queue_job(EntityRef::Node(*node), JobDescriptor::new("count"), TIMEOUT)
                .unwrap();
        }
    }
    let outcomes = jobs.wait_idle();
    jobs.shutdown();

    assert_eq!(outcomes.len(), 10);
    assert!(outcomes.iter().all(JobOutcome::is_completed));
    assert_eq!(counter.load(Ordering::SeqCst), 10);
    assert!(f.store.read(|t| t.owners_awaiting().is_empty()));
}

#[test]
fn test_cancelled_job_is_skipped_by_worker() {
    let f = fixture();
    let counter = Arc::new(AtomicUsize::new(0));
    let jobs = JobManager::new(
        Arc::clone(&f.store),
        registry(Arc::clone(&counter)),
        DispatchMode::Distributed { workers: 0 },
    );
    let owner = EntityRef::Network(f.network);

    let job_id = jobs.queue_job(owner, JobDescriptor::new("count"), TIMEOUT).unwrap();
    let cancelled = jobs.cancel_job(owner, job_id).unwrap();
    let outcomes = jobs.wait_idle();

    assert!(cancelled.cancelled);
    assert_eq!(outcomes, vec![JobOutcome::Skipped { job_id }]);
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    f.store.read(|t| {
        let network = t.network(f.network).unwrap();
        assert!(!network.failed());
        assert_eq!(network.async_state.failed_jobs()[0].failure_reason(), Some("cancelled"));
    });
}

#[test]
fn test_completion_after_purge_is_discarded() {
    let f = fixture();
    let jobs = JobManager::new(
        Arc::clone(&f.store),
        registry(Arc::new(AtomicUsize::new(0))),
        DispatchMode::Distributed { workers: 0 },
    );

    let job_id = jobs
        .queue_job(EntityRef::Node(f.nodes[1]), JobDescriptor::new("purge_self"), TIMEOUT)
        .unwrap();
    let outcomes = jobs.wait_idle();

    assert_eq!(outcomes, vec![JobOutcome::Discarded { job_id }]);
    f.store.read(|t| {
        let node = t.node(f.nodes[1]).unwrap();
        assert!(node.failed());
        assert!(node.async_state.finished_jobs().is_empty());
    });
}

#[test]
fn test_failed_owner_rejects_new_jobs() {
    let f = fixture();
    let jobs = JobManager::new(
        Arc::clone(&f.store),
        registry(Arc::new(AtomicUsize::new(0))),
        DispatchMode::Distributed { workers: 0 },
    );
    let owner = EntityRef::Node(f.nodes[0]);
    f.store.transaction(|t| t.fail(owner, "pruned")).unwrap();

    let result = jobs.queue_job(owner, JobDescriptor::new("count"), TIMEOUT);
    assert!(matches!(result, Err(JobError::OwnerFailed(o)) if o == owner));
}

#[test]
fn test_async_timeout_fails_owner_on_next_tick() {
    let f = fixture();
    let owner = EntityRef::Node(f.nodes[0]);
    f.store
        .transaction(|t| t.enqueue_job(owner, JobDescriptor::new("count"), TIMEOUT, Utc::now()))
        .unwrap();
    let config = SupervisorConfig::default().with_async_timeout(Duration::from_secs(10));
    let supervisor = TimeoutSupervisor::new(Arc::clone(&f.store), config);

    let early = supervisor.run_timeout_checks_at(Utc::now() + chrono::Duration::seconds(5));
    assert!(early.async_timeouts.is_empty());

    let late = supervisor.run_timeout_checks_at(Utc::now() + chrono::Duration::seconds(11));
    assert_eq!(late.async_timeouts, vec![owner]);
    f.store.read(|t| {
        let node = t.node(f.nodes[0]).unwrap();
        assert!(!node.awaiting_async_process());
        assert_eq!(node.failure.failed_reason.as_deref(), Some(ASYNC_TIMEOUT_REASON));
        // node cascade reaches its trial and child
        assert!(t.trial(f.trial).unwrap().failed());
        assert!(t.node(f.nodes[1]).unwrap().failed());
    });
}

#[test]
fn test_job_deadline_counts_as_stalled() {
    let f = fixture();
    let owner = EntityRef::Network(f.network);
    f.store
        .transaction(|t| {
            t.enqueue_job(owner, JobDescriptor::new("count"), Duration::from_secs(1), Utc::now())
        })
        .unwrap();
    let supervisor = TimeoutSupervisor::new(Arc::clone(&f.store), SupervisorConfig::default());

    let report = supervisor.run_timeout_checks_at(Utc::now() + chrono::Duration::seconds(2));
    assert_eq!(report.async_timeouts, vec![owner]);
}

#[test]
fn test_response_timeout_skips_complete_trials() {
    let f = fixture();
    let config = SupervisorConfig::default().with_response_timeout(Duration::from_secs(60));
    let supervisor = TimeoutSupervisor::new(Arc::clone(&f.store), config);

    // answered but still post-processing
    f.store
        .transaction(|t| {
            t.complete_trial(f.trial, Value::from(1), None, Utc::now())?;
            t.enqueue_job(EntityRef::Trial(f.trial), JobDescriptor::new("count"), TIMEOUT, Utc::now())
                .map_err(|e| StoreError::Invariant(e.to_string()))
        })
        .unwrap();

    let report = supervisor.run_timeout_checks_at(Utc::now() + chrono::Duration::seconds(61));
    assert!(report.response_timeouts.is_empty());
}

#[test]
fn test_response_timeout_fails_unanswered_trial() {
    let f = fixture();
    let config = SupervisorConfig::default().with_response_timeout(Duration::from_secs(60));
    let supervisor = TimeoutSupervisor::new(Arc::clone(&f.store), config);

    let report = supervisor.run_timeout_checks_at(Utc::now() + chrono::Duration::seconds(61));

    assert_eq!(report.response_timeouts, vec![f.trial]);
    f.store.read(|t| {
        let trial = t.trial(f.trial).unwrap();
        assert_eq!(trial.failure.failed_reason.as_deref(), Some(RESPONSE_TIMEOUT_REASON));
        assert!(t.node(f.nodes[1]).unwrap().failed());
    });

    // a second tick finds nothing new
    let again = supervisor.run_timeout_checks_at(Utc::now() + chrono::Duration::seconds(120));
    assert!(again.is_empty());
}

#[tokio::test]
async fn test_supervisor_loop_ticks_until_shutdown() {
    let f = fixture();
    let owner = EntityRef::Node(f.nodes[0]);
    f.store
        .transaction(|t| {
            t.enqueue_job(
                owner,
                JobDescriptor::new("count"),
                TIMEOUT,
                Utc::now() - chrono::Duration::hours(1),
            )
        })
        .unwrap();
    let config = SupervisorConfig::default()
        .with_interval(Duration::from_millis(10))
        .with_async_timeout(Duration::from_secs(60));

    let handle = TimeoutSupervisor::new(Arc::clone(&f.store), config).spawn();
    for _ in 0..100 {
        if f.store.read(|t| t.node(f.nodes[0]).unwrap().failed()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(handle.is_running());
    handle.shutdown().await;

    assert!(f.store.read(|t| t.node(f.nodes[0]).unwrap().failed()));
}
