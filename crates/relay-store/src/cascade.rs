//! Failure cascade
//!
//! Failing an entity drains its pending jobs, marks it failed, and then walks
//! its failure cascade breadth-first. Already-failed entities are skipped, so
//! a cascade may reach the same descendant through several paths and still
//! leave the tables exactly as a single failure would.

use crate::error::StoreError;
use crate::ids::EntityRef;
use crate::store::Tables;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

/// What a call to [`Tables::fail`] changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    /// Entities newly marked failed, in the order they were failed
    pub failed: Vec<EntityRef>,
    /// Pending jobs converted into failures across all of them
    pub jobs_failed: usize,
}

impl FailureReport {
    /// True if nothing changed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.failed.is_empty()
    }

    /// Fold another report into this one
    pub fn merge(&mut self, other: FailureReport) {
        self.failed.extend(other.failed);
        self.jobs_failed += other.jobs_failed;
    }
}

impl Tables {
    /// Entities that must also fail when `entity` fails, grouped in the
    /// order they are applied
    ///
    /// * a node with `propagate_failure` fails its trials, then its current
    ///   child;
    /// * a trial with `propagate_failure` fails its origin node's child;
    /// * a network has no cascade.
    ///
    /// Children are resolved when the cascade is applied, not when the
    /// failure started, so a child created in between is still reached.
    ///
    /// # Errors
    /// `NotFound` if the entity does not exist.
    pub fn failure_cascade(&self, entity: EntityRef) -> Result<Vec<Vec<EntityRef>>, StoreError> {
        match entity {
            EntityRef::Network(id) => {
                self.network(id)?;
                Ok(Vec::new())
            }
            EntityRef::Node(id) => {
                let node = self.node(id)?;
                if !node.propagate_failure {
                    return Ok(Vec::new());
                }
                let trials = self.trials_of_node(id).map(|t| EntityRef::Trial(t.id)).collect();
                let child = node.child.map(EntityRef::Node).into_iter().collect();
                Ok(vec![trials, child])
            }
            EntityRef::Trial(id) => {
                let trial = self.trial(id)?;
                if !trial.propagate_failure {
                    return Ok(Vec::new());
                }
                let child = self.node(trial.node_id)?.child;
                Ok(vec![child.map(EntityRef::Node).into_iter().collect()])
            }
        }
    }

    /// Fail `entity` and everything its cascade reaches
    ///
    /// The root is recorded with `reason`; cascaded entities record the
    /// reason together with the root that caused them to fail. Failing an
    /// entity that already failed is a no-op.
    ///
    /// # Errors
    /// `NotFound` if the root or any cascade target is missing.
    pub fn fail(&mut self, entity: EntityRef, reason: &str) -> Result<FailureReport, StoreError> {
        self.fail_at(entity, reason, Utc::now())
    }

    /// [`Tables::fail`] with an explicit timestamp
    ///
    /// # Errors
    /// `NotFound` if the root or any cascade target is missing.
    pub fn fail_at(
        &mut self,
        entity: EntityRef,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureReport, StoreError> {
        let mut report = FailureReport::default();
        let mut queue = VecDeque::from([entity]);
        let mut visited = HashSet::new();
        let cascaded_reason = format!("{reason} (cascaded from {entity})");

        while let Some(target) = queue.pop_front() {
            if !visited.insert(target) {
                continue;
            }
            let reason = if target == entity { reason } else { cascaded_reason.as_str() };
            if !self.mark_failed(target, reason, now, &mut report)? {
                continue;
            }
            for group in self.failure_cascade(target)? {
                queue.extend(group);
            }
        }

        if !report.is_empty() {
            tracing::info!(
                root = %entity,
                failed = report.failed.len(),
                jobs_failed = report.jobs_failed,
                "failure applied"
            );
        }
        Ok(report)
    }

    /// Drain pending jobs, then mark failed. Returns false if already failed.
    fn mark_failed(
        &mut self,
        target: EntityRef,
        reason: &str,
        now: DateTime<Utc>,
        report: &mut FailureReport,
    ) -> Result<bool, StoreError> {
        let entity = self.failable_mut(target)?;
        if entity.failed() {
            return Ok(false);
        }
        report.jobs_failed += entity.async_state_mut().fail_all_pending(reason, now);
        entity.failure_mut().mark(reason, now);
        report.failed.push(target);

        if let EntityRef::Node(id) = target {
            let network = self.node(id)?.network_id;
            self.refresh_full(network)?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{NetworkId, NodeId, ParticipantId, TrialId};
    use crate::job::{AsyncJob, JobDescriptor};
    use crate::model::{ChainScope, Failable};
    use crate::store::{NewNetwork, NewNode, NewTrial};
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use std::time::Duration;

    struct Chain {
        tables: Tables,
        network: NetworkId,
        nodes: Vec<NodeId>,
        participant: ParticipantId,
    }

    fn chain(len: u32, propagate: bool) -> Chain {
        let mut tables = Tables::default();
        let network = tables.insert_network(NewNetwork {
            trial_maker_id: "tm".into(),
            paradigm: "transmission".into(),
            scope: ChainScope::Across,
            trials_per_node: 1,
            target_num_nodes: len,
            block: "default".into(),
            participant_group: "default".into(),
            participant_id: None,
            id_within_participant: None,
            definition: Value::Null,
        });
        let mut nodes: Vec<NodeId> = Vec::new();
        for degree in 0..len {
            let id = tables
                .insert_node(NewNode {
                    network_id: network,
                    degree,
                    parent: nodes.last().copied(),
                    seed: Value::Null,
                    definition: Value::Null,
                    propagate_failure: propagate,
                })
                .unwrap();
            nodes.push(id);
        }
        let participant = tables.create_participant("default");
        Chain {
            tables,
            network,
            nodes,
            participant,
        }
    }

    fn add_trial(c: &mut Chain, node: NodeId) -> TrialId {
        c.tables
            .insert_trial(NewTrial {
                node_id: node,
                participant_id: c.participant,
                trial_maker_id: "tm".into(),
                is_repeat_trial: false,
                parent_trial: None,
                propagate_failure: true,
                definition: Value::Null,
            })
            .unwrap()
    }

    #[test]
    fn node_cascade_fails_trials_then_descendants() {
        let mut c = chain(3, true);
        let n0 = c.nodes[0];
        let t0 = add_trial(&mut c, n0);
        let n1 = c.nodes[1];
        let t1 = add_trial(&mut c, n1);

        let report = c.tables.fail(EntityRef::Node(c.nodes[1]), "pruned").unwrap();

        assert_eq!(
            report.failed,
            vec![
                EntityRef::Node(c.nodes[1]),
                EntityRef::Trial(t1),
                EntityRef::Node(c.nodes[2]),
            ]
        );
        assert!(!c.tables.trial(t0).unwrap().failed());
        assert!(!c.tables.node(c.nodes[0]).unwrap().failed());
    }

    #[test]
    fn trial_cascade_fails_origin_child() {
        let mut c = chain(3, true);
        let n0 = c.nodes[0];
        let t0 = add_trial(&mut c, n0);

        c.tables.fail(EntityRef::Trial(t0), "bad answer").unwrap();

        assert!(c.tables.node(c.nodes[1]).unwrap().failed());
        assert!(c.tables.node(c.nodes[2]).unwrap().failed());
        assert!(!c.tables.node(c.nodes[0]).unwrap().failed());
        let reason = c.tables.node(c.nodes[1]).unwrap().failure.failed_reason.clone();
        assert_eq!(reason.as_deref(), Some("bad answer (cascaded from trial#1)"));
    }

    #[test]
    fn no_propagation_stops_at_root() {
        let mut c = chain(3, false);
        let report = c.tables.fail(EntityRef::Node(c.nodes[0]), "x").unwrap();
        assert_eq!(report.failed, vec![EntityRef::Node(c.nodes[0])]);
    }

    #[test]
    fn failing_twice_is_a_no_op() {
        let mut c = chain(2, true);
        let first = c.tables.fail(EntityRef::Node(c.nodes[0]), "x").unwrap();
        let snapshot = serde_json::to_value(&c.tables).unwrap();

        let second = c.tables.fail(EntityRef::Node(c.nodes[0]), "y").unwrap();

        assert_eq!(first.failed.len(), 2);
        assert!(second.is_empty());
        assert_eq!(serde_json::to_value(&c.tables).unwrap(), snapshot);
    }

    #[test]
    fn cascade_drains_pending_jobs() {
        let mut c = chain(2, true);
        let child = c.nodes[1];
        let job = AsyncJob::new(
            EntityRef::Node(child),
            JobDescriptor::new("render"),
            Utc::now(),
            Duration::from_secs(60),
        );
        c.tables.node_mut(child).unwrap().async_state.push_pending(job);

        let report = c.tables.fail(EntityRef::Node(c.nodes[0]), "x").unwrap();

        assert_eq!(report.jobs_failed, 1);
        let node = c.tables.node(child).unwrap();
        assert!(!node.awaiting_async_process());
        assert_eq!(node.async_state.failed_jobs().len(), 1);
    }

    #[test]
    fn failing_a_node_clears_full() {
        let mut c = chain(2, true);
        assert!(c.tables.refresh_full(c.network).unwrap());
        c.tables.fail(EntityRef::Node(c.nodes[1]), "x").unwrap();
        assert!(!c.tables.network(c.network).unwrap().full);
    }
}
