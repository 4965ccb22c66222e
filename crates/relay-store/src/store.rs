//! Tables and transactions
//!
//! [`Tables`] is the arena holding every entity, keyed by id, plus the
//! secondary indexes the scheduler needs. Tables are built on persistent
//! `im` maps so a snapshot is O(1); [`Store::transaction`] takes one before
//! running a closure and restores it if the closure fails. A successful
//! closure is the commit boundary.

use crate::error::StoreError;
use crate::ids::{EntityRef, NetworkId, NodeId, ParticipantId, TrialId};
use crate::job::AsyncState;
use crate::model::{ChainScope, Failable, Failure, Network, Node, Participant, Trial};
use chrono::{DateTime, Utc};
use im::{OrdMap, OrdSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// Fields of a network supplied by its creator
#[derive(Debug, Clone)]
pub struct NewNetwork {
    /// Owning trial maker
    pub trial_maker_id: String,
    /// Paradigm tag
    pub paradigm: String,
    /// `within` or `across`
    pub scope: ChainScope,
    /// Successful trials per node
    pub trials_per_node: u32,
    /// Nodes at which the network is full
    pub target_num_nodes: u32,
    /// Block
    pub block: String,
    /// Participant group
    pub participant_group: String,
    /// Owner, for `within` chains
    pub participant_id: Option<ParticipantId>,
    /// Position among the owner's networks
    pub id_within_participant: Option<u32>,
    /// Shared payload
    pub definition: Value,
}

/// Fields of a node supplied by its creator
#[derive(Debug, Clone)]
pub struct NewNode {
    /// Network to add the node to
    pub network_id: NetworkId,
    /// Position in the chain
    pub degree: u32,
    /// Node it grows from
    pub parent: Option<NodeId>,
    /// Seed value
    pub seed: Value,
    /// Payload shown to participants
    pub definition: Value,
    /// Whether failure cascades to descendants
    pub propagate_failure: bool,
}

/// Fields of a trial supplied by its creator
#[derive(Debug, Clone)]
pub struct NewTrial {
    /// Node the trial is taken on
    pub node_id: NodeId,
    /// Participant taking it
    pub participant_id: ParticipantId,
    /// Trial maker creating it
    pub trial_maker_id: String,
    /// Whether it repeats an earlier trial
    pub is_repeat_trial: bool,
    /// Trial it repeats
    pub parent_trial: Option<TrialId>,
    /// Whether failure cascades to grown nodes
    pub propagate_failure: bool,
    /// What the participant is shown
    pub definition: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Sequences {
    network: u64,
    node: u64,
    trial: u64,
    participant: u64,
}

fn next(counter: &mut u64) -> u64 {
    *counter += 1;
    *counter
}

fn index_insert<K: Ord + Clone, V: Ord + Clone>(index: &mut OrdMap<K, OrdSet<V>>, key: K, value: V) {
    match index.get_mut(&key) {
        Some(set) => {
            set.insert(value);
        }
        None => {
            index.insert(key, OrdSet::unit(value));
        }
    }
}

/// Entity arena with secondary indexes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    networks: OrdMap<NetworkId, Network>,
    nodes: OrdMap<NodeId, Node>,
    trials: OrdMap<TrialId, Trial>,
    participants: OrdMap<ParticipantId, Participant>,
    network_nodes: OrdMap<NetworkId, OrdSet<NodeId>>,
    node_trials: OrdMap<NodeId, OrdSet<TrialId>>,
    participant_trials: OrdMap<ParticipantId, OrdSet<TrialId>>,
    sequences: Sequences,
}

impl Tables {
    // ---------------------------------------------------------------
    // Creation
    // ---------------------------------------------------------------

    /// Register a participant
    pub fn create_participant(&mut self, participant_group: impl Into<String>) -> ParticipantId {
        let id = ParticipantId(next(&mut self.sequences.participant));
        self.participants
            .insert(id, Participant::new(id, participant_group.into(), Utc::now()));
        id
    }

    /// Create a network with no nodes
    pub fn insert_network(&mut self, new: NewNetwork) -> NetworkId {
        let id = NetworkId(next(&mut self.sequences.network));
        let network = Network {
            id,
            trial_maker_id: new.trial_maker_id,
            paradigm: new.paradigm,
            scope: new.scope,
            trials_per_node: new.trials_per_node,
            target_num_nodes: new.target_num_nodes,
            full: false,
            block: new.block,
            participant_group: new.participant_group,
            participant_id: new.participant_id,
            id_within_participant: new.id_within_participant,
            definition: new.definition,
            created_at: Utc::now(),
            failure: Failure::default(),
            async_state: AsyncState::default(),
        };
        self.networks.insert(id, network);
        self.network_nodes.insert(id, OrdSet::new());
        id
    }

    /// Append a node to a network
    ///
    /// If the node has a parent, the parent's `child` is reassigned to it.
    ///
    /// # Errors
    /// `NotFound` if the network or the parent does not exist.
    pub fn insert_node(&mut self, new: NewNode) -> Result<NodeId, StoreError> {
        let target_num_trials = self.network(new.network_id)?.trials_per_node;
        if let Some(parent) = new.parent {
            self.node(parent)?;
        }

        let id = NodeId(next(&mut self.sequences.node));
        let node = Node {
            id,
            network_id: new.network_id,
            degree: new.degree,
            parent: new.parent,
            child: None,
            seed: new.seed,
            definition: new.definition,
            propagate_failure: new.propagate_failure,
            target_num_trials,
            created_at: Utc::now(),
            failure: Failure::default(),
            async_state: AsyncState::default(),
        };
        self.nodes.insert(id, node);
        self.node_trials.insert(id, OrdSet::new());
        index_insert(&mut self.network_nodes, new.network_id, id);

        if let Some(parent) = new.parent {
            self.node_mut(parent)?.child = Some(id);
        }
        Ok(id)
    }

    /// Create a trial attached to a node
    ///
    /// # Errors
    /// `NotFound` if the node or the participant does not exist.
    pub fn insert_trial(&mut self, new: NewTrial) -> Result<TrialId, StoreError> {
        let network_id = self.node(new.node_id)?.network_id;
        self.participant(new.participant_id)?;

        let id = TrialId(next(&mut self.sequences.trial));
        let trial = Trial {
            id,
            network_id,
            node_id: new.node_id,
            participant_id: new.participant_id,
            trial_maker_id: new.trial_maker_id,
            complete: false,
            is_repeat_trial: new.is_repeat_trial,
            parent_trial: new.parent_trial,
            propagate_failure: new.propagate_failure,
            definition: new.definition,
            answer: None,
            score: None,
            created_at: Utc::now(),
            completed_at: None,
            failure: Failure::default(),
            async_state: AsyncState::default(),
        };
        self.trials.insert(id, trial);
        index_insert(&mut self.node_trials, new.node_id, id);
        index_insert(&mut self.participant_trials, new.participant_id, id);
        Ok(id)
    }

    // ---------------------------------------------------------------
    // Lookup
    // ---------------------------------------------------------------

    /// # Errors
    /// `NotFound` if absent.
    pub fn network(&self, id: NetworkId) -> Result<&Network, StoreError> {
        self.networks
            .get(&id)
            .ok_or(StoreError::NotFound(EntityRef::Network(id)))
    }

    /// # Errors
    /// `NotFound` if absent.
    pub fn network_mut(&mut self, id: NetworkId) -> Result<&mut Network, StoreError> {
        self.networks
            .get_mut(&id)
            .ok_or(StoreError::NotFound(EntityRef::Network(id)))
    }

    /// # Errors
    /// `NotFound` if absent.
    pub fn node(&self, id: NodeId) -> Result<&Node, StoreError> {
        self.nodes
            .get(&id)
            .ok_or(StoreError::NotFound(EntityRef::Node(id)))
    }

    /// # Errors
    /// `NotFound` if absent.
    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, StoreError> {
        self.nodes
            .get_mut(&id)
            .ok_or(StoreError::NotFound(EntityRef::Node(id)))
    }

    /// # Errors
    /// `NotFound` if absent.
    pub fn trial(&self, id: TrialId) -> Result<&Trial, StoreError> {
        self.trials
            .get(&id)
            .ok_or(StoreError::NotFound(EntityRef::Trial(id)))
    }

    /// # Errors
    /// `NotFound` if absent.
    pub fn trial_mut(&mut self, id: TrialId) -> Result<&mut Trial, StoreError> {
        self.trials
            .get_mut(&id)
            .ok_or(StoreError::NotFound(EntityRef::Trial(id)))
    }

    /// # Errors
    /// `ParticipantNotFound` if absent.
    pub fn participant(&self, id: ParticipantId) -> Result<&Participant, StoreError> {
        self.participants
            .get(&id)
            .ok_or(StoreError::ParticipantNotFound(id))
    }

    /// # Errors
    /// `ParticipantNotFound` if absent.
    pub fn participant_mut(&mut self, id: ParticipantId) -> Result<&mut Participant, StoreError> {
        self.participants
            .get_mut(&id)
            .ok_or(StoreError::ParticipantNotFound(id))
    }

    /// Any failable entity by reference
    ///
    /// # Errors
    /// `NotFound` if absent.
    pub fn failable(&self, entity: EntityRef) -> Result<&dyn Failable, StoreError> {
        Ok(match entity {
            EntityRef::Network(id) => self.network(id)? as &dyn Failable,
            EntityRef::Node(id) => self.node(id)? as &dyn Failable,
            EntityRef::Trial(id) => self.trial(id)? as &dyn Failable,
        })
    }

    /// Any failable entity by reference, mutably
    ///
    /// # Errors
    /// `NotFound` if absent.
    pub fn failable_mut(&mut self, entity: EntityRef) -> Result<&mut dyn Failable, StoreError> {
        Ok(match entity {
            EntityRef::Network(id) => self.network_mut(id)? as &mut dyn Failable,
            EntityRef::Node(id) => self.node_mut(id)? as &mut dyn Failable,
            EntityRef::Trial(id) => self.trial_mut(id)? as &mut dyn Failable,
        })
    }

    // ---------------------------------------------------------------
    // Iteration
    // ---------------------------------------------------------------

    /// All networks in id order
    pub fn networks(&self) -> impl Iterator<Item = &Network> {
        self.networks.values()
    }

    /// All nodes in id order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// All trials in id order
    pub fn trials(&self) -> impl Iterator<Item = &Trial> {
        self.trials.values()
    }

    /// All participants in id order
    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    /// Nodes of a network, ordered by (degree, id), failed ones included
    pub fn nodes_of(&self, network: NetworkId) -> Vec<&Node> {
        let mut nodes: Vec<&Node> = self
            .network_nodes
            .get(&network)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.nodes.get(id))
            .collect();
        nodes.sort_by_key(|node| (node.degree, node.id));
        nodes
    }

    /// Trials whose origin is `node`, in id order
    pub fn trials_of_node(&self, node: NodeId) -> impl Iterator<Item = &Trial> {
        self.node_trials
            .get(&node)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.trials.get(id))
    }

    /// Trials attached to any node of `network`
    pub fn trials_of_network(&self, network: NetworkId) -> impl Iterator<Item = &Trial> {
        self.network_nodes
            .get(&network)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .flat_map(|node| self.trials_of_node(*node))
    }

    /// Trials of a participant, in id order
    pub fn trials_of_participant(&self, participant: ParticipantId) -> impl Iterator<Item = &Trial> {
        self.participant_trials
            .get(&participant)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.trials.get(id))
    }

    /// Every entity that currently has pending jobs
    pub fn owners_awaiting(&self) -> Vec<EntityRef> {
        let networks = self
            .networks
            .values()
            .filter(|n| n.awaiting_async_process())
            .map(|n| EntityRef::Network(n.id));
        let nodes = self
            .nodes
            .values()
            .filter(|n| n.awaiting_async_process())
            .map(|n| EntityRef::Node(n.id));
        let trials = self
            .trials
            .values()
            .filter(|t| t.awaiting_async_process())
            .map(|t| EntityRef::Trial(t.id));
        networks.chain(nodes).chain(trials).collect()
    }

    /// Number of non-failed nodes in a network
    pub fn num_alive_nodes(&self, network: NetworkId) -> usize {
        self.nodes_of(network).iter().filter(|n| !n.failed()).count()
    }

    /// Recompute a network's `full` flag from its non-failed node count
    ///
    /// # Errors
    /// `NotFound` if the network does not exist.
    pub fn refresh_full(&mut self, network: NetworkId) -> Result<bool, StoreError> {
        let alive = self.num_alive_nodes(network);
        let net = self.network_mut(network)?;
        net.full = alive >= net.target_num_nodes as usize;
        Ok(net.full)
    }

    /// Record a participant's answer on a trial
    ///
    /// # Errors
    /// `NotFound` if the trial does not exist.
    pub fn complete_trial(
        &mut self,
        trial: TrialId,
        answer: Value,
        score: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<&Trial, StoreError> {
        let t = self.trial_mut(trial)?;
        t.complete = true;
        t.answer = Some(answer);
        t.score = score;
        t.completed_at = Some(now);
        Ok(t)
    }
}

/// Shared, transactional handle over [`Tables`]
///
/// Cross-thread coordination between request handlers, job workers and the
/// timeout supervisor goes exclusively through this store.
#[derive(Debug, Default)]
pub struct Store {
    tables: RwLock<Tables>,
    revision: AtomicU64,
}

impl Store {
    /// Empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with existing tables
    #[must_use]
    pub fn from_tables(tables: Tables) -> Self {
        Self {
            tables: RwLock::new(tables),
            revision: AtomicU64::new(0),
        }
    }

    /// Run `f` atomically against the tables
    ///
    /// On `Ok` the changes are committed and the revision advances; on `Err`
    /// the tables are rolled back to their state before `f` ran.
    ///
    /// # Errors
    /// Whatever `f` returns.
    pub fn transaction<T, E>(&self, f: impl FnOnce(&mut Tables) -> Result<T, E>) -> Result<T, E> {
        let mut tables = self.tables.write();
        let snapshot = tables.clone();
        match f(&mut tables) {
            Ok(value) => {
                self.revision.fetch_add(1, Ordering::AcqRel);
                Ok(value)
            }
            Err(e) => {
                *tables = snapshot;
                tracing::debug!("transaction rolled back");
                Err(e)
            }
        }
    }

    /// Read-only access
    pub fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        f(&self.tables.read())
    }

    /// Cheap point-in-time copy of every table
    #[must_use]
    pub fn snapshot(&self) -> Tables {
        self.tables.read().clone()
    }

    /// Number of committed transactions
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_network() -> NewNetwork {
        NewNetwork {
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
        }
    }

    fn new_node(network_id: NetworkId, degree: u32, parent: Option<NodeId>) -> NewNode {
        NewNode {
            network_id,
            degree,
            parent,
            seed: json!(degree),
            definition: json!(degree),
            propagate_failure: true,
        }
    }

    #[test]
    fn insert_node_links_parent_child() {
        let mut t = Tables::default();
        let net = t.insert_network(new_network());
        let a = t.insert_node(new_node(net, 0, None)).unwrap();
        let b = t.insert_node(new_node(net, 1, Some(a))).unwrap();

        assert_eq!(t.node(a).unwrap().child, Some(b));
        assert_eq!(t.node(b).unwrap().parent, Some(a));
        assert_eq!(t.node(b).unwrap().target_num_trials, 1);
        assert!(a < b);
    }

    #[test]
    fn trial_indexes_follow_node_and_participant() {
        let mut t = Tables::default();
        let net = t.insert_network(new_network());
        let node = t.insert_node(new_node(net, 0, None)).unwrap();
        let p = t.create_participant("default");
        let trial = t
            .insert_trial(NewTrial {
                node_id: node,
                participant_id: p,
                trial_maker_id: "tm".into(),
                is_repeat_trial: false,
                parent_trial: None,
                propagate_failure: true,
                definition: Value::Null,
            })
            .unwrap();

        assert_eq!(t.trials_of_node(node).map(|t| t.id).collect::<Vec<_>>(), vec![trial]);
        assert_eq!(t.trials_of_network(net).count(), 1);
        assert_eq!(t.trials_of_participant(p).count(), 1);
        assert_eq!(t.trial(trial).unwrap().network_id, net);
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let store = Store::new();
        let result: Result<(), StoreError> = store.transaction(|t| {
            t.insert_network(new_network());
            Err(StoreError::Invariant("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.read(|t| t.networks().count()), 0);
        assert_eq!(store.revision(), 0);

        store
            .transaction(|t| Ok::<_, StoreError>(t.insert_network(new_network())))
            .unwrap();
        assert_eq!(store.read(|t| t.networks().count()), 1);
        assert_eq!(store.revision(), 1);
    }

    #[test]
    fn refresh_full_counts_alive_nodes() {
        let mut t = Tables::default();
        let net = t.insert_network(new_network());
        let mut parent = None;
        for degree in 0..3 {
            parent = Some(t.insert_node(new_node(net, degree, parent)).unwrap());
        }
        assert!(t.refresh_full(net).unwrap());

        t.node_mut(parent.unwrap()).unwrap().failure.mark("x", Utc::now());
        assert!(!t.refresh_full(net).unwrap());
    }

    #[test]
    fn missing_entities_report_not_found() {
        let t = Tables::default();
        assert_eq!(
            t.node(NodeId(9)).unwrap_err(),
            StoreError::NotFound(EntityRef::Node(NodeId(9)))
        );
        assert!(t.failable(EntityRef::Trial(TrialId(1))).is_err());
    }
}
