//! Chain data model: networks, nodes, trials and participants
//!
//! Nodes reference their parent and child by id; trials reference their
//! origin node by id. Nothing is ever physically removed, entities are only
//! marked failed, so the history of a chain stays inspectable.

use crate::error::StoreError;
use crate::ids::{NetworkId, NodeId, ParticipantId, TrialId};
use crate::job::AsyncState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Who a chain belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainScope {
    /// Privately owned by one participant
    Within,
    /// Shared by many participants
    Across,
}

/// Failure bookkeeping shared by every failable entity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    /// Whether the entity failed
    pub failed: bool,
    /// Why it failed
    pub failed_reason: Option<String>,
    /// When it failed
    pub failed_at: Option<DateTime<Utc>>,
}

impl Failure {
    /// Mark failed; returns false if it already was
    pub fn mark(&mut self, reason: &str, now: DateTime<Utc>) -> bool {
        if self.failed {
            return false;
        }
        self.failed = true;
        self.failed_reason = Some(reason.to_string());
        self.failed_at = Some(now);
        true
    }
}

/// Common surface of entities that can fail and own async jobs
pub trait Failable {
    /// Failure bookkeeping
    fn failure(&self) -> &Failure;
    /// Mutable failure bookkeeping
    fn failure_mut(&mut self) -> &mut Failure;
    /// Job ledger
    fn async_state(&self) -> &AsyncState;
    /// Mutable job ledger
    fn async_state_mut(&mut self) -> &mut AsyncState;

    /// Whether the entity has failed
    fn failed(&self) -> bool {
        self.failure().failed
    }

    /// Whether the entity has pending async jobs
    fn awaiting_async_process(&self) -> bool {
        self.async_state().awaiting_async_process()
    }
}

macro_rules! impl_failable {
    ($($ty:ty),*) => {$(
        impl Failable for $ty {
            fn failure(&self) -> &Failure {
                &self.failure
            }
            fn failure_mut(&mut self) -> &mut Failure {
                &mut self.failure
            }
            fn async_state(&self) -> &AsyncState {
                &self.async_state
            }
            fn async_state_mut(&mut self) -> &mut AsyncState {
                &mut self.async_state
            }
        }
    )*};
}

/// A chain instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    /// Network id
    pub id: NetworkId,
    /// Trial maker that owns this chain
    pub trial_maker_id: String,
    /// Paradigm tag resolved through the paradigm registry
    pub paradigm: String,
    /// `within` or `across`
    pub scope: ChainScope,
    /// Successful trials the head needs before it may spawn a child
    pub trials_per_node: u32,
    /// Nodes at which the network is full
    pub target_num_nodes: u32,
    /// Set once the target is reached
    pub full: bool,
    /// Block the network belongs to
    pub block: String,
    /// Participant group the network belongs to
    pub participant_group: String,
    /// Owner, for `within` chains
    pub participant_id: Option<ParticipantId>,
    /// Position among the owner's networks
    pub id_within_participant: Option<u32>,
    /// Payload shared by every node of the chain
    pub definition: Value,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Failure state
    pub failure: Failure,
    /// Pending and finished jobs
    pub async_state: AsyncState,
}

/// One state of a chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node id
    pub id: NodeId,
    /// Network the node belongs to
    pub network_id: NetworkId,
    /// Position in the chain, 0 for the source
    pub degree: u32,
    /// Node this one grew from
    pub parent: Option<NodeId>,
    /// Node grown from this one
    pub child: Option<NodeId>,
    /// Value the node was grown from
    pub seed: Value,
    /// Payload shown to participants
    pub definition: Value,
    /// Whether failing this node fails its descendants
    pub propagate_failure: bool,
    /// Successful trials needed before spawning a child
    pub target_num_trials: u32,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Failure state
    pub failure: Failure,
    /// Pending and finished jobs
    pub async_state: AsyncState,
}

/// One participant response episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    /// Trial id
    pub id: TrialId,
    /// Network of the origin node
    pub network_id: NetworkId,
    /// Origin node
    pub node_id: NodeId,
    /// Participant who took the trial
    pub participant_id: ParticipantId,
    /// Trial maker that created the trial
    pub trial_maker_id: String,
    /// Whether an answer was recorded
    pub complete: bool,
    /// Whether this repeats an earlier trial
    pub is_repeat_trial: bool,
    /// Trial this one repeats
    pub parent_trial: Option<TrialId>,
    /// Whether failing this trial fails nodes grown from it
    pub propagate_failure: bool,
    /// What the participant was shown
    pub definition: Value,
    /// Normalized answer
    pub answer: Option<Value>,
    /// Paradigm score for the answer
    pub score: Option<f64>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// When the answer was recorded
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure state
    pub failure: Failure,
    /// Pending and finished jobs
    pub async_state: AsyncState,
}

impl_failable!(Network, Node, Trial);

/// A participant and their variable store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    /// Participant id
    pub id: ParticipantId,
    /// Group the participant was recruited into
    pub participant_group: String,
    /// Blocks still to visit, in order
    pub block_order: Vec<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Failure state
    pub failure: Failure,
    vars: BTreeMap<String, Value>,
}

impl Participant {
    pub(crate) fn new(id: ParticipantId, participant_group: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            participant_group,
            block_order: Vec::new(),
            created_at: now,
            failure: Failure::default(),
            vars: BTreeMap::new(),
        }
    }

    /// Whether the participant has failed
    #[inline]
    #[must_use]
    pub fn failed(&self) -> bool {
        self.failure.failed
    }

    /// Read a variable
    ///
    /// # Errors
    /// `StoreError::UndefinedVariable` if the variable was never set. A
    /// variable explicitly set to null returns `Ok(&Value::Null)`.
    pub fn var(&self, name: &str) -> Result<&Value, StoreError> {
        self.vars
            .get(name)
            .ok_or_else(|| StoreError::UndefinedVariable(name.to_string()))
    }

    /// Read a variable, falling back to `default` when undefined
    #[must_use]
    pub fn var_or<'a>(&'a self, name: &str, default: &'a Value) -> &'a Value {
        self.vars.get(name).unwrap_or(default)
    }

    /// Whether a variable has been set
    #[must_use]
    pub fn has_var(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// Set a variable
    pub fn set_var(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    /// Increment an integer variable, treating an undefined variable as 0
    ///
    /// # Errors
    /// `StoreError::InvalidVariable` if the variable holds a non-integer.
    pub fn increment_var(&mut self, name: &str, by: i64) -> Result<i64, StoreError> {
        let current = match self.vars.get(name) {
            None => 0,
            Some(value) => value.as_i64().ok_or_else(|| StoreError::InvalidVariable {
                name: name.to_string(),
                expected: "an integer",
            })?,
        };
        let next = current + by;
        self.vars.insert(name.to_string(), Value::from(next));
        Ok(next)
    }
}
