//! Stable identities for stored entities
//!
//! Networks, nodes, trials and participants carry monotonically increasing
//! integer ids assigned by the store, so "lowest id" means "created first".
//! Jobs carry UUIDs because they are generated outside any transaction.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! sequential_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl $name {
            /// Raw integer value
            #[inline]
            #[must_use]
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

sequential_id!(
    /// Network (chain instance) identifier
    NetworkId,
    "network"
);
sequential_id!(
    /// Node identifier
    NodeId,
    "node"
);
sequential_id!(
    /// Trial identifier
    TrialId,
    "trial"
);
sequential_id!(
    /// Participant identifier
    ParticipantId,
    "participant"
);

/// Asynchronous job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a fresh job id
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to any failable entity that can own asynchronous jobs
///
/// Jobs and cascades always refer to entities through this handle and
/// re-resolve them from the store; they never hold the entity itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EntityRef {
    /// A network
    Network(NetworkId),
    /// A node
    Node(NodeId),
    /// A trial
    Trial(TrialId),
}

impl EntityRef {
    /// Entity kind as a static label
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Node(_) => "node",
            Self::Trial(_) => "trial",
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(id) => id.fmt(f),
            Self::Node(id) => id.fmt(f),
            Self::Trial(id) => id.fmt(f),
        }
    }
}

impl From<NetworkId> for EntityRef {
    fn from(id: NetworkId) -> Self {
        Self::Network(id)
    }
}

impl From<NodeId> for EntityRef {
    fn from(id: NodeId) -> Self {
        Self::Node(id)
    }
}

impl From<TrialId> for EntityRef {
    fn from(id: TrialId) -> Self {
        Self::Trial(id)
    }
}
