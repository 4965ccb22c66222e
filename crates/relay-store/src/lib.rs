//! Relay Store - chain data model and transactions
//!
//! Holds every network, node, trial and participant of an experiment in an
//! arena keyed by stable ids:
//! - Entities reference each other by id, never by pointer
//! - [`Store::transaction`] is the only commit boundary; a failing closure
//!   rolls the tables back
//! - Failure is a flag plus a cascade ([`Tables::fail`]), never a deletion
//! - Every failable entity carries its own asynchronous job ledger
//!
//! # Example
//!
//! ```rust,ignore
//! use relay_store::prelude::*;
//!
//! let store = Store::new();
//! let report = store.transaction(|tables| tables.fail(EntityRef::Node(node), "pruned"))?;
//! println!("failed {} entities", report.failed.len());
//! ```

pub mod cascade;
pub mod error;
pub mod ids;
pub mod job;
pub mod model;
pub mod store;

pub use cascade::FailureReport;
pub use error::StoreError;
pub use ids::{EntityRef, JobId, NetworkId, NodeId, ParticipantId, TrialId};
pub use job::{AsyncJob, AsyncState, JobDescriptor, JobStatus, CANCELLED_REASON};
pub use model::{ChainScope, Failable, Failure, Network, Node, Participant, Trial};
pub use store::{NewNetwork, NewNode, NewTrial, Store, Tables};

/// Common imports
pub mod prelude {
    pub use crate::{
        ChainScope, EntityRef, Failable, JobId, NetworkId, NodeId, ParticipantId, Store,
        StoreError, Tables, TrialId,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
