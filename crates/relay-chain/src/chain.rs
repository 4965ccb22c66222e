//! Chain structure operations
//!
//! Free functions over [`Tables`] so they compose inside a single
//! [`relay_store::Store::transaction`]. Growth is gated on pending async
//! work: a network or head node that is awaiting a job never spawns.

use crate::config::TrialMakerConfig;
use crate::error::SchedulerError;
use crate::paradigm::Paradigm;
use rand::RngCore;
use relay_store::{
    EntityRef, Failable, NetworkId, NewNetwork, NewNode, Node, NodeId, ParticipantId, StoreError,
    Tables, Trial,
};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Result of a growth attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Growth {
    /// Head lacks enough completed, processed trials
    NotReady,
    /// Network reached its target size
    Full,
    /// A new head was added
    Grew(NodeId),
    /// Network failed or awaiting async work
    Blocked,
}

impl Growth {
    /// Whether a node was added
    #[inline]
    #[must_use]
    pub fn grew(self) -> bool {
        matches!(self, Self::Grew(_))
    }
}

/// Owner of a `within` network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkOwner {
    /// Participant who owns the network
    pub participant: ParticipantId,
    /// Position among the participant's networks
    pub id_within_participant: u32,
}

/// Create a network and seed its degree-0 node
///
/// # Errors
/// Store errors from node insertion.
pub fn create_network(
    tables: &mut Tables,
    config: &TrialMakerConfig,
    paradigm: &dyn Paradigm,
    block: &str,
    participant_group: &str,
    owner: Option<NetworkOwner>,
    rng: &mut dyn RngCore,
) -> Result<NetworkId, SchedulerError> {
    let definition = paradigm.network_definition(rng);
    let network = tables.insert_network(NewNetwork {
        trial_maker_id: config.id.clone(),
        paradigm: paradigm.name().to_string(),
        scope: config.chain_type,
        trials_per_node: config.trials_per_node,
        target_num_nodes: config.target_num_nodes,
        block: block.to_string(),
        participant_group: participant_group.to_string(),
        participant_id: owner.map(|o| o.participant),
        id_within_participant: owner.map(|o| o.id_within_participant),
        definition,
    });
    let source = seed_source(tables, paradigm, network, config.propagate_failure, rng)?;
    info!(%network, %source, block, participant_group, "network created");
    Ok(network)
}

fn seed_source(
    tables: &mut Tables,
    paradigm: &dyn Paradigm,
    network: NetworkId,
    propagate_failure: bool,
    rng: &mut dyn RngCore,
) -> Result<NodeId, SchedulerError> {
    let network_definition = tables.network(network)?.definition.clone();
    let seed = paradigm.source_seed(&network_definition, rng);
    let definition = paradigm.make_definition(&seed, 0, &network_definition, rng);
    let node = tables.insert_node(NewNode {
        network_id: network,
        degree: 0,
        parent: None,
        seed,
        definition,
        propagate_failure,
    })?;
    tables.refresh_full(network)?;
    Ok(node)
}

/// Fail every non-failed node that shares a degree with a lower-id node
///
/// Returns the failed duplicates. The surviving node becomes its parent's
/// child again.
///
/// # Errors
/// Store errors while failing nodes.
pub fn resolve_duplicates(tables: &mut Tables, network: NetworkId) -> Result<Vec<NodeId>, StoreError> {
    let mut by_degree: BTreeMap<u32, Vec<NodeId>> = BTreeMap::new();
    for node in tables.nodes_of(network).into_iter().filter(|n| !n.failed()) {
        by_degree.entry(node.degree).or_default().push(node.id);
    }

    let mut removed = Vec::new();
    for (degree, ids) in by_degree {
        // nodes_of orders by (degree, id), so the keeper is first
        let Some((&keep, duplicates)) = ids.split_first() else {
            continue;
        };
        if duplicates.is_empty() {
            continue;
        }
        warn!(%network, degree, %keep, duplicates = duplicates.len(), "resolving duplicate nodes");
        let reason = format!("duplicate node at degree {degree}");
        for &duplicate in duplicates {
            tables.fail(EntityRef::Node(duplicate), &reason)?;
            removed.push(duplicate);
        }
        if let Some(parent) = tables.node(keep)?.parent {
            tables.node_mut(parent)?.child = Some(keep);
        }
    }
    if !removed.is_empty() {
        tables.refresh_full(network)?;
    }
    Ok(removed)
}

/// Highest-degree non-failed node, after duplicate repair
///
/// # Errors
/// Store errors from duplicate resolution.
pub fn head_node(tables: &mut Tables, network: NetworkId) -> Result<Option<NodeId>, StoreError> {
    resolve_duplicates(tables, network)?;
    Ok(peek_head(tables, network).map(|n| n.id))
}

/// Highest-degree non-failed node without repairing duplicates
#[must_use]
pub fn peek_head(tables: &Tables, network: NetworkId) -> Option<&Node> {
    tables
        .nodes_of(network)
        .into_iter()
        .filter(|n| !n.failed())
        .min_by_key(|n| (std::cmp::Reverse(n.degree), n.id))
}

/// Non-failed, non-repeat trials at a node, complete or not
pub fn viable_trials(tables: &Tables, node: NodeId) -> Vec<&Trial> {
    tables
        .trials_of_node(node)
        .filter(|t| !t.failed() && !t.is_repeat_trial)
        .collect()
}

/// Viable trials that are complete and have no pending async work
pub fn completed_viable_trials(tables: &Tables, node: NodeId) -> Vec<&Trial> {
    viable_trials(tables, node)
        .into_iter()
        .filter(|t| t.complete && !t.awaiting_async_process())
        .collect()
}

/// Whether `node` has enough processed trials to spawn a child
#[must_use]
pub fn ready_to_spawn(tables: &Tables, node: &Node) -> bool {
    completed_viable_trials(tables, node.id).len() >= node.target_num_trials as usize
}

/// Whether neither the network nor its head has pending async work
///
/// # Errors
/// `NotFound` if the network does not exist.
pub fn network_is_clean(tables: &Tables, network: NetworkId) -> Result<bool, StoreError> {
    if tables.network(network)?.awaiting_async_process() {
        return Ok(false);
    }
    Ok(peek_head(tables, network).map_or(true, |head| !head.awaiting_async_process()))
}

/// Whether the head can take another trial, or will after growth
///
/// A full head that is already [`ready_to_spawn`] counts as having
/// capacity: the growth attempt made before assignment replaces it with an
/// empty child. Only a head whose viable trials are still unanswered or
/// awaiting async work turns the participant away.
#[must_use]
pub fn head_has_capacity(tables: &Tables, network: NetworkId, trials_per_node: u32) -> bool {
    match peek_head(tables, network) {
        None => true,
        Some(head) => {
            viable_trials(tables, head.id).len() < trials_per_node as usize
                || ready_to_spawn(tables, head)
        }
    }
}

/// Add a child to the head if it is ready
///
/// A network whose nodes have all failed is re-seeded at degree 0.
/// Calling this repeatedly without new trials is a no-op after the first
/// success.
///
/// # Errors
/// Store errors, or paradigm errors from `summarize_trials`.
pub fn grow_network(
    tables: &mut Tables,
    paradigm: &dyn Paradigm,
    network: NetworkId,
    rng: &mut dyn RngCore,
) -> Result<Growth, SchedulerError> {
    {
        let net = tables.network(network)?;
        if net.failed() || net.awaiting_async_process() {
            return Ok(Growth::Blocked);
        }
    }

    let Some(head) = head_node(tables, network)? else {
        let propagate = tables
            .nodes_of(network)
            .first()
            .map_or(true, |n| n.propagate_failure);
        let source = seed_source(tables, paradigm, network, propagate, rng)?;
        info!(%network, %source, "network re-seeded");
        return Ok(Growth::Grew(source));
    };

    if tables.refresh_full(network)? {
        return Ok(Growth::Full);
    }

    let (new_node, network_definition) = {
        let node = tables.node(head)?;
        if node.awaiting_async_process() || !ready_to_spawn(tables, node) {
            return Ok(Growth::NotReady);
        }
        let trials = completed_viable_trials(tables, head);
        let seed = paradigm.summarize_trials(node, &trials, rng)?;
        let network_definition: Value = tables.network(network)?.definition.clone();
        (
            NewNode {
                network_id: network,
                degree: node.degree + 1,
                parent: Some(head),
                seed,
                definition: Value::Null,
                propagate_failure: node.propagate_failure,
            },
            network_definition,
        )
    };
    let new_node = NewNode {
        definition: paradigm.make_definition(&new_node.seed, new_node.degree, &network_definition, rng),
        ..new_node
    };
    let degree = new_node.degree;
    let child = tables.insert_node(new_node)?;
    let full = tables.refresh_full(network)?;
    info!(%network, parent = %head, %child, degree, full, "network grew");
    Ok(Growth::Grew(child))
}

/// Whether non-failed node degrees are exactly `0..n` with no duplicates
#[must_use]
pub fn degrees_contiguous(tables: &Tables, network: NetworkId) -> bool {
    tables
        .nodes_of(network)
        .into_iter()
        .filter(|n| !n.failed())
        .enumerate()
        .all(|(i, n)| n.degree as usize == i)
}
