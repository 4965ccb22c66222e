//! Paradigms
//!
//! A paradigm decides what a chain carries from node to node: how a source
//! node is seeded, how a parent's completed trials become a child's seed,
//! what a participant is shown, and how an answer is normalized and scored.
//!
//! Built-ins:
//! - `transmission`: iterated reproduction of a value
//! - `gibbs`: Gibbs sampling with people over a bounded vector
//! - `mcmcp`: Markov chain Monte Carlo with people (current vs. proposal)

use crate::error::SchedulerError;
use dashmap::DashMap;
use rand::{Rng, RngCore};
use relay_store::{Node, Trial};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

/// Chain paradigm strategy
pub trait Paradigm: Send + Sync {
    /// Registry name
    fn name(&self) -> &'static str;

    /// Definition shared by every node of a new network
    fn network_definition(&self, _rng: &mut dyn RngCore) -> Value {
        Value::Null
    }

    /// Seed of the degree-0 node
    fn source_seed(&self, network_definition: &Value, rng: &mut dyn RngCore) -> Value;

    /// Seed of a child node, from its parent's viable completed trials
    ///
    /// # Errors
    /// `SchedulerError::Paradigm` if the answers cannot be combined.
    fn summarize_trials(
        &self,
        parent: &Node,
        trials: &[&Trial],
        rng: &mut dyn RngCore,
    ) -> Result<Value, SchedulerError>;

    /// Node definition derived from its seed
    fn make_definition(
        &self,
        seed: &Value,
        degree: u32,
        network_definition: &Value,
        rng: &mut dyn RngCore,
    ) -> Value;

    /// Definition of a new trial at `node`
    fn trial_definition(&self, node: &Node, _rng: &mut dyn RngCore) -> Value {
        node.definition.clone()
    }

    /// What the participant is shown
    fn show_trial(&self, trial: &Trial) -> Value {
        json!({ "trial_id": trial.id.get(), "definition": trial.definition })
    }

    /// Validate and normalize a raw answer
    ///
    /// # Errors
    /// `SchedulerError::Paradigm` if the answer is malformed.
    fn normalize_answer(&self, _trial: &Trial, raw: Value) -> Result<Value, SchedulerError> {
        Ok(raw)
    }

    /// Score in `[0, 1]` used by the accuracy check, if the paradigm has one
    fn score_answer(&self, _trial: &Trial, _answer: &Value) -> Option<f64> {
        None
    }
}

fn answers<'a>(trials: &'a [&Trial]) -> impl Iterator<Item = &'a Value> + 'a {
    trials.iter().filter_map(|t| t.answer.as_ref())
}

fn numeric_mean<'a>(values: impl Iterator<Item = &'a Value>) -> Option<f64> {
    let mut sum = 0.0;
    let mut count = 0usize;
    for value in values {
        sum += value.as_f64()?;
        count += 1;
    }
    (count > 0).then(|| sum / count as f64)
}

// ---------------------------------------------------------------------------
// Transmission
// ---------------------------------------------------------------------------

/// Iterated reproduction: each node shows what the previous generation
/// produced
///
/// Numeric answers from several trials are averaged; otherwise the most
/// recent answer is passed on. A network definition may fix the source seed
/// with `{"source_seed": ...}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Transmission;

impl Paradigm for Transmission {
    fn name(&self) -> &'static str {
        "transmission"
    }

    fn source_seed(&self, network_definition: &Value, rng: &mut dyn RngCore) -> Value {
        network_definition
            .get("source_seed")
            .cloned()
            .unwrap_or_else(|| json!(rng.gen::<f64>()))
    }

    fn summarize_trials(
        &self,
        parent: &Node,
        trials: &[&Trial],
        _rng: &mut dyn RngCore,
    ) -> Result<Value, SchedulerError> {
        if let Some(mean) = numeric_mean(answers(trials)) {
            return Ok(json!(mean));
        }
        trials
            .iter()
            .filter(|t| t.answer.is_some())
            .max_by_key(|t| (t.completed_at, t.id))
            .and_then(|t| t.answer.clone())
            .ok_or_else(|| SchedulerError::Paradigm(format!("{} has no answers to pass on", parent.id)))
    }

    fn make_definition(&self, seed: &Value, _degree: u32, _network: &Value, _rng: &mut dyn RngCore) -> Value {
        seed.clone()
    }

    fn score_answer(&self, trial: &Trial, answer: &Value) -> Option<f64> {
        let target = trial.definition.as_f64()?;
        let given = answer.as_f64()?;
        Some((1.0 - (target - given).abs()).clamp(0.0, 1.0))
    }
}

// ---------------------------------------------------------------------------
// Gibbs sampling with people
// ---------------------------------------------------------------------------

/// Gibbs sampler: each node fixes all dimensions but one, which the
/// participant sets
///
/// Node definitions are `{"vector": [...], "active_index": i}` with
/// `i = degree % dimensions`. The network definition carries
/// `{"dimensions": d, "min": lo, "max": hi}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Gibbs;

impl Gibbs {
    const DIMENSIONS: u64 = 3;
    const MIN: f64 = -1.0;
    const MAX: f64 = 1.0;

    fn bounds(network_definition: &Value) -> (f64, f64) {
        let lo = network_definition.get("min").and_then(Value::as_f64).unwrap_or(Self::MIN);
        let hi = network_definition.get("max").and_then(Value::as_f64).unwrap_or(Self::MAX);
        if lo < hi {
            (lo, hi)
        } else {
            (Self::MIN, Self::MAX)
        }
    }

    fn vector(definition: &Value) -> Option<Vec<f64>> {
        definition
            .get("vector")?
            .as_array()?
            .iter()
            .map(Value::as_f64)
            .collect()
    }
}

impl Paradigm for Gibbs {
    fn name(&self) -> &'static str {
        "gibbs"
    }

    fn network_definition(&self, _rng: &mut dyn RngCore) -> Value {
        json!({ "dimensions": Self::DIMENSIONS, "min": Self::MIN, "max": Self::MAX })
    }

    fn source_seed(&self, network_definition: &Value, rng: &mut dyn RngCore) -> Value {
        let dimensions = network_definition
            .get("dimensions")
            .and_then(Value::as_u64)
            .unwrap_or(Self::DIMENSIONS)
            .max(1);
        let (lo, hi) = Self::bounds(network_definition);
        let vector: Vec<f64> = (0..dimensions).map(|_| rng.gen_range(lo..hi)).collect();
        json!(vector)
    }

    fn summarize_trials(
        &self,
        parent: &Node,
        trials: &[&Trial],
        _rng: &mut dyn RngCore,
    ) -> Result<Value, SchedulerError> {
        let mut vector = Self::vector(&parent.definition)
            .ok_or_else(|| SchedulerError::Paradigm(format!("{} has no gibbs vector", parent.id)))?;
        let active = parent
            .definition
            .get("active_index")
            .and_then(Value::as_u64)
            .and_then(|i| usize::try_from(i).ok())
            .filter(|i| *i < vector.len())
            .ok_or_else(|| SchedulerError::Paradigm(format!("{} has no active index", parent.id)))?;
        let mean = numeric_mean(answers(trials))
            .ok_or_else(|| SchedulerError::Paradigm("gibbs answers must be numeric".into()))?;
        vector[active] = mean;
        Ok(json!(vector))
    }

    fn make_definition(&self, seed: &Value, degree: u32, _network: &Value, _rng: &mut dyn RngCore) -> Value {
        let len = seed.as_array().map_or(1, Vec::len).max(1);
        json!({ "vector": seed, "active_index": degree as usize % len })
    }

    fn normalize_answer(&self, trial: &Trial, raw: Value) -> Result<Value, SchedulerError> {
        let value = raw
            .as_f64()
            .ok_or_else(|| SchedulerError::Paradigm(format!("{}: gibbs answers must be numbers", trial.id)))?;
        Ok(json!(value))
    }
}

// ---------------------------------------------------------------------------
// MCMC with people
// ---------------------------------------------------------------------------

/// MCMCP: participants choose between the current state and a proposal
///
/// Node definitions are `{"current": x, "proposal": y}`; answers are the
/// strings `"current"` or `"proposal"`. Proposals are drawn uniformly within
/// `proposal_step` of the current state.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mcmcp;

impl Mcmcp {
    const PROPOSAL_STEP: f64 = 0.1;
}

impl Paradigm for Mcmcp {
    fn name(&self) -> &'static str {
        "mcmcp"
    }

    fn network_definition(&self, _rng: &mut dyn RngCore) -> Value {
        json!({ "proposal_step": Self::PROPOSAL_STEP })
    }

    fn source_seed(&self, network_definition: &Value, rng: &mut dyn RngCore) -> Value {
        network_definition
            .get("source_seed")
            .cloned()
            .unwrap_or_else(|| json!(rng.gen::<f64>()))
    }

    fn summarize_trials(
        &self,
        parent: &Node,
        trials: &[&Trial],
        rng: &mut dyn RngCore,
    ) -> Result<Value, SchedulerError> {
        let (mut current, mut proposal) = (0usize, 0usize);
        for answer in answers(trials) {
            match answer.as_str() {
                Some("current") => current += 1,
                Some("proposal") => proposal += 1,
                _ => {}
            }
        }
        let pick_proposal = match proposal.cmp(&current) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => rng.gen_bool(0.5),
        };
        let key = if pick_proposal { "proposal" } else { "current" };
        parent
            .definition
            .get(key)
            .cloned()
            .ok_or_else(|| SchedulerError::Paradigm(format!("{} has no {key} state", parent.id)))
    }

    fn make_definition(&self, seed: &Value, _degree: u32, network: &Value, rng: &mut dyn RngCore) -> Value {
        let step = network
            .get("proposal_step")
            .and_then(Value::as_f64)
            .filter(|s| *s > 0.0)
            .unwrap_or(Self::PROPOSAL_STEP);
        let proposal = seed.as_f64().map_or(Value::Null, |x| json!(x + rng.gen_range(-step..step)));
        json!({ "current": seed, "proposal": proposal })
    }

    fn show_trial(&self, trial: &Trial) -> Value {
        // presentation order is part of the trial definition
        json!({
            "trial_id": trial.id.get(),
            "first": trial.definition.get("first"),
            "second": trial.definition.get("second"),
        })
    }

    fn trial_definition(&self, node: &Node, rng: &mut dyn RngCore) -> Value {
        let current = node.definition.get("current").cloned().unwrap_or(Value::Null);
        let proposal = node.definition.get("proposal").cloned().unwrap_or(Value::Null);
        let (first, second) = if rng.gen_bool(0.5) {
            (json!({"role": "current", "value": current}), json!({"role": "proposal", "value": proposal}))
        } else {
            (json!({"role": "proposal", "value": proposal}), json!({"role": "current", "value": current}))
        };
        json!({ "first": first, "second": second })
    }

    fn normalize_answer(&self, trial: &Trial, raw: Value) -> Result<Value, SchedulerError> {
        // accept a role name or the presented position
        let role = match raw.as_str() {
            Some(role @ ("current" | "proposal")) => role.to_string(),
            Some(position @ ("first" | "second")) => trial
                .definition
                .get(position)
                .and_then(|p| p.get("role"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| SchedulerError::Paradigm(format!("{}: malformed definition", trial.id)))?,
            _ => {
                return Err(SchedulerError::Paradigm(format!(
                    "{}: answer must be current, proposal, first or second",
                    trial.id
                )))
            }
        };
        Ok(Value::String(role))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Name to paradigm map
#[derive(Clone, Default)]
pub struct ParadigmRegistry {
    paradigms: Arc<DashMap<String, Arc<dyn Paradigm>>>,
}

impl ParadigmRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `transmission`, `gibbs` and `mcmcp`
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(Transmission));
        registry.register(Arc::new(Gibbs));
        registry.register(Arc::new(Mcmcp));
        registry
    }

    /// Register under the paradigm's own name
    pub fn register(&self, paradigm: Arc<dyn Paradigm>) {
        self.paradigms.insert(paradigm.name().to_string(), paradigm);
    }

    /// # Errors
    /// `SchedulerError::UnknownParadigm` if nothing is registered as `name`.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Paradigm>, SchedulerError> {
        self.paradigms
            .get(name)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| SchedulerError::UnknownParadigm(name.to_string()))
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.paradigms.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl fmt::Debug for ParadigmRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParadigmRegistry").field("paradigms", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use relay_store::{AsyncState, Failure, NetworkId, NodeId, ParticipantId, TrialId};

    fn node(definition: Value) -> Node {
        Node {
            id: NodeId(1),
            network_id: NetworkId(1),
            degree: 0,
            parent: None,
            child: None,
            seed: Value::Null,
            definition,
            propagate_failure: true,
            target_num_trials: 1,
            created_at: Utc::now(),
            failure: Failure::default(),
            async_state: AsyncState::default(),
        }
    }

    fn trial(id: u64, definition: Value, answer: Value) -> Trial {
        Trial {
            id: TrialId(id),
            network_id: NetworkId(1),
            node_id: NodeId(1),
            participant_id: ParticipantId(1),
            trial_maker_id: "tm".into(),
            complete: true,
            is_repeat_trial: false,
            parent_trial: None,
            propagate_failure: true,
            definition,
            answer: Some(answer),
            score: None,
            created_at: Utc::now(),
            completed_at: Some(Utc::now()),
            failure: Failure::default(),
            async_state: AsyncState::default(),
        }
    }

    #[test]
    fn registry_resolves_builtins() {
        let registry = ParadigmRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["gibbs", "mcmcp", "transmission"]);
        assert!(matches!(
            registry.resolve("nope"),
            Err(SchedulerError::UnknownParadigm(_))
        ));
    }

    #[test]
    fn transmission_averages_numeric_answers() {
        let mut rng = StdRng::seed_from_u64(1);
        let a = trial(1, json!(0.5), json!(0.2));
        let b = trial(2, json!(0.5), json!(0.4));
        let seed = Transmission.summarize_trials(&node(json!(0.5)), &[&a, &b], &mut rng).unwrap();
        assert!((seed.as_f64().unwrap() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn transmission_passes_on_latest_text_answer() {
        let mut rng = StdRng::seed_from_u64(1);
        let a = trial(1, json!("x"), json!("hello"));
        let b = trial(2, json!("x"), json!("world"));
        let seed = Transmission.summarize_trials(&node(json!("x")), &[&a, &b], &mut rng).unwrap();
        assert_eq!(seed, json!("world"));
    }

    #[test]
    fn transmission_scores_reproduction_error() {
        let t = trial(1, json!(0.5), Value::Null);
        assert_eq!(Transmission.score_answer(&t, &json!(0.75)), Some(0.75));
        assert_eq!(Transmission.score_answer(&t, &json!("x")), None);
    }

    #[test]
    fn gibbs_replaces_active_dimension() {
        let mut rng = StdRng::seed_from_u64(1);
        let definition = Gibbs.make_definition(&json!([0.1, 0.2, 0.3]), 1, &Value::Null, &mut rng);
        assert_eq!(definition["active_index"], json!(1));

        let parent = node(definition);
        let t = trial(1, Value::Null, json!(0.9));
        let seed = Gibbs.summarize_trials(&parent, &[&t], &mut rng).unwrap();
        assert_eq!(seed, json!([0.1, 0.9, 0.3]));
    }

    #[test]
    fn gibbs_source_seed_respects_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let network = json!({"dimensions": 4, "min": 0.0, "max": 2.0});
        let seed = Gibbs.source_seed(&network, &mut rng);
        let values = seed.as_array().unwrap();
        assert_eq!(values.len(), 4);
        assert!(values.iter().all(|v| (0.0..2.0).contains(&v.as_f64().unwrap())));
    }

    #[test]
    fn mcmcp_follows_the_chosen_state() {
        let mut rng = StdRng::seed_from_u64(3);
        let parent = node(json!({"current": 0.5, "proposal": 0.55}));
        let t = trial(1, Value::Null, json!("proposal"));
        let seed = Mcmcp.summarize_trials(&parent, &[&t], &mut rng).unwrap();
        assert_eq!(seed, json!(0.55));
    }

    #[test]
    fn mcmcp_normalizes_positions_to_roles() {
        let mut rng = StdRng::seed_from_u64(3);
        let n = node(json!({"current": 0.5, "proposal": 0.55}));
        let definition = Mcmcp.trial_definition(&n, &mut rng);
        let t = trial(1, definition.clone(), Value::Null);

        let role = Mcmcp.normalize_answer(&t, json!("first")).unwrap();
        assert_eq!(role, definition["first"]["role"]);
        assert!(Mcmcp.normalize_answer(&t, json!(3)).is_err());
    }
}
