//! Participant performance scoring
//!
//! Two scores are supported:
//! - accuracy: fraction of non-repeat trials that did not fail, or the mean
//!   trial score when every trial carries one (a failed trial scores 0)
//! - consistency: Monte-Carlo average of the correlation between original
//!   and repeat answers, resampling one pair per node
//!
//! A missing score (too little data) passes.

use crate::config::{PerformanceConfig, PerformanceMethod};
use rand::{Rng, RngCore};
use relay_store::{Failable, NodeId, Trial, TrialId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Score and verdict
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceResult {
    /// Score, or `None` when there is too little data
    pub score: Option<f64>,
    /// Whether the score reached the threshold
    pub passed: bool,
}

impl PerformanceResult {
    /// Result for `score` against `threshold`; a missing score passes
    #[must_use]
    pub fn new(score: Option<f64>, threshold: f64) -> Self {
        Self {
            score,
            passed: score.map_or(true, |s| s >= threshold),
        }
    }
}

/// Outcome of a checkpoint that may wait for async work
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PerformanceCheck {
    /// Some of the participant's trials still await async work
    Pending,
    /// Checked
    Done(PerformanceResult),
}

/// Accuracy over non-repeat trials
///
/// Failed trials count as zero whether or not they were scored.
#[must_use]
pub fn accuracy(trials: &[&Trial]) -> Option<f64> {
    let originals: Vec<&Trial> = trials.iter().copied().filter(|t| !t.is_repeat_trial).collect();
    if originals.is_empty() {
        return None;
    }
    let n = originals.len() as f64;
    let scores: Option<Vec<f64>> = originals
        .iter()
        .map(|t| t.score.map(|score| if t.failed() { 0.0 } else { score }))
        .collect();
    match scores {
        Some(scores) => Some(scores.iter().sum::<f64>() / n),
        None => Some(originals.iter().filter(|t| !t.failed()).count() as f64 / n),
    }
}

/// Original/repeat answer pairs grouped by the original's node
fn answer_pairs<'a>(trials: &[&'a Trial]) -> BTreeMap<NodeId, Vec<(&'a Value, &'a Value)>> {
    let originals: HashMap<TrialId, &Trial> = trials
        .iter()
        .filter(|t| !t.is_repeat_trial)
        .map(|t| (t.id, *t))
        .collect();

    let mut pairs: BTreeMap<NodeId, Vec<(&Value, &Value)>> = BTreeMap::new();
    for repeat in trials.iter().copied().filter(|t| t.is_repeat_trial) {
        let Some(original) = repeat.parent_trial.and_then(|id| originals.get(&id).copied()) else {
            continue;
        };
        if let (Some(a), Some(b)) = (original.answer.as_ref(), repeat.answer.as_ref()) {
            pairs.entry(original.node_id).or_default().push((a, b));
        }
    }
    pairs
}

fn pearson(pairs: &[(f64, f64)]) -> Option<f64> {
    if pairs.len() < 2 {
        return None;
    }
    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
    for (x, y) in pairs {
        cov += (x - mean_x) * (y - mean_y);
        var_x += (x - mean_x).powi(2);
        var_y += (y - mean_y).powi(2);
    }
    let denominator = (var_x * var_y).sqrt();
    (denominator > 0.0).then(|| cov / denominator)
}

fn agreement(pairs: &[(&Value, &Value)]) -> Option<f64> {
    if pairs.is_empty() {
        return None;
    }
    let agree = pairs.iter().filter(|(a, b)| a == b).count();
    Some(agree as f64 / pairs.len() as f64)
}

/// Consistency between original and repeat answers
///
/// Numeric pairs use Pearson correlation; anything else uses the exact
/// agreement rate. Resamples whose correlation is undefined are skipped.
pub fn consistency(trials: &[&Trial], resamples: usize, rng: &mut dyn RngCore) -> Option<f64> {
    let pairs = answer_pairs(trials);
    if pairs.is_empty() {
        return None;
    }
    let numeric = pairs
        .values()
        .flatten()
        .all(|(a, b)| a.is_number() && b.is_number());

    let mut total = 0.0;
    let mut counted = 0usize;
    for _ in 0..resamples.max(1) {
        let sample: Vec<(&Value, &Value)> = pairs
            .values()
            .map(|candidates| candidates[rng.gen_range(0..candidates.len())])
            .collect();
        let score = if numeric {
            let values: Vec<(f64, f64)> = sample
                .iter()
                .filter_map(|(a, b)| Some((a.as_f64()?, b.as_f64()?)))
                .collect();
            pearson(&values)
        } else {
            agreement(&sample)
        };
        if let Some(score) = score {
            total += score;
            counted += 1;
        }
    }
    (counted > 0).then(|| total / counted as f64)
}

/// Score `trials` with the configured method and apply the threshold
pub fn evaluate(config: &PerformanceConfig, trials: &[&Trial], rng: &mut dyn RngCore) -> PerformanceResult {
    let score = match config.method {
        PerformanceMethod::Accuracy => accuracy(trials),
        PerformanceMethod::Consistency => consistency(trials, config.resamples, rng),
    };
    PerformanceResult::new(score, config.threshold)
}
