//! Recruitment criteria
//!
//! A criterion estimates how much more participant work the experiment
//! needs. Criteria live in a plain name-keyed registry, resolved once when
//! the scheduler is built.

use crate::chain::{completed_viable_trials, peek_head};
use crate::config::TrialMakerConfig;
use crate::error::SchedulerError;
use relay_store::{ChainScope, Failable, Tables};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Strategy for deciding whether more participants are needed
pub trait RecruitmentCriterion: Send + Sync {
    /// Registry name
    fn name(&self) -> &'static str;

    /// Units of work still required (trials or participants)
    fn num_still_required(&self, tables: &Tables, config: &TrialMakerConfig) -> u64;
}

/// Trials still needed to fill every live `across` network
///
/// For each network that is neither failed nor full, with `r` nodes still
/// to grow and `c` completed trials on the head:
/// `r * trials_per_node - min(c, trials_per_node)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NumTrials;

impl RecruitmentCriterion for NumTrials {
    fn name(&self) -> &'static str {
        "num_trials"
    }

    fn num_still_required(&self, tables: &Tables, config: &TrialMakerConfig) -> u64 {
        tables
            .networks()
            .filter(|n| n.trial_maker_id == config.id && n.scope == ChainScope::Across)
            .filter(|n| !n.failed() && !n.full)
            .map(|network| {
                let per_node = u64::from(network.trials_per_node);
                let alive = tables.num_alive_nodes(network.id) as u64;
                let remaining = u64::from(network.target_num_nodes).saturating_sub(alive);
                let on_head = peek_head(tables, network.id)
                    .map_or(0, |head| completed_viable_trials(tables, head.id).len() as u64);
                (remaining * per_node).saturating_sub(on_head.min(per_node))
            })
            .sum()
    }
}

/// Participants still needed to reach `target_num_participants`
///
/// A participant counts once they have completed a trial of this trial maker
/// and have not failed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NumParticipants;

impl RecruitmentCriterion for NumParticipants {
    fn name(&self) -> &'static str {
        "num_participants"
    }

    fn num_still_required(&self, tables: &Tables, config: &TrialMakerConfig) -> u64 {
        let target = u64::from(config.target_num_participants.unwrap_or(0));
        let contributors: HashSet<_> = tables
            .trials()
            .filter(|t| t.trial_maker_id == config.id && t.complete)
            .map(|t| t.participant_id)
            .collect();
        let active = tables
            .participants()
            .filter(|p| !p.failed() && contributors.contains(&p.id))
            .count() as u64;
        target.saturating_sub(active)
    }
}

/// Name to criterion map
#[derive(Clone, Default)]
pub struct RecruitmentRegistry {
    criteria: HashMap<String, Arc<dyn RecruitmentCriterion>>,
}

impl RecruitmentRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `num_trials` and `num_participants`
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(NumTrials));
        registry.register(Arc::new(NumParticipants));
        registry
    }

    /// Register `criterion` under its name, replacing any previous one
    pub fn register(&mut self, criterion: Arc<dyn RecruitmentCriterion>) {
        self.criteria.insert(criterion.name().to_string(), criterion);
    }

    /// # Errors
    /// `SchedulerError::UnknownRecruitmentCriterion` if `name` is not registered.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn RecruitmentCriterion>, SchedulerError> {
        self.criteria
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownRecruitmentCriterion(name.to_string()))
    }
}

impl fmt::Debug for RecruitmentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.criteria.keys().collect();
        names.sort();
        f.debug_struct("RecruitmentRegistry").field("criteria", &names).finish()
    }
}
