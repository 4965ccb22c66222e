//! Trial maker and experiment configuration
//!
//! Configuration is explicit and validated up front: a scheduler cannot be
//! built from a [`TrialMakerConfig`] that fails [`TrialMakerConfig::validate`].
//! Durations are written in seconds.

use crate::error::ConfigError;
use relay_jobs::{DispatchMode, SupervisorConfig};
use relay_store::ChainScope;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How participant performance is scored
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceMethod {
    /// Fraction of non-failed trials, or mean trial score
    #[default]
    Accuracy,
    /// Agreement between original and repeat answers
    Consistency,
}

/// Performance gate settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Scoring method
    pub method: PerformanceMethod,
    /// `passed = score >= threshold`
    pub threshold: f64,
    /// Monte-Carlo resamples for the consistency score
    pub resamples: usize,
    /// Report `Pending` while any of the participant's trials await async work
    pub wait_for_async: bool,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            method: PerformanceMethod::Accuracy,
            threshold: 0.0,
            resamples: 1000,
            wait_for_async: true,
        }
    }
}

/// Settings for one chain trial maker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrialMakerConfig {
    /// Prefix for participant variables and the owner tag on networks
    pub id: String,
    /// `within` (private) or `across` (shared) chains
    pub chain_type: ChainScope,
    /// Registered paradigm name
    pub paradigm: String,
    /// Successful trials a node needs before it spawns a child
    pub trials_per_node: u32,
    /// Nodes at which a network is full
    pub target_num_nodes: u32,
    /// Networks created per participant (`within`)
    pub chains_per_participant: Option<u32>,
    /// Networks created per block and participant group (`across`)
    pub chains_per_experiment: Option<u32>,
    /// Cap on non-repeat trials per participant
    pub max_trials_per_participant: Option<u32>,
    /// Let participants return to networks they already visited
    pub allow_revisiting_networks_in_across_chains: bool,
    /// Tell participants to wait rather than exit while networks are busy
    pub wait_for_networks: bool,
    /// Repeat trials given after the main phase
    pub num_repeat_trials: u32,
    /// Whether failing a trial fails the nodes grown from it
    pub propagate_failure: bool,
    /// Fail a participant's trials when they leave early
    pub fail_trials_on_premature_exit: bool,
    /// Fail a participant's trials when they fail a performance check
    pub fail_trials_on_participant_performance_check: bool,
    /// Run the performance check when the participant runs out of trials
    pub check_performance_at_end: bool,
    /// Run the performance check after every finalized trial
    pub check_performance_every_trial: bool,
    /// Performance gate settings
    pub performance: PerformanceConfig,
    /// Registered recruitment criterion; defaults by chain type
    pub recruit_criterion: Option<String>,
    /// Participants wanted by the `num_participants` criterion
    pub target_num_participants: Option<u32>,
    /// Blocks, in the order participants visit them
    pub blocks: Vec<String>,
    /// Participant groups; networks are created per group
    pub participant_groups: Vec<String>,
    /// Job function run on each finalized trial
    pub async_post_trial: Option<String>,
    /// Job function run on each network after it grows
    pub async_post_grow: Option<String>,
    /// Timeout attached to jobs queued by the scheduler
    #[serde(with = "relay_jobs::duration_secs")]
    pub async_timeout: Duration,
    /// Seed for the scheduler's random generator
    pub seed: Option<u64>,
}

impl Default for TrialMakerConfig {
    fn default() -> Self {
        Self {
            id: "chain".to_string(),
            chain_type: ChainScope::Across,
            paradigm: "transmission".to_string(),
            trials_per_node: 1,
            target_num_nodes: 3,
            chains_per_participant: None,
            chains_per_experiment: Some(1),
            max_trials_per_participant: None,
            allow_revisiting_networks_in_across_chains: false,
            wait_for_networks: false,
            num_repeat_trials: 0,
            propagate_failure: true,
            fail_trials_on_premature_exit: true,
            fail_trials_on_participant_performance_check: true,
            check_performance_at_end: false,
            check_performance_every_trial: false,
            performance: PerformanceConfig::default(),
            recruit_criterion: None,
            target_num_participants: None,
            blocks: vec!["default".to_string()],
            participant_groups: vec!["default".to_string()],
            async_post_trial: None,
            async_post_grow: None,
            async_timeout: Duration::from_secs(5 * 60),
            seed: None,
        }
    }
}

impl TrialMakerConfig {
    /// Default `within` configuration with `chains` networks per participant
    #[must_use]
    pub fn within(chains: u32) -> Self {
        Self {
            chain_type: ChainScope::Within,
            chains_per_participant: Some(chains),
            chains_per_experiment: None,
            ..Self::default()
        }
    }

    /// Default `across` configuration with `chains` networks per block and group
    #[must_use]
    pub fn across(chains: u32) -> Self {
        Self {
            chain_type: ChainScope::Across,
            chains_per_experiment: Some(chains),
            ..Self::default()
        }
    }

    /// Set the trial maker id
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the paradigm name
    #[must_use]
    pub fn with_paradigm(mut self, paradigm: impl Into<String>) -> Self {
        self.paradigm = paradigm.into();
        self
    }

    /// Set trials per node and target nodes
    #[must_use]
    pub fn with_growth(mut self, trials_per_node: u32, target_num_nodes: u32) -> Self {
        self.trials_per_node = trials_per_node;
        self.target_num_nodes = target_num_nodes;
        self
    }

    /// Seed the scheduler's random generator
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Recruitment criterion name after applying the chain-type default
    #[must_use]
    pub fn recruit_criterion(&self) -> &str {
        match (&self.recruit_criterion, self.chain_type) {
            (Some(name), _) => name.as_str(),
            (None, ChainScope::Within) => "num_participants",
            (None, ChainScope::Across) => "num_trials",
        }
    }

    /// Participant variable holding a per-trial-maker counter or list
    #[must_use]
    pub fn var_name(&self, suffix: &str) -> String {
        format!("{}__{suffix}", self.id)
    }

    /// Reject contradictory or degenerate settings
    ///
    /// # Errors
    /// `ConfigError::Invalid` naming the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.id.is_empty() {
            return invalid("id must not be empty".into());
        }
        if self.trials_per_node == 0 {
            return invalid("trials_per_node must be at least 1".into());
        }
        if self.target_num_nodes == 0 {
            return invalid("target_num_nodes must be at least 1".into());
        }
        if self.blocks.is_empty() || self.participant_groups.is_empty() {
            return invalid("blocks and participant_groups must not be empty".into());
        }
        if !self.performance.threshold.is_finite() {
            return invalid("performance threshold must be finite".into());
        }
        if self.performance.method == PerformanceMethod::Consistency && self.performance.resamples == 0 {
            return invalid("consistency checks need at least one resample".into());
        }

        match self.chain_type {
            ChainScope::Within => {
                if self.chains_per_participant.unwrap_or(0) == 0 {
                    return invalid("within chains require chains_per_participant >= 1".into());
                }
                if self.chains_per_experiment.is_some() {
                    return invalid("chains_per_experiment only applies to across chains".into());
                }
                if self.recruit_criterion() == "num_trials" {
                    return invalid(
                        "the num_trials recruitment criterion is undefined for within chains".into(),
                    );
                }
            }
            ChainScope::Across => {
                let chains = self.chains_per_experiment.unwrap_or(0);
                if chains == 0 {
                    return invalid("across chains require chains_per_experiment >= 1".into());
                }
                if self.chains_per_participant.is_some() {
                    return invalid("chains_per_participant only applies to within chains".into());
                }
                let visitable = u64::from(chains) * self.blocks.len() as u64;
                if let Some(max) = self.max_trials_per_participant {
                    if !self.allow_revisiting_networks_in_across_chains && u64::from(max) > visitable {
                        return invalid(format!(
                            "max_trials_per_participant ({max}) exceeds the {visitable} networks a \
                             participant can visit without revisiting"
                        ));
                    }
                }
            }
        }

        if self.recruit_criterion() == "num_participants" && self.target_num_participants.is_none() {
            return invalid("the num_participants criterion requires target_num_participants".into());
        }
        Ok(())
    }
}

/// Everything needed to run one experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Trial maker settings
    pub trial_maker: TrialMakerConfig,
    /// Timeout supervisor settings
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Job dispatch strategy
    #[serde(default)]
    pub dispatch: DispatchMode,
}

impl ExperimentConfig {
    /// Parse and validate TOML
    ///
    /// # Errors
    /// Parse errors or `ConfigError::Invalid`.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.trial_maker.validate()?;
        Ok(config)
    }

    /// Parse and validate YAML
    ///
    /// # Errors
    /// Parse errors or `ConfigError::Invalid`.
    pub fn from_yaml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(input)?;
        config.trial_maker.validate()?;
        Ok(config)
    }

    /// Load from a `.toml`, `.yaml` or `.yml` file
    ///
    /// # Errors
    /// I/O, parse, format or validation errors.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        let config = match extension {
            "toml" => Self::from_toml_str(&input)?,
            "yaml" | "yml" => Self::from_yaml_str(&input)?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };
        tracing::info!(path = %path.display(), trial_maker = %config.trial_maker.id, "configuration loaded");
        Ok(config)
    }
}
