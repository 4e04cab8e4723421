use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use goap_actions::CostModel;
use goap_learning::{LearningConfig, ReusePolicy};
use serde::{Deserialize, Serialize};

/// Engine configuration, usually read from `goap.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoapConfig {
    /// Search budgets.
    #[serde(default)]
    pub search: SearchConfig,
    /// Cost model.
    #[serde(default)]
    pub costs: CostConfig,
    /// Plan reuse.
    #[serde(default)]
    pub reuse: ReuseConfig,
    /// Executor.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Tabular learning.
    #[serde(default)]
    pub learning: LearningSection,
    /// Log and event destinations.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl GoapConfig {
    /// Loads and validates configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading goap config {}", path.display()))?;
        let mut config: Self =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.telemetry.resolve_relative(base);
        if let Some(path) = config.learning.q_table_path.as_mut() {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Parses configuration from TOML text.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("parsing goap config")?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.search.max_iterations == 0 {
            bail!("search.max_iterations must be positive");
        }
        if self.search.timeout_ms == 0 {
            bail!("search.timeout_ms must be positive");
        }
        if self.search.numeric_normalization <= 0.0 || !self.search.numeric_normalization.is_finite() {
            bail!("search.numeric_normalization must be a positive number");
        }
        if self.search.max_plan_length == 0 {
            bail!("search.max_plan_length must be positive");
        }
        if !(0.0..=1.0).contains(&self.costs.ema_alpha) || self.costs.ema_alpha == 0.0 {
            bail!("costs.ema_alpha must lie in (0, 1]");
        }
        if self.costs.penalty_weight < 0.0 {
            bail!("costs.penalty_weight must not be negative");
        }
        if !(0.0..=1.0).contains(&self.costs.initial_success_rate) {
            bail!("costs.initial_success_rate must lie in [0, 1]");
        }
        if self.reuse.threshold <= 0.0 || self.reuse.threshold > 1.0 {
            bail!("reuse.threshold must lie in (0, 1]");
        }
        if self.reuse.max_threshold < self.reuse.threshold || self.reuse.max_threshold > 1.0 {
            bail!("reuse.max_threshold must lie in [reuse.threshold, 1]");
        }
        if self.reuse.raise_step < 0.0 {
            bail!("reuse.raise_step must not be negative");
        }
        if self.execution.step_timeout_ms == 0 {
            bail!("execution.step_timeout_ms must be positive");
        }
        if !(0.0..=1.0).contains(&self.learning.learning_rate)
            || !(0.0..=1.0).contains(&self.learning.discount)
        {
            bail!("learning.learning_rate and learning.discount must lie in [0, 1]");
        }
        if self.learning.bucket_size <= 0.0 {
            bail!("learning.bucket_size must be positive");
        }
        Ok(())
    }

    /// Cost model for the action library.
    #[must_use]
    pub const fn cost_model(&self) -> CostModel {
        CostModel {
            penalty_weight: self.costs.penalty_weight,
        }
    }

    /// Reuse policy for the tracker.
    #[must_use]
    pub const fn reuse_policy(&self) -> ReusePolicy {
        ReusePolicy {
            threshold: self.reuse.threshold,
            raise_step: self.reuse.raise_step,
            max_threshold: self.reuse.max_threshold,
            min_samples: self.reuse.min_samples,
        }
    }

    /// Learner settings; distance normalization follows the search.
    #[must_use]
    pub const fn learning_config(&self) -> LearningConfig {
        LearningConfig {
            learning_rate: self.learning.learning_rate,
            discount: self.learning.discount,
            bucket_size: self.learning.bucket_size,
            failure_penalty: self.learning.failure_penalty,
            normalization: self.search.numeric_normalization,
        }
    }
}

/// Search budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Maximum nodes popped per search.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Wall clock budget per search.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Divisor applied to numeric gaps in the heuristic.
    #[serde(default = "default_normalization")]
    pub numeric_normalization: f64,
    /// Longest plan the search will build.
    #[serde(default = "default_max_plan_length")]
    pub max_plan_length: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            timeout_ms: default_timeout_ms(),
            numeric_normalization: default_normalization(),
            max_plan_length: default_max_plan_length(),
        }
    }
}

/// Cost model settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostConfig {
    /// EMA smoothing factor for success rates.
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,
    /// Weight of the unreliability penalty.
    #[serde(default = "default_one")]
    pub penalty_weight: f64,
    /// Success rate assumed for unseen actions.
    #[serde(default = "default_one")]
    pub initial_success_rate: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            ema_alpha: default_ema_alpha(),
            penalty_weight: default_one(),
            initial_success_rate: default_one(),
        }
    }
}

/// Plan reuse settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReuseConfig {
    /// Whether stored plans are consulted before search.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Initial cosine similarity threshold.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Increment applied when reuse underperforms.
    #[serde(default = "default_raise_step")]
    pub raise_step: f64,
    /// Threshold ceiling.
    #[serde(default = "default_max_threshold")]
    pub max_threshold: f64,
    /// Runs of each kind needed before adapting.
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,
}

impl Default for ReuseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_threshold(),
            raise_step: default_raise_step(),
            max_threshold: default_max_threshold(),
            min_samples: default_min_samples(),
        }
    }
}

/// Executor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Replans allowed per execution.
    #[serde(default = "default_max_replans")]
    pub max_replans: usize,
    /// Upper bound for a single capability call.
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_replans: default_max_replans(),
            step_timeout_ms: default_step_timeout_ms(),
        }
    }
}

/// Tabular learning settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningSection {
    /// Q-learning rate.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Q-learning discount.
    #[serde(default = "default_discount")]
    pub discount: f64,
    /// Width of numeric state buckets.
    #[serde(default = "default_bucket_size")]
    pub bucket_size: f64,
    /// Reward for a failed step (negated).
    #[serde(default = "default_learning_rate")]
    pub failure_penalty: f64,
    /// JSON file keeping the Q-table across restarts.
    #[serde(default)]
    pub q_table_path: Option<PathBuf>,
}

impl Default for LearningSection {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            discount: default_discount(),
            bucket_size: default_bucket_size(),
            failure_penalty: default_learning_rate(),
            q_table_path: None,
        }
    }
}

/// Log and event destinations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// JSON-lines log file.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// JSON-lines event file.
    #[serde(default)]
    pub event_log: Option<PathBuf>,
}

impl TelemetryConfig {
    fn resolve_relative(&mut self, base: &Path) {
        for path in [&mut self.log_path, &mut self.event_log].into_iter().flatten() {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}

const fn default_max_iterations() -> usize {
    10_000
}

const fn default_timeout_ms() -> u64 {
    5_000
}

const fn default_normalization() -> f64 {
    10.0
}

const fn default_max_plan_length() -> usize {
    64
}

const fn default_ema_alpha() -> f64 {
    0.1
}

const fn default_one() -> f64 {
    1.0
}

const fn default_true() -> bool {
    true
}

const fn default_threshold() -> f64 {
    0.85
}

const fn default_raise_step() -> f64 {
    0.02
}

const fn default_max_threshold() -> f64 {
    0.98
}

const fn default_min_samples() -> u64 {
    5
}

const fn default_max_replans() -> usize {
    3
}

const fn default_step_timeout_ms() -> u64 {
    30_000
}

const fn default_learning_rate() -> f64 {
    0.1
}

const fn default_discount() -> f64 {
    0.9
}

const fn default_bucket_size() -> f64 {
    10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_document_uses_defaults() {
        let config = GoapConfig::from_toml("").unwrap();
        assert_eq!(config, GoapConfig::default());
        assert_eq!(config.search.max_iterations, 10_000);
        assert_eq!(config.execution.max_replans, 3);
        assert!((config.reuse.threshold - 0.85).abs() < f64::EPSILON);
    }

    #[test]
    fn loads_partial_sections_and_resolves_paths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("goap.toml");
        fs::write(
            &path,
            r#"
[search]
max_iterations = 500

[reuse]
threshold = 0.9

[learning]
q_table_path = "state/q-table.json"

[telemetry]
log_path = "logs/goap.jsonl"
"#,
        )
        .unwrap();
        let config = GoapConfig::load(&path).unwrap();
        assert_eq!(config.search.max_iterations, 500);
        assert_eq!(config.search.timeout_ms, 5_000);
        assert!((config.reuse_policy().threshold - 0.9).abs() < f64::EPSILON);
        assert_eq!(
            config.telemetry.log_path.unwrap(),
            dir.path().join("logs/goap.jsonl")
        );
        assert_eq!(
            config.learning.q_table_path.unwrap(),
            dir.path().join("state/q-table.json")
        );
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(GoapConfig::from_toml("[reuse]\nthreshold = 1.5").is_err());
        assert!(GoapConfig::from_toml("[search]\nmax_iterations = 0").is_err());
        assert!(GoapConfig::from_toml("[costs]\nema_alpha = 0.0").is_err());
    }
}
