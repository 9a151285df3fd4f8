use std::path::Path;

use chrono::TimeDelta;
use config::{Config, ConfigError};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "analysis.toml";
const ENV_PREFIX: &str = "ANALYSIS";
/// Upper limit for any configured span or delay: ten years.
pub const MAX_CONFIGURED_SECS: u64 = 10 * 366 * 86_400;

/// Process-wide analysis settings, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub step: StepConfig,
    #[serde(default)]
    pub priority: PriorityConfig,
    #[serde(default)]
    pub pending: PendingConfig,
    #[serde(default)]
    pub cycle: CycleConfig,
    #[serde(default)]
    pub merge: MergeDefaults,
    #[serde(default)]
    pub conflict: ConflictRetryConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    #[serde(default = "default_min_span_secs")]
    pub min_span_secs: u64,
    /// Step used when a range has no upper bound and no span was computed yet.
    #[serde(default = "default_no_end_span_secs")]
    pub no_end_span_secs: u64,
    #[serde(default = "default_max_span_secs")]
    pub max_span_secs: u64,
    #[serde(default = "default_step_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_increase_threshold")]
    pub increase_threshold: f64,
    #[serde(default = "default_increase_rate")]
    pub increase_rate: f64,
}

fn default_min_span_secs() -> u64 {
    30
}

fn default_no_end_span_secs() -> u64 {
    86_400
}

fn default_max_span_secs() -> u64 {
    86_400
}

fn default_step_timeout_ms() -> u64 {
    8_000
}

fn default_increase_threshold() -> f64 {
    0.70
}

fn default_increase_rate() -> f64 {
    1.2
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            min_span_secs: default_min_span_secs(),
            no_end_span_secs: default_no_end_span_secs(),
            max_span_secs: default_max_span_secs(),
            timeout_ms: default_step_timeout_ms(),
            increase_threshold: default_increase_threshold(),
            increase_rate: default_increase_rate(),
        }
    }
}

impl StepConfig {
    pub fn min_span(&self) -> TimeDelta {
        seconds(self.min_span_secs)
    }

    pub fn no_end_span(&self) -> TimeDelta {
        seconds(self.no_end_span_secs)
    }

    /// Growth cap. Never larger than the no-end fallback.
    pub fn max_span(&self) -> TimeDelta {
        seconds(self.max_span_secs.min(self.no_end_span_secs))
    }

    pub fn timeout(&self) -> TimeDelta {
        i64::try_from(self.timeout_ms)
            .ok()
            .and_then(TimeDelta::try_milliseconds)
            .unwrap_or(TimeDelta::MAX)
    }
}

/// Saturating conversion; out-of-range values map to `TimeDelta::MAX`.
fn seconds(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

/// Status priority offsets. Values `<= 0` are offsets from the base priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityConfig {
    #[serde(default = "default_priority_offset")]
    pub pending_offset: i32,
    #[serde(default = "default_priority_offset")]
    pub in_progress_offset: i32,
}

fn default_priority_offset() -> i32 {
    -1
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            pending_offset: default_priority_offset(),
            in_progress_offset: default_priority_offset(),
        }
    }
}

impl PriorityConfig {
    pub fn pending_priority(&self, base: i32) -> i32 {
        resolve_priority(base, self.pending_offset)
    }

    pub fn in_progress_priority(&self, base: i32) -> i32 {
        resolve_priority(base, self.in_progress_offset)
    }
}

fn resolve_priority(base: i32, configured: i32) -> i32 {
    if configured <= 0 {
        base.saturating_add(configured)
    } else {
        configured
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingConfig {
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

fn default_retry_delay_secs() -> u64 {
    60
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            retry_delay_secs: default_retry_delay_secs(),
        }
    }
}

impl PendingConfig {
    pub fn retry_delay(&self) -> TimeDelta {
        seconds(self.retry_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleConfig {
    #[serde(default = "default_association_margin_secs")]
    pub association_margin_secs: u64,
}

fn default_association_margin_secs() -> u64 {
    20
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            association_margin_secs: default_association_margin_secs(),
        }
    }
}

impl CycleConfig {
    pub fn association_margin(&self) -> TimeDelta {
        seconds(self.association_margin_secs)
    }
}

/// Merge suppression applied to associations that do not set their own options.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct MergeDefaults {
    #[serde(default)]
    pub no_left_merge: bool,
    #[serde(default)]
    pub no_right_merge: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRetryConfig {
    #[serde(default = "default_conflict_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_conflict_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_conflict_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_conflict_jitter_pct")]
    pub jitter_pct: f64,
}

fn default_conflict_attempts() -> usize {
    3
}

fn default_conflict_base_delay_ms() -> u64 {
    5
}

fn default_conflict_max_delay_ms() -> u64 {
    50
}

fn default_conflict_jitter_pct() -> f64 {
    0.2
}

impl Default for ConflictRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_conflict_attempts(),
            base_delay_ms: default_conflict_base_delay_ms(),
            max_delay_ms: default_conflict_max_delay_ms(),
            jitter_pct: default_conflict_jitter_pct(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,
    #[serde(default = "default_liveness_timeout_secs")]
    pub liveness_timeout_secs: u64,
}

fn default_workers() -> usize {
    2
}

fn default_idle_backoff_ms() -> u64 {
    200
}

fn default_liveness_timeout_secs() -> u64 {
    120
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            idle_backoff_ms: default_idle_backoff_ms(),
            liveness_timeout_secs: default_liveness_timeout_secs(),
        }
    }
}

impl AnalysisConfig {
    /// Reads `analysis.toml` when present, then `ANALYSIS_*` environment overrides
    /// (nested keys use `__`, e.g. `ANALYSIS_STEP__TIMEOUT_MS`).
    pub fn load() -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(config::File::with_name(CONFIG_FILE).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let step = &self.step;
        if step.min_span_secs == 0 || step.no_end_span_secs == 0 {
            return Err(ConfigError::Message(
                "step spans must be greater than zero".to_string(),
            ));
        }
        if step.max_span_secs > step.no_end_span_secs {
            return Err(ConfigError::Message(format!(
                "step.max_span_secs ({}) exceeds step.no_end_span_secs ({})",
                step.max_span_secs, step.no_end_span_secs
            )));
        }
        for (key, value) in [
            ("step.no_end_span_secs", step.no_end_span_secs),
            ("step.timeout_ms", step.timeout_ms / 1_000),
            ("pending.retry_delay_secs", self.pending.retry_delay_secs),
            ("cycle.association_margin_secs", self.cycle.association_margin_secs),
        ] {
            if value > MAX_CONFIGURED_SECS {
                return Err(ConfigError::Message(format!(
                    "{key} exceeds {MAX_CONFIGURED_SECS}s"
                )));
            }
        }
        if step.min_span_secs > step.max_span_secs {
            return Err(ConfigError::Message(format!(
                "step.min_span_secs ({}) exceeds step.max_span_secs ({})",
                step.min_span_secs, step.max_span_secs
            )));
        }
        if step.timeout_ms == 0 {
            return Err(ConfigError::Message(
                "step.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if !(step.increase_threshold > 0.0 && step.increase_threshold <= 1.0) {
            return Err(ConfigError::Message(format!(
                "step.increase_threshold must be in (0, 1], got {}",
                step.increase_threshold
            )));
        }
        if step.increase_rate < 1.0 {
            return Err(ConfigError::Message(format!(
                "step.increase_rate must be >= 1, got {}",
                step.increase_rate
            )));
        }
        if self.engine.workers == 0 {
            return Err(ConfigError::Message(
                "engine.workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = AnalysisConfig::default();
        assert_eq!(config.step.min_span(), TimeDelta::seconds(30));
        assert_eq!(config.step.no_end_span(), TimeDelta::days(1));
        assert_eq!(config.step.timeout(), TimeDelta::seconds(8));
        assert_eq!(config.cycle.association_margin(), TimeDelta::seconds(20));
        assert_eq!(config.priority.pending_priority(100), 99);
        assert_eq!(config.priority.in_progress_priority(100), 99);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn positive_priority_replaces_base() {
        let priority = PriorityConfig {
            pending_offset: 5,
            in_progress_offset: 0,
        };
        assert_eq!(priority.pending_priority(100), 5);
        assert_eq!(priority.in_progress_priority(100), 100);
    }

    #[test]
    fn load_from_file_keeps_defaults_for_missing_keys() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[step]\nmin_span_secs = 10\ntimeout_ms = 500\n").unwrap();
        writeln!(file, "[merge]\nno_left_merge = true\n").unwrap();
        let config = AnalysisConfig::load_from(file.path()).unwrap();
        assert_eq!(config.step.min_span_secs, 10);
        assert_eq!(config.step.timeout_ms, 500);
        assert_eq!(config.step.no_end_span_secs, 86_400);
        assert!(config.merge.no_left_merge);
        assert!(!config.merge.no_right_merge);
        assert_eq!(config.engine.workers, 2);
    }

    #[test]
    fn validate_rejects_inverted_spans() {
        let mut config = AnalysisConfig::default();
        config.step.min_span_secs = 100;
        config.step.max_span_secs = 10;
        assert!(config.validate().is_err());

        let mut config = AnalysisConfig::default();
        config.step.increase_rate = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_keeps_growth_within_no_end_span() {
        let mut config = AnalysisConfig::default();
        config.step.no_end_span_secs = 3_600;
        config.step.max_span_secs = 86_400;
        assert!(config.validate().is_err());
        assert_eq!(config.step.max_span(), TimeDelta::hours(1));
    }

    #[test]
    fn validate_rejects_spans_beyond_limit() {
        let mut config = AnalysisConfig::default();
        config.step.no_end_span_secs = 10_000_000_000_000;
        config.step.max_span_secs = 10_000_000_000_000;
        assert!(config.validate().is_err());

        let mut config = AnalysisConfig::default();
        config.pending.retry_delay_secs = u64::MAX;
        assert!(config.validate().is_err());
        assert_eq!(config.pending.retry_delay(), TimeDelta::MAX);
    }
}
