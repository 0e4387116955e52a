//! LeadPilot configuration system.

use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{LeadPilotError, Result};
use crate::types::{StageConfig, default_stage_catalog};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadPilotConfig {
    #[serde(default)]
    pub business_hours: BusinessHoursConfig,
    #[serde(default)]
    pub progression: ProgressionConfig,
    #[serde(default)]
    pub selector: SelectorConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub composer: ComposerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default = "default_stage_catalog")]
    pub stages: Vec<StageConfig>,
}

impl Default for LeadPilotConfig {
    fn default() -> Self {
        Self {
            business_hours: BusinessHoursConfig::default(),
            progression: ProgressionConfig::default(),
            selector: SelectorConfig::default(),
            routing: RoutingConfig::default(),
            workflow: WorkflowConfig::default(),
            sweep: SweepConfig::default(),
            retry: RetryConfig::default(),
            composer: ComposerConfig::default(),
            database: DatabaseConfig::default(),
            stages: default_stage_catalog(),
        }
    }
}

impl LeadPilotConfig {
    /// Load config from the default path (~/.leadpilot/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load and validate config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LeadPilotError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    /// Parse and validate config from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| LeadPilotError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| LeadPilotError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the LeadPilot home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".leadpilot")
    }

    /// Reject configs the engines cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.business_hours.resolve()?;

        let p = self.selector.exploit_probability;
        if !(0.0..=1.0).contains(&p) {
            return Err(LeadPilotError::Config(format!(
                "selector.exploit_probability must be within [0, 1], got {p}"
            )));
        }
        if self.selector.exploit_pool == 0 {
            return Err(LeadPilotError::Config(
                "selector.exploit_pool must be at least 1".into(),
            ));
        }
        for threshold in [
            self.workflow.optimize_below,
            self.workflow.promote_above,
        ] {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(LeadPilotError::Config(format!(
                    "workflow thresholds must be within [0, 1], got {threshold}"
                )));
            }
        }
        if self.workflow.health_window_hours == 0 {
            return Err(LeadPilotError::Config(
                "workflow.health_window_hours must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(LeadPilotError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.stage.as_str()) {
                return Err(LeadPilotError::Config(format!(
                    "duplicate stage '{}'",
                    stage.stage
                )));
            }
            if let Some(h) = stage.preferred_hours.iter().find(|h| **h > 23) {
                return Err(LeadPilotError::Config(format!(
                    "stage '{}' has invalid preferred hour {h}",
                    stage.stage
                )));
            }
        }
        Ok(())
    }
}

/// Business-hours window, local to `timezone`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessHoursConfig {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_start_hour")]
    pub start_hour: u32,
    #[serde(default)]
    pub start_minute: u32,
    #[serde(default = "default_end_hour")]
    pub end_hour: u32,
    #[serde(default)]
    pub end_minute: u32,
    /// Hour used when a send is pushed off a Sunday.
    #[serde(default = "default_fallback_hour")]
    pub fallback_hour: u32,
}

fn default_timezone() -> String { "America/New_York".into() }
fn default_start_hour() -> u32 { 9 }
fn default_end_hour() -> u32 { 19 }
fn default_fallback_hour() -> u32 { 10 }

impl Default for BusinessHoursConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            start_hour: default_start_hour(),
            start_minute: 0,
            end_hour: default_end_hour(),
            end_minute: 0,
            fallback_hour: default_fallback_hour(),
        }
    }
}

/// Parsed, validated business hours.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BusinessHours {
    pub tz: Tz,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub fallback: NaiveTime,
}

impl BusinessHoursConfig {
    /// Parse timezone and window bounds.
    pub fn resolve(&self) -> Result<BusinessHours> {
        let tz: Tz = self.timezone.parse().map_err(|e| {
            LeadPilotError::Config(format!("invalid timezone '{}': {e}", self.timezone))
        })?;
        let start = NaiveTime::from_hms_opt(self.start_hour, self.start_minute, 0).ok_or_else(
            || LeadPilotError::Config(format!(
                "invalid window start {}:{:02}",
                self.start_hour, self.start_minute
            )),
        )?;
        let end = NaiveTime::from_hms_opt(self.end_hour, self.end_minute, 0).ok_or_else(|| {
            LeadPilotError::Config(format!(
                "invalid window end {}:{:02}",
                self.end_hour, self.end_minute
            ))
        })?;
        if end <= start {
            return Err(LeadPilotError::Config(format!(
                "business window end {end} must be after start {start}"
            )));
        }
        let fallback = NaiveTime::from_hms_opt(self.fallback_hour, 0, 0).ok_or_else(|| {
            LeadPilotError::Config(format!("invalid fallback hour {}", self.fallback_hour))
        })?;
        // Keep the Sunday fallback inside the window.
        let fallback = fallback.clamp(start, end);
        Ok(BusinessHours {
            tz,
            start,
            end,
            fallback,
        })
    }
}

/// Which progression variant drives a lead forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProgressionMode {
    /// Strict per-send chain through the stage catalog.
    #[default]
    Linear,
    /// Stages gated by lead-age buckets.
    DayOffset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressionConfig {
    #[serde(default)]
    pub mode: ProgressionMode,
    /// Advancement is suppressed while the last reply is younger than this.
    #[serde(default = "default_reply_guard_hours")]
    pub reply_guard_hours: u32,
}

fn default_reply_guard_hours() -> u32 { 24 }

impl Default for ProgressionConfig {
    fn default() -> Self {
        Self {
            mode: ProgressionMode::default(),
            reply_guard_hours: default_reply_guard_hours(),
        }
    }
}

/// Explore/exploit template selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Below this many total sends, pick uniformly.
    #[serde(default = "default_cold_start_threshold")]
    pub cold_start_threshold: u64,
    #[serde(default = "default_exploit_probability")]
    pub exploit_probability: f64,
    /// How many top templates form the exploitation pool.
    #[serde(default = "default_exploit_pool")]
    pub exploit_pool: usize,
}

fn default_cold_start_threshold() -> u64 { 100 }
fn default_exploit_probability() -> f64 { 0.8 }
fn default_exploit_pool() -> usize { 2 }

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            cold_start_threshold: default_cold_start_threshold(),
            exploit_probability: default_exploit_probability(),
            exploit_pool: default_exploit_pool(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_performance_window_days")]
    pub performance_window_days: u32,
    /// Minimum leads before an assignee's conversion rate counts.
    #[serde(default = "default_min_sample_size")]
    pub min_sample_size: u64,
    #[serde(default = "default_workload_window_days")]
    pub workload_window_days: u32,
}

fn default_performance_window_days() -> u32 { 30 }
fn default_min_sample_size() -> u64 { 5 }
fn default_workload_window_days() -> u32 { 7 }

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            performance_window_days: default_performance_window_days(),
            min_sample_size: default_min_sample_size(),
            workload_window_days: default_workload_window_days(),
        }
    }
}

/// Self-optimization thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_optimize_below")]
    pub optimize_below: f64,
    #[serde(default = "default_promote_above")]
    pub promote_above: f64,
    #[serde(default = "default_promote_min_executions")]
    pub promote_min_executions: u64,
    #[serde(default = "default_cycle_secs")]
    pub optimization_interval_secs: u64,
    /// Each cycle scores executions created within this many trailing hours.
    #[serde(default = "default_health_window_hours")]
    pub health_window_hours: u64,
}

fn default_optimize_below() -> f64 { 0.6 }
fn default_promote_above() -> f64 { 0.8 }
fn default_promote_min_executions() -> u64 { 100 }
fn default_cycle_secs() -> u64 { 3600 }
fn default_health_window_hours() -> u64 { 168 }

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            optimize_below: default_optimize_below(),
            promote_above: default_promote_above(),
            promote_min_executions: default_promote_min_executions(),
            optimization_interval_secs: default_cycle_secs(),
            health_window_hours: default_health_window_hours(),
        }
    }
}

/// Due-send sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "default_sweep_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_sweep_secs() -> u64 { 60 }
fn default_batch_size() -> usize { 100 }

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_secs(),
            batch_size: default_batch_size(),
        }
    }
}

/// Bounded retry for transient store errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 { 3 }
fn default_base_delay_ms() -> u64 { 200 }
fn default_max_delay_ms() -> u64 { 5_000 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ComposerConfig {
    /// Fail on unresolved placeholders instead of stripping them.
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.leadpilot/leadpilot.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = LeadPilotConfig::default();
        config.validate().unwrap();
        assert_eq!(config.selector.cold_start_threshold, 100);
        assert_eq!(config.progression.reply_guard_hours, 24);
        assert_eq!(config.stages.len(), 6);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = LeadPilotConfig::from_toml(
            r#"
            [business_hours]
            timezone = "Europe/Lisbon"
            start_hour = 8

            [progression]
            mode = "day_offset"
            "#,
        )
        .unwrap();
        assert_eq!(config.business_hours.timezone, "Europe/Lisbon");
        assert_eq!(config.business_hours.end_hour, 19);
        assert_eq!(config.progression.mode, ProgressionMode::DayOffset);
        assert_eq!(config.selector.exploit_pool, 2);
    }

    #[test]
    fn test_rejects_bad_timezone() {
        let err = LeadPilotConfig::from_toml("[business_hours]\ntimezone = \"Mars/Olympus\"")
            .unwrap_err();
        assert!(err.to_string().contains("invalid timezone"));
    }

    #[test]
    fn test_rejects_inverted_window() {
        let mut config = LeadPilotConfig::default();
        config.business_hours.start_hour = 18;
        config.business_hours.end_hour = 9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fallback_clamped_into_window() {
        let hours = BusinessHoursConfig {
            start_hour: 12,
            end_hour: 17,
            ..Default::default()
        }
        .resolve()
        .unwrap();
        assert_eq!(hours.fallback, NaiveTime::from_hms_opt(12, 0, 0).unwrap());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join("leadpilot-config-test");
        let path = dir.join("config.toml");
        let mut config = LeadPilotConfig::default();
        config.sweep.batch_size = 25;
        config.save_to(&path).unwrap();

        let loaded = LeadPilotConfig::load_from(&path).unwrap();
        assert_eq!(loaded.sweep.batch_size, 25);
        assert_eq!(loaded.stages, config.stages);
        std::fs::remove_dir_all(&dir).ok();
    }
}
