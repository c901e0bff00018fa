//! Engine configuration loading
//!
//! Loads configuration from `~/.config/inkwell/inkwell.toml` (or `INKWELL_CONFIG` env).
//! Every field has a default; a missing file yields the default configuration.

use crate::errors::{EngineError, Result};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for the season engine
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Path to the SQLite database
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Ink economy costs and thresholds
    #[serde(default)]
    pub ink: InkConfig,

    /// Season phase scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Task worker settings
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Task queue hygiene
    #[serde(default)]
    pub queue: QueueConfig,

    /// Retry/timeout policy around the opaque generator
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Simulated reader personas
    #[serde(default)]
    pub readers: ReadersConfig,

    /// External content service used by the HTTP generator
    #[serde(default)]
    pub content_service: ContentServiceConfig,
}

fn default_db_path() -> String {
    dirs::data_dir()
        .map(|d| {
            d.join("inkwell")
                .join("inkwell.db")
                .to_string_lossy()
                .into_owned()
        })
        .unwrap_or_else(|| "inkwell.db".to_string())
}

/// Ink economy configuration
#[derive(Debug, Deserialize, Clone)]
pub struct InkConfig {
    /// Balance granted when an entrant joins a season
    #[serde(default = "default_starting_balance")]
    pub starting_balance: i64,

    /// Debited once an outline is persisted
    #[serde(default = "default_outline_cost")]
    pub outline_cost: i64,

    /// Debited per published chapter
    #[serde(default = "default_chapter_publish_cost")]
    pub chapter_publish_cost: i64,

    /// Debited per published chapter for the reader agents that review it
    #[serde(default = "default_reader_agent_cost")]
    pub reader_agent_cost: i64,

    /// Balances strictly below this value are bankrupt
    #[serde(default)]
    pub bankruptcy_threshold: i64,

    /// Mean reader rating at or above which a chapter earns `acclaim_reward`
    #[serde(default = "default_acclaim_rating")]
    pub acclaim_rating: f64,

    /// Credited for an acclaimed chapter (0 disables the reward)
    #[serde(default)]
    pub acclaim_reward: i64,
}

fn default_starting_balance() -> i64 {
    100
}
fn default_outline_cost() -> i64 {
    10
}
fn default_chapter_publish_cost() -> i64 {
    5
}
fn default_reader_agent_cost() -> i64 {
    2
}
fn default_acclaim_rating() -> f64 {
    8.0
}

impl Default for InkConfig {
    fn default() -> Self {
        Self {
            starting_balance: default_starting_balance(),
            outline_cost: default_outline_cost(),
            chapter_publish_cost: default_chapter_publish_cost(),
            reader_agent_cost: default_reader_agent_cost(),
            bankruptcy_threshold: 0,
            acclaim_rating: default_acclaim_rating(),
            acclaim_reward: 0,
        }
    }
}

/// Longest span any scheduling or retention setting may express (ten years)
pub const MAX_HORIZON_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// `secs` as a duration, clamped to [`MAX_HORIZON_SECS`]
pub(crate) fn horizon(secs: u64) -> TimeDelta {
    i64::try_from(secs.min(MAX_HORIZON_SECS))
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or_else(TimeDelta::zero)
}

/// Season phase scheduler configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Fail-safe: leave AI_WORKING after this long even if the round cycle
    /// has not finished
    #[serde(default = "default_max_ai_work_minutes")]
    pub max_ai_work_minutes: u64,

    /// Floor for the reading window, regardless of generation latency
    #[serde(default = "default_min_reading_minutes")]
    pub min_reading_minutes: u64,

    /// Enqueue a season-wide catch-up when the fail-safe fires
    #[serde(default = "default_catch_up_on_timeout")]
    pub catch_up_on_timeout: bool,
}

fn default_max_ai_work_minutes() -> u64 {
    120
}
fn default_min_reading_minutes() -> u64 {
    60
}
fn default_catch_up_on_timeout() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_ai_work_minutes: default_max_ai_work_minutes(),
            min_reading_minutes: default_min_reading_minutes(),
            catch_up_on_timeout: default_catch_up_on_timeout(),
        }
    }
}

impl SchedulerConfig {
    pub fn max_ai_work(&self) -> TimeDelta {
        horizon(self.max_ai_work_minutes.saturating_mul(60))
    }

    pub fn min_reading(&self) -> TimeDelta {
        horizon(self.min_reading_minutes.saturating_mul(60))
    }
}

/// Task worker configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// A busy flag older than this is treated as left behind by a crashed run
    #[serde(default = "default_stale_run_minutes")]
    pub stale_run_minutes: u64,

    /// Triggers arriving closer together than this are rejected
    #[serde(default = "default_min_trigger_interval_secs")]
    pub min_trigger_interval_secs: u64,
}

fn default_stale_run_minutes() -> u64 {
    30
}
fn default_min_trigger_interval_secs() -> u64 {
    10
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            stale_run_minutes: default_stale_run_minutes(),
            min_trigger_interval_secs: default_min_trigger_interval_secs(),
        }
    }
}

impl WorkerConfig {
    pub fn stale_run(&self) -> TimeDelta {
        horizon(self.stale_run_minutes.saturating_mul(60))
    }

    pub fn min_trigger_interval(&self) -> TimeDelta {
        horizon(self.min_trigger_interval_secs)
    }
}

/// Task queue configuration
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Items older than this are deleted by `cleanup`, whatever their status
    #[serde(default = "default_cleanup_max_age_hours")]
    pub cleanup_max_age_hours: u64,
}

fn default_cleanup_max_age_hours() -> u64 {
    168
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            cleanup_max_age_hours: default_cleanup_max_age_hours(),
        }
    }
}

/// Generation retry configuration
#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// Total attempts per generation call (first try included)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Hard timeout per generation call
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Ask the generator to revise the outline after reader feedback
    #[serde(default)]
    pub optimize_outline_after_feedback: bool,
}

fn default_max_attempts() -> usize {
    3
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    10_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_call_timeout_secs() -> u64 {
    600
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            call_timeout_secs: default_call_timeout_secs(),
            optimize_outline_after_feedback: false,
        }
    }
}

impl GenerationConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// A simulated reader
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ReaderPersona {
    pub name: String,
    /// Free-text description of the persona's taste, passed to the generator
    pub style: String,
}

/// Reader feedback configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ReadersConfig {
    /// Upper bound on personas sampled per chapter
    #[serde(default = "default_per_chapter")]
    pub per_chapter: usize,

    #[serde(default = "default_personas")]
    pub personas: Vec<ReaderPersona>,
}

fn default_per_chapter() -> usize {
    3
}

fn default_personas() -> Vec<ReaderPersona> {
    [
        ("critic", "Exacting literary critic who weighs prose and structure"),
        ("genre-fan", "Enthusiastic genre reader who wants momentum and payoff"),
        ("casual", "Casual reader skimming on a commute"),
        ("editor", "Developmental editor tracking plot holes and pacing"),
    ]
    .into_iter()
    .map(|(name, style)| ReaderPersona {
        name: name.to_string(),
        style: style.to_string(),
    })
    .collect()
}

impl Default for ReadersConfig {
    fn default() -> Self {
        Self {
            per_chapter: default_per_chapter(),
            personas: default_personas(),
        }
    }
}

/// External content service configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ContentServiceConfig {
    #[serde(default = "default_content_base_url")]
    pub base_url: String,

    /// Optional bearer token sent with every request
    #[serde(default)]
    pub api_key: Option<String>,

    /// HTTP client timeout per request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_content_base_url() -> String {
    "http://127.0.0.1:8787".to_string()
}

fn default_request_timeout_secs() -> u64 {
    300
}

impl Default for ContentServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_content_base_url(),
            api_key: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ContentServiceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            ink: InkConfig::default(),
            scheduler: SchedulerConfig::default(),
            worker: WorkerConfig::default(),
            queue: QueueConfig::default(),
            generation: GenerationConfig::default(),
            readers: ReadersConfig::default(),
            content_service: ContentServiceConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Environment variable for config path override
    pub const ENV_CONFIG_PATH: &'static str = "INKWELL_CONFIG";

    /// Default config filename
    pub const DEFAULT_CONFIG_FILENAME: &'static str = "inkwell.toml";

    /// Load configuration from file
    ///
    /// Resolution order:
    /// 1. `INKWELL_CONFIG` environment variable
    /// 2. `~/.config/inkwell/inkwell.toml`
    ///
    /// If the config file doesn't exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let path = Self::resolve_config_path();

        if !path.exists() {
            tracing::info!(
                path = %path.display(),
                "Inkwell config not found, using defaults"
            );
            return Ok(Self::default());
        }

        Self::load_from_path(&path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            EngineError::config_with_source(
                format!("failed to read config at {}", path.display()),
                e,
            )
        })?;

        Self::parse(&contents)
    }

    /// Parse configuration from TOML string
    pub fn parse(contents: &str) -> Result<Self> {
        let cfg: EngineConfig = toml::from_str(contents)
            .map_err(|e| EngineError::config_with_source("failed to parse config", e))?;

        cfg.validate()?;
        Ok(cfg)
    }

    fn resolve_config_path() -> PathBuf {
        if let Ok(path) = std::env::var(Self::ENV_CONFIG_PATH) {
            return PathBuf::from(path);
        }

        dirs::home_dir()
            .map(|h| {
                h.join(".config")
                    .join("inkwell")
                    .join(Self::DEFAULT_CONFIG_FILENAME)
            })
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_CONFIG_FILENAME))
    }

    fn validate(&self) -> Result<()> {
        if self.generation.max_attempts == 0 {
            return Err(EngineError::config(
                "generation.max_attempts must be at least 1",
            ));
        }

        if self.generation.backoff_multiplier < 1.0 {
            return Err(EngineError::config(
                "generation.backoff_multiplier must be >= 1.0",
            ));
        }

        let costs = [
            self.ink.outline_cost,
            self.ink.chapter_publish_cost,
            self.ink.reader_agent_cost,
        ];
        if costs.iter().any(|c| *c < 0) {
            return Err(EngineError::config("ink costs must not be negative"));
        }

        if self.ink.starting_balance < self.ink.bankruptcy_threshold {
            tracing::warn!(
                starting_balance = self.ink.starting_balance,
                threshold = self.ink.bankruptcy_threshold,
                "New entrants start below the bankruptcy threshold"
            );
        }

        if self.readers.personas.is_empty() {
            tracing::warn!("No reader personas configured; reader feedback will be skipped");
        } else if self.readers.per_chapter > self.readers.personas.len() {
            tracing::warn!(
                per_chapter = self.readers.per_chapter,
                personas = self.readers.personas.len(),
                "readers.per_chapter exceeds persona count; all personas will review"
            );
        }

        let horizons = [
            (
                "scheduler.max_ai_work_minutes",
                self.scheduler.max_ai_work_minutes.saturating_mul(60),
            ),
            (
                "scheduler.min_reading_minutes",
                self.scheduler.min_reading_minutes.saturating_mul(60),
            ),
            (
                "worker.stale_run_minutes",
                self.worker.stale_run_minutes.saturating_mul(60),
            ),
            (
                "worker.min_trigger_interval_secs",
                self.worker.min_trigger_interval_secs,
            ),
            (
                "queue.cleanup_max_age_hours",
                self.queue.cleanup_max_age_hours.saturating_mul(3600),
            ),
        ];
        if let Some((name, _)) = horizons.iter().find(|(_, secs)| *secs > MAX_HORIZON_SECS) {
            return Err(EngineError::config(format!(
                "{name} exceeds the ten-year limit"
            )));
        }

        if self.worker.stale_run_minutes.saturating_mul(60) <= self.worker.min_trigger_interval_secs {
            tracing::warn!(
                "worker.stale_run_minutes is shorter than the trigger interval; live drains may be reclaimed"
            );
        }

        Ok(())
    }

    /// Get the resolved database path (expanding ~ if needed)
    pub fn resolved_db_path(&self) -> PathBuf {
        let path = &self.db_path;
        if let Some(stripped) = path.strip_prefix("~/")
            && let Some(home) = dirs::home_dir()
        {
            return home.join(stripped);
        }
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.ink.starting_balance, 100);
        assert_eq!(cfg.ink.bankruptcy_threshold, 0);
        assert_eq!(cfg.generation.max_attempts, 3);
        assert_eq!(cfg.readers.personas.len(), 4);
        assert!(cfg.scheduler.catch_up_on_timeout);
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            db_path = "/tmp/inkwell-test.db"
        "#;

        let cfg = EngineConfig::parse(toml).expect("should parse");
        assert_eq!(cfg.db_path, "/tmp/inkwell-test.db");
        assert_eq!(cfg.ink.outline_cost, 10);
        assert_eq!(cfg.worker.min_trigger_interval_secs, 10);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            db_path = "~/.local/share/inkwell/season.db"

            [ink]
            starting_balance = 50
            outline_cost = 4
            chapter_publish_cost = 3
            reader_agent_cost = 1
            bankruptcy_threshold = 5
            acclaim_rating = 7.5
            acclaim_reward = 2

            [scheduler]
            max_ai_work_minutes = 45
            min_reading_minutes = 15
            catch_up_on_timeout = false

            [worker]
            stale_run_minutes = 20
            min_trigger_interval_secs = 0

            [queue]
            cleanup_max_age_hours = 24

            [generation]
            max_attempts = 2
            initial_backoff_ms = 10
            call_timeout_secs = 30
            optimize_outline_after_feedback = true

            [readers]
            per_chapter = 1

            [[readers.personas]]
            name = "skeptic"
            style = "Doubts every plot twist"

            [content_service]
            base_url = "http://content.internal:9000"
            api_key = "secret"
        "#;

        let cfg = EngineConfig::parse(toml).expect("should parse");
        assert_eq!(cfg.ink.bankruptcy_threshold, 5);
        assert_eq!(cfg.ink.acclaim_reward, 2);
        assert_eq!(cfg.scheduler.min_reading(), chrono::Duration::minutes(15));
        assert!(!cfg.scheduler.catch_up_on_timeout);
        assert_eq!(cfg.worker.min_trigger_interval(), chrono::Duration::zero());
        assert_eq!(cfg.queue.cleanup_max_age_hours, 24);
        assert_eq!(cfg.generation.call_timeout(), Duration::from_secs(30));
        assert!(cfg.generation.optimize_outline_after_feedback);
        assert_eq!(cfg.readers.personas.len(), 1);
        assert_eq!(cfg.readers.personas[0].name, "skeptic");
        assert_eq!(cfg.content_service.api_key.as_deref(), Some("secret"));
        assert!(cfg.resolved_db_path().ends_with("season.db"));
    }

    #[test]
    fn test_rejects_horizons_past_ten_years() {
        let toml = r#"
            [queue]
            cleanup_max_age_hours = 10000000000000000
        "#;
        let err = EngineConfig::parse(toml).expect_err("overflowing hours");
        assert!(err.to_string().contains("queue.cleanup_max_age_hours"), "{err}");

        let toml = r#"
            [worker]
            stale_run_minutes = 10000000000000000
        "#;
        let err = EngineConfig::parse(toml).expect_err("overflowing minutes");
        assert!(err.to_string().contains("worker.stale_run_minutes"), "{err}");

        let toml = r#"
            [scheduler]
            max_ai_work_minutes = 5256000
        "#;
        let cfg = EngineConfig::parse(toml).expect("exactly ten years is allowed");
        assert_eq!(cfg.scheduler.max_ai_work(), TimeDelta::days(3650));
    }

    #[test]
    fn test_durations_saturate_when_built_in_code() {
        let worker = WorkerConfig {
            stale_run_minutes: u64::MAX,
            min_trigger_interval_secs: u64::MAX,
        };
        let limit = TimeDelta::seconds(MAX_HORIZON_SECS as i64);
        assert_eq!(worker.stale_run(), limit);
        assert_eq!(worker.min_trigger_interval(), limit);
        assert_eq!(horizon(u64::MAX.saturating_mul(3600)), limit);
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let toml = r#"
            [generation]
            max_attempts = 0
        "#;

        let err = EngineConfig::parse(toml).expect_err("zero attempts is invalid");
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("inkwell.toml");
        std::fs::write(&path, "[ink]\nstarting_balance = 7\n").expect("write");

        let cfg = EngineConfig::load_from_path(&path).expect("load");
        assert_eq!(cfg.ink.starting_balance, 7);
    }
}
