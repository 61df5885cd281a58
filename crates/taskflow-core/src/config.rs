use std::time::Duration;

use serde::Deserialize;

use crate::models::{CoreError, CoreErrorKind, TaskRecord};

pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 2;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_TIMEOUT_SAFETY_FACTOR: f64 = 1.5;

const ENV_PREFIX: &str = "TASKFLOW_";

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(rename = "task_timeout_ms", with = "duration_ms")]
    pub task_timeout: Duration,
    pub max_retry_attempts: u32,
    /// Advisory cap on simultaneously in-progress tasks per project.
    pub max_concurrent_tasks: Option<usize>,
    pub default_priority: i32,
    #[serde(rename = "retry_backoff_ms", with = "duration_ms")]
    pub retry_backoff: Duration,
    pub timeout_safety_factor: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_millis(DEFAULT_TASK_TIMEOUT_MS),
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            max_concurrent_tasks: None,
            default_priority: 0,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            timeout_safety_factor: DEFAULT_TIMEOUT_SAFETY_FACTOR,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `TASKFLOW_*` keys resolved by `lookup`. Missing
    /// keys keep their defaults; malformed ones are rejected.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let read = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut config = Self::default();

        if let Some(raw) = read("TASK_TIMEOUT_MS") {
            config.task_timeout = Duration::from_millis(parse_option("TASK_TIMEOUT_MS", &raw)?);
        }
        if let Some(raw) = read("MAX_RETRY_ATTEMPTS") {
            config.max_retry_attempts = parse_option("MAX_RETRY_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = read("MAX_CONCURRENT_TASKS") {
            config.max_concurrent_tasks = Some(parse_option("MAX_CONCURRENT_TASKS", &raw)?);
        }
        if let Some(raw) = read("DEFAULT_PRIORITY") {
            config.default_priority = parse_option("DEFAULT_PRIORITY", &raw)?;
        }
        if let Some(raw) = read("RETRY_BACKOFF_MS") {
            config.retry_backoff = Duration::from_millis(parse_option("RETRY_BACKOFF_MS", &raw)?);
        }
        if let Some(raw) = read("TIMEOUT_SAFETY_FACTOR") {
            config.timeout_safety_factor = parse_option("TIMEOUT_SAFETY_FACTOR", &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.task_timeout.is_zero() {
            return Err(invalid_config("task timeout must be greater than zero"));
        }
        if !(self.timeout_safety_factor.is_finite() && self.timeout_safety_factor > 0.0) {
            return Err(invalid_config(
                "timeout safety factor must be a positive finite number",
            ));
        }
        if self.max_concurrent_tasks == Some(0) {
            return Err(invalid_config(
                "max concurrent tasks must be greater than zero when provided",
            ));
        }
        Ok(())
    }

    /// Timeout armed when `task` starts: its estimated duration scaled by
    /// the safety factor, or the global timeout when no estimate exists.
    pub fn timeout_for(&self, task: &TaskRecord) -> Duration {
        match task.metadata.estimated_duration_ms {
            Some(estimate) if estimate > 0 => {
                let scaled = estimate as f64 * self.timeout_safety_factor;
                Duration::from_millis(scaled.ceil() as u64)
            }
            _ => self.task_timeout,
        }
    }
}

fn parse_option<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, CoreError> {
    raw.trim().parse::<T>().map_err(|_| {
        invalid_config(format!(
            "environment option '{ENV_PREFIX}{name}' has invalid value '{raw}'"
        ))
    })
}

fn invalid_config(message: impl Into<String>) -> CoreError {
    CoreError::new(CoreErrorKind::InvalidInput, message)
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
