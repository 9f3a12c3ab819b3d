//! Pipeline configuration.
//!
//! Loaded from a TOML file; every section and field is optional and falls back
//! to the built-in policy.
//!
//! ```toml
//! [policy]
//! auto_approve_threshold = 85.0
//! apply_timeout_ms = 30000
//!
//! [scoring]
//! user_fix = 92.0
//! ema_alpha = 0.3
//!
//! [patterns]
//! restricted = ["middleware.ts", "**/auth/**"]
//! unmatched_tier = "medium"
//!
//! [storage]
//! database = "autopatch.db"
//! root = "."
//!
//! [logging]
//! filter = "info,autopatch=debug"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::self_modify::confidence::ScoringWeights;
use crate::self_modify::decision::DEFAULT_AUTO_APPROVE_THRESHOLD;
use crate::self_modify::patterns::{PatternSpec, PatternTable};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Minimum confidence (0–100) for a low-risk proposal to skip human review.
    pub auto_approve_threshold: f64,
    /// Budget for a whole `apply()`, in milliseconds.
    pub apply_timeout_ms: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self { auto_approve_threshold: DEFAULT_AUTO_APPROVE_THRESHOLD, apply_timeout_ms: 30_000 }
    }
}

impl PolicyConfig {
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite state file used by the CLI.
    pub database: String,
    /// Directory tree the CLI's filesystem gateway operates on.
    pub root: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { database: "autopatch.db".into(), root: ".".into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` takes precedence.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { filter: "info".into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub policy: PolicyConfig,
    pub scoring: ScoringWeights,
    pub patterns: PatternSpec,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    /// Read and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = self.policy.auto_approve_threshold;
        if !(0.0..=100.0).contains(&t) {
            return Err(ConfigError::Invalid(format!(
                "policy.auto_approve_threshold must be within 0..=100, got {}",
                t
            )));
        }
        if self.policy.apply_timeout_ms == 0 {
            return Err(ConfigError::Invalid("policy.apply_timeout_ms must be non-zero".into()));
        }
        self.scoring.validate().map_err(ConfigError::Invalid)?;
        PatternTable::compile(&self.patterns)?;
        Ok(())
    }
}
