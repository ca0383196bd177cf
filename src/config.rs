//==============================================
// File: config.rs
// License: Duality Public License (DPL v1.0)
// Goal: Runner configuration surface
// Objective: Parse and normalize the TOML configuration controlling
//            execution timeouts, runtime artifacts, and file guards
//==============================================

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

pub const TIMEOUT_DEFAULT_SECONDS: u64 = 30;
pub const TIMEOUT_MIN_SECONDS: u64 = 5;
pub const TIMEOUT_MAX_SECONDS: u64 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration document: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("runtime.url must not be empty")]
    MissingRuntimeUrl,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub execution: ExecutionConfig,
    pub runtime: RuntimeConfig,
    pub files: FileConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            execution: ExecutionConfig::default(),
            runtime: RuntimeConfig::default(),
            files: FileConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub timeout_seconds: u64,
    pub safety_timeout_seconds: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: TIMEOUT_DEFAULT_SECONDS,
            safety_timeout_seconds: TIMEOUT_DEFAULT_SECONDS,
        }
    }
}

impl ExecutionConfig {
    /// Clamp the hard timeout into [5, 300] and the safety timeout
    /// below it. Out-of-range values are corrected silently so a bad
    /// config document degrades instead of refusing to run.
    pub fn normalized(mut self) -> Self {
        self.timeout_seconds = self
            .timeout_seconds
            .clamp(TIMEOUT_MIN_SECONDS, TIMEOUT_MAX_SECONDS);
        self.safety_timeout_seconds = self
            .safety_timeout_seconds
            .clamp(1, self.timeout_seconds);
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Loader module location for the embedded interpreter.
    pub url: String,
    /// Interpreter binary location.
    pub wasm: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Per-path read-only flags consulted by filesystem write guards.
    pub read_only: HashMap<String, bool>,
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(text)?;
        if config.runtime.url.is_empty() && !config.runtime.wasm.is_empty() {
            return Err(ConfigError::MissingRuntimeUrl);
        }
        config.execution = config.execution.normalized();
        Ok(config)
    }

    pub fn is_read_only(&self, path: &str) -> bool {
        self.files.read_only.get(path).copied().unwrap_or(false)
    }
}
