//! Store configuration
//!
//! Loaded from a TOML file or from environment variables:
//! - `DOCCTX_MAX_ATTEMPTS`: transaction attempts before giving up (default: 5)
//! - `DOCCTX_LATENCY_MS`: simulated round-trip per call (default: 0)

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Attempts per transaction when the caller sets no limit
    pub max_attempts: u32,
    /// Delay added to every call, so deadlines and cancellation have
    /// something to interrupt
    pub latency_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            latency_ms: 0,
        }
    }
}

impl MemoryConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from any key lookup; unparsable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup("DOCCTX_MAX_ATTEMPTS") {
            match raw.parse() {
                Ok(attempts) => config.max_attempts = attempts,
                Err(e) => warn!(value = %raw, "ignoring DOCCTX_MAX_ATTEMPTS: {}", e),
            }
        }
        if let Some(raw) = lookup("DOCCTX_LATENCY_MS") {
            match raw.parse() {
                Ok(ms) => config.latency_ms = ms,
                Err(e) => warn!(value = %raw, "ignoring DOCCTX_LATENCY_MS: {}", e),
            }
        }

        config
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse store config (invalid TOML)")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml_str(&content)
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}
