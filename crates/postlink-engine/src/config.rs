//! Engine policy configuration (strict parsing + validation).
//!
//! Retry interval and default response timeout are policy, not protocol:
//! they are configured here and never hard-coded at call sites.

use serde::Deserialize;

use postlink_core::error::{PostlinkError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Fixed re-send interval for unacked envelopes.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Default wait for a RESPONSE. 0 means wait indefinitely.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: default_retry_interval_ms(),
            response_timeout_ms: default_response_timeout_ms(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=1000).contains(&self.retry_interval_ms) {
            return Err(PostlinkError::Config(
                "retry_interval_ms must be between 1 and 1000".into(),
            ));
        }
        if self.response_timeout_ms != 0 && self.response_timeout_ms < self.retry_interval_ms {
            return Err(PostlinkError::Config(
                "response_timeout_ms must be 0 (indefinite) or >= retry_interval_ms".into(),
            ));
        }
        Ok(())
    }
}

fn default_retry_interval_ms() -> u64 {
    50
}
fn default_response_timeout_ms() -> u64 {
    5000
}

/// Parse and validate a YAML config document.
pub fn load_from_str(s: &str) -> Result<EngineConfig> {
    let cfg: EngineConfig =
        serde_yaml::from_str(s).map_err(|e| PostlinkError::Config(e.to_string()))?;
    cfg.validate()?;
    Ok(cfg)
}
