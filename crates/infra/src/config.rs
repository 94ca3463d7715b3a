//! Pipeline configuration.
//!
//! One immutable [`PipelineConfig`] is built at startup (defaults, then `ANNOTFLOW_*`
//! environment overrides, then command-line flags) and handed to every component.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use annotflow_core::KeyLayout;

use crate::workers::RetryPolicy;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}'")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Leading segment of every object key (`{prefix}/{user_id}/...`); may be empty.
    pub key_prefix: String,
    pub inputs_bucket: String,
    pub results_bucket: String,
    /// Cold-storage vault receiving archived results.
    pub vault: String,
    /// Time after completion during which archival-eligible results stay live.
    pub grace_period: Duration,
    /// Re-check delay for a completion event whose record is not COMPLETED yet, and for
    /// a retrieval completion that arrived before its acceptance.
    pub status_poll_interval: Duration,
    /// Long-poll wait per receive.
    pub queue_wait: Duration,
    /// How long a received message stays hidden before redelivery.
    pub visibility_timeout: Duration,
    /// Local directory for downloaded inputs and produced artifacts.
    pub scratch_dir: PathBuf,
    /// Lifetime of e-mail and retrieval sidecar entries.
    pub sidecar_ttl: Duration,
    /// Deliveries after which a message is quarantined in the dead-letter store.
    pub max_deliveries: u32,
    /// Supervisor back-off between failing drain cycles.
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            key_prefix: "annotflow".to_string(),
            inputs_bucket: "annotflow-inputs".to_string(),
            results_bucket: "annotflow-results".to_string(),
            vault: "annotflow-archive".to_string(),
            grace_period: Duration::from_secs(300),
            status_poll_interval: Duration::from_secs(10),
            queue_wait: Duration::from_secs(5),
            visibility_timeout: Duration::from_secs(60),
            scratch_dir: std::env::temp_dir().join("annotflow"),
            sidecar_ttl: Duration::from_secs(24 * 60 * 60),
            max_deliveries: 5,
            retry: RetryPolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by `ANNOTFLOW_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `ANNOTFLOW_*` name.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("ANNOTFLOW_KEY_PREFIX") {
            config.key_prefix = v;
        }
        if let Some(v) = lookup("ANNOTFLOW_INPUTS_BUCKET") {
            config.inputs_bucket = v;
        }
        if let Some(v) = lookup("ANNOTFLOW_RESULTS_BUCKET") {
            config.results_bucket = v;
        }
        if let Some(v) = lookup("ANNOTFLOW_VAULT") {
            config.vault = v;
        }
        if let Some(v) = lookup("ANNOTFLOW_SCRATCH_DIR") {
            config.scratch_dir = PathBuf::from(v);
        }

        let secs = |var: &'static str, target: &mut Duration| -> Result<(), ConfigError> {
            if let Some(v) = lookup(var) {
                *target = Duration::from_secs(parse(var, &v)?);
            }
            Ok(())
        };
        secs("ANNOTFLOW_GRACE_PERIOD_SECS", &mut config.grace_period)?;
        secs("ANNOTFLOW_STATUS_POLL_SECS", &mut config.status_poll_interval)?;
        secs("ANNOTFLOW_QUEUE_WAIT_SECS", &mut config.queue_wait)?;
        secs("ANNOTFLOW_VISIBILITY_TIMEOUT_SECS", &mut config.visibility_timeout)?;
        secs("ANNOTFLOW_SIDECAR_TTL_SECS", &mut config.sidecar_ttl)?;

        if let Some(v) = lookup("ANNOTFLOW_MAX_DELIVERIES") {
            config.max_deliveries = parse("ANNOTFLOW_MAX_DELIVERIES", &v)?;
        }

        Ok(config)
    }

    pub fn key_layout(&self) -> KeyLayout {
        KeyLayout::new(self.key_prefix.clone())
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_status_poll_interval(mut self, interval: Duration) -> Self {
        self.status_poll_interval = interval;
        self
    }

    pub fn with_queue_wait(mut self, wait: Duration) -> Self {
        self.queue_wait = wait;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn with_max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = max;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

fn parse<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_use_five_minute_grace_period() {
        let config = PipelineConfig::default();
        assert_eq!(config.grace_period, Duration::from_secs(300));
        assert_eq!(config.queue_wait, Duration::from_secs(5));
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("ANNOTFLOW_KEY_PREFIX", "gas"),
            ("ANNOTFLOW_GRACE_PERIOD_SECS", "60"),
            ("ANNOTFLOW_MAX_DELIVERIES", "3"),
        ]))
        .unwrap();

        assert_eq!(config.key_prefix, "gas");
        assert_eq!(config.grace_period, Duration::from_secs(60));
        assert_eq!(config.max_deliveries, 3);
        assert_eq!(config.results_bucket, PipelineConfig::default().results_bucket);
    }

    #[test]
    fn unparsable_number_is_rejected() {
        let err = PipelineConfig::from_lookup(lookup(&[("ANNOTFLOW_QUEUE_WAIT_SECS", "soon")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                var: "ANNOTFLOW_QUEUE_WAIT_SECS",
                value: "soon".to_string()
            }
        );
    }

    #[test]
    fn partial_json_config_fills_in_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"vault": "cold", "max_deliveries": 9}"#).unwrap();
        assert_eq!(config.vault, "cold");
        assert_eq!(config.max_deliveries, 9);
        assert_eq!(config.grace_period, Duration::from_secs(300));
    }
}
