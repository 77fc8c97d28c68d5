use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

fn default_max_inflight_messages() -> usize {
    1024
}

fn default_delivery_buffer() -> usize {
    1024
}

fn default_transport_buffer() -> usize {
    64
}

fn default_event_buffer() -> usize {
    256
}

/// Top-level configuration for the Stratus runtime.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Session-core tunables. Authorization and persistence implementations are
/// supplied at broker construction, not through this file.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Upper bound on unacknowledged QoS-1 publishes per session. A session
    /// that would exceed this is closed ("too many inflight").
    #[serde(default = "default_max_inflight_messages")]
    pub max_inflight_messages: usize,

    /// Capacity of the per-session fabric delivery channel.
    #[serde(default = "default_delivery_buffer")]
    pub delivery_buffer: usize,

    /// Capacity of the decoded-packet channels between transport and session.
    #[serde(default = "default_transport_buffer")]
    pub transport_buffer: usize,

    /// Capacity of the broker event broadcast channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_inflight_messages: default_max_inflight_messages(),
            delivery_buffer: default_delivery_buffer(),
            transport_buffer: default_transport_buffer(),
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    /// Tracing filter directive, e.g. "info" or "stratus=debug".
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML or JSON file, selected by extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("failed to read config file {}", path_ref.display()))?;
        let cfg: Config = if is_json(path_ref) {
            serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))?
        } else {
            toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))?
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.broker.max_inflight_messages == 0 {
            bail!("broker.max_inflight_messages must be positive");
        }
        if self.broker.delivery_buffer == 0 || self.broker.transport_buffer == 0 {
            bail!("broker channel capacities must be positive");
        }
        Ok(())
    }
}

fn is_json(path: &Path) -> bool {
    matches!(path.extension().and_then(|s| s.to_str()), Some("json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.broker.max_inflight_messages, 1024);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_toml_roundtrip() {
        let doc = r#"
            [broker]
            max_inflight_messages = 16

            [telemetry]
            log_level = "debug"
        "#;
        let cfg: Config = toml::from_str(doc).unwrap();
        assert_eq!(cfg.broker.max_inflight_messages, 16);
        assert_eq!(cfg.telemetry.log_level.as_deref(), Some("debug"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_zero_inflight_rejected() {
        let doc = r#"
            [broker]
            max_inflight_messages = 0
        "#;
        let cfg: Config = toml::from_str(doc).unwrap();
        assert!(cfg.validate().is_err());
    }
}
