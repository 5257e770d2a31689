use anyhow::Result;
use config::{Config, Environment};
use serde::Deserialize;

fn default_finalize_timeout_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_chain_rebid_factor() -> f64 {
    1.1
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// How long `execute_workflow` waits for an actor to reach `Completed`
    /// before the workflow is aborted with a timeout error.
    #[serde(default = "default_finalize_timeout_ms")]
    pub finalize_timeout_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Multiplier applied to the previous clearing price when chained
    /// auctions re-bid the previous winners.
    #[serde(default = "default_chain_rebid_factor")]
    pub chain_rebid_factor: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            finalize_timeout_ms: default_finalize_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            chain_rebid_factor: default_chain_rebid_factor(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PrometheusExporterConfig {
    /// Exporter is only started when a bind address is configured.
    pub bind_address: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    controller: ControllerConfig,
    #[serde(default)]
    prometheus_exporter: PrometheusExporterConfig,
}

impl Configuration {
    pub fn new(filename: &str) -> Result<Self> {
        Ok(Config::builder()
            .add_source(config::File::with_name(filename))
            .add_source(
                Environment::with_prefix("ae")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<Configuration>()?)
    }

    pub fn get_controller_config(&self) -> &ControllerConfig {
        &self.controller
    }

    pub fn get_prometheus_exporter_bind_address(&self) -> Option<String> {
        self.prometheus_exporter.bind_address.clone()
    }
}

/// Settings context threaded into every constructor that needs engine
/// configuration. Kept separate from `Configuration` so callers can grow it
/// without touching the deserialized shape.
pub struct Register {
    pub config: Configuration,
}

impl Register {
    pub fn new(config: Configuration) -> Self {
        Self { config }
    }

    /// Configuration file plus `ae__`-prefixed environment overrides.
    pub fn from_file(filename: &str) -> Result<Self> {
        Ok(Self::new(Configuration::new(filename)?))
    }
}

impl Default for Register {
    fn default() -> Self {
        Self::new(Configuration::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable_without_a_config_file() {
        let configuration = Configuration::default();
        let controller = configuration.get_controller_config();

        assert_eq!(controller.finalize_timeout_ms, 10_000);
        assert_eq!(controller.poll_interval_ms, 50);
        assert!((controller.chain_rebid_factor - 1.1).abs() < f64::EPSILON);
        assert!(configuration.get_prometheus_exporter_bind_address().is_none());
    }

    #[test]
    fn default_register_carries_default_settings() {
        let register = Register::default();

        assert_eq!(register.config.get_controller_config().finalize_timeout_ms, 10_000);
    }
}
