//! Fleet configuration.
//!
//! The single configuration surface of the fleet core. Loadable from a TOML
//! file; every field has a default so a partial file parses.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{EmulatorError, EmulatorResult};
use crate::types::ResourceAllocation;

/// Configuration for the emulator fleet and its allocation pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Hard cap on concurrently existing instances.
    pub max_emulators: usize,
    /// Instances created and started ahead of demand.
    pub pre_warm_count: usize,
    /// Android version new instances run, doubles as the image tag.
    pub android_version: String,
    /// Baseline resources merged under caller overrides.
    pub default_resources: ResourceAllocation,
    /// Inclusive start of the host ADB port range.
    pub adb_port_start: u16,
    /// Inclusive end of the host ADB port range.
    pub adb_port_end: u16,
    /// Container network mode ("bridge", "host", ...).
    pub network_mode: String,
    /// Per-instance bound on the device responsiveness probe.
    pub probe_timeout_secs: u64,
    /// Interval between background health sweeps.
    pub check_interval_secs: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_emulators: 10,
            pre_warm_count: 2,
            android_version: "13.0.0".to_string(),
            default_resources: ResourceAllocation::default(),
            adb_port_start: 5555,
            adb_port_end: 5755,
            network_mode: "bridge".to_string(),
            probe_timeout_secs: 5,
            check_interval_secs: 30,
        }
    }
}

impl FleetConfig {
    /// Load a fleet config from a TOML file.
    pub fn from_file(path: &Path) -> EmulatorResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EmulatorError::Config(format!("{}: {e}", path.display())))?;
        let config: FleetConfig =
            toml::from_str(&content).map_err(|e| EmulatorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> EmulatorResult<()> {
        if self.pre_warm_count > self.max_emulators {
            return Err(EmulatorError::Config(format!(
                "pre_warm_count {} exceeds max_emulators {}",
                self.pre_warm_count, self.max_emulators
            )));
        }
        if self.adb_port_start > self.adb_port_end {
            return Err(EmulatorError::Config(format!(
                "adb port range {}-{} is empty",
                self.adb_port_start, self.adb_port_end
            )));
        }
        if self.android_version.is_empty() {
            return Err(EmulatorError::Config(
                "android_version must not be empty".to_string(),
            ));
        }
        if self.probe_timeout_secs == 0 {
            return Err(EmulatorError::Config(
                "probe_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(FleetConfig::default().validate().is_ok());
    }

    #[test]
    fn prewarm_above_max_rejected() {
        let config = FleetConfig {
            max_emulators: 2,
            pre_warm_count: 3,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pre_warm_count"));
    }

    #[test]
    fn inverted_port_range_rejected() {
        let config = FleetConfig {
            adb_port_start: 5700,
            adb_port_end: 5600,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_probe_timeout_rejected() {
        let config = FleetConfig {
            probe_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: FleetConfig = toml::from_str(
            r#"
            max_emulators = 5
            pre_warm_count = 2
            android_version = "12.0.0"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_emulators, 5);
        assert_eq!(config.android_version, "12.0.0");
        assert_eq!(config.adb_port_start, 5555);
        assert_eq!(config.network_mode, "bridge");
    }

    #[test]
    fn toml_round_trip() {
        let config = FleetConfig {
            max_emulators: 7,
            pre_warm_count: 3,
            ..Default::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let back: FleetConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.max_emulators, 7);
        assert_eq!(back.pre_warm_count, 3);
    }
}
