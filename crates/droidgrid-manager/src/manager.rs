//! Emulator manager.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};
use uuid::Uuid;

use droidgrid_core::{
    EmulatorConfig, EmulatorError, EmulatorInfo, EmulatorResult, EmulatorState, FleetConfig,
    ResourceOverrides, SnapshotInfo,
};
use droidgrid_provider::EmulatorProvider;

/// Adds identity, ADB port allocation, and default-resource merging in
/// front of a provider.
///
/// The manager exclusively owns the set of ADB ports currently in use.
/// Port reservation happens inside one lock so concurrent `create` calls
/// can never be handed the same port; a reservation is rolled back when
/// the provider call behind it fails.
pub struct EmulatorManager {
    provider: Arc<dyn EmulatorProvider>,
    config: FleetConfig,
    used_ports: Mutex<HashSet<u16>>,
}

impl EmulatorManager {
    pub fn new(provider: Arc<dyn EmulatorProvider>, config: FleetConfig) -> Self {
        Self {
            provider,
            config,
            used_ports: Mutex::new(HashSet::new()),
        }
    }

    /// Create and register a new emulator instance.
    ///
    /// Generates a fresh identity, merges `overrides` over the fleet's
    /// default resources, and allocates an ADB port unless `adb_port`
    /// pins one explicitly. The port stays reserved only if the provider
    /// create succeeds.
    pub async fn create(
        &self,
        overrides: Option<ResourceOverrides>,
        adb_port: Option<u16>,
    ) -> EmulatorResult<EmulatorInfo> {
        let short = Uuid::new_v4().simple().to_string();
        let id = format!("emu-{}", &short[..8]);
        let name = format!("redroid-{}", &short[..8]);

        let resources = self
            .config
            .default_resources
            .with_overrides(&overrides.unwrap_or_default());

        let port = match adb_port {
            Some(port) => self.reserve_explicit_port(port)?,
            None => self.allocate_port()?,
        };

        let emulator_config = EmulatorConfig {
            id: id.clone(),
            name,
            android_version: self.config.android_version.clone(),
            resources,
            adb_port: port,
            network_mode: self.config.network_mode.clone(),
        };

        match self.provider.create(&emulator_config).await {
            Ok(info) => {
                info!(%id, port, "emulator registered");
                Ok(info)
            }
            Err(e) => {
                self.release_port(port);
                Err(e)
            }
        }
    }

    /// Destroy an instance and release its ADB port.
    ///
    /// The port is read from the provider before the destroy call, because
    /// destroy drops the provider's record; it is released from the used
    /// set even when the provider call partially fails. Destroying an id
    /// the provider no longer knows is a tolerated no-op.
    pub async fn destroy(&self, id: &str) -> EmulatorResult<()> {
        let port = self
            .provider
            .get_info(id)
            .await
            .map(|info| info.config.adb_port);

        let result = self.provider.destroy(id).await;

        if let Some(port) = port {
            self.release_port(port);
        }

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(%id, "destroy of unknown emulator ignored");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn start(&self, id: &str) -> EmulatorResult<()> {
        self.provider.start(id).await
    }

    pub async fn stop(&self, id: &str) -> EmulatorResult<()> {
        self.provider.stop(id).await
    }

    pub async fn get_state(&self, id: &str) -> EmulatorResult<EmulatorState> {
        self.provider.get_state(id).await
    }

    pub async fn get_info(&self, id: &str) -> Option<EmulatorInfo> {
        self.provider.get_info(id).await
    }

    pub async fn list_all(&self) -> Vec<EmulatorInfo> {
        self.provider.list_all().await
    }

    pub async fn snapshot(&self, id: &str, name: &str) -> EmulatorResult<SnapshotInfo> {
        self.provider.snapshot(id, name).await
    }

    pub async fn restore_snapshot(&self, id: &str, snapshot_id: &str) -> EmulatorResult<()> {
        self.provider.restore_snapshot(id, snapshot_id).await
    }

    /// Number of ADB ports currently reserved.
    pub fn used_port_count(&self) -> usize {
        self.used_ports.lock().expect("port set poisoned").len()
    }

    /// First free port in the configured range, reserved atomically.
    ///
    /// Exhaustion is fatal to the calling create: the operator must widen
    /// the range or destroy existing instances.
    fn allocate_port(&self) -> EmulatorResult<u16> {
        let mut used = self.used_ports.lock().expect("port set poisoned");
        for port in self.config.adb_port_start..=self.config.adb_port_end {
            if !used.contains(&port) {
                used.insert(port);
                return Ok(port);
            }
        }
        Err(EmulatorError::PortRangeExhausted {
            start: self.config.adb_port_start,
            end: self.config.adb_port_end,
        })
    }

    fn reserve_explicit_port(&self, port: u16) -> EmulatorResult<u16> {
        let mut used = self.used_ports.lock().expect("port set poisoned");
        if !used.insert(port) {
            return Err(EmulatorError::Validation(format!(
                "adb port {port} is already in use"
            )));
        }
        Ok(port)
    }

    fn release_port(&self, port: u16) {
        self.used_ports.lock().expect("port set poisoned").remove(&port);
    }
}
