//! Redroid backend — one emulator instance per redroid container.
//!
//! Redroid runs Android inside a privileged container; the host-selected
//! ADB port is bound to the container's fixed internal ADB port and screen
//! geometry is passed as boot arguments. The provider owns the
//! id → [`EmulatorInfo`] registry; state reads reconcile the cached value
//! against a live container inspect.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::{
    Docker,
    errors::Error as BollardError,
    models::{ContainerConfig, ContainerCreateBody, HostConfig, PortBinding},
    query_parameters::{
        CommitContainerOptionsBuilder, CreateContainerOptionsBuilder, InspectContainerOptions,
        RemoveContainerOptionsBuilder, StartContainerOptions, StopContainerOptionsBuilder,
    },
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use droidgrid_core::{
    EmulatorConfig, EmulatorError, EmulatorInfo, EmulatorResult, EmulatorState, SnapshotInfo,
    epoch_secs,
};

use crate::provider::EmulatorProvider;

/// Image repository redroid instances boot from; the Android version is
/// the tag.
const REDROID_IMAGE: &str = "redroid/redroid";

/// Fixed ADB port inside every redroid container.
const CONTAINER_ADB_PORT: u16 = 5555;

/// Image repository snapshot commits are tagged under.
const SNAPSHOT_REPO: &str = "droidgrid/snapshots";

const SCREEN_WIDTH: u32 = 720;
const SCREEN_HEIGHT: u32 = 1280;
const SCREEN_FPS: u32 = 30;

/// Seconds the engine waits before killing a container on stop.
const STOP_TIMEOUT_SECS: i32 = 10;

/// Docker-backed provider running redroid containers.
pub struct RedroidProvider {
    docker: Docker,
    registry: Arc<RwLock<HashMap<String, EmulatorInfo>>>,
}

impl RedroidProvider {
    /// Connect to the local container engine.
    pub fn new() -> EmulatorResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EmulatorError::Engine(e.into()))?;
        Ok(Self::with_docker(docker))
    }

    /// Build a provider over an existing engine connection.
    pub fn with_docker(docker: Docker) -> Self {
        Self {
            docker,
            registry: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn set_state(&self, id: &str, state: EmulatorState) {
        if let Some(info) = self.registry.write().await.get_mut(id) {
            info.state = state;
        }
    }

    async fn container_id(&self, id: &str) -> EmulatorResult<String> {
        let registry = self.registry.read().await;
        registry
            .get(id)
            .and_then(|info| info.container_id.clone())
            .ok_or_else(|| EmulatorError::NotFound(id.to_string()))
    }
}

/// Container name the engine sees for an emulator.
fn container_name(config: &EmulatorConfig) -> String {
    format!("droidgrid-{}", config.name)
}

/// Redroid kernel boot arguments for screen geometry.
fn boot_args() -> Vec<String> {
    vec![
        format!("androidboot.redroid_width={SCREEN_WIDTH}"),
        format!("androidboot.redroid_height={SCREEN_HEIGHT}"),
        format!("androidboot.redroid_fps={SCREEN_FPS}"),
    ]
}

/// Build the container creation body for an emulator config.
///
/// Privileged mode is required for redroid's graphics and input stacks.
fn container_body(config: &EmulatorConfig) -> ContainerCreateBody {
    let adb_key = format!("{CONTAINER_ADB_PORT}/tcp");

    let mut port_bindings = HashMap::new();
    port_bindings.insert(
        adb_key.clone(),
        Some(vec![PortBinding {
            host_ip: Some("0.0.0.0".to_string()),
            host_port: Some(config.adb_port.to_string()),
        }]),
    );

    let mut exposed_ports = HashMap::new();
    exposed_ports.insert(adb_key, HashMap::new());

    ContainerCreateBody {
        image: Some(format!("{REDROID_IMAGE}:{}", config.android_version)),
        cmd: Some(boot_args()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(HostConfig {
            privileged: Some(true),
            port_bindings: Some(port_bindings),
            memory: Some(memory_bytes(config.resources.memory_mb)),
            nano_cpus: Some(nano_cpus(config.resources.cpu_cores)),
            network_mode: Some(config.network_mode.clone()),
            ..HostConfig::default()
        }),
        ..ContainerCreateBody::default()
    }
}

fn memory_bytes(memory_mb: u64) -> i64 {
    (memory_mb as i64) * 1024 * 1024
}

fn nano_cpus(cores: u32) -> i64 {
    i64::from(cores) * 1_000_000_000
}

/// Reconcile the cached state against a live inspect.
///
/// The live engine is authoritative, with one exception: a container
/// process being up does not mean Android has finished booting, so a
/// cached `Booting` survives a live `running`.
fn reconcile_state(cached: EmulatorState, running: bool, paused: bool) -> EmulatorState {
    if paused {
        EmulatorState::Paused
    } else if running {
        if cached == EmulatorState::Booting {
            EmulatorState::Booting
        } else {
            EmulatorState::Running
        }
    } else {
        EmulatorState::Stopped
    }
}

/// Restrict a snapshot name to characters safe to use as an image tag.
fn sanitize_snapshot_name(name: &str) -> EmulatorResult<String> {
    let sanitized: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    if sanitized.is_empty() {
        return Err(EmulatorError::Validation(format!(
            "snapshot name {name:?} contains no usable characters"
        )));
    }
    Ok(sanitized)
}

fn engine_err(e: BollardError) -> EmulatorError {
    EmulatorError::Engine(e.into())
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code, .. } if *status_code == 404
    )
}

fn is_not_modified(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code, .. } if *status_code == 304
    )
}

#[async_trait]
impl EmulatorProvider for RedroidProvider {
    async fn create(&self, config: &EmulatorConfig) -> EmulatorResult<EmulatorInfo> {
        let name = container_name(config);
        let body = container_body(config);

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&name).build()),
                body,
            )
            .await
            .map_err(engine_err)?;

        let info = EmulatorInfo {
            id: config.id.clone(),
            config: config.clone(),
            state: EmulatorState::Creating,
            container_id: Some(created.id.clone()),
            adb_address: Some(format!("127.0.0.1:{}", config.adb_port)),
            ip_address: None,
            created_at: epoch_secs(),
            metrics: None,
        };

        self.registry
            .write()
            .await
            .insert(config.id.clone(), info.clone());

        info!(
            id = %config.id,
            container = %created.id,
            adb_port = config.adb_port,
            "emulator container created"
        );
        Ok(info)
    }

    async fn start(&self, id: &str) -> EmulatorResult<()> {
        let container_id = self.container_id(id).await?;

        self.docker
            .start_container(&container_id, None::<StartContainerOptions>)
            .await
            .map_err(engine_err)?;

        let inspect = self
            .docker
            .inspect_container(&container_id, None::<InspectContainerOptions>)
            .await
            .map_err(engine_err)?;

        let running = inspect
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        let ip = inspect
            .network_settings
            .as_ref()
            .and_then(|net| net.networks.as_ref())
            .and_then(|networks| networks.values().next())
            .and_then(|endpoint| endpoint.ip_address.clone())
            .filter(|ip| !ip.is_empty());

        {
            let mut registry = self.registry.write().await;
            if let Some(info) = registry.get_mut(id) {
                info.state = if running {
                    EmulatorState::Running
                } else {
                    EmulatorState::Booting
                };
                info.ip_address = ip;
            }
        }

        info!(%id, running, "emulator started");
        Ok(())
    }

    async fn stop(&self, id: &str) -> EmulatorResult<()> {
        let container_id = self.container_id(id).await?;
        self.set_state(id, EmulatorState::Stopping).await;

        let result = self
            .docker
            .stop_container(
                &container_id,
                Some(StopContainerOptionsBuilder::new().t(STOP_TIMEOUT_SECS).build()),
            )
            .await;

        match result {
            Ok(()) => {}
            Err(e) if is_not_modified(&e) || is_not_found(&e) => {
                debug!(%id, "container already stopped");
            }
            Err(e) => return Err(engine_err(e)),
        }

        self.set_state(id, EmulatorState::Stopped).await;
        info!(%id, "emulator stopped");
        Ok(())
    }

    async fn destroy(&self, id: &str) -> EmulatorResult<()> {
        let container_id = self.container_id(id).await?;

        // Best-effort stop; the forced remove below handles a still-running
        // container anyway.
        if let Err(e) = self
            .docker
            .stop_container(
                &container_id,
                Some(StopContainerOptionsBuilder::new().t(STOP_TIMEOUT_SECS).build()),
            )
            .await
        {
            debug!(%id, error = %e, "pre-destroy stop failed");
        }

        let removed = self
            .docker
            .remove_container(
                &container_id,
                Some(
                    RemoveContainerOptionsBuilder::new()
                        .force(true)
                        .v(true)
                        .build(),
                ),
            )
            .await;

        // The registry entry goes away no matter what, so a half-dead
        // container can never pin its id and port forever.
        self.registry.write().await.remove(id);

        match removed {
            Ok(()) => {
                info!(%id, "emulator destroyed");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(%id, "container already removed");
                Ok(())
            }
            Err(e) => {
                warn!(%id, error = %e, "container remove failed, record dropped");
                Err(engine_err(e))
            }
        }
    }

    async fn get_state(&self, id: &str) -> EmulatorResult<EmulatorState> {
        let (cached, container_id) = {
            let registry = self.registry.read().await;
            let info = registry
                .get(id)
                .ok_or_else(|| EmulatorError::NotFound(id.to_string()))?;
            (info.state, info.container_id.clone())
        };

        let Some(container_id) = container_id else {
            return Ok(cached);
        };

        let state = match self
            .docker
            .inspect_container(&container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => {
                let running = inspect
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                let paused = inspect
                    .state
                    .as_ref()
                    .and_then(|s| s.paused)
                    .unwrap_or(false);
                reconcile_state(cached, running, paused)
            }
            Err(e) => {
                warn!(%id, error = %e, "container inspect failed");
                EmulatorState::Error
            }
        };

        self.set_state(id, state).await;
        Ok(state)
    }

    async fn get_info(&self, id: &str) -> Option<EmulatorInfo> {
        self.registry.read().await.get(id).cloned()
    }

    async fn list_all(&self) -> Vec<EmulatorInfo> {
        self.registry.read().await.values().cloned().collect()
    }

    async fn snapshot(&self, id: &str, name: &str) -> EmulatorResult<SnapshotInfo> {
        let sanitized = sanitize_snapshot_name(name)?;
        let container_id = self.container_id(id).await?;

        let commit = self
            .docker
            .commit_container(
                CommitContainerOptionsBuilder::new()
                    .container(&container_id)
                    .repo(SNAPSHOT_REPO)
                    .tag(&sanitized)
                    .build(),
                ContainerConfig::default(),
            )
            .await
            .map_err(engine_err)?;

        let size_mb = match self
            .docker
            .inspect_image(&format!("{SNAPSHOT_REPO}:{sanitized}"))
            .await
        {
            Ok(image) => image.size.unwrap_or(0) as u64 / (1024 * 1024),
            Err(e) => {
                debug!(%id, error = %e, "snapshot image inspect failed");
                0
            }
        };

        info!(%id, name = %sanitized, commit = %commit.id, "snapshot committed");
        Ok(SnapshotInfo {
            id: commit.id,
            emulator_id: id.to_string(),
            name: sanitized,
            created_at: epoch_secs(),
            size_mb,
        })
    }

    async fn restore_snapshot(&self, _id: &str, _snapshot_id: &str) -> EmulatorResult<()> {
        Err(EmulatorError::Unsupported(
            "snapshot restore is not implemented for the redroid backend".to_string(),
        ))
    }

    async fn get_container_ip(&self, container_id: &str) -> EmulatorResult<String> {
        let inspect = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(engine_err)?;

        inspect
            .network_settings
            .as_ref()
            .and_then(|net| net.networks.as_ref())
            .and_then(|networks| networks.values().next())
            .and_then(|endpoint| endpoint.ip_address.clone())
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| {
                EmulatorError::Engine(anyhow::anyhow!(
                    "container {container_id} has no network address"
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use droidgrid_core::ResourceAllocation;

    fn test_config() -> EmulatorConfig {
        EmulatorConfig {
            id: "emu-test".to_string(),
            name: "test".to_string(),
            android_version: "13.0.0".to_string(),
            resources: ResourceAllocation {
                cpu_cores: 4,
                memory_mb: 2048,
                storage_mb: 8192,
            },
            adb_port: 5600,
            network_mode: "bridge".to_string(),
        }
    }

    #[test]
    fn body_sets_privileged_and_limits() {
        let body = container_body(&test_config());
        let host = body.host_config.unwrap();
        assert_eq!(host.privileged, Some(true));
        assert_eq!(host.memory, Some(2048 * 1024 * 1024));
        assert_eq!(host.nano_cpus, Some(4_000_000_000));
        assert_eq!(host.network_mode.as_deref(), Some("bridge"));
    }

    #[test]
    fn body_binds_host_port_to_container_adb() {
        let body = container_body(&test_config());
        let bindings = body.host_config.unwrap().port_bindings.unwrap();
        let adb = bindings.get("5555/tcp").unwrap().as_ref().unwrap();
        assert_eq!(adb[0].host_port.as_deref(), Some("5600"));
    }

    #[test]
    fn body_uses_version_as_image_tag() {
        let body = container_body(&test_config());
        assert_eq!(body.image.as_deref(), Some("redroid/redroid:13.0.0"));
    }

    #[test]
    fn boot_args_carry_screen_geometry() {
        let args = boot_args();
        assert!(args.contains(&"androidboot.redroid_width=720".to_string()));
        assert!(args.contains(&"androidboot.redroid_height=1280".to_string()));
        assert!(args.contains(&"androidboot.redroid_fps=30".to_string()));
    }

    #[test]
    fn reconcile_prefers_live_stopped() {
        let state = reconcile_state(EmulatorState::Running, false, false);
        assert_eq!(state, EmulatorState::Stopped);
    }

    #[test]
    fn reconcile_preserves_booting_while_container_runs() {
        let state = reconcile_state(EmulatorState::Booting, true, false);
        assert_eq!(state, EmulatorState::Booting);
    }

    #[test]
    fn reconcile_promotes_to_running() {
        let state = reconcile_state(EmulatorState::Stopped, true, false);
        assert_eq!(state, EmulatorState::Running);
    }

    #[test]
    fn reconcile_maps_paused() {
        let state = reconcile_state(EmulatorState::Running, true, true);
        assert_eq!(state, EmulatorState::Paused);
    }

    #[test]
    fn sanitize_strips_disallowed_characters() {
        assert_eq!(
            sanitize_snapshot_name("base line/v2!").unwrap(),
            "baselinev2"
        );
        assert_eq!(
            sanitize_snapshot_name("nightly_2026-08.05").unwrap(),
            "nightly_2026-08.05"
        );
    }

    #[test]
    fn sanitize_rejects_all_disallowed_input() {
        let err = sanitize_snapshot_name("!!/ /!!").unwrap_err();
        assert!(matches!(err, EmulatorError::Validation(_)));
    }

    #[test]
    fn memory_and_cpu_conversions() {
        assert_eq!(memory_bytes(1), 1024 * 1024);
        assert_eq!(nano_cpus(2), 2_000_000_000);
    }
}
