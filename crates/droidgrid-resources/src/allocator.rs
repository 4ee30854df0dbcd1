//! Resource allocator.

use std::sync::Arc;

use bollard::{Docker, models::ContainerUpdateBody};
use sysinfo::System;
use tracing::{debug, info};

use droidgrid_core::{
    EmulatorError, EmulatorInfo, EmulatorResult, HostResources, ResourceAllocation,
};
use droidgrid_provider::EmulatorProvider;

/// Fraction of total host memory held back when no fleet registry is
/// wired in and committed memory cannot be summed per instance.
const FALLBACK_RESERVED_DIVISOR: u64 = 4;

/// Queries host capacity, applies live limit changes, and computes how
/// many more instances the host can safely accept.
pub struct ResourceAllocator {
    docker: Docker,
    provider: Option<Arc<dyn EmulatorProvider>>,
}

impl ResourceAllocator {
    /// Allocator without a fleet registry.
    ///
    /// Host availability falls back to a conservative fixed-fraction
    /// reservation; use [`ResourceAllocator::with_provider`] once a fleet
    /// exists so committed memory is subtracted per instance.
    pub fn new() -> EmulatorResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EmulatorError::Engine(e.into()))?;
        Ok(Self::with_docker(docker))
    }

    /// Allocator over an existing engine connection.
    pub fn with_docker(docker: Docker) -> Self {
        Self {
            docker,
            provider: None,
        }
    }

    /// Account committed memory against the given provider's registry.
    pub fn with_provider(mut self, provider: Arc<dyn EmulatorProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Total CPU/memory capacity of the host and what is still available.
    ///
    /// Available memory is total minus the configured limits of every
    /// instance currently holding resources. Reporting available = total
    /// while instances run would let the pool oversubscribe the host, so
    /// without a registry a fixed quarter of total memory is reserved
    /// instead.
    pub async fn host_resources(&self) -> HostResources {
        let sys = System::new_all();
        let cpu_cores = sys.cpus().len();
        let total_memory_mb = sys.total_memory() / (1024 * 1024);

        let committed_mb = match &self.provider {
            Some(provider) => Some(committed_memory_mb(&provider.list_all().await)),
            None => None,
        };
        let available_memory_mb = available_memory_mb(total_memory_mb, committed_mb);

        debug!(
            cpu_cores,
            total_memory_mb, available_memory_mb, "host resources sampled"
        );
        HostResources {
            cpu_cores,
            total_memory_mb,
            available_memory_mb,
        }
    }

    /// Apply a live memory and/or CPU limit change to a running instance.
    ///
    /// Partial updates are supported; omitted fields keep their current
    /// engine-side value.
    pub async fn update_resources(
        &self,
        id: &str,
        memory_mb: Option<u64>,
        cpu_cores: Option<u32>,
    ) -> EmulatorResult<()> {
        let provider = self.provider.as_ref().ok_or_else(|| {
            EmulatorError::Unsupported("resource updates require a fleet provider".to_string())
        })?;

        let container_id = provider
            .get_info(id)
            .await
            .and_then(|info| info.container_id)
            .ok_or_else(|| EmulatorError::NotFound(id.to_string()))?;

        let memory = memory_mb.map(|mb| (mb as i64) * 1024 * 1024);
        let update = ContainerUpdateBody {
            memory,
            // Swap tracks the memory limit so a shrunk instance cannot
            // spill the difference into swap.
            memory_swap: memory,
            nano_cpus: cpu_cores.map(|cores| i64::from(cores) * 1_000_000_000),
            ..ContainerUpdateBody::default()
        };

        self.docker
            .update_container(&container_id, update)
            .await
            .map_err(|e| EmulatorError::Engine(e.into()))?;

        info!(%id, ?memory_mb, ?cpu_cores, "instance limits updated");
        Ok(())
    }

    /// How many instances of the requested size fit in what is left of
    /// host memory.
    pub async fn calculate_max_emulators(&self, resources: &ResourceAllocation) -> usize {
        let host = self.host_resources().await;
        max_instances_for(host.available_memory_mb, resources.memory_mb)
    }
}

/// Sum of configured memory limits over instances that still hold
/// host memory.
fn committed_memory_mb(instances: &[EmulatorInfo]) -> u64 {
    instances
        .iter()
        .filter(|info| info.state.holds_resources())
        .map(|info| info.config.resources.memory_mb)
        .sum()
}

fn available_memory_mb(total_mb: u64, committed_mb: Option<u64>) -> u64 {
    match committed_mb {
        Some(committed) => total_mb.saturating_sub(committed),
        None => total_mb.saturating_sub(total_mb / FALLBACK_RESERVED_DIVISOR),
    }
}

fn max_instances_for(available_mb: u64, per_instance_mb: u64) -> usize {
    if per_instance_mb == 0 || available_mb == 0 {
        return 0;
    }
    (available_mb / per_instance_mb) as usize
}
