//! The backend capability contract.

use async_trait::async_trait;

use droidgrid_core::{EmulatorConfig, EmulatorInfo, EmulatorResult, EmulatorState, SnapshotInfo};

/// Contract every virtualization backend must satisfy.
///
/// Additional backends plug in behind this trait without touching the
/// manager, pool, health checker, or resource allocator.
#[async_trait]
pub trait EmulatorProvider: Send + Sync {
    /// Register and create the backing instance for `config`.
    ///
    /// The instance is created but not started; the returned record is in
    /// state [`EmulatorState::Creating`].
    async fn create(&self, config: &EmulatorConfig) -> EmulatorResult<EmulatorInfo>;

    /// Start a previously created instance.
    async fn start(&self, id: &str) -> EmulatorResult<()>;

    /// Stop a running instance. Stopping an already-stopped instance is
    /// not an error.
    async fn stop(&self, id: &str) -> EmulatorResult<()>;

    /// Stop (best-effort) and remove the backing instance, and drop the
    /// provider's record of `id` regardless of partial failure.
    async fn destroy(&self, id: &str) -> EmulatorResult<()>;

    /// Current lifecycle state, reconciled against the live backend.
    async fn get_state(&self, id: &str) -> EmulatorResult<EmulatorState>;

    /// The runtime record for `id`, if the provider knows it.
    async fn get_info(&self, id: &str) -> Option<EmulatorInfo>;

    /// Records for every instance this provider currently manages.
    async fn list_all(&self) -> Vec<EmulatorInfo>;

    /// Commit the instance's current disk state to a named, reusable image.
    async fn snapshot(&self, id: &str, name: &str) -> EmulatorResult<SnapshotInfo>;

    /// Restore an instance from a snapshot. Backends that cannot do this
    /// must fail with [`droidgrid_core::EmulatorError::Unsupported`].
    async fn restore_snapshot(&self, id: &str, snapshot_id: &str) -> EmulatorResult<()>;

    /// Network address of a backend container.
    async fn get_container_ip(&self, container_id: &str) -> EmulatorResult<String>;
}
