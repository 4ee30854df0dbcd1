//! Domain types for the emulator fleet.
//!
//! One [`EmulatorInfo`] exists per emulator for its entire lifetime; it is
//! the unit of truth the provider owns. Everything else here is either an
//! immutable creation spec or a derived, short-lived view.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier for a managed emulator instance.
pub type EmulatorId = String;

// ── Resources ─────────────────────────────────────────────────────

/// Per-instance resource allocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceAllocation {
    /// CPU cores granted to the instance.
    pub cpu_cores: u32,
    /// Memory limit in megabytes.
    pub memory_mb: u64,
    /// Disk budget in megabytes.
    pub storage_mb: u64,
}

impl Default for ResourceAllocation {
    fn default() -> Self {
        Self {
            cpu_cores: 2,
            memory_mb: 4096,
            storage_mb: 8192,
        }
    }
}

/// Caller-supplied partial overrides, merged over the pool-wide baseline.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceOverrides {
    pub cpu_cores: Option<u32>,
    pub memory_mb: Option<u64>,
    pub storage_mb: Option<u64>,
}

impl ResourceAllocation {
    /// Apply overrides on top of this baseline allocation.
    pub fn with_overrides(self, overrides: &ResourceOverrides) -> Self {
        Self {
            cpu_cores: overrides.cpu_cores.unwrap_or(self.cpu_cores),
            memory_mb: overrides.memory_mb.unwrap_or(self.memory_mb),
            storage_mb: overrides.storage_mb.unwrap_or(self.storage_mb),
        }
    }
}

// ── Emulator lifecycle ────────────────────────────────────────────

/// Lifecycle state of an emulator instance.
///
/// `Running`/`Ready` imply the backing container is actually alive;
/// `Stopped` implies it is not. A state observed by reconciliation against
/// the live engine wins over the last cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmulatorState {
    Creating,
    Booting,
    Ready,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
}

impl EmulatorState {
    /// Whether the backing container is expected to be alive.
    pub fn is_active(self) -> bool {
        matches!(self, EmulatorState::Running | EmulatorState::Ready)
    }

    /// Whether the instance still holds committed host memory
    /// (anything between creation and stop).
    pub fn holds_resources(self) -> bool {
        !matches!(self, EmulatorState::Stopped | EmulatorState::Error)
    }
}

/// Immutable creation spec for one emulator instance.
///
/// Produced once by the manager and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorConfig {
    pub id: EmulatorId,
    pub name: String,
    /// Target Android version, doubles as the redroid image tag.
    pub android_version: String,
    pub resources: ResourceAllocation,
    /// Host port the instance's ADB endpoint is bound to.
    pub adb_port: u16,
    pub network_mode: String,
}

/// Mutable runtime record for one emulator instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorInfo {
    pub id: EmulatorId,
    pub config: EmulatorConfig,
    pub state: EmulatorState,
    /// Backend container id, set once the engine has created the container.
    pub container_id: Option<String>,
    /// `host:port` address the instance's ADB endpoint answers on.
    pub adb_address: Option<String>,
    /// Container network address, discovered on start.
    pub ip_address: Option<String>,
    /// Unix timestamp (seconds) when the instance was created.
    pub created_at: u64,
    /// Last observed resource sample, if any.
    pub metrics: Option<EmulatorMetrics>,
}

/// Point-in-time resource sample for a running instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EmulatorMetrics {
    pub memory_bytes: u64,
    pub cpu_percent: f64,
    /// Unix timestamp (seconds) of the sample.
    pub observed_at: u64,
}

// ── Health ────────────────────────────────────────────────────────

/// Health verdict for a single instance.
///
/// Derived, never stored long-term. `healthy` is a pure function of the
/// two probe signals: `container_running && adb_responsive`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorHealthStatus {
    pub id: EmulatorId,
    pub healthy: bool,
    pub adb_responsive: bool,
    pub container_running: bool,
    /// Unix timestamp (seconds) of this check.
    pub last_checked: u64,
    pub error: Option<String>,
}

// ── Snapshots ─────────────────────────────────────────────────────

/// A named, reusable image committed from an instance's disk state.
///
/// Not a clone: the instance it was taken from keeps running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Backend commit id of the resulting image.
    pub id: String,
    pub emulator_id: EmulatorId,
    pub name: String,
    /// Unix timestamp (seconds) when the snapshot was taken.
    pub created_at: u64,
    pub size_mb: u64,
}

// ── Host & pool views ─────────────────────────────────────────────

/// Host capacity as seen by the resource allocator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HostResources {
    pub cpu_cores: usize,
    pub total_memory_mb: u64,
    /// Total minus memory already committed to running instances.
    pub available_memory_mb: u64,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub available: usize,
    pub allocated: usize,
    pub total: usize,
    pub max: usize,
}

/// Current Unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
