//! Health check probe logic.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::process::Command;
use tracing::debug;

use droidgrid_core::{EmulatorHealthStatus, epoch_secs};
use droidgrid_provider::EmulatorProvider;

/// Default bound on a single device responsiveness probe.
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Device property that reads `1` once Android has finished booting.
const BOOT_COMPLETED_PROP: &str = "sys.boot_completed";

/// Combines container run-state with a live device probe into a single
/// health verdict per instance.
pub struct EmulatorHealthChecker {
    provider: Arc<dyn EmulatorProvider>,
    probe_timeout: Duration,
}

impl EmulatorHealthChecker {
    pub fn new(provider: Arc<dyn EmulatorProvider>) -> Self {
        Self {
            provider,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Check a single instance.
    ///
    /// Never fails: an unknown id, a dead container, and every flavor of
    /// probe failure all come back as an unhealthy status with the cause
    /// in `error`. The device is only probed while its container runs, so
    /// `adb_responsive` can never be true for a stopped container.
    pub async fn check(&self, id: &str) -> EmulatorHealthStatus {
        let Some(info) = self.provider.get_info(id).await else {
            return EmulatorHealthStatus {
                id: id.to_string(),
                healthy: false,
                adb_responsive: false,
                container_running: false,
                last_checked: epoch_secs(),
                error: Some(format!("unknown emulator: {id}")),
            };
        };

        let (container_running, mut error) = match self.provider.get_state(id).await {
            Ok(state) => (state.is_active(), None),
            Err(e) => (false, Some(e.to_string())),
        };

        let adb_responsive = if container_running {
            match &info.adb_address {
                Some(address) => match probe_boot_completed(address, self.probe_timeout).await {
                    Ok(responsive) => responsive,
                    Err(cause) => {
                        debug!(%id, %cause, "adb probe failed");
                        error = Some(cause);
                        false
                    }
                },
                None => {
                    error = Some("instance has no adb address".to_string());
                    false
                }
            }
        } else {
            false
        };

        EmulatorHealthStatus {
            id: id.to_string(),
            healthy: container_running && adb_responsive,
            adb_responsive,
            container_running,
            last_checked: epoch_secs(),
            error,
        }
    }

    /// Check every instance the provider currently knows, concurrently.
    ///
    /// No ordering guarantee between results.
    pub async fn check_all(&self) -> Vec<EmulatorHealthStatus> {
        let instances = self.provider.list_all().await;
        join_all(instances.iter().map(|info| self.check(&info.id))).await
    }
}

/// Probe the device's boot-completion property over ADB.
///
/// Returns `Ok(true)` only for an exact `1`; `Ok(false)` for any other
/// well-formed answer; `Err` with a cause for timeouts, spawn failures,
/// and non-zero exits. The serial goes through an allow-list check before
/// it is handed to the adb client.
async fn probe_boot_completed(serial: &str, timeout: Duration) -> Result<bool, String> {
    validate_serial(serial)?;

    let output = Command::new("adb")
        .args(["-s", serial, "shell", "getprop", BOOT_COMPLETED_PROP])
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, output).await {
        Err(_) => Err(format!("adb probe timed out after {}s", timeout.as_secs())),
        Ok(Err(e)) => Err(format!("adb spawn failed: {e}")),
        Ok(Ok(output)) => {
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(format!("adb probe exited nonzero: {}", stderr.trim()));
            }
            Ok(parse_boot_completed(&output.stdout))
        }
    }
}

/// Only an exact `1` (modulo surrounding whitespace) counts as booted;
/// `0`, an empty property, and garbage are all "still booting".
fn parse_boot_completed(stdout: &[u8]) -> bool {
    String::from_utf8_lossy(stdout).trim() == "1"
}

/// Allow-list check on an ADB serial before it reaches a process
/// invocation. `host:port` serials and emulator serials only need
/// alphanumerics plus `. _ : -`.
fn validate_serial(serial: &str) -> Result<(), String> {
    if serial.is_empty() {
        return Err("empty adb serial".to_string());
    }
    if serial
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'))
    {
        Ok(())
    } else {
        Err(format!("adb serial {serial:?} contains disallowed characters"))
    }
}
