//! droidgrid-health — liveness determination for emulator instances.
//!
//! Health is a two-signal verdict: the container must be running *and*
//! the device behind its ADB address must answer a bounded boot-completion
//! probe. Either signal alone is not enough — a container can be up while
//! Android inside it is wedged, and a cached record can claim an address
//! whose container is long gone.

pub mod checker;
pub mod monitor;

pub use checker::EmulatorHealthChecker;
pub use monitor::HealthMonitor;
