//! droidgrid-provider — virtualization backends for the emulator fleet.
//!
//! [`EmulatorProvider`] is the only point of variability for backends:
//! the manager, pool, health checker, and resource allocator are all written
//! against it and never against a concrete engine. [`RedroidProvider`] is
//! the one implementation today, mapping each emulator 1:1 onto a redroid
//! (Android-in-container) Docker container.

pub mod provider;
pub mod redroid;

pub use provider::EmulatorProvider;
pub use redroid::RedroidProvider;
