//! droidgrid-core — shared domain types for the DroidGrid emulator fleet.
//!
//! Defines the emulator lifecycle model (configs, runtime records, states),
//! the typed error enum used across all fleet crates, and the TOML-loadable
//! fleet configuration.
//!
//! The provider crate owns the id → [`EmulatorInfo`] registry, the manager
//! owns the ADB port set, and the pool owns the available/allocated id sets;
//! this crate only defines the vocabulary they share.

pub mod config;
pub mod error;
pub mod types;

pub use config::FleetConfig;
pub use error::{EmulatorError, EmulatorResult};
pub use types::*;
