//! droidgrid-resources — host capacity accounting for the emulator fleet.
//!
//! Answers two questions the pool cannot answer itself: how much of the
//! host is already committed to running instances, and how many more
//! instances of a given size the host can safely accept. Also applies
//! live memory/CPU limit changes to running instances through the engine.

pub mod allocator;

pub use allocator::ResourceAllocator;
