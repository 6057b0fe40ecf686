//! Workspace placeholder crate.
//!
//! This crate exists to expose shared feature flags that map to the individual
//! workspace crates (`core-bridge`, `core-runtime`). Test suites can depend on
//! `isolated-async-workspace` and enable the documented features without
//! wiring each crate individually.

#[cfg(feature = "bridge")]
pub use core_bridge as bridge;

#[cfg(feature = "logging")]
pub use core_runtime::logging;
