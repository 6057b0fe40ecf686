//! # Core Runtime Module
//!
//! Ambient infrastructure shared by the bridge crates:
//! - Bridge configuration (`config`)
//! - Logging and tracing setup (`logging`)
//! - Shared error type (`error`)
//!
//! Nothing here touches the scheduler loop; `core-async` owns that.

pub mod config;
pub mod error;
pub mod logging;

pub use config::BridgeConfig;
pub use error::{Error, Result};
