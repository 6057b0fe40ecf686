//! Time-related operations.
//!
//! Timers require the scheduler loop to be built with time enabled
//! (`LoopOptions::enable_time`, on by default).
//!
//! # Examples
//!
//! ```rust
//! use core_async::time::{sleep, timeout, Duration};
//!
//! async fn example() {
//!     let result = timeout(Duration::from_millis(10), sleep(Duration::from_secs(5))).await;
//!     assert!(result.is_err());
//! }
//! ```

pub use tokio::time::{error::Elapsed, interval, sleep, sleep_until, timeout, Interval, Sleep, Timeout};

pub use std::time::{Duration, Instant};
