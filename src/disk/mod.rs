//! Staging directory disk budget.
//!
//! The monitor measures the staging area on a timer and on demand, and
//! publishes a paused/unpaused signal that the download stage waits on.

mod monitor;

pub use monitor::*;
