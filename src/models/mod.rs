//! Core data models for relaysync.
//!
//! - `config`: TOML configuration with per-field defaults
//! - `error`: error taxonomy and remote failure classification
//! - `item`: work items and their state machine

mod config;
mod error;
mod item;

pub use config::*;
pub use error::*;
pub use item::*;
