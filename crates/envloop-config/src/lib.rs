//! Configuration for envloop
//!
//! This crate handles parsing of:
//! - The run configuration (mode, patch strategy, budgets, timeouts)
//! - The optional global config file (`~/.config/envloop/config.toml`)

mod error;
mod run;

pub use error::*;
pub use run::*;
