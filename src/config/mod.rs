//! Configuration module for ballotd.
//!
//! Handles loading and validating daemon configuration from TOML files.

mod settings;

pub use settings::*;
