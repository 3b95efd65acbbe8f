//! Error types for ballotd.
//!
//! Provides a unified error handling system using thiserror.

mod types;

pub use types::*;
