//! Core utilities for the Forge render runtime.
//!
//! This crate provides foundational types used across the runtime:
//! - Error types and result aliases
//! - Logging initialization

mod error;
mod logging;

pub use error::{Error, Result};
pub use logging::init_logging;
