//! Splice Common Utilities
//!
//! Shared infrastructure for all Splice crates:
//! - Error taxonomy and result aliases
//! - Frame/time conversions and progress timing
//! - Tracing/logging initialization
//! - Configuration loading

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;

pub use clock::*;
pub use config::*;
pub use error::*;
