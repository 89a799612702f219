//! # volantix Common
//!
//! Shared utilities for the volantix storage components.
//!
//! ## Logging
//!
//! ```rust
//! use volantix_common::init_logging;
//!
//! // Initialize with level
//! init_logging("info").unwrap();
//! ```

pub mod logging;

// Re-export logging functions
pub use logging::{init_logging, init_logging_json};
