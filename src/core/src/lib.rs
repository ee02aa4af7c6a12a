//! Funcforge Core - Foundational Types and Abstractions
//!
//! This module provides the foundational types shared across the funcforge
//! host builder: the error enum, the crate-wide `Result` alias, and the
//! cancelable build context.

pub mod context;
pub mod error;

// Re-export commonly used types
pub use context::{BuildContext, CancelHandle};
pub use error::{BuildError, Result};

/// Funcforge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
