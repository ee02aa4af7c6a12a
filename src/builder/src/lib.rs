//! Funcforge Builder - Host-native OCI image builder.
//!
//! Builds a function source tree into a multi-platform OCI image layout
//! on the local filesystem, without delegating to a container daemon.
//! Runtime support is pluggable; Go functions are cross-compiled per
//! platform, Python functions ship their interpreter dependencies as
//! shared layers.
//!
//! ```ignore
//! let builder = Builder::new(false).with_templates("templates");
//! builder.build(&BuildContext::background(), &function, &platforms).await?;
//! ```

pub mod fingerprint;
pub mod function;
pub mod oci;
pub mod scaffolding;

// Re-export common types
pub use function::{default_platforms, Env, Function, Platform, Volume, RUN_DATA_DIR};
pub use oci::{is_supported, Builder};

pub use funcforge_core::{BuildContext, BuildError, CancelHandle, Result};

/// Funcforge Builder version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
