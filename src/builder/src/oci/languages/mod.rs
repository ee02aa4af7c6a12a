//! Per-runtime build strategies.
//!
//! Each supported runtime provides a [`LanguageBuilder`]: base image
//! selection, shared layer emission, per-platform layer emission, and
//! final config adjustment. Registration is a compile-time mapping from
//! runtime identifier to builder instance.

use std::sync::Arc;

use async_trait::async_trait;
use funcforge_core::Result;

use super::job::BuildJob;
use super::tarball::Layer;
use super::types::ConfigFile;
use crate::function::Platform;

mod go;
mod python;

pub use go::GoBuilder;
pub use python::PythonBuilder;

/// Strategy for building one language's functions.
#[async_trait]
pub trait LanguageBuilder: Send + Sync {
    /// The base image to build upon. An empty string means build from
    /// scratch. `custom` is any base explicitly requested on the function.
    fn base(&self, custom: &str) -> String;

    /// Layers shared by every platform image, such as generated
    /// dependencies.
    async fn write_shared(&self, job: &BuildJob) -> Result<Vec<Layer>>;

    /// Layers specific to one platform, such as a cross-compiled binary.
    async fn write_platform(&self, job: &BuildJob, platform: &Platform) -> Result<Vec<Layer>>;

    /// Final adjustments to the image config (entrypoint etc.). Called
    /// once per platform.
    fn configure(&self, job: &BuildJob, platform: &Platform, config: ConfigFile)
        -> Result<ConfigFile>;
}

/// Look up the builder registered for a runtime identifier.
pub fn for_runtime(runtime: &str) -> Option<Arc<dyn LanguageBuilder>> {
    match runtime {
        "go" => Some(Arc::new(GoBuilder)),
        "python" => Some(Arc::new(PythonBuilder)),
        _ => None,
    }
}

/// Whether a runtime has a registered builder. For UX.
pub fn is_supported(runtime: &str) -> bool {
    for_runtime(runtime).is_some()
}
