//! Build job state and workspace layout.
//!
//! A [`BuildJob`] gathers everything a single build needs: the function
//! being built, the platforms requested, the fingerprint of the source
//! tree at job start, and accessors for the on-disk workspace rooted at
//! `<project>/.func`:
//!
//! ```text
//! builds/
//!   by-hash/<fingerprint>/      one directory per attempt
//!       oci/                    image layout (oci-layout, index.json, blobs/)
//!       result/                 intermediate compile outputs
//!       service/                scaffolded wrapper source
//!   by-pid/<pid>                liveness link -> ../by-hash/<fingerprint>
//!   last                        link to the last successful attempt
//! blob-cache/<hex>              cross-build base-layer cache
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use funcforge_core::{BuildContext, BuildError, Result};

use super::languages::{self, LanguageBuilder};
use crate::fingerprint;
use crate::function::{default_platforms, Function, Platform, RUN_DATA_DIR};

/// State for a single build attempt.
#[derive(Clone)]
pub struct BuildJob {
    /// Cancellation context for this build.
    pub ctx: BuildContext,
    /// Job start time; becomes the image `created` timestamp.
    pub start: DateTime<Utc>,
    /// Fingerprint of the project tree at job start.
    pub fingerprint: String,
    /// The function being built.
    pub function: Function,
    /// Platforms to produce images for.
    pub platforms: Vec<Platform>,
    /// Strategy for the function's runtime.
    pub language_builder: Arc<dyn LanguageBuilder>,
    /// Log shell-equivalent operations while building.
    pub verbose: bool,
}

impl BuildJob {
    pub(crate) fn new(
        ctx: BuildContext,
        function: Function,
        platforms: &[Platform],
        verbose: bool,
    ) -> Result<Self> {
        let platforms = if platforms.is_empty() {
            default_platforms()
        } else {
            platforms.to_vec()
        };

        let fingerprint = fingerprint::fingerprint(&function.root)?;

        let language_builder = languages::for_runtime(&function.runtime)
            .ok_or_else(|| BuildError::UnsupportedRuntime(function.runtime.clone()))?;

        Ok(Self {
            ctx,
            start: Utc::now(),
            fingerprint,
            function,
            platforms,
            language_builder,
            verbose,
        })
    }

    fn run_data_dir(&self) -> PathBuf {
        self.function.root.join(RUN_DATA_DIR)
    }

    /// `builds/last`, the pointer to the most recent successful attempt.
    pub fn last_link(&self) -> PathBuf {
        self.run_data_dir().join("builds").join("last")
    }

    /// `builds/by-pid`, the liveness link directory.
    pub fn pids_dir(&self) -> PathBuf {
        self.run_data_dir().join("builds").join("by-pid")
    }

    /// This process's liveness link.
    pub fn pid_link(&self) -> PathBuf {
        self.pids_dir().join(std::process::id().to_string())
    }

    /// `builds/by-hash`, the per-attempt directory root.
    pub fn builds_dir(&self) -> PathBuf {
        self.run_data_dir().join("builds").join("by-hash")
    }

    /// This attempt's build directory.
    pub fn build_dir(&self) -> PathBuf {
        self.builds_dir().join(&self.fingerprint)
    }

    /// The OCI image layout being produced.
    pub fn oci_dir(&self) -> PathBuf {
        self.build_dir().join("oci")
    }

    /// Content-addressed blob directory of the image layout.
    pub fn blobs_dir(&self) -> PathBuf {
        self.oci_dir().join("blobs").join("sha256")
    }

    /// Intermediate compile outputs.
    pub fn result_dir(&self) -> PathBuf {
        self.build_dir().join("result")
    }

    /// Cross-build base-layer cache.
    pub fn cache_dir(&self) -> PathBuf {
        self.run_data_dir().join("blob-cache")
    }

    /// Whether a live process is already building this fingerprint.
    ///
    /// A fingerprint is live iff some `by-pid/<pid>` link names a live
    /// process and resolves to this job's build directory.
    pub fn is_active(&self) -> bool {
        let entries = match std::fs::read_dir(self.pids_dir()) {
            Ok(entries) => entries,
            Err(_) => return false,
        };
        let build_dir = self.build_dir();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if process_exists(&name) && is_link_to(&entry.path(), &build_dir) {
                return true;
            }
        }
        false
    }
}

/// Whether a process with the given (stringified) PID exists.
///
/// Where process existence cannot be interrogated, every PID is presumed
/// live so that cleanup never reaps an in-progress attempt.
pub(crate) fn process_exists(pid: &str) -> bool {
    let Ok(pid) = pid.parse::<i32>() else {
        return false;
    };

    #[cfg(unix)]
    {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// Whether `link` resolves to `target`, comparing fully resolved paths.
pub(crate) fn is_link_to(link: &Path, target: &Path) -> bool {
    let (Ok(link), Ok(target)) = (std::fs::canonicalize(link), std::fs::canonicalize(target))
    else {
        return false;
    };
    link == target
}
