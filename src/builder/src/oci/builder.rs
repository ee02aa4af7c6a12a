//! Build coordination and image assembly.
//!
//! [`Builder::build`] drives the full lifecycle of one attempt: job
//! instantiation (fingerprint, language builder lookup), workspace setup
//! with the liveness-link protocol, scaffolding, containerization, and
//! the final `last` link update. A best-effort cleanup pass runs on every
//! outcome, reaping attempts that no live process owns.
//!
//! Containerization assembles, per platform, the shared layers (source
//! data, certificates, language-shared) with the platform layers and the
//! optional base image into a config blob and manifest blob, then writes
//! the multi-platform index.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::SecondsFormat;
use funcforge_core::{BuildContext, BuildError, Result};

#[cfg(unix)]
use std::os::unix::fs::symlink;
#[cfg(windows)]
use std::os::windows::fs::symlink_dir as symlink;

use super::base::{self, BaseImage};
use super::blob;
use super::job::{self, BuildJob};
use super::languages::LanguageBuilder;
use super::tarball::{self, Layer, DEFAULT_GID, DEFAULT_UID};
use super::types::{
    Config, ConfigFile, Descriptor, EmptyObject, History, Index, Manifest, OciPlatform, RootFs,
    MEDIA_TYPE_CONFIG, MEDIA_TYPE_INDEX, MEDIA_TYPE_MANIFEST, OCI_LAYOUT_CONTENT,
};
use crate::function::{Env, Function, Platform};
use crate::scaffolding;

/// Host-native OCI image builder for function projects.
pub struct Builder {
    verbose: bool,
    templates: Option<PathBuf>,
    impl_override: Option<Arc<dyn LanguageBuilder>>,
}

impl Builder {
    /// Create a builder. `verbose` raises the detail of emitted events.
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            templates: None,
            impl_override: None,
        }
    }

    /// Use the scaffolding template filesystem rooted at `templates`.
    /// Without one, the scaffold phase is skipped.
    pub fn with_templates(mut self, templates: impl Into<PathBuf>) -> Self {
        self.templates = Some(templates.into());
        self
    }

    /// Override the resolved language builder. For tests.
    pub(crate) fn with_language_builder(mut self, builder: Arc<dyn LanguageBuilder>) -> Self {
        self.impl_override = Some(builder);
        self
    }

    /// Build `function` into a multi-platform OCI image layout on disk.
    ///
    /// `platforms` defaults to the built-in set when empty. On success the
    /// workspace's `last` link points at the produced layout.
    pub async fn build(
        &self,
        ctx: &BuildContext,
        function: &Function,
        platforms: &[Platform],
    ) -> Result<()> {
        let mut job = BuildJob::new(ctx.clone(), function.clone(), platforms, self.verbose)?;
        if let Some(builder) = &self.impl_override {
            job.language_builder = Arc::clone(builder);
        }

        tracing::info!(
            root = %job.function.root.display(),
            runtime = %job.function.runtime,
            fingerprint = %job.fingerprint,
            "starting build"
        );

        setup(&job)?;
        let result = self.run(&job).await;
        cleanup(&job);

        if result.is_ok() {
            tracing::info!(dir = %job.build_dir().display(), "build complete");
        }
        result
    }

    async fn run(&self, job: &BuildJob) -> Result<()> {
        scaffold(job, self.templates.as_deref())?;
        containerize(job).await?;
        update_last_link(job)
    }
}

// ---------------------------------------------------------------------------
// Lifecycle phases
// ---------------------------------------------------------------------------

fn setup(job: &BuildJob) -> Result<()> {
    if job.is_active() {
        return Err(BuildError::BuildInProgress(job.build_dir()));
    }

    // A leftover attempt with the same fingerprint is stale; start over.
    let build_dir = job.build_dir();
    if build_dir.exists() {
        tracing::debug!(dir = %build_dir.display(), "rm -rf");
        fs::remove_dir_all(&build_dir)?;
    }
    fs::create_dir_all(&build_dir)?;
    fs::create_dir_all(job.pids_dir())?;

    // The liveness link must exist before any work happens.
    let link = job.pid_link();
    if fs::symlink_metadata(&link).is_ok() {
        fs::remove_file(&link)?;
    }
    let target = Path::new("..").join("by-hash").join(&job.fingerprint);
    tracing::debug!(target = %target.display(), link = %link.display(), "ln -s");
    symlink(&target, &link)
        .map_err(|e| BuildError::Link(format!("{}: {}", link.display(), e)))?;

    fs::create_dir_all(job.blobs_dir())?;
    fs::create_dir_all(job.cache_dir())?;
    Ok(())
}

/// Best-effort reaping of filesystem artifacts nobody owns. Errors are
/// swallowed; cleanup is idempotent.
fn cleanup(job: &BuildJob) {
    // Liveness links whose process is gone.
    if let Ok(entries) = fs::read_dir(job.pids_dir()) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if job::process_exists(&name) {
                continue;
            }
            tracing::debug!(link = %entry.path().display(), "rm");
            let _ = fs::remove_file(entry.path());
        }
    }

    // Attempts that are neither the last success nor backed by a live
    // liveness link.
    if let Ok(entries) = fs::read_dir(job.builds_dir()) {
        let last = job.last_link();
        for entry in entries.flatten() {
            let dir = entry.path();
            if job::is_link_to(&last, &dir) {
                continue;
            }
            if backed_by_live_pid(job, &dir) {
                continue;
            }
            tracing::debug!(dir = %dir.display(), "rm -rf");
            let _ = fs::remove_dir_all(&dir);
        }
    }
}

fn backed_by_live_pid(job: &BuildJob, dir: &Path) -> bool {
    let Ok(entries) = fs::read_dir(job.pids_dir()) else {
        return false;
    };
    entries.flatten().any(|entry| {
        let name = entry.file_name().to_string_lossy().into_owned();
        job::process_exists(&name) && job::is_link_to(&entry.path(), dir)
    })
}

/// Write the wrapper code which, included in the final container,
/// instantiates the function and exposes it as a service.
fn scaffold(job: &BuildJob, templates: Option<&Path>) -> Result<()> {
    let Some(templates) = templates else {
        tracing::debug!("no scaffolding templates configured; skipping");
        return Ok(());
    };
    tracing::debug!(dest = %job.build_dir().display(), "scaffolding");
    scaffolding::write(
        &job.build_dir(),
        &job.function.root,
        &job.function.runtime,
        &job.function.invoke,
        templates,
    )
}

async fn containerize(job: &BuildJob) -> Result<()> {
    fs::write(job.oci_dir().join("oci-layout"), OCI_LAYOUT_CONTENT)?;

    // Shared layers, in order: source data, certificates, language-shared.
    job.ctx.checkpoint()?;
    let mut shared = vec![tarball::write_data_layer(job)?, tarball::write_certs_layer(job)?];
    shared.extend(job.language_builder.write_shared(job).await?);

    // One image per platform.
    let mut manifests = Vec::with_capacity(job.platforms.len());
    for platform in &job.platforms {
        job.ctx.checkpoint()?;

        let mut layers = shared.clone();
        layers.extend(job.language_builder.write_platform(job, platform).await?);

        let base = base::pull_base(job, platform).await?;

        let config = new_config_file(job, platform, base.as_ref(), &layers).await?;
        let config = job
            .language_builder
            .configure(job, platform, config)?;

        let config_desc = write_config(job, &config)?;
        manifests.push(write_manifest(job, platform, base.as_ref(), config_desc, &layers)?);
    }

    write_index(job, manifests)
}

fn update_last_link(job: &BuildJob) -> Result<()> {
    let link = job.last_link();
    if fs::symlink_metadata(&link).is_ok() {
        fs::remove_file(&link)?;
    }
    let target = Path::new("by-hash").join(&job.fingerprint);
    tracing::debug!(target = %target.display(), link = %link.display(), "ln -s");
    symlink(&target, &link)
        .map_err(|e| BuildError::Link(format!("{}: {}", link.display(), e)))
}

// ---------------------------------------------------------------------------
// Image assembly
// ---------------------------------------------------------------------------

async fn new_config_file(
    job: &BuildJob,
    platform: &Platform,
    base: Option<&BaseImage>,
    layers: &[Layer],
) -> Result<ConfigFile> {
    let mut config = ConfigFile {
        architecture: platform.architecture.clone(),
        os: platform.os.clone(),
        variant: (!platform.variant.is_empty()).then(|| platform.variant.clone()),
        created: Some(job.start),
        config: Config {
            env: new_config_envs(job).await?,
            volumes: new_config_volumes(job),
            exposed_ports: BTreeMap::from([("8080/tcp".to_string(), EmptyObject {})]),
            working_dir: "/func/".to_string(),
            stop_signal: "SIGKILL".to_string(),
            user: format!("{}:{}", DEFAULT_UID, DEFAULT_GID),
            ..Default::default()
        },
        history: vec![History {
            author: Some("func".to_string()),
            created: Some(job.start),
            comment: Some("func host builder".to_string()),
            empty_layer: true,
            ..Default::default()
        }],
        rootfs: RootFs {
            typ: "layers".to_string(),
            diff_ids: layers.iter().map(|l| l.diff_id.clone()).collect(),
        },
    };

    // Carry over settings from the base image.
    if let Some(base) = base {
        if !base.config.config.user.is_empty() {
            config.config.user = base.config.config.user.clone();
        }

        let mut env = base.config.config.env.clone();
        env.append(&mut config.config.env);
        config.config.env = env;

        let mut history = base.config.history.clone();
        history.append(&mut config.history);
        config.history = history;

        let mut diff_ids = base.config.rootfs.diff_ids.clone();
        diff_ids.append(&mut config.rootfs.diff_ids);
        config.rootfs.diff_ids = diff_ids;
    }

    Ok(config)
}

/// The environment built into the container: build metadata first, then
/// anything declared on the function itself.
async fn new_config_envs(job: &BuildJob) -> Result<Vec<String>> {
    let mut envs = Vec::new();

    // FUNC_CREATED: the build timestamp as RFC 3339.
    envs.push(format!(
        "FUNC_CREATED={}",
        job.start.to_rfc3339_opts(SecondsFormat::Secs, true)
    ));

    // FUNC_VERSION: present even when no version is determinable, to
    // record that this logic executed.
    envs.push(format!("FUNC_VERSION={}", function_version(job).await?));

    envs.extend(job.function.envs.iter().map(Env::kv));
    Ok(envs)
}

/// `git describe --tags` of the project, or empty when unavailable.
async fn function_version(job: &BuildJob) -> Result<String> {
    let gitbin = match std::env::var("FUNC_GIT") {
        Ok(path) if !path.is_empty() => path,
        _ => "git".to_string(),
    };

    let mut cmd = tokio::process::Command::new(&gitbin);
    cmd.args(["describe", "--tags"])
        .current_dir(&job.function.root)
        .kill_on_drop(true);

    let output = tokio::select! {
        _ = job.ctx.canceled() => return Err(BuildError::Canceled),
        output = cmd.output() => output,
    };

    match output {
        Ok(output) if output.status.success() => {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        }
        Ok(output) => {
            tracing::warn!(status = %output.status, "unable to determine function version");
            Ok(String::new())
        }
        Err(e) => {
            tracing::warn!(error = %e, "unable to determine function version");
            Ok(String::new())
        }
    }
}

fn new_config_volumes(job: &BuildJob) -> BTreeMap<String, EmptyObject> {
    job.function
        .volumes
        .iter()
        .filter_map(|v| v.path.clone())
        .map(|path| (path, EmptyObject {}))
        .collect()
}

fn write_config(job: &BuildJob, config: &ConfigFile) -> Result<Descriptor> {
    let mut desc = blob::write_json_blob(&job.build_dir(), &job.blobs_dir(), "config.json", config)?;
    desc.media_type = MEDIA_TYPE_CONFIG.to_string();
    Ok(desc)
}

/// Write the image manifest for one platform. Base layers, when present,
/// precede the layers produced by this build.
fn write_manifest(
    job: &BuildJob,
    platform: &Platform,
    base: Option<&BaseImage>,
    config: Descriptor,
    layers: &[Layer],
) -> Result<Descriptor> {
    let mut layer_descs: Vec<Descriptor> =
        base.map(|b| b.layers.clone()).unwrap_or_default();
    layer_descs.extend(layers.iter().map(|l| l.descriptor.clone()));

    let manifest = Manifest {
        schema_version: 2,
        media_type: MEDIA_TYPE_MANIFEST.to_string(),
        config,
        layers: layer_descs,
    };

    let mut desc = blob::write_json_blob(
        &job.build_dir(),
        &job.blobs_dir(),
        &format!("manifest.{}.{}.json", platform.os, platform.architecture),
        &manifest,
    )?;
    desc.media_type = MEDIA_TYPE_MANIFEST.to_string();
    desc.platform = Some(OciPlatform::from(platform));
    Ok(desc)
}

/// Write the image index. The index is a plain file in the layout root,
/// not a blob.
fn write_index(job: &BuildJob, manifests: Vec<Descriptor>) -> Result<()> {
    let index = Index {
        schema_version: 2,
        media_type: MEDIA_TYPE_INDEX.to_string(),
        manifests,
    };
    let encoded = blob::encode_json(&index)?;
    fs::write(job.oci_dir().join("index.json"), encoded)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::types::Hash;
    use async_trait::async_trait;
    use sha2::{Digest, Sha256};
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Serializes tests that touch process-global environment.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// A language builder standing in for a real toolchain: its platform
    /// layer wraps a fabricated binary, so builds run hermetically.
    struct StubLanguage {
        base: String,
    }

    #[async_trait]
    impl LanguageBuilder for StubLanguage {
        fn base(&self, custom: &str) -> String {
            if custom.is_empty() {
                self.base.clone()
            } else {
                custom.to_string()
            }
        }

        async fn write_shared(&self, _job: &BuildJob) -> Result<Vec<Layer>> {
            Ok(Vec::new())
        }

        async fn write_platform(&self, job: &BuildJob, platform: &Platform) -> Result<Vec<Layer>> {
            fs::create_dir_all(job.result_dir())?;
            let exe = job
                .result_dir()
                .join(format!("f.{}.{}", platform.os, platform.architecture));
            fs::write(&exe, format!("binary for {}", platform))?;
            Ok(vec![tarball::write_exe_layer(job, &exe, platform)?])
        }

        fn configure(
            &self,
            _job: &BuildJob,
            _platform: &Platform,
            mut config: ConfigFile,
        ) -> Result<ConfigFile> {
            config.config.cmd = vec!["/func/f".to_string()];
            config
                .config
                .env
                .push("LISTEN_ADDRESS=[::]:8080".to_string());
            Ok(config)
        }
    }

    struct TestProject {
        _tmp: TempDir,
        function: Function,
    }

    fn project() -> TestProject {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("fn");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("handler.go"), "package f\n").unwrap();

        // A CA bundle for the certs layer, so builds need nothing from
        // the host.
        let bundle = tmp.path().join("ca-bundle.crt");
        fs::write(&bundle, "TEST CERTIFICATES\n").unwrap();
        std::env::set_var("FUNC_CA_BUNDLE", &bundle);

        TestProject {
            function: Function {
                root,
                runtime: "go".to_string(),
                ..Default::default()
            },
            _tmp: tmp,
        }
    }

    fn stub_builder() -> Builder {
        Builder::new(false).with_language_builder(Arc::new(StubLanguage {
            base: String::new(),
        }))
    }

    fn read_index(oci_dir: &Path) -> Index {
        let data = fs::read(oci_dir.join("index.json")).unwrap();
        serde_json::from_slice(&data).unwrap()
    }

    fn read_manifest(blobs: &Path, desc: &Descriptor) -> Manifest {
        let data = fs::read(blobs.join(&desc.digest.hex)).unwrap();
        serde_json::from_slice(&data).unwrap()
    }

    fn read_config(blobs: &Path, desc: &Descriptor) -> ConfigFile {
        let data = fs::read(blobs.join(&desc.digest.hex)).unwrap();
        serde_json::from_slice(&data).unwrap()
    }

    fn verify_blob(blobs: &Path, desc: &Descriptor) {
        let data = fs::read(blobs.join(&desc.digest.hex)).unwrap();
        assert_eq!(data.len() as i64, desc.size, "blob size mismatch");
        assert_eq!(
            hex::encode(Sha256::digest(&data)),
            desc.digest.hex,
            "blob digest mismatch"
        );
    }

    /// Simulate the owning builder process having exited, so a
    /// subsequent in-process build is not refused as in-progress.
    fn release_liveness_link(function: &Function) {
        let link = function
            .root
            .join(crate::function::RUN_DATA_DIR)
            .join("builds")
            .join("by-pid")
            .join(std::process::id().to_string());
        let _ = fs::remove_file(link);
    }

    fn job_for(function: &Function) -> BuildJob {
        let mut job = BuildJob::new(
            BuildContext::background(),
            function.clone(),
            &["linux/amd64".parse().unwrap()],
            false,
        )
        .unwrap();
        job.language_builder = Arc::new(StubLanguage {
            base: String::new(),
        });
        job
    }

    #[tokio::test]
    async fn test_single_platform_build_layout() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let project = project();
        let builder = stub_builder();

        builder
            .build(
                &BuildContext::background(),
                &project.function,
                &["linux/amd64".parse().unwrap()],
            )
            .await
            .unwrap();

        let job = job_for(&project.function);
        let oci = job.oci_dir();
        let blobs = job.blobs_dir();

        // Layout marker.
        assert_eq!(
            fs::read(oci.join("oci-layout")).unwrap(),
            OCI_LAYOUT_CONTENT
        );

        // One manifest, carrying its platform.
        let index = read_index(&oci);
        assert_eq!(index.schema_version, 2);
        assert_eq!(index.media_type, MEDIA_TYPE_INDEX);
        assert_eq!(index.manifests.len(), 1);
        let mdesc = &index.manifests[0];
        assert_eq!(mdesc.media_type, MEDIA_TYPE_MANIFEST);
        let platform = mdesc.platform.as_ref().unwrap();
        assert_eq!(platform.os, "linux");
        assert_eq!(platform.architecture, "amd64");
        verify_blob(&blobs, mdesc);

        // Three layers: data, certs, exe; all blobs verify.
        let manifest = read_manifest(&blobs, mdesc);
        assert_eq!(manifest.schema_version, 2);
        assert_eq!(manifest.config.media_type, MEDIA_TYPE_CONFIG);
        assert_eq!(manifest.layers.len(), 3);
        verify_blob(&blobs, &manifest.config);
        for layer in &manifest.layers {
            assert_eq!(
                layer.media_type,
                crate::oci::types::MEDIA_TYPE_LAYER
            );
            verify_blob(&blobs, layer);
        }

        // Config contents.
        let config = read_config(&blobs, &manifest.config);
        assert_eq!(config.architecture, "amd64");
        assert_eq!(config.os, "linux");
        assert_eq!(config.config.cmd, vec!["/func/f"]);
        assert_eq!(config.config.user, "1000:1000");
        assert_eq!(config.config.working_dir, "/func/");
        assert_eq!(config.config.stop_signal, "SIGKILL");
        assert!(config.config.exposed_ports.contains_key("8080/tcp"));
        assert!(config.config.env[0].starts_with("FUNC_CREATED="));
        assert!(config.config.env[1].starts_with("FUNC_VERSION"));
        assert_eq!(
            config.config.env.last().unwrap(),
            "LISTEN_ADDRESS=[::]:8080"
        );
        assert_eq!(config.history.len(), 1);
        assert_eq!(config.history[0].author.as_deref(), Some("func"));
        assert!(config.history[0].empty_layer);

        // DiffIDs follow layer order.
        assert_eq!(config.rootfs.typ, "layers");
        assert_eq!(config.rootfs.diff_ids.len(), manifest.layers.len());

        // The last link resolves to the attempt.
        assert!(job::is_link_to(&job.last_link(), &job.build_dir()));
        let target = fs::read_link(job.last_link()).unwrap();
        assert_eq!(target, Path::new("by-hash").join(&job.fingerprint));
    }

    #[tokio::test]
    async fn test_multi_platform_build_shares_layers() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let project = project();
        let builder = stub_builder();

        let platforms: Vec<Platform> = ["linux/amd64", "linux/arm64", "linux/arm/v7"]
            .iter()
            .map(|p| p.parse().unwrap())
            .collect();
        builder
            .build(&BuildContext::background(), &project.function, &platforms)
            .await
            .unwrap();

        let job = job_for(&project.function);
        let index = read_index(&job.oci_dir());
        assert_eq!(index.manifests.len(), 3);

        let manifests: Vec<Manifest> = index
            .manifests
            .iter()
            .map(|d| read_manifest(&job.blobs_dir(), d))
            .collect();

        // Data and certs blobs are shared across platforms.
        for other in &manifests[1..] {
            assert_eq!(manifests[0].layers[0].digest, other.layers[0].digest);
            assert_eq!(manifests[0].layers[1].digest, other.layers[1].digest);
        }

        // Executable blobs are per-platform.
        let exes: Vec<&Hash> = manifests.iter().map(|m| &m.layers[2].digest).collect();
        assert_ne!(exes[0], exes[1]);
        assert_ne!(exes[1], exes[2]);
        assert_ne!(exes[0], exes[2]);

        // The arm manifest records its variant.
        let arm = index
            .manifests
            .iter()
            .find(|d| d.platform.as_ref().unwrap().architecture == "arm")
            .unwrap();
        assert_eq!(
            arm.platform.as_ref().unwrap().variant.as_deref(),
            Some("v7")
        );
    }

    #[tokio::test]
    async fn test_second_build_on_live_fingerprint_is_refused() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let project = project();
        let builder = stub_builder();

        builder
            .build(
                &BuildContext::background(),
                &project.function,
                &["linux/amd64".parse().unwrap()],
            )
            .await
            .unwrap();

        // The liveness link from the first attempt still names this live
        // process, so the same fingerprint is refused.
        let err = builder
            .build(
                &BuildContext::background(),
                &project.function,
                &["linux/amd64".parse().unwrap()],
            )
            .await;
        assert!(matches!(err, Err(BuildError::BuildInProgress(_))));

        // The first build's artifacts are untouched.
        let job = job_for(&project.function);
        assert!(job.oci_dir().join("index.json").is_file());
        assert!(job::is_link_to(&job.last_link(), &job.build_dir()));

        // Once the owning process is gone, building works again.
        release_liveness_link(&project.function);
        builder
            .build(
                &BuildContext::background(),
                &project.function,
                &["linux/amd64".parse().unwrap()],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sequential_builds_are_deterministic() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let project = project();
        let builder = stub_builder();
        let platforms: Vec<Platform> = vec!["linux/amd64".parse().unwrap()];

        builder
            .build(&BuildContext::background(), &project.function, &platforms)
            .await
            .unwrap();
        let job = job_for(&project.function);
        let first = read_manifest(&job.blobs_dir(), &read_index(&job.oci_dir()).manifests[0]);

        release_liveness_link(&project.function);
        builder
            .build(&BuildContext::background(), &project.function, &platforms)
            .await
            .unwrap();
        let second = read_manifest(&job.blobs_dir(), &read_index(&job.oci_dir()).manifests[0]);

        // The data layer digest is reproducible for an unchanged tree.
        assert_eq!(first.layers[0].digest, second.layers[0].digest);
    }

    #[tokio::test]
    async fn test_canceled_context_aborts_without_last_link() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let project = project();
        let builder = stub_builder();

        let (ctx, handle) = BuildContext::cancellable();
        handle.cancel();

        let err = builder
            .build(&ctx, &project.function, &["linux/amd64".parse().unwrap()])
            .await;
        assert!(matches!(err, Err(BuildError::Canceled)));

        let job = job_for(&project.function);
        assert!(fs::symlink_metadata(job.last_link()).is_err());

        // A later attempt (new process) succeeds.
        release_liveness_link(&project.function);
        builder
            .build(
                &BuildContext::background(),
                &project.function,
                &["linux/amd64".parse().unwrap()],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_runtime_is_refused() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let project = project();
        let mut function = project.function.clone();
        function.runtime = "fortran".to_string();

        let err = Builder::new(false)
            .build(
                &BuildContext::background(),
                &function,
                &["linux/amd64".parse().unwrap()],
            )
            .await;
        assert!(matches!(err, Err(BuildError::UnsupportedRuntime(_))));
    }

    #[tokio::test]
    async fn test_cleanup_reaps_dead_attempts_and_is_idempotent() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let project = project();
        let builder = stub_builder();
        builder
            .build(
                &BuildContext::background(),
                &project.function,
                &["linux/amd64".parse().unwrap()],
            )
            .await
            .unwrap();

        let job = job_for(&project.function);

        // Fabricate a stale attempt owned by a dead process.
        let stale_dir = job.builds_dir().join("feedface");
        fs::create_dir_all(&stale_dir).unwrap();
        let dead_link = job.pids_dir().join("999999999");
        symlink(Path::new("..").join("by-hash").join("feedface"), &dead_link).unwrap();

        cleanup(&job);
        assert!(!stale_dir.exists(), "stale attempt should be reaped");
        assert!(
            fs::symlink_metadata(&dead_link).is_err(),
            "dead pid link should be reaped"
        );

        // The last successful attempt survives.
        assert!(job.build_dir().is_dir());
        assert!(job::is_link_to(&job.last_link(), &job.build_dir()));

        // Idempotent on a quiescent workspace.
        cleanup(&job);
        assert!(job.build_dir().is_dir());
    }

    #[tokio::test]
    async fn test_config_file_merges_base_image() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let project = project();
        let job = job_for(&project.function);
        fs::create_dir_all(job.blobs_dir()).unwrap();
        let platform: Platform = "linux/amd64".parse().unwrap();

        let base = BaseImage {
            layers: vec![Descriptor {
                media_type: crate::oci::types::MEDIA_TYPE_LAYER.to_string(),
                size: 10,
                digest: Hash::sha256("base0"),
                platform: None,
            }],
            config: ConfigFile {
                architecture: "amd64".to_string(),
                os: "linux".to_string(),
                config: Config {
                    user: "app:app".to_string(),
                    env: vec!["PATH=/usr/bin".to_string()],
                    ..Default::default()
                },
                history: vec![History {
                    created_by: Some("base step".to_string()),
                    ..Default::default()
                }],
                rootfs: RootFs {
                    typ: "layers".to_string(),
                    diff_ids: vec![Hash::sha256("basediff")],
                },
                ..Default::default()
            },
        };

        let layers = vec![Layer {
            descriptor: Descriptor {
                media_type: crate::oci::types::MEDIA_TYPE_LAYER.to_string(),
                size: 20,
                digest: Hash::sha256("new0"),
                platform: None,
            },
            diff_id: Hash::sha256("newdiff"),
        }];

        let config = new_config_file(&job, &platform, Some(&base), &layers)
            .await
            .unwrap();

        // Base user wins when non-empty; env, history and diffIDs are
        // prepended.
        assert_eq!(config.config.user, "app:app");
        assert_eq!(config.config.env[0], "PATH=/usr/bin");
        assert!(config.config.env[1].starts_with("FUNC_CREATED="));
        assert_eq!(config.history[0].created_by.as_deref(), Some("base step"));
        assert_eq!(config.history[1].author.as_deref(), Some("func"));
        assert_eq!(config.rootfs.diff_ids[0].hex, "basediff");
        assert_eq!(config.rootfs.diff_ids[1].hex, "newdiff");

        // Manifests prepend base layers too.
        let config_desc = write_config(&job, &config).unwrap();
        let mdesc = write_manifest(&job, &platform, Some(&base), config_desc, &layers).unwrap();
        let manifest = read_manifest(&job.blobs_dir(), &mdesc);
        assert_eq!(manifest.layers.len(), 2);
        assert_eq!(manifest.layers[0].digest.hex, "base0");
        assert_eq!(manifest.layers[1].digest.hex, "new0");
    }

    #[tokio::test]
    async fn test_function_envs_and_volumes_in_config() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let project = project();
        let mut function = project.function.clone();
        function.envs = vec![Env {
            name: "APP_MODE".to_string(),
            value: "prod".to_string(),
        }];
        function.volumes = vec![
            crate::function::Volume {
                path: Some("/data".to_string()),
            },
            crate::function::Volume { path: None },
        ];

        let builder = stub_builder();
        builder
            .build(
                &BuildContext::background(),
                &function,
                &["linux/amd64".parse().unwrap()],
            )
            .await
            .unwrap();

        let job = job_for(&function);
        let index = read_index(&job.oci_dir());
        let manifest = read_manifest(&job.blobs_dir(), &index.manifests[0]);
        let config = read_config(&job.blobs_dir(), &manifest.config);

        assert!(config.config.env.contains(&"APP_MODE=prod".to_string()));
        // Declared envs come after the FUNC_* metadata.
        let app_idx = config
            .config
            .env
            .iter()
            .position(|e| e == "APP_MODE=prod")
            .unwrap();
        assert!(app_idx >= 2);
        assert!(config.config.volumes.contains_key("/data"));
        assert_eq!(config.config.volumes.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_same_hash_attempt_is_replaced() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let project = project();
        let builder = stub_builder();

        // A prior attempt for the same fingerprint, not owned by anyone.
        let job = job_for(&project.function);
        fs::create_dir_all(job.build_dir()).unwrap();
        fs::write(job.build_dir().join("leftover"), "stale").unwrap();

        builder
            .build(
                &BuildContext::background(),
                &project.function,
                &["linux/amd64".parse().unwrap()],
            )
            .await
            .unwrap();

        assert!(!job.build_dir().join("leftover").exists());
        assert!(job.oci_dir().join("index.json").is_file());
    }
}
