//! Go language builder.
//!
//! Cross-compiles the scaffolded project into a static binary per
//! platform and wraps it as a single executable layer. Builds from
//! scratch unless the function requests an explicit base image.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use funcforge_core::{BuildError, Result};

use super::LanguageBuilder;
use crate::function::Platform;
use crate::oci::job::BuildJob;
use crate::oci::tarball::{self, Layer};
use crate::oci::types::ConfigFile;

pub struct GoBuilder;

#[async_trait]
impl LanguageBuilder for GoBuilder {
    fn base(&self, custom: &str) -> String {
        // No default: an empty reference builds from scratch.
        custom.to_string()
    }

    async fn write_shared(&self, _job: &BuildJob) -> Result<Vec<Layer>> {
        Ok(Vec::new()) // no shared dependencies generated at build time
    }

    async fn write_platform(&self, job: &BuildJob, platform: &Platform) -> Result<Vec<Layer>> {
        let exe = go_build(job, platform).await?;
        let layer = tarball::write_exe_layer(job, &exe, platform)?;
        Ok(vec![layer])
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

/// Cross-compile the build directory for `platform`, returning the
/// absolute path of the produced binary.
async fn go_build(job: &BuildJob, platform: &Platform) -> Result<PathBuf> {
    let gobin = toolchain();
    let (args, outpath) = go_build_cmd(platform);
    let envs = go_build_envs(platform);

    std::fs::create_dir_all(job.result_dir())?;

    tracing::info!(target = %outpath.display(), platform = %platform, "go build");

    run_toolchain(job, &gobin, &["mod".to_string(), "tidy".to_string()], &envs).await?;
    run_toolchain(job, &gobin, &args, &envs).await?;

    // The toolchain ran with the build directory as its working
    // directory, so the relative output path resolves beneath it.
    Ok(job.build_dir().join(outpath))
}

fn toolchain() -> String {
    match std::env::var("FUNC_GO") {
        Ok(path) if !path.is_empty() => path,
        _ => "go".to_string(),
    }
}

/// Arguments for the compile step and the relative output path.
fn go_build_cmd(platform: &Platform) -> (Vec<String>, PathBuf) {
    let mut name = format!("f.{}.{}", platform.os, platform.architecture);
    if !platform.variant.is_empty() {
        name.push('.');
        name.push_str(&platform.variant);
    }
    let outpath = Path::new("result").join(name);
    let args = vec![
        "build".to_string(),
        "-o".to_string(),
        outpath.to_string_lossy().into_owned(),
    ];
    (args, outpath)
}

/// The toolchain environment: pegged cross-compile variables first, then
/// the caller's environment minus anything pegged.
fn go_build_envs(platform: &Platform) -> Vec<(String, String)> {
    let mut pegged = vec![
        ("CGO_ENABLED".to_string(), "0".to_string()),
        ("GOOS".to_string(), platform.os.clone()),
        ("GOARCH".to_string(), platform.architecture.clone()),
    ];
    if !platform.variant.is_empty() && platform.architecture == "arm" {
        pegged.push((
            "GOARM".to_string(),
            platform.variant.trim_start_matches('v').to_string(),
        ));
    } else if !platform.variant.is_empty() && platform.architecture == "amd64" {
        pegged.push(("GOAMD64".to_string(), platform.variant.clone()));
    }

    let mut envs = pegged.clone();
    for (key, value) in std::env::vars() {
        if !pegged.iter().any(|(name, _)| *name == key) {
            envs.push((key, value));
        }
    }
    envs
}

/// Run the toolchain in the build directory, killing it on cancel.
async fn run_toolchain(
    job: &BuildJob,
    program: &str,
    args: &[String],
    envs: &[(String, String)],
) -> Result<()> {
    tracing::debug!(program, ?args, "exec");

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .env_clear()
        .envs(envs.iter().cloned())
        .current_dir(job.build_dir())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| BuildError::Toolchain {
        program: program.to_string(),
        message: e.to_string(),
    })?;

    let status = tokio::select! {
        _ = job.ctx.canceled() => {
            let _ = child.kill().await;
            return Err(BuildError::Canceled);
        }
        status = child.wait() => status.map_err(|e| BuildError::Toolchain {
            program: program.to_string(),
            message: e.to_string(),
        })?,
    };

    if !status.success() {
        return Err(BuildError::Toolchain {
            program: program.to_string(),
            message: format!("exited with {}", status),
        });
    }
    Ok(())
}
