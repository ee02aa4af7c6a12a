//! Python language builder.
//!
//! Python images are platform independent: everything is emitted as
//! shared layers. The scaffolded service wrapper lands under
//! `/func/service` and, when the project declares requirements, a
//! dependency layer is produced with `pip install --target` and placed
//! under `/func/lib`.

use std::path::Path;

use async_trait::async_trait;
use funcforge_core::{BuildError, Result};

use super::LanguageBuilder;
use crate::function::Platform;
use crate::oci::job::BuildJob;
use crate::oci::tarball::{self, Layer};
use crate::oci::types::ConfigFile;

/// Base image applied when the function does not request one.
const DEFAULT_BASE: &str = "docker.io/library/python:3.12-slim";

pub struct PythonBuilder;

#[async_trait]
impl LanguageBuilder for PythonBuilder {
    fn base(&self, custom: &str) -> String {
        if custom.is_empty() {
            DEFAULT_BASE.to_string()
        } else {
            custom.to_string()
        }
    }

    async fn write_shared(&self, job: &BuildJob) -> Result<Vec<Layer>> {
        let mut layers = Vec::new();

        let service = job.build_dir().join("service");
        if service.is_dir() {
            layers.push(tarball::write_dir_layer(
                job,
                &service,
                "/func/service",
                "servicelayer.tar.gz",
            )?);
        }

        let requirements = job.function.root.join("requirements.txt");
        if requirements.is_file() {
            let deps = job.build_dir().join("deps");
            pip_install(job, &requirements, &deps).await?;
            layers.push(tarball::write_dir_layer(
                job,
                &deps,
                "/func/lib",
                "depslayer.tar.gz",
            )?);
        }

        Ok(layers)
    }

    async fn write_platform(&self, _job: &BuildJob, _platform: &Platform) -> Result<Vec<Layer>> {
        Ok(Vec::new()) // the interpreter comes from the base image
    }

    fn configure(
        &self,
        _job: &BuildJob,
        _platform: &Platform,
        mut config: ConfigFile,
    ) -> Result<ConfigFile> {
        config.config.cmd = vec!["python3".to_string(), "/func/service/main.py".to_string()];
        config
            .config
            .env
            .push("PYTHONPATH=/func/lib:/func".to_string());
        config
            .config
            .env
            .push("LISTEN_ADDRESS=[::]:8080".to_string());
        Ok(config)
    }
}

fn interpreter() -> String {
    match std::env::var("FUNC_PYTHON") {
        Ok(path) if !path.is_empty() => path,
        _ => "python3".to_string(),
    }
}

/// Install the project's requirements into `target`, killing the
/// subprocess on cancel.
async fn pip_install(job: &BuildJob, requirements: &Path, target: &Path) -> Result<()> {
    let python = interpreter();
    std::fs::create_dir_all(target)?;

    tracing::info!(requirements = %requirements.display(), "pip install");

    let mut cmd = tokio::process::Command::new(&python);
    cmd.args([
        "-m",
        "pip",
        "install",
        "--quiet",
        "--no-cache-dir",
        "-r",
    ])
    .arg(requirements)
    .arg("--target")
    .arg(target)
    .current_dir(job.build_dir())
    .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| BuildError::Toolchain {
        program: python.clone(),
        message: e.to_string(),
    })?;

    let status = tokio::select! {
        _ = job.ctx.canceled() => {
            let _ = child.kill().await;
            return Err(BuildError::Canceled);
        }
        status = child.wait() => status.map_err(|e| BuildError::Toolchain {
            program: python.clone(),
            message: e.to_string(),
        })?,
    };

    if !status.success() {
        return Err(BuildError::Toolchain {
            program: python,
            message: format!("pip install exited with {}", status),
        });
    }
    Ok(())
}
