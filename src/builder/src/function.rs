//! Function descriptor and build platforms.
//!
//! A [`Function`] describes the project being containerized: where its
//! source lives, which runtime it targets, and the metadata that ends up
//! in the image config. It is immutable for the duration of a build.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Directory under the project root holding builder run data.
pub const RUN_DATA_DIR: &str = ".func";

/// A function project to be built into an OCI image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Function {
    /// Absolute path to the project root.
    pub root: PathBuf,

    /// Runtime identifier (e.g. "go", "python").
    pub runtime: String,

    /// Explicit base image reference. Empty means the language builder's
    /// default applies.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_image: String,

    /// Environment variables declared on the function.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub envs: Vec<Env>,

    /// Volume mounts declared on the function.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    /// Invocation hint passed to the scaffolding (e.g. "http").
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub invoke: String,
}

/// A single environment variable declared on a function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Env {
    pub name: String,
    pub value: String,
}

impl Env {
    /// Render as a `NAME=value` pair.
    pub fn kv(&self) -> String {
        format!("{}={}", self.name, self.value)
    }
}

/// A volume mount declared on a function. Only the in-container target
/// path participates in the image config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// A target platform triple: operating system, architecture, and an
/// optional variant (e.g. `arm/v7`, `amd64/v2`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    /// Empty when the platform has no variant.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variant: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
            variant: String::new(),
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = variant.into();
        self
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if !self.variant.is_empty() {
            write!(f, "/{}", self.variant)?;
        }
        Ok(())
    }
}

impl FromStr for Platform {
    type Err = String;

    /// Parse `os/arch` or `os/arch/variant`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut parts = s.split('/');
        let (os, arch) = match (parts.next(), parts.next()) {
            (Some(os), Some(arch)) if !os.is_empty() && !arch.is_empty() => (os, arch),
            _ => return Err(format!("invalid platform: '{}' (expected os/arch[/variant])", s)),
        };
        let variant = parts.next().unwrap_or("");
        if parts.next().is_some() {
            return Err(format!("invalid platform: '{}' (too many components)", s));
        }
        Ok(Platform::new(os, arch).with_variant(variant))
    }
}

/// Platforms built when the caller requests none.
pub fn default_platforms() -> Vec<Platform> {
    vec![
        Platform::new("linux", "amd64"),
        Platform::new("linux", "arm64"),
        Platform::new("linux", "arm").with_variant("v7"),
    ]
}
