//! Registry credentials from the ambient Docker configuration.
//!
//! Base image pulls authenticate the way other container tooling does:
//! `REGISTRY_USERNAME`/`REGISTRY_PASSWORD` take precedence, then the
//! `auths` table of `~/.docker/config.json` (or `$DOCKER_CONFIG`), and
//! finally anonymous access. No credential state is kept in the builder.

use std::collections::HashMap;
use std::path::PathBuf;

use base64::Engine;
use oci_distribution::secrets::RegistryAuth;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuth>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuth {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// Resolve credentials for a registry host.
pub fn resolve(registry: &str) -> RegistryAuth {
    if let (Ok(username), Ok(password)) = (
        std::env::var("REGISTRY_USERNAME"),
        std::env::var("REGISTRY_PASSWORD"),
    ) {
        if !username.is_empty() {
            return RegistryAuth::Basic(username, password);
        }
    }

    match docker_config_auth(registry) {
        Some((username, password)) => RegistryAuth::Basic(username, password),
        None => RegistryAuth::Anonymous,
    }
}

fn docker_config_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
        if !dir.is_empty() {
            return Some(PathBuf::from(dir).join("config.json"));
        }
    }
    Some(dirs::home_dir()?.join(".docker").join("config.json"))
}

fn docker_config_auth(registry: &str) -> Option<(String, String)> {
    let path = docker_config_path()?;
    let data = std::fs::read_to_string(path).ok()?;
    let config: DockerConfig = serde_json::from_str(&data).ok()?;

    for key in candidate_keys(registry) {
        if let Some(entry) = config.auths.get(&key) {
            if let Some(creds) = decode_entry(entry) {
                tracing::debug!(registry, key, "using docker config credentials");
                return Some(creds);
            }
        }
    }
    None
}

/// Keys under which a registry's credentials may be stored.
fn candidate_keys(registry: &str) -> Vec<String> {
    let mut keys = vec![registry.to_string(), format!("https://{}", registry)];
    if registry.contains("docker.io") {
        keys.push("https://index.docker.io/v1/".to_string());
        keys.push("index.docker.io".to_string());
    }
    keys
}

fn decode_entry(entry: &DockerAuth) -> Option<(String, String)> {
    if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
        return Some((username.clone(), password.clone()));
    }
    let encoded = entry.auth.as_deref()?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}
