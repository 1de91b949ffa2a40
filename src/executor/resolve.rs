//! Locating provider and plugin binaries.
//!
//! A binary is either a local path or an artifact reference of the form
//! `<registry>/<repository>/<name>:<version>`. References are pulled once
//! with the `oras` CLI into a per-platform cache and reused afterwards.

use crate::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Overrides the cache root (`~/.dstream/plugins`).
pub const PLUGIN_CACHE_ENV: &str = "DSTREAM_PLUGIN_CACHE";

/// `<os>_<arch>` using the names artifact publishers tag binaries with.
pub fn platform() -> String {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    };
    format!("{}_{}", std::env::consts::OS, arch)
}

/// Splits a reference into the artifact name (last path segment) and version.
pub fn parse_ref(reference: &str) -> Result<(String, String)> {
    let invalid = || Error::Config(format!("invalid plugin reference '{}'", reference));
    let (path, version) = reference.rsplit_once(':').ok_or_else(invalid)?;
    if version.is_empty() || version.contains('/') {
        return Err(invalid());
    }
    let name = path.rsplit('/').next().filter(|n| !n.is_empty()).ok_or_else(invalid)?;
    Ok((name.to_string(), version.to_string()))
}

fn cache_root() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(PLUGIN_CACHE_ENV) {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var_os("HOME")
        .ok_or_else(|| Error::Config(format!("HOME is not set; set {}", PLUGIN_CACHE_ENV)))?;
    Ok(PathBuf::from(home).join(".dstream").join("plugins"))
}

fn binary_name() -> &'static str {
    if cfg!(windows) {
        "plugin.exe"
    } else {
        "plugin"
    }
}

/// Where a reference is cached: `<root>/<name>/<version>/<os>_<arch>/plugin`.
pub fn cache_path(reference: &str) -> Result<PathBuf> {
    let (name, version) = parse_ref(reference)?;
    Ok(cache_root()?
        .join(name)
        .join(version)
        .join(platform())
        .join(binary_name()))
}

/// Resolves a binary from a path or a reference. Exactly one must be set.
pub async fn resolve(path: Option<&Path>, reference: Option<&str>) -> Result<PathBuf> {
    match (path, reference) {
        (Some(path), None) => {
            if !path.is_file() {
                return Err(Error::Config(format!(
                    "provider binary '{}' does not exist",
                    path.display()
                )));
            }
            Ok(path.to_path_buf())
        }
        (None, Some(reference)) => pull(reference).await,
        _ => Err(Error::Config(
            "exactly one of a binary path or reference must be set".into(),
        )),
    }
}

/// Returns the cached binary for `reference`, pulling it first if needed.
pub async fn pull(reference: &str) -> Result<PathBuf> {
    let target = cache_path(reference)?;
    if target.is_file() {
        debug!(path = %target.display(), "Using cached plugin");
        return Ok(target);
    }

    let dir = target
        .parent()
        .ok_or_else(|| Error::Config(format!("invalid cache path {}", target.display())))?;
    tokio::fs::create_dir_all(dir).await?;

    info!(reference = %reference, path = %target.display(), "Pulling plugin");
    let status = Command::new("oras")
        .arg("pull")
        .arg(reference)
        .arg("--output")
        .arg(dir)
        .status()
        .await
        .map_err(|e| Error::Provider(format!("could not run oras: {}", e)))?;
    if !status.success() {
        return Err(Error::Provider(format!(
            "oras pull {} failed with {}",
            reference, status
        )));
    }

    // Artifacts carry one binary per platform, named plugin.<os>_<arch>.
    let suffix = if cfg!(windows) { ".exe" } else { "" };
    let pulled = dir.join(format!("plugin.{}{}", platform(), suffix));
    if !pulled.is_file() {
        return Err(Error::Provider(format!(
            "artifact {} has no binary for {}",
            reference,
            platform()
        )));
    }
    tokio::fs::rename(&pulled, &target).await?;
    make_executable(&target).await?;
    Ok(target)
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ref() {
        assert_eq!(
            parse_ref("ghcr.io/katasec/dstream-mssql:v0.3.1").unwrap(),
            ("dstream-mssql".to_string(), "v0.3.1".to_string())
        );
        assert_eq!(
            parse_ref("localhost:5000/plugins/echo:1.0").unwrap(),
            ("echo".to_string(), "1.0".to_string())
        );
        assert!(parse_ref("ghcr.io/katasec/no-version").is_err());
        assert!(parse_ref("localhost:5000/plugins/echo").is_err());
        assert!(parse_ref("ghcr.io/katasec/:1.0").is_err());
    }

    #[test]
    fn test_platform_names() {
        let platform = platform();
        assert!(platform.starts_with(std::env::consts::OS));
        assert!(!platform.contains("x86_64"));
    }

    #[tokio::test]
    async fn test_resolve_path() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("provider");
        std::fs::write(&binary, b"#!/bin/sh\n").unwrap();

        assert_eq!(resolve(Some(&binary), None).await.unwrap(), binary);
        assert!(matches!(
            resolve(Some(&dir.path().join("missing")), None).await,
            Err(Error::Config(_))
        ));
        assert!(resolve(None, None).await.is_err());
        assert!(resolve(Some(&binary), Some("a/b:1")).await.is_err());
    }
}
