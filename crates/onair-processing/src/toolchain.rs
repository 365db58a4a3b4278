//! External binary resolution

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolchainError {
    #[error(
        "{name} not found. Set {env}_PATH to an absolute path or install it and ensure it is on PATH"
    )]
    NotFound { name: String, env: String },
}

/// Resolved locations of the probe and transcode binaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Toolchain {
    pub fn resolve(
        ffmpeg: Option<&str>,
        ffprobe: Option<&str>,
    ) -> Result<Self, ToolchainError> {
        Ok(Self {
            ffmpeg: resolve_binary("ffmpeg", ffmpeg)?,
            ffprobe: resolve_binary("ffprobe", ffprobe)?,
        })
    }
}

/// Resolve `name`, preferring `configured` when it is an absolute executable path and
/// otherwise searching PATH for `configured` (or `name`).
pub fn resolve_binary(name: &str, configured: Option<&str>) -> Result<PathBuf, ToolchainError> {
    let candidate = configured.filter(|c| !c.trim().is_empty()).unwrap_or(name);

    let path = Path::new(candidate);
    if path.is_absolute() && is_executable(path) {
        return Ok(path.to_path_buf());
    }

    which::which(candidate).map_err(|_| ToolchainError::NotFound {
        name: name.to_string(),
        env: name.to_uppercase(),
    })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
