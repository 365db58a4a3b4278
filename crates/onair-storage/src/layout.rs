//! Studio directory layout

use std::path::{Component, Path, PathBuf};

use tokio::fs;
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};

const WRITE_PROBE: &str = ".onair-write-probe";

/// The shared filesystem root all studios live under.
#[derive(Debug, Clone)]
pub struct StudioRoot {
    root: PathBuf,
    default_bitrate_kbps: u32,
}

/// The directories of one studio, for one target bitrate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudioPaths {
    pub base: PathBuf,
    pub incoming: PathBuf,
    pub processing: PathBuf,
    pub library: PathBuf,
    pub waveform: PathBuf,
    pub artwork: PathBuf,
    pub bitrate_kbps: u32,
}

impl StudioPaths {
    /// Temp file receiving the chunks of an upload.
    pub fn incoming_part(&self, upload_id: Uuid) -> PathBuf {
        self.incoming.join(format!("{}.part", upload_id))
    }

    /// Where the transcoder writes before publish.
    pub fn processing_output(&self, track_id: Uuid) -> PathBuf {
        self.processing.join(format!("{}.mp3", track_id))
    }

    /// Final published location.
    pub fn library_output(&self, track_id: Uuid) -> PathBuf {
        self.library.join(format!("{}.mp3", track_id))
    }
}

impl StudioRoot {
    /// Open the root, creating it if needed. Fails with
    /// [`StorageError::InvalidRoot`] when it is unset or not writable.
    pub fn new(root: impl Into<PathBuf>, default_bitrate_kbps: u32) -> StorageResult<Self> {
        let root = root.into();
        if root.as_os_str().is_empty() {
            return Err(StorageError::InvalidRoot(
                "studios root is not configured".to_string(),
            ));
        }

        std::fs::create_dir_all(&root).map_err(|e| {
            StorageError::InvalidRoot(format!("cannot create {}: {}", root.display(), e))
        })?;

        let probe = root.join(WRITE_PROBE);
        std::fs::write(&probe, b"").map_err(|e| {
            StorageError::InvalidRoot(format!("{} is not writable: {}", root.display(), e))
        })?;
        let _ = std::fs::remove_file(&probe);

        Ok(Self {
            root,
            default_bitrate_kbps,
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn default_bitrate_kbps(&self) -> u32 {
        self.default_bitrate_kbps
    }

    /// Directory layout for `slug`, creating any missing directory.
    pub async fn studio_paths(
        &self,
        slug: &str,
        bitrate_kbps: Option<u32>,
    ) -> StorageResult<StudioPaths> {
        validate_segment(slug)?;
        let bitrate = bitrate_kbps
            .filter(|b| *b > 0)
            .unwrap_or(self.default_bitrate_kbps);

        let base = self.root.join(slug);
        let paths = StudioPaths {
            incoming: base.join("incoming"),
            processing: base.join("processing"),
            library: base.join("library").join("mp3").join(bitrate.to_string()),
            waveform: base.join("waveform"),
            artwork: base.join("artwork"),
            base,
            bitrate_kbps: bitrate,
        };

        for dir in [
            &paths.incoming,
            &paths.processing,
            &paths.library,
            &paths.waveform,
            &paths.artwork,
        ] {
            fs::create_dir_all(dir).await.map_err(|e| {
                StorageError::InvalidRoot(format!("cannot create {}: {}", dir.display(), e))
            })?;
        }

        Ok(paths)
    }

    /// Key of `path` relative to the root, with `/` separators.
    pub fn relpath_from_root(&self, path: &Path) -> StorageResult<String> {
        let rel = path.strip_prefix(&self.root).map_err(|_| {
            StorageError::InvalidKey(format!(
                "{} is outside the studios root",
                path.display()
            ))
        })?;

        let mut parts = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                Component::CurDir => {}
                _ => {
                    return Err(StorageError::InvalidKey(format!(
                        "{} is not a plain path",
                        path.display()
                    )))
                }
            }
        }

        if parts.is_empty() {
            return Err(StorageError::InvalidKey(
                "path resolves to the studios root itself".to_string(),
            ));
        }
        Ok(parts.join("/"))
    }

    /// Absolute path for a stored key.
    pub fn resolve(&self, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() || key.starts_with('/') || key.contains('\\') {
            return Err(StorageError::InvalidKey(format!("invalid key: {:?}", key)));
        }
        let mut path = self.root.clone();
        for segment in key.split('/') {
            validate_segment(segment)?;
            path.push(segment);
        }
        Ok(path)
    }
}

fn validate_segment(segment: &str) -> StorageResult<()> {
    if segment.is_empty() || segment == "." || segment == ".." || segment.contains('/') {
        return Err(StorageError::InvalidKey(format!(
            "invalid path segment: {:?}",
            segment
        )));
    }
    Ok(())
}
