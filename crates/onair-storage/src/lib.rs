//! onair storage
//!
//! Every studio owns a directory under a single shared root:
//!
//! ```text
//! {root}/{slug}/incoming/{upload_id}.part
//! {root}/{slug}/processing/{track_id}.mp3
//! {root}/{slug}/library/mp3/{bitrate}/{track_id}.mp3
//! {root}/{slug}/waveform/
//! {root}/{slug}/artwork/
//! ```
//!
//! Paths are persisted as keys relative to the root (see [`StudioRoot::relpath_from_root`])
//! and resolved back with [`StudioRoot::resolve`]. The pipeline only ever writes into
//! `processing/` and publishes into `library/` with a single rename.

pub mod error;
pub mod layout;
pub mod local;

pub use error::{StorageError, StorageResult};
pub use layout::{StudioPaths, StudioRoot};
pub use local::{
    append_from_reader, atomic_publish, create_empty, file_size, remove_if_exists, sha256_file,
};
