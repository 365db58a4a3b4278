//! PostgreSQL repositories
//!
//! Queries are built at runtime (`query`/`query_as` with `.bind`) so the crate compiles
//! without a live database. Enum columns are stored as text and decoded by the manual
//! `FromRow` impls in `onair_core::models`.

mod asset;
mod job;
mod studio;
mod track;
mod upload;

pub use asset::AssetRepository;
pub use job::JobRepository;
pub use studio::StudioRepository;
pub use track::TrackRepository;
pub use upload::UploadRepository;

pub(crate) const TRACK_COLUMNS: &str = "id, studio_id, title, artist, album, year, genre, state, \
     error_message, duration_seconds, bitrate_kbps, loudness_lufs, peak_dbfs, content_hash, \
     is_duplicate_of, upload_session_id, processed_rel_path, is_active, is_explicit, \
     created_at, updated_at, deleted_at";
