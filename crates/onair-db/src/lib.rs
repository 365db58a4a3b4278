//! onair database layer
//!
//! Repository traits live in [`traits`]; [`db`] implements them on PostgreSQL and
//! [`memory`] implements them in process for tests and local development.

pub mod db;
pub mod memory;
pub mod traits;

pub use db::{
    AssetRepository, JobRepository, StudioRepository, TrackRepository, UploadRepository,
};
pub use memory::MemoryStore;
pub use traits::{
    AssetStore, JobLedger, LockedUpload, NewUpload, StudioStore, TrackStore, UploadStore,
};
