//! Data models for the ingest pipeline
//!
//! Studios own upload sessions and tracks. Each pipeline attempt on a track leaves a
//! transcode job row; published outputs are recorded as track assets.

mod asset;
mod job;
mod studio;
mod track;
mod upload;

pub use asset::*;
pub use job::*;
pub use studio::*;
pub use track::*;
pub use upload::*;
