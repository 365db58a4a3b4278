//! onair processing
//!
//! Everything the pipeline needs from the external audio toolchain: resolving the
//! `ffmpeg`/`ffprobe` binaries, reading tags and duration from a probe, backfilling
//! track metadata, and the loudness-normalizing MP3 transcode.

pub mod metadata;
pub mod probe;
#[cfg(feature = "test-support")]
pub mod testing;
pub mod toolchain;
pub mod transcode;

pub use metadata::{backfill, MetadataField};
pub use probe::{coerce_year, ProbeResult, TagMap};
pub use toolchain::{resolve_binary, Toolchain, ToolchainError};
pub use transcode::{
    FfmpegTranscoder, LoudnessMeasurement, LoudnessTarget, TranscodeOutcome, TranscodeRequest,
    Transcoder,
};
