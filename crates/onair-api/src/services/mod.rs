pub mod ingest;

pub use ingest::{
    FinalizeResult, IngestService, StreamTarget, UploadProgress, UploadRequest, UploadTicket,
};
