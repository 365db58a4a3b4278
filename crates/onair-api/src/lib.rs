//! OnAir ingest API library
//!
//! HTTP handlers for the chunked upload protocol and track lifecycle, plus application setup.

mod api_doc;
pub mod constants;
pub mod content_range;
mod handlers;
pub mod services;
pub mod setup;
mod telemetry;

pub mod error;
pub mod state;

pub use error::ErrorResponse;
pub use services::IngestService;
