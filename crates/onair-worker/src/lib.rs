//! onair worker
//!
//! A finalized upload becomes a QUEUED row in the job ledger, followed by a
//! [`PipelineMessage`] on the [`JobQueue`] to wake the [`WorkerPool`]. The pool claims
//! due rows, bounds concurrency and run time, retries transient failures and reaps
//! attempts whose worker disappeared. The work itself is
//! [`UploadPipeline::process_upload`].

pub mod context;
pub mod dispatch;
pub mod pipeline;
pub mod queue;
pub mod retry;

pub use context::{JobContext, JobHandler};
pub use dispatch::dispatch_track;
pub use pipeline::{PipelineOutcome, PipelineStores, UploadPipeline};
pub use queue::{worker_identity, ChannelJobQueue, JobQueue, PipelineMessage, WorkerPool, WorkerPoolConfig};
pub use retry::RetryPolicy;
