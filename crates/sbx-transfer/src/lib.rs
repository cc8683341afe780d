//! sbx-transfer: bounded job queue and chunked file transfer
//!
//! A file is split into fixed-size parts. Every part is encrypted under its
//! own content-derived key, uploaded as an independent job, and listed in the
//! file's item metadata (`p: [{p, k, m}]`). Downloads fan out one job per
//! part and join the verified plaintexts back in part order.
//!
//! Concurrency is bounded by [`JobQueue`]: never more than `max_jobs` part
//! jobs run at once, and every finished job admits the next queued one.

pub mod engine;
pub mod error;
pub mod queue;

pub use engine::{
    download_file, download_file_lenient, upload_file, PartPipeline, PartialDownload,
    ProgressFn, UploadResult,
};
pub use error::{PartError, TransferError};
pub use queue::{Job, JobHandle, JobQueue};
