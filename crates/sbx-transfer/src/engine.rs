//! Chunked upload and download of encrypted file parts
//!
//!   - `upload_file`: split → encrypt each part (content-derived key) → upload
//!     as one queue job per part → ordered part metadata
//!   - `download_file`: one queue job per part → verify + decrypt → join in
//!     part order; the first failure cancels the remaining parts
//!   - `download_file_lenient`: same fan-out, but every part reports its own
//!     outcome so intact parts survive a bad one
//!
//! Each part is self-authenticating (HMAC under its own key); there is no
//! separate whole-file MAC. A failed part job is resubmitted up to
//! `max_retries` times.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::future::join_all;
use sbx_core::api::StorageService;
use sbx_core::config::{CryptoConfig, PartKeying, TransferConfig};
use sbx_core::types::{FileBody, PartMeta};
use sbx_crypto::{decrypt_file_part, encrypt_file_part, part_count, PrimitiveProvider};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransferError;
use crate::queue::{Job, JobQueue};

/// Progress callback type (bytes_done, bytes_total, message)
pub type ProgressFn = Box<dyn Fn(u64, u64, &str) + Send + Sync>;

/// Everything a part job needs besides its own bytes.
#[derive(Clone)]
pub struct PartPipeline {
    store: Arc<dyn StorageService>,
    provider: Arc<dyn PrimitiveProvider>,
    part_size: u64,
    keying: PartKeying,
    max_retries: u32,
}

impl PartPipeline {
    pub fn new(
        store: Arc<dyn StorageService>,
        provider: Arc<dyn PrimitiveProvider>,
        part_size: u64,
        keying: PartKeying,
    ) -> Self {
        Self {
            store,
            provider,
            part_size: part_size.max(1),
            keying,
            max_retries: 0,
        }
    }

    pub fn from_config(
        store: Arc<dyn StorageService>,
        provider: Arc<dyn PrimitiveProvider>,
        crypto: &CryptoConfig,
        transfer: &TransferConfig,
    ) -> Self {
        Self::new(store, provider, crypto.part_size, crypto.part_keying)
            .with_retries(transfer.max_retries)
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn keying(&self) -> PartKeying {
        self.keying
    }
}

/// Result of uploading a file's parts
#[derive(Debug, Clone)]
pub struct UploadResult {
    pub item_id: String,
    /// Part metadata ordered by part number
    pub parts: Vec<PartMeta>,
    pub bytes: u64,
    pub part_size: u64,
}

impl UploadResult {
    /// File item body for the uploaded parts.
    pub fn file_body(&self, name: &str, mime_type: &str, created: i64, modified: i64) -> FileBody {
        FileBody {
            name: name.to_owned(),
            created,
            modified,
            size: self.bytes,
            mime_type: mime_type.to_owned(),
            part_size: self.part_size,
            parts: self.parts.clone(),
        }
    }
}

/// Per-part outcome of a lenient download, in part order.
#[derive(Debug)]
pub struct PartialDownload {
    pub parts: Vec<Result<Bytes, TransferError>>,
}

impl PartialDownload {
    pub fn is_complete(&self) -> bool {
        self.parts.iter().all(Result::is_ok)
    }

    pub fn failed_parts(&self) -> Vec<u64> {
        self.parts
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_err())
            .map(|(i, _)| i as u64)
            .collect()
    }

    /// Join all parts, or return the first failure.
    pub fn assemble(self) -> Result<Bytes, TransferError> {
        let mut out = BytesMut::new();
        for part in self.parts {
            out.extend_from_slice(&part?);
        }
        Ok(out.freeze())
    }
}

struct Progress<'a> {
    callback: Option<&'a ProgressFn>,
    done: AtomicU64,
    total: u64,
    verb: &'static str,
}

impl<'a> Progress<'a> {
    fn new(callback: Option<&'a ProgressFn>, total: u64, verb: &'static str) -> Self {
        Self {
            callback,
            done: AtomicU64::new(0),
            total,
            verb,
        }
    }

    fn advance(&self, part: u64, bytes: u64, parts: u64) {
        let done = self.done.fetch_add(bytes, Ordering::SeqCst) + bytes;
        if let Some(cb) = self.callback {
            cb(done, self.total, &format!("part {}/{parts} {}", part + 1, self.verb));
        }
    }
}

/// Push `make()` onto `queue`, resubmitting on retryable failures.
async fn submit<T, F>(
    queue: &JobQueue<T>,
    part: u64,
    retries: u32,
    cancel: &CancellationToken,
    make: F,
) -> Result<T, TransferError>
where
    T: Send + 'static,
    F: Fn() -> Job<T>,
{
    let mut attempt = 0;
    loop {
        let result = queue.push(make().cancelled_by(cancel.clone())).join().await;
        match result {
            Err(e) if attempt < retries && e.is_retryable() && !cancel.is_cancelled() => {
                attempt += 1;
                warn!(part, attempt, error = %e, "resubmitting part");
            }
            other => return other,
        }
    }
}

/// Prefer the root cause over the `Cancelled` it triggered in sibling parts.
fn first_failure<T>(results: Vec<Result<T, TransferError>>) -> Result<Vec<T>, TransferError> {
    let mut ok = Vec::with_capacity(results.len());
    let mut cancelled = false;
    let mut failure = None;
    for result in results {
        match result {
            Ok(v) => ok.push(v),
            Err(TransferError::Cancelled) => cancelled = true,
            Err(e) => {
                if failure.is_none() {
                    failure = Some(e);
                }
            }
        }
    }
    match (failure, cancelled) {
        (Some(e), _) => Err(e),
        (None, true) => Err(TransferError::Cancelled),
        (None, false) => Ok(ok),
    }
}

fn upload_job(
    pipeline: &PartPipeline,
    item_id: &str,
    part: u64,
    plaintext: Bytes,
) -> Job<PartMeta> {
    let store = Arc::clone(&pipeline.store);
    let provider = Arc::clone(&pipeline.provider);
    let keying = pipeline.keying;
    let item_id = item_id.to_owned();

    Job::new(format!("upload {item_id}#{part}"), move || async move {
        let encrypted = tokio::task::spawn_blocking(move || {
            encrypt_file_part(provider.as_ref(), part, &plaintext, keying)
        })
        .await
        .map_err(|e| TransferError::Queue(format!("encrypt task failed: {e}")))?
        .map_err(|e| TransferError::part(part, e))?;

        let meta = encrypted.meta();
        store
            .upload_part(&item_id, part, Bytes::from(encrypted.ciphertext))
            .await
            .map_err(|e| TransferError::part(part, e))?;
        debug!(item = %item_id, part, "part uploaded");
        Ok::<_, TransferError>(meta)
    })
}

fn download_job(pipeline: &PartPipeline, item_id: &str, meta: &PartMeta) -> Job<Bytes> {
    let store = Arc::clone(&pipeline.store);
    let provider = Arc::clone(&pipeline.provider);
    let keying = pipeline.keying;
    let item_id = item_id.to_owned();
    let meta = meta.clone();

    Job::new(format!("download {item_id}#{}", meta.part), move || async move {
        let part = meta.part;
        let ciphertext = store
            .download_part(&item_id, part)
            .await
            .map_err(|e| TransferError::part(part, e))?;

        let plaintext = tokio::task::spawn_blocking(move || {
            decrypt_file_part(provider.as_ref(), &meta, &ciphertext, keying)
        })
        .await
        .map_err(|e| TransferError::Queue(format!("decrypt task failed: {e}")))?
        .map_err(|e| TransferError::part(part, e))?;
        debug!(item = %item_id, part, "part downloaded");
        Ok::<_, TransferError>(Bytes::from(plaintext))
    })
}

/// Split `data` into parts, encrypt and upload each as a queue job.
///
/// The first failing part cancels the remaining ones. An empty file has no
/// parts and uploads nothing.
pub async fn upload_file(
    pipeline: &PartPipeline,
    queue: &JobQueue<PartMeta>,
    item_id: &str,
    data: Bytes,
    cancel: &CancellationToken,
    progress: Option<&ProgressFn>,
) -> Result<UploadResult, TransferError> {
    let size = data.len() as u64;
    let count = part_count(size, pipeline.part_size);
    let file_cancel = cancel.child_token();
    let tracker = Progress::new(progress, size, "uploaded");

    let jobs = (0..count).map(|part| {
        let start = (part * pipeline.part_size) as usize;
        let end = ((part + 1) * pipeline.part_size).min(size) as usize;
        let plaintext = data.slice(start..end);
        let len = plaintext.len() as u64;
        let file_cancel = &file_cancel;
        let tracker = &tracker;
        async move {
            let result = submit(queue, part, pipeline.max_retries, file_cancel, || {
                upload_job(pipeline, item_id, part, plaintext.clone())
            })
            .await;
            match &result {
                Ok(_) => tracker.advance(part, len, count),
                Err(_) => file_cancel.cancel(),
            }
            result
        }
    });

    let parts = first_failure(join_all(jobs).await)?;
    info!(item = %item_id, parts = count, bytes = size, "uploaded");
    Ok(UploadResult {
        item_id: item_id.to_owned(),
        parts,
        bytes: size,
        part_size: pipeline.part_size,
    })
}

/// Check that `file.parts` lists exactly parts `0..n` in order.
fn check_parts(file: &FileBody) -> Result<(), TransferError> {
    let expected = part_count(file.size, file.part_size.max(1));
    if file.parts.len() as u64 != expected {
        return Err(TransferError::Manifest(format!(
            "{} bytes in parts of {} need {expected} parts, metadata lists {}",
            file.size,
            file.part_size,
            file.parts.len()
        )));
    }
    if let Some((i, meta)) = file
        .parts
        .iter()
        .enumerate()
        .find(|(i, meta)| meta.part != *i as u64)
    {
        return Err(TransferError::Manifest(format!(
            "part {} listed at position {i}",
            meta.part
        )));
    }
    Ok(())
}

async fn fetch_parts(
    pipeline: &PartPipeline,
    queue: &JobQueue<Bytes>,
    item_id: &str,
    file: &FileBody,
    cancel: &CancellationToken,
    fail_fast: bool,
    progress: Option<&ProgressFn>,
) -> Vec<Result<Bytes, TransferError>> {
    let count = file.parts.len() as u64;
    let tracker = Progress::new(progress, file.size, "downloaded");

    let jobs = file.parts.iter().map(|meta| {
        let tracker = &tracker;
        async move {
            let result = submit(queue, meta.part, pipeline.max_retries, cancel, || {
                download_job(pipeline, item_id, meta)
            })
            .await;
            match &result {
                Ok(bytes) => tracker.advance(meta.part, bytes.len() as u64, count),
                Err(e) => {
                    warn!(item = %item_id, part = meta.part, error = %e, "part download failed");
                    if fail_fast {
                        cancel.cancel();
                    }
                }
            }
            result
        }
    });
    join_all(jobs).await
}

/// Download, verify and decrypt every part of `file`, joined in part order.
pub async fn download_file(
    pipeline: &PartPipeline,
    queue: &JobQueue<Bytes>,
    item_id: &str,
    file: &FileBody,
    cancel: &CancellationToken,
    progress: Option<&ProgressFn>,
) -> Result<Bytes, TransferError> {
    check_parts(file)?;
    let file_cancel = cancel.child_token();
    let results = fetch_parts(pipeline, queue, item_id, file, &file_cancel, true, progress).await;

    let parts = first_failure(results)?;
    let mut out = BytesMut::with_capacity(file.size as usize);
    for part in parts {
        out.extend_from_slice(&part);
    }
    if out.len() as u64 != file.size {
        return Err(TransferError::Manifest(format!(
            "expected {} bytes, parts decrypted to {}",
            file.size,
            out.len()
        )));
    }
    info!(item = %item_id, parts = file.parts.len(), bytes = file.size, "downloaded");
    Ok(out.freeze())
}

/// Like [`download_file`], but a failing part does not cancel the others.
pub async fn download_file_lenient(
    pipeline: &PartPipeline,
    queue: &JobQueue<Bytes>,
    item_id: &str,
    file: &FileBody,
    cancel: &CancellationToken,
    progress: Option<&ProgressFn>,
) -> Result<PartialDownload, TransferError> {
    check_parts(file)?;
    let parts = fetch_parts(pipeline, queue, item_id, file, cancel, false, progress).await;
    let download = PartialDownload { parts };
    if !download.is_complete() {
        warn!(item = %item_id, failed = ?download.failed_parts(), "download incomplete");
    }
    Ok(download)
}
