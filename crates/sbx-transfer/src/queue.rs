//! Bounded, self-draining job queue
//!
//! Jobs are pushed at any time; the queue starts one immediately when fewer
//! than `max_jobs` are running, otherwise it parks the job until a running one
//! finishes. Every completion re-evaluates the queue, so no external pump is
//! needed.
//!
//! Pop order is configurable: [`QueueOrder::Fifo`] (default) runs jobs in push
//! order, [`QueueOrder::Lifo`] runs the most recently pushed job first.
//!
//! Cancellation: every job gets a child token of the queue's token, plus an
//! optional caller token. A job cancelled before it starts never runs; a
//! running job is aborted at its next suspension point.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use futures::FutureExt;
use sbx_core::config::{QueueOrder, TransferConfig};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TransferError;

type JobResult<T> = Result<T, TransferError>;
type RunFn<T> = Box<dyn FnOnce() -> BoxFuture<'static, JobResult<T>> + Send>;
type ExecutingHook = Box<dyn FnOnce() + Send>;
type CompletedHook<T> = Box<dyn FnOnce(bool, &JobResult<T>) + Send>;
type ErrorHook = Box<dyn FnOnce(&TransferError) + Send>;

/// A unit of work plus its lifecycle hooks.
pub struct Job<T> {
    label: String,
    run: RunFn<T>,
    on_executing: Option<ExecutingHook>,
    on_completed: Option<CompletedHook<T>>,
    on_error: Option<ErrorHook>,
    cancel: Option<CancellationToken>,
}

impl<T: Send + 'static> Job<T> {
    pub fn new<F, Fut>(label: impl Into<String>, run: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = JobResult<T>> + Send + 'static,
    {
        Self {
            label: label.into(),
            run: Box::new(move || run().boxed()),
            on_executing: None,
            on_completed: None,
            on_error: None,
            cancel: None,
        }
    }

    /// Called when the job leaves the queue and starts running.
    pub fn on_executing(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_executing = Some(Box::new(hook));
        self
    }

    /// Called once the job has finished. The flag is true while other jobs
    /// of the same queue are still running.
    pub fn on_completed(mut self, hook: impl FnOnce(bool, &JobResult<T>) + Send + 'static) -> Self {
        self.on_completed = Some(Box::new(hook));
        self
    }

    /// Called before `on_completed` when the job fails or is cancelled.
    pub fn on_error(mut self, hook: impl FnOnce(&TransferError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(hook));
        self
    }

    /// Also cancel this job when `token` is cancelled.
    pub fn cancelled_by(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Resolves to the result of a pushed job.
pub struct JobHandle<T> {
    rx: oneshot::Receiver<JobResult<T>>,
    token: CancellationToken,
}

impl<T> JobHandle<T> {
    /// Cancel this job only. A job that has not started yet never will.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub async fn join(self) -> JobResult<T> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(TransferError::Queue("job dropped before completion".into())))
    }
}

struct Queued<T> {
    job: Job<T>,
    token: CancellationToken,
    tx: oneshot::Sender<JobResult<T>>,
}

impl<T> Queued<T> {
    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.job.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }
}

struct State<T> {
    pending: VecDeque<Queued<T>>,
    running: usize,
}

struct Shared<T> {
    max_jobs: usize,
    order: QueueOrder,
    cancel: CancellationToken,
    state: Mutex<State<T>>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // State stays consistent across a panicking hook; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct JobQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for JobQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> JobQueue<T> {
    /// `max_jobs` of 0 is treated as 1.
    pub fn new(max_jobs: usize, order: QueueOrder) -> Self {
        Self {
            shared: Arc::new(Shared {
                max_jobs: max_jobs.max(1),
                order,
                cancel: CancellationToken::new(),
                state: Mutex::new(State {
                    pending: VecDeque::new(),
                    running: 0,
                }),
            }),
        }
    }

    pub fn uploads(config: &TransferConfig) -> Self {
        Self::new(config.max_upload_jobs, config.queue_order)
    }

    pub fn downloads(config: &TransferConfig) -> Self {
        Self::new(config.max_download_jobs, config.queue_order)
    }

    pub fn max_jobs(&self) -> usize {
        self.shared.max_jobs
    }

    pub fn running(&self) -> usize {
        self.shared.lock().running
    }

    pub fn pending(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Queue a job and start it right away if a slot is free.
    ///
    /// Must be called from within a tokio runtime.
    pub fn push(&self, job: Job<T>) -> JobHandle<T> {
        let token = self.shared.cancel.child_token();
        let (tx, rx) = oneshot::channel();
        self.shared.lock().pending.push_back(Queued {
            job,
            token: token.clone(),
            tx,
        });
        drain(&self.shared);
        JobHandle { rx, token }
    }

    /// Re-evaluate the queue. Only needed after external state changes; push
    /// and completion already drain.
    pub fn refresh(&self) {
        drain(&self.shared);
    }

    /// Cancel every queued and running job. Jobs pushed afterwards are
    /// cancelled as well.
    pub fn cancel_all(&self) {
        self.shared.cancel.cancel();
        drain(&self.shared);
    }
}

fn drain<T: Send + 'static>(shared: &Arc<Shared<T>>) {
    loop {
        let next = {
            let mut state = shared.lock();
            let popped = match shared.order {
                QueueOrder::Fifo => state.pending.pop_front(),
                QueueOrder::Lifo => state.pending.pop_back(),
            };
            let Some(queued) = popped else {
                return;
            };
            if queued.is_cancelled() {
                drop(state);
                reject(queued);
                continue;
            }
            if state.running >= shared.max_jobs {
                // Put it back where it came from
                match shared.order {
                    QueueOrder::Fifo => state.pending.push_front(queued),
                    QueueOrder::Lifo => state.pending.push_back(queued),
                }
                return;
            }
            state.running += 1;
            queued
        };
        start(Arc::clone(shared), next);
    }
}

/// Resolve a job that was cancelled before it started.
fn reject<T>(queued: Queued<T>) {
    let Queued { job, tx, .. } = queued;
    debug!(job = %job.label, "job cancelled before start");
    let result = Err(TransferError::Cancelled);
    if let (Some(hook), Err(e)) = (job.on_error, &result) {
        hook(e);
    }
    let _ = tx.send(result);
}

fn start<T: Send + 'static>(shared: Arc<Shared<T>>, queued: Queued<T>) {
    let Queued { job, token, tx } = queued;
    let Job {
        label,
        run,
        on_executing,
        on_completed,
        on_error,
        cancel,
    } = job;

    if let Some(hook) = on_executing {
        hook();
    }
    debug!(job = %label, "job executing");

    let work = tokio::spawn(run());
    tokio::spawn(async move {
        let abort = work.abort_handle();
        let external = cancel.unwrap_or_default();
        let result = tokio::select! {
            joined = work => joined.unwrap_or_else(|e| {
                warn!(job = %label, error = %e, "job task failed");
                Err(TransferError::Queue(format!("job {label} did not finish: {e}")))
            }),
            _ = token.cancelled() => {
                abort.abort();
                Err(TransferError::Cancelled)
            }
            _ = external.cancelled() => {
                abort.abort();
                Err(TransferError::Cancelled)
            }
        };

        // Hooks run while the slot is still held, so paired
        // on_executing/on_completed counts never exceed max_jobs.
        let more_running = shared.lock().running > 1;
        if let (Some(hook), Err(e)) = (on_error, &result) {
            hook(e);
        }
        if let Some(hook) = on_completed {
            hook(more_running, &result);
        }

        shared.lock().running -= 1;
        let _ = tx.send(result);
        drain(&shared);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_runs_and_returns_result() {
        let queue = JobQueue::new(2, QueueOrder::Fifo);
        let handle = queue.push(Job::new("answer", || async { Ok(42) }));
        assert_eq!(handle.join().await.unwrap(), 42);
        assert_eq!(queue.running(), 0);
    }

    #[tokio::test]
    async fn test_zero_max_jobs_still_runs() {
        let queue: JobQueue<()> = JobQueue::new(0, QueueOrder::Fifo);
        assert_eq!(queue.max_jobs(), 1);
        queue.push(Job::new("one", || async { Ok(()) })).join().await.unwrap();
    }

    #[tokio::test]
    async fn test_error_hooks() {
        let queue: JobQueue<()> = JobQueue::new(1, QueueOrder::Fifo);
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&errors);
        let (done_tx, done_rx) = oneshot::channel();

        let handle = queue.push(
            Job::new("fails", || async { Err(TransferError::Queue("boom".into())) })
                .on_error(move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                })
                .on_completed(move |more_running, result| {
                    let _ = done_tx.send((more_running, result.is_err()));
                }),
        );

        assert!(matches!(handle.join().await, Err(TransferError::Queue(_))));
        assert_eq!(done_rx.await.unwrap(), (false, true));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let queue: JobQueue<()> = JobQueue::new(1, QueueOrder::Fifo);
        let handle = queue.push(Job::new("sleeper", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }));
        handle.cancel();
        assert!(matches!(handle.join().await, Err(TransferError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_all_drains_pending() {
        let queue: JobQueue<()> = JobQueue::new(1, QueueOrder::Fifo);
        let started = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..4 {
            let started = Arc::clone(&started);
            handles.push(queue.push(
                Job::new(format!("job-{i}"), || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                })
                .on_executing(move || {
                    started.fetch_add(1, Ordering::SeqCst);
                }),
            ));
        }
        assert_eq!(queue.pending(), 3);

        queue.cancel_all();
        for handle in handles {
            assert!(matches!(handle.join().await, Err(TransferError::Cancelled)));
        }
        assert_eq!(started.load(Ordering::SeqCst), 1, "queued jobs never start");
    }

    #[test]
    fn test_lifo_queue_under_block_on() {
        let result = tokio_test::block_on(async {
            let queue = JobQueue::new(1, QueueOrder::Lifo);
            queue.push(Job::new("sum", || async { Ok(1 + 1) })).join().await
        });
        assert_eq!(result.unwrap(), 2);
    }
}
