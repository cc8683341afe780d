//! Job queue scheduling: concurrency bound, exactly-once completion, pop order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sbx_core::config::QueueOrder;
use sbx_transfer::{Job, JobQueue};
use tokio::sync::oneshot;

#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

async fn run_bounded(max_jobs: usize, jobs: usize, order: QueueOrder) -> Arc<Gauge> {
    let queue: JobQueue<usize> = JobQueue::new(max_jobs, order);
    let gauge = Arc::new(Gauge::default());

    let handles: Vec<_> = (0..jobs)
        .map(|i| {
            let enter = Arc::clone(&gauge);
            let leave = Arc::clone(&gauge);
            queue.push(
                Job::new(format!("job-{i}"), move || async move {
                    tokio::time::sleep(Duration::from_millis((i % 4) as u64 + 1)).await;
                    Ok(i)
                })
                .on_executing(move || enter.enter())
                .on_completed(move |_, _| leave.leave()),
            )
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().await.unwrap(), i);
    }
    gauge
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn never_more_than_max_jobs_in_flight() {
    for order in [QueueOrder::Fifo, QueueOrder::Lifo] {
        let gauge = run_bounded(3, 25, order).await;
        assert!(gauge.peak.load(Ordering::SeqCst) <= 3, "{order:?} exceeded bound");
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 3, "{order:?} should saturate");
        assert_eq!(gauge.completed.load(Ordering::SeqCst), 25, "each job completes once");
        assert_eq!(gauge.current.load(Ordering::SeqCst), 0);
    }
}

#[tokio::test]
async fn single_slot_serializes_jobs() {
    let gauge = run_bounded(1, 8, QueueOrder::Fifo).await;
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
    assert_eq!(gauge.completed.load(Ordering::SeqCst), 8);
}

/// Block the only slot, queue `a b c`, release, and record start order.
async fn start_order(order: QueueOrder) -> Vec<&'static str> {
    let queue: JobQueue<()> = JobQueue::new(1, order);
    let started = Arc::new(Mutex::new(Vec::new()));
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let blocker = queue.push(Job::new("blocker", move || async move {
        let _ = release_rx.await;
        Ok(())
    }));

    let handles: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|name| {
            let started = Arc::clone(&started);
            queue.push(
                Job::new(name, || async { Ok(()) })
                    .on_executing(move || started.lock().unwrap().push(name)),
            )
        })
        .collect();
    assert_eq!(queue.pending(), 3);

    release_tx.send(()).unwrap();
    blocker.join().await.unwrap();
    for handle in handles {
        handle.join().await.unwrap();
    }
    let order = started.lock().unwrap().clone();
    order
}

#[tokio::test]
async fn fifo_runs_in_push_order() {
    assert_eq!(start_order(QueueOrder::Fifo).await, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn lifo_runs_newest_first() {
    assert_eq!(start_order(QueueOrder::Lifo).await, vec!["c", "b", "a"]);
}

#[tokio::test]
async fn more_running_flag_reports_siblings() {
    let queue: JobQueue<()> = JobQueue::new(2, QueueOrder::Fifo);
    let flags = Arc::new(Mutex::new(Vec::new()));
    let (slow_tx, slow_rx) = oneshot::channel::<()>();

    let f = Arc::clone(&flags);
    let slow = queue.push(
        Job::new("slow", move || async move {
            let _ = slow_rx.await;
            Ok(())
        })
        .on_completed(move |more, _| f.lock().unwrap().push(("slow", more))),
    );
    let f = Arc::clone(&flags);
    let fast = queue.push(
        Job::new("fast", || async { Ok(()) })
            .on_completed(move |more, _| f.lock().unwrap().push(("fast", more))),
    );

    fast.join().await.unwrap();
    slow_tx.send(()).unwrap();
    slow.join().await.unwrap();

    assert_eq!(
        *flags.lock().unwrap(),
        vec![("fast", true), ("slow", false)]
    );
}
