//! Work queue, worker pool and retry scheduler.
//!
//! Workers share one bounded queue. A failed signal is handed to the retry
//! scheduler, which holds it on a [`DelayQueue`] for the backoff period and
//! then puts it back on the work queue; the worker moves on immediately.

use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tracing::{debug, error, info, warn};

use super::transport::{is_delivered, SignalDispatcher};
use super::Signal;

/// Receiving side of the work queue, shared by all workers
pub type SharedReceiver = Arc<Mutex<mpsc::Receiver<Signal>>>;

/// Create the bounded work queue.
pub fn work_queue(capacity: usize) -> (mpsc::Sender<Signal>, SharedReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, Arc::new(Mutex::new(rx)))
}

/// Handle for scheduling delayed re-submissions
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    tx: mpsc::UnboundedSender<Signal>,
    pending: Arc<AtomicUsize>,
}

impl RetryScheduler {
    /// Start the scheduler task feeding expired retries into `work`.
    pub fn spawn(
        backoff: Duration,
        work: mpsc::Sender<Signal>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let handle = tokio::spawn(run_scheduler(backoff, rx, work, pending.clone(), cancel));
        (Self { tx, pending }, handle)
    }

    pub fn schedule(&self, signal: Signal) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(signal).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            debug!("retry scheduler stopped, dropping signal");
        }
    }

    /// Signals waiting out their backoff
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

async fn run_scheduler(
    backoff: Duration,
    mut incoming: mpsc::UnboundedReceiver<Signal>,
    work: mpsc::Sender<Signal>,
    pending: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    let mut delayed: DelayQueue<Signal> = DelayQueue::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(signal) = incoming.recv() => {
                debug!(target_url = %signal.request.url, attempt = signal.attempt, "retrying in {:?}", backoff);
                delayed.insert(signal, backoff);
            }
            Some(expired) = delayed.next() => {
                let signal = expired.into_inner();
                pending.fetch_sub(1, Ordering::SeqCst);
                let sent = tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = work.send(signal) => sent,
                };
                if sent.is_err() {
                    break;
                }
            }
            else => break,
        }
    }

    // later schedule() calls fail and undo their own increment
    incoming.close();
    let mut dropped = delayed.len();
    while incoming.try_recv().is_ok() {
        dropped += 1;
    }
    pending.fetch_sub(dropped, Ordering::SeqCst);
    debug!(dropped, "retry scheduler stopped");
}

/// Start `count` workers draining `queue`.
pub fn spawn_workers(
    count: usize,
    queue: SharedReceiver,
    dispatcher: Arc<dyn SignalDispatcher>,
    retries: RetryScheduler,
    max_retries: u32,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    info!(workers = count, max_retries, "📣 SIGNALLER: Starting signal workers");
    (0..count)
        .map(|id| {
            tokio::spawn(run_worker(
                id,
                queue.clone(),
                dispatcher.clone(),
                retries.clone(),
                max_retries,
                cancel.clone(),
            ))
        })
        .collect()
}

async fn run_worker(
    id: usize,
    queue: SharedReceiver,
    dispatcher: Arc<dyn SignalDispatcher>,
    retries: RetryScheduler,
    max_retries: u32,
    cancel: CancellationToken,
) {
    loop {
        let next = {
            let mut rx = queue.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                next = rx.recv() => next,
            }
        };
        let Some(mut signal) = next else {
            debug!(worker = id, "signal worker stopped");
            return;
        };

        let outcome = dispatcher.dispatch(&signal.request).await;
        match outcome {
            Ok(status) if is_delivered(status) => {
                debug!(worker = id, broadcast_id = %signal.broadcast_id, target_url = %signal.request.url, status, "signal delivered");
                continue;
            }
            Ok(status) => {
                warn!(worker = id, broadcast_id = %signal.broadcast_id, target_url = %signal.request.url, status, "signal broadcast error: unusual status code");
            }
            Err(e) => {
                error!(worker = id, broadcast_id = %signal.broadcast_id, target_url = %signal.request.url, error = %e, "signal broadcast error");
            }
        }

        signal.attempt += 1;
        if signal.attempt < max_retries {
            retries.schedule(signal);
        } else {
            error!(
                broadcast_id = %signal.broadcast_id,
                target_url = %signal.request.url,
                attempts = signal.attempt,
                "❌ SIGNALLER: Giving up on signal"
            );
        }
    }
}
