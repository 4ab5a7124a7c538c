// cleanup/mod.rs
// Background repair of transactions that left state behind
//
// This module provides:
// - `AtrCleanupEntry`: the clean-one-entry workhorse shared by both loops
// - `AtrCleanupQueue`: in-process priority queue of this client's own
//   stranded attempts
// - `LostAttemptsCleanup`: cross-client cleanup via the client record
// - `TransactionsCleanup`: owns both background workers

mod entry;
mod lost;
mod queue;

pub use entry::AtrCleanupEntry;
pub use lost::{AtrCleanupStats, ClientRecordDetails, LostAttemptsCleanup};
pub use queue::AtrCleanupQueue;

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::attempt_context::AttemptContext;
use crate::attempt_state::AttemptState;
use crate::config::TransactionConfig;
use crate::document::DocId;
use crate::kv::KvClient;
use crate::logging::LogTarget;
use crate::uid;
use crate::{log_debug, log_error, log_info, log_trace};

/// How often the queue worker wakes to look for ready entries
const CLEANUP_LOOP_DELAY: Duration = Duration::from_millis(100);
/// Grace between an attempt finishing and its cleanup becoming eligible
const QUEUE_GRACE: Duration = Duration::from_millis(50);
/// Bounded wait for draining the queue on shutdown
const SHUTDOWN_DRAIN_BUDGET: Duration = Duration::from_secs(2);

/// Owns the two background cleanup workers. Created by `Transactions`,
/// shut down via [`TransactionsCleanup::close`].
pub struct TransactionsCleanup {
    client: Arc<dyn KvClient>,
    config: Arc<TransactionConfig>,
    client_uuid: String,
    queue: Arc<AtrCleanupQueue>,
    shutdown: Mutex<Option<Sender<()>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TransactionsCleanup {
    pub fn start(client: Arc<dyn KvClient>, config: Arc<TransactionConfig>) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = unbounded::<()>();
        let cleanup = Arc::new(TransactionsCleanup {
            client: client.clone(),
            config: config.clone(),
            client_uuid: uid::next_id(),
            queue: Arc::new(AtrCleanupQueue::new()),
            shutdown: Mutex::new(Some(shutdown_tx)),
            handles: Mutex::new(Vec::new()),
        });

        let mut handles = cleanup.handles.lock();
        if config.cleanup_client_attempts() {
            let queue = cleanup.queue.clone();
            let client = client.clone();
            let config = config.clone();
            let rx = shutdown_rx.clone();
            handles.push(std::thread::spawn(move || {
                attempts_loop(&*client, &config, &queue, &rx);
            }));
        }
        if config.cleanup_lost_attempts() {
            let uuid = cleanup.client_uuid.clone();
            let rx = shutdown_rx;
            handles.push(std::thread::spawn(move || {
                lost_attempts_loop(client, config, uuid, &rx);
            }));
        }
        drop(handles);
        cleanup
    }

    pub fn client_uuid(&self) -> &str {
        &self.client_uuid
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Offer a finished attempt. Attempts that left no state behind
    /// (never started, or fully finalized) are not queued.
    pub fn add_attempt(&self, ctx: &AttemptContext<'_>) {
        match ctx.state() {
            AttemptState::NotStarted | AttemptState::Completed | AttemptState::RolledBack => {
                log_trace!(
                    LogTarget::AttemptCleanup,
                    "attempt {} in state {}, not queueing",
                    ctx.id(),
                    ctx.state()
                );
            }
            _ => {
                if !self.config.cleanup_client_attempts() {
                    log_trace!(
                        LogTarget::AttemptCleanup,
                        "client-attempt cleanup disabled, ignoring {}",
                        ctx.id()
                    );
                    return;
                }
                let Some(atr_id) = ctx.atr_id() else {
                    return;
                };
                log_debug!(
                    LogTarget::AttemptCleanup,
                    "queueing attempt {} for cleanup",
                    ctx.id()
                );
                self.queue.push(AtrCleanupEntry::new(
                    atr_id,
                    ctx.id().to_string(),
                    false,
                    Instant::now() + QUEUE_GRACE,
                ));
            }
        }
    }

    /// Synchronously clean everything on the queue, ignoring ready
    /// times. Testing aid.
    pub fn force_cleanup_attempts(&self) -> usize {
        let mut cleaned = 0;
        while let Some(entry) = self.queue.pop_any() {
            match entry.clean(&*self.client, &self.config, LogTarget::AttemptCleanup) {
                Ok(_) => cleaned += 1,
                Err(err) => {
                    log_error!(
                        LogTarget::AttemptCleanup,
                        "forced cleanup of {} failed: {}",
                        entry.attempt_id(),
                        err
                    );
                }
            }
        }
        cleaned
    }

    /// Synchronously sweep one ATR, expired or not. Testing aid.
    pub fn force_cleanup_atr(&self, atr_doc_id: &DocId) -> crate::error::OpResult<AtrCleanupStats> {
        let lost = LostAttemptsCleanup::new(
            self.client.clone(),
            self.config.clone(),
            self.client_uuid.clone(),
        );
        lost.handle_atr_cleanup(atr_doc_id, false)
    }

    /// Synchronously sweep this client's whole share of a bucket with
    /// expiry checks on, as the background loop would. Testing aid.
    pub fn force_lost_cleanup(&self, bucket: &str) -> crate::error::OpResult<()> {
        let lost = LostAttemptsCleanup::new(
            self.client.clone(),
            self.config.clone(),
            self.client_uuid.clone(),
        );
        let (_tx, rx) = unbounded::<()>();
        // keep _tx alive so the sweep is not interrupted
        let result = lost.clean_lost_attempts_in_bucket(bucket, &rx);
        drop(_tx);
        result
    }

    /// Stop both workers. The queue worker drains with a bounded wait;
    /// the lost worker deregisters this client from every bucket.
    pub fn close(&self) {
        let sender = self.shutdown.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender);
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                log_error!(LogTarget::AttemptCleanup, "cleanup worker panicked");
            }
        }
        log_info!(LogTarget::AttemptCleanup, "cleanup workers closed");
    }
}

impl Drop for TransactionsCleanup {
    fn drop(&mut self) {
        self.close();
    }
}

/// C6 worker: pop ready entries and clean them, best effort. Errors are
/// logged and the entry is dropped; lost-attempts cleanup is the safety
/// net.
fn attempts_loop(
    client: &dyn KvClient,
    config: &TransactionConfig,
    queue: &AtrCleanupQueue,
    shutdown: &Receiver<()>,
) {
    log_debug!(LogTarget::AttemptCleanup, "cleanup attempts loop starting");
    loop {
        match shutdown.recv_timeout(CLEANUP_LOOP_DELAY) {
            Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        while let Some(entry) = queue.pop_ready() {
            log_trace!(
                LogTarget::AttemptCleanup,
                "beginning cleanup of attempt {}",
                entry.attempt_id()
            );
            if let Err(err) = entry.clean(client, config, LogTarget::AttemptCleanup) {
                log_info!(
                    LogTarget::AttemptCleanup,
                    "error cleaning {}: {}, leaving for lost-attempts cleanup",
                    entry.attempt_id(),
                    err
                );
            }
        }
    }
    // Shutdown: drain what is left, within a bounded budget
    let deadline = Instant::now() + SHUTDOWN_DRAIN_BUDGET;
    while let Some(entry) = queue.pop_any() {
        if Instant::now() > deadline {
            log_info!(
                LogTarget::AttemptCleanup,
                "drain budget exhausted with {} entries left",
                queue.len() + 1
            );
            break;
        }
        if let Err(err) = entry.clean(client, config, LogTarget::AttemptCleanup) {
            log_info!(
                LogTarget::AttemptCleanup,
                "error cleaning {} during drain: {}",
                entry.attempt_id(),
                err
            );
        }
    }
    log_debug!(LogTarget::AttemptCleanup, "cleanup attempts loop stopped");
}

/// C7 worker: sweep every bucket once per cleanup window, then
/// deregister on shutdown
fn lost_attempts_loop(
    client: Arc<dyn KvClient>,
    config: Arc<TransactionConfig>,
    client_uuid: String,
    shutdown: &Receiver<()>,
) {
    log_info!(LogTarget::LostCleanup, "lost attempts loop starting");
    let lost = LostAttemptsCleanup::new(client.clone(), config.clone(), client_uuid);
    'outer: loop {
        let window_start = Instant::now();
        for bucket in client.bucket_names() {
            if let Err(err) = lost.clean_lost_attempts_in_bucket(&bucket, shutdown) {
                log_error!(
                    LogTarget::LostCleanup,
                    "error cleaning bucket {}: {}",
                    bucket,
                    err
                );
            }
            // A shutdown during the sweep returns early; notice it here
            if shutdown_requested(shutdown) {
                break 'outer;
            }
        }
        let elapsed = window_start.elapsed();
        let window = config.cleanup_window();
        if elapsed < window {
            match shutdown.recv_timeout(window - elapsed) {
                Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }
    lost.remove_client_record_from_all_buckets();
    log_info!(LogTarget::LostCleanup, "lost attempts loop stopped");
}

fn shutdown_requested(shutdown: &Receiver<()>) -> bool {
    matches!(
        shutdown.try_recv(),
        Ok(_) | Err(crossbeam::channel::TryRecvError::Disconnected)
    )
}
