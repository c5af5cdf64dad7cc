// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconciliation of cached counts into the durable store.
//!
//! One pass drains [`count_stream`] through a [`RowBatcher`] and upserts each
//! batch. A failed write aborts the rest of the pass with
//! [`StorageError::BatchWriteFailure`]; batches already written stay
//! committed and the next pass rescans from the start.
//!
//! Only one pass runs at a time. [`Reconciler::try_begin`] hands out the
//! single-flight guard; scheduler triggers and manual runs share it.
//!
//! Between steps the pass checks the shutdown flag and its deadline. Either
//! one stops it before the next fetch or write, never in the middle of one.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batching::row_batcher::{BatchConfig, FlushBatch, RowBatcher};
use crate::config::FavoriteEngineConfig;
use crate::domain::FavoriteCount;
use crate::metrics;
use crate::storage::stream::count_stream;
use crate::storage::traits::{CountArchive, FavoriteCache, StorageError};

/// What started a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Interval,
    Threshold,
    Manual,
}

impl Trigger {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interval => "interval",
            Self::Threshold => "threshold",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a pass stopped before the stream was exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Deadline,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Completed,
    Abandoned(StopReason),
}

impl PassOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Abandoned(StopReason::Deadline) => "abandoned_deadline",
            Self::Abandoned(StopReason::Shutdown) => "abandoned_shutdown",
        }
    }
}

/// Summary of one pass
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub run_id: Uuid,
    pub trigger: Trigger,
    pub outcome: PassOutcome,
    /// Entries read from the cache
    pub scanned: usize,
    /// Rows committed to the durable store
    pub written: usize,
    pub batches: usize,
    /// Mutations since the previous pass
    pub pending_delta: u64,
    pub elapsed: Duration,
}

/// Held while a pass runs; releases the single-flight slot on drop.
#[must_use = "dropping the guard releases the pass slot"]
pub struct PassGuard {
    in_flight: Arc<AtomicBool>,
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::Release);
    }
}

#[derive(Default)]
struct Progress {
    scanned: usize,
    written: usize,
    batches: usize,
}

pub struct Reconciler {
    cache: Arc<dyn FavoriteCache>,
    archive: Arc<dyn CountArchive>,
    stream_batch_size: usize,
    batch_config: BatchConfig,
    run_timeout: Duration,
    in_flight: Arc<AtomicBool>,
    completed_passes: watch::Sender<u64>,
}

impl Reconciler {
    pub fn new(cache: Arc<dyn FavoriteCache>, archive: Arc<dyn CountArchive>, config: &FavoriteEngineConfig) -> Self {
        let (completed_passes, _) = watch::channel(0);
        Self {
            cache,
            archive,
            stream_batch_size: config.stream_batch_size,
            batch_config: BatchConfig::from_engine_config(config),
            run_timeout: config.sync_timeout(),
            in_flight: Arc::new(AtomicBool::new(false)),
            completed_passes,
        }
    }

    /// Claim the single-flight slot, `None` if a pass is already running.
    pub fn try_begin(&self) -> Option<PassGuard> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PassGuard { in_flight: self.in_flight.clone() })
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Ticks once per pass that ran to completion.
    pub fn subscribe_completions(&self) -> watch::Receiver<u64> {
        self.completed_passes.subscribe()
    }

    /// Run a pass unless one is already in flight (`None` = dropped).
    pub async fn run_exclusive(
        &self,
        trigger: Trigger,
        shutdown: &watch::Receiver<bool>,
    ) -> Option<Result<ReconcileReport, StorageError>> {
        let Some(guard) = self.try_begin() else {
            debug!(%trigger, "Reconciliation already running, trigger dropped");
            metrics::record_trigger_dropped(trigger.as_str());
            return None;
        };
        let result = self.run_pass(trigger, shutdown).await;
        drop(guard);
        Some(result)
    }

    /// Run one pass. Callers are expected to hold a [`PassGuard`].
    #[tracing::instrument(skip(self, shutdown))]
    pub async fn run_pass(
        &self,
        trigger: Trigger,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<ReconcileReport, StorageError> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let deadline = started + self.run_timeout;

        let pending_delta = match self.cache.take_pending_delta().await {
            Ok(delta) => delta,
            Err(e) => {
                warn!(%run_id, error = %e, "Could not read pending delta, continuing");
                0
            }
        };
        info!(%run_id, %trigger, pending_delta, "Reconciliation pass started");

        let mut progress = Progress::default();
        let result = self.drain(&mut progress, deadline, shutdown).await;
        let elapsed = started.elapsed();

        if !matches!(result, Ok(PassOutcome::Completed)) {
            self.restore_delta(run_id, pending_delta).await;
        }

        match result {
            Ok(outcome) => {
                metrics::record_reconcile_run(trigger.as_str(), outcome.as_str(), elapsed);
                if outcome == PassOutcome::Completed {
                    self.completed_passes.send_modify(|n| *n += 1);
                    info!(
                        %run_id,
                        scanned = progress.scanned,
                        written = progress.written,
                        batches = progress.batches,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Reconciliation pass completed"
                    );
                } else {
                    warn!(
                        %run_id,
                        ?outcome,
                        written = progress.written,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Reconciliation pass abandoned"
                    );
                }
                Ok(ReconcileReport {
                    run_id,
                    trigger,
                    outcome,
                    scanned: progress.scanned,
                    written: progress.written,
                    batches: progress.batches,
                    pending_delta,
                    elapsed,
                })
            }
            Err(e) => {
                metrics::record_reconcile_run(trigger.as_str(), "failed", elapsed);
                error!(
                    %run_id,
                    error = %e,
                    scanned = progress.scanned,
                    committed = progress.written,
                    "Reconciliation pass failed"
                );
                Err(e)
            }
        }
    }

    /// Hand the delta back so a threshold trigger can fire again.
    async fn restore_delta(&self, run_id: Uuid, delta: u64) {
        if delta == 0 {
            return;
        }
        if let Err(e) = self.cache.restore_pending_delta(delta).await {
            warn!(%run_id, delta, error = %e, "Could not restore pending delta");
        }
    }

    async fn drain(
        &self,
        progress: &mut Progress,
        deadline: Instant,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<PassOutcome, StorageError> {
        let mut counts = count_stream(self.cache.clone(), self.stream_batch_size);
        let mut batcher: RowBatcher<FavoriteCount> = RowBatcher::new(self.batch_config.clone());

        loop {
            if let Some(reason) = stop_reason(deadline, shutdown) {
                return Ok(PassOutcome::Abandoned(reason));
            }

            let ready = match counts.next().await {
                Some(Ok(count)) => {
                    progress.scanned += 1;
                    batcher.add(count)
                }
                Some(Err(e)) => return Err(e),
                None => {
                    if let Some(batch) = batcher.drain() {
                        if let Some(reason) = stop_reason(deadline, shutdown) {
                            return Ok(PassOutcome::Abandoned(reason));
                        }
                        self.write(batch, progress).await?;
                    }
                    return Ok(PassOutcome::Completed);
                }
            };

            if let Some(batch) = ready {
                if let Some(reason) = stop_reason(deadline, shutdown) {
                    return Ok(PassOutcome::Abandoned(reason));
                }
                self.write(batch, progress).await?;
            }
        }
    }

    async fn write(&self, batch: FlushBatch<FavoriteCount>, progress: &mut Progress) -> Result<(), StorageError> {
        let rows = batch.items.len();
        let written = self
            .archive
            .upsert_counts(&batch.items)
            .await
            .map_err(|e| StorageError::BatchWriteFailure {
                committed: progress.written,
                reason: e.to_string(),
            })?;

        progress.written += written;
        progress.batches += 1;
        metrics::record_reconcile_rows(written);
        debug!(
            batch = progress.batches,
            rows,
            bytes = batch.total_bytes,
            reason = ?batch.reason,
            "Batch committed"
        );
        Ok(())
    }
}

fn stop_reason(deadline: Instant, shutdown: &watch::Receiver<bool>) -> Option<StopReason> {
    if *shutdown.borrow() {
        Some(StopReason::Shutdown)
    } else if Instant::now() >= deadline {
        Some(StopReason::Deadline)
    } else {
        None
    }
}
