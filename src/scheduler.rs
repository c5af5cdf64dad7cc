// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconciliation scheduler.
//!
//! Two triggers feed one single-flight slot:
//!
//! - **interval**: fires every `sync_interval_mins`. Any pass that completes,
//!   whatever started it, restarts the interval.
//! - **threshold**: every `threshold_check_secs` the cache-resident pending
//!   delta is compared against `sync_threshold`.
//!
//! When both are due at once the threshold is served first. A trigger that
//! arrives while a pass is running is dropped, never queued. Failed passes are
//! logged and the schedule carries on.
//!
//! Shutdown stops new triggers immediately, then waits for the in-flight pass,
//! which stops after the batch it is writing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::FavoriteEngineConfig;
use crate::metrics;
use crate::reconcile::{Reconciler, Trigger};
use crate::storage::traits::FavoriteCache;

pub struct SyncScheduler {
    reconciler: Arc<Reconciler>,
    cache: Arc<dyn FavoriteCache>,
    interval: Option<Duration>,
    threshold: u64,
    threshold_check: Duration,
}

impl SyncScheduler {
    pub fn new(reconciler: Arc<Reconciler>, cache: Arc<dyn FavoriteCache>, config: &FavoriteEngineConfig) -> Self {
        Self {
            reconciler,
            cache,
            interval: config.sync_interval(),
            threshold: config.sync_threshold,
            threshold_check: config.threshold_check_interval(),
        }
    }

    /// Override the trigger periods (`None` disables the interval).
    #[must_use]
    pub fn with_periods(mut self, interval: Option<Duration>, threshold_check: Duration) -> Self {
        self.interval = interval;
        self.threshold_check = threshold_check;
        self
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = self.interval.map(periodic);
        let mut threshold_tick = (self.threshold > 0).then(|| periodic(self.threshold_check));
        let mut completions = self.reconciler.subscribe_completions();
        let mut in_flight: Option<JoinHandle<()>> = None;

        info!(
            interval_secs = self.interval.map(|d| d.as_secs()),
            threshold = self.threshold,
            "Sync scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tick(&mut threshold_tick) => {
                    let reached = tokio::select! {
                        reached = self.threshold_reached() => reached,
                        _ = stop_requested(&mut shutdown) => break,
                    };
                    if reached {
                        self.fire(Trigger::Threshold, &mut in_flight, &shutdown);
                    }
                }
                _ = tick(&mut interval) => {
                    self.fire(Trigger::Interval, &mut in_flight, &shutdown);
                }
                Ok(()) = completions.changed() => {
                    if let Some(interval) = interval.as_mut() {
                        interval.reset();
                    }
                }
            }
        }

        info!("Sync scheduler stopping, waiting for in-flight pass");
        if let Some(handle) = in_flight.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Reconciliation task ended abnormally");
            }
        }
        info!("Sync scheduler stopped");
    }

    async fn threshold_reached(&self) -> bool {
        match self.cache.pending_delta().await {
            Ok(delta) => {
                metrics::set_pending_delta(delta);
                delta >= self.threshold
            }
            Err(e) => {
                warn!(error = %e, "Pending delta check failed");
                false
            }
        }
    }

    fn fire(&self, trigger: Trigger, in_flight: &mut Option<JoinHandle<()>>, shutdown: &watch::Receiver<bool>) {
        let Some(guard) = self.reconciler.try_begin() else {
            debug!(%trigger, "Reconciliation already running, trigger dropped");
            metrics::record_trigger_dropped(trigger.as_str());
            return;
        };

        let reconciler = self.reconciler.clone();
        let shutdown = shutdown.clone();
        *in_flight = Some(tokio::spawn(async move {
            let _guard = guard;
            // run_pass logs its own failure
            let _ = reconciler.run_pass(trigger, &shutdown).await;
        }));
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Longest period handed to tokio; `Instant + period` must not overflow.
const MAX_PERIOD: Duration = Duration::from_secs(86_400 * 365 * 30);

fn periodic(period: Duration) -> Interval {
    let period = period.min(MAX_PERIOD);
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
