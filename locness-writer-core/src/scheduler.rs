//! Fixed-interval driver for [`run_cycle`].
//!
//! The scheduler owns the store, the publisher and the [`SyncState`]. Cycles run
//! strictly one after another: the shutdown future is only polled between cycles,
//! so an in-flight cycle always completes. Ticks missed during a slow cycle are
//! skipped rather than replayed back to back.
//!
//! On shutdown every bucket with unpublished changes is flushed and the
//! watermark checkpoint (if configured) is written one last time.
//!
//! The checkpoint is [`SyncState::checkpoint`], not the in-memory watermark: it
//! stays below any row that has not been published yet, so a restart fetches
//! those rows again. Nothing is written while the state is still rehydrating.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::contract::{Publisher, RecordStore};
use crate::synchronise::{publish_pending, run_cycle, CycleError, CycleReport, PublishSummary, SyncState};
use crate::watermark::WatermarkFile;

/// Source of "now" for each cycle.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// What a full `run` did, returned once the loop has stopped.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub cycles: usize,
    pub failed_cycles: usize,
    pub final_flush: PublishSummary,
    pub watermark: Option<DateTime<Utc>>,
}

pub struct Scheduler<S, P> {
    store: S,
    publisher: P,
    state: SyncState,
    interval: Duration,
    checkpoint: Option<WatermarkFile>,
    last_saved: Option<DateTime<Utc>>,
    clock: Clock,
}

impl<S, P> Scheduler<S, P>
where
    S: RecordStore,
    P: Publisher,
{
    pub fn new(store: S, publisher: P, state: SyncState, interval: Duration) -> Self {
        Self {
            store,
            publisher,
            state,
            interval,
            checkpoint: None,
            last_saved: None,
            clock: Arc::new(Utc::now),
        }
    }

    /// Persist the watermark to `file` after every advancing cycle and on shutdown.
    pub fn with_checkpoint(mut self, file: WatermarkFile) -> Self {
        self.checkpoint = Some(file);
        self
    }

    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    /// Writes [`SyncState::checkpoint`] when it differs from the last one saved.
    fn save_checkpoint(&mut self) {
        let Some(file) = &self.checkpoint else {
            return;
        };
        if self.state.is_rehydrating() {
            return;
        }
        let safe = self.state.checkpoint();
        if self.last_saved == Some(safe.current()) {
            return;
        }
        if safe.current() < self.state.watermark.current() {
            warn!(
                checkpoint = %safe.current(),
                watermark = %self.state.watermark.current(),
                "[CYCLE] Checkpoint held below unpublished rows"
            );
        }
        match file.save(&safe) {
            Ok(()) => self.last_saved = Some(safe.current()),
            Err(e) => error!(error = %e, "[CYCLE] Failed to persist watermark checkpoint"),
        }
    }

    /// Runs one cycle now, then checkpoints.
    pub async fn tick(&mut self) -> Result<CycleReport, CycleError> {
        let now = (self.clock)();
        let report = run_cycle(&mut self.state, &self.store, &self.publisher, now).await?;
        self.save_checkpoint();
        Ok(report)
    }

    /// Publishes every bucket that still has unpublished rows, then checkpoints.
    /// Buckets of an unfinished rehydration are left alone; the checkpoint on disk
    /// still covers them.
    pub async fn flush(&mut self) -> PublishSummary {
        let pending = self.state.writer.pending().len();
        if self.state.is_rehydrating() {
            warn!(pending, "[PUBLISH] Rehydration incomplete, skipping final flush");
            return PublishSummary::default();
        }
        info!(pending, "[PUBLISH] Final flush");
        let summary = publish_pending(&mut self.state.writer, &self.publisher).await;
        if !summary.is_clean() {
            warn!(
                failed = summary.failed.len(),
                "[PUBLISH] Some buckets could not be flushed before exit"
            );
        }
        self.save_checkpoint();
        summary
    }

    /// Ticks every `interval` until `shutdown` resolves, then flushes.
    pub async fn run<F>(mut self, shutdown: F) -> RunSummary
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(interval_secs = self.interval.as_secs(), "[CYCLE] Scheduler started");
        let mut summary = RunSummary::default();
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("[CYCLE] Shutdown requested");
                    break;
                }
                _ = ticker.tick() => {}
            }
            summary.cycles += 1;
            if self.tick().await.is_err() {
                summary.failed_cycles += 1;
            }
        }

        summary.final_flush = self.flush().await;
        summary.watermark = Some(self.state.watermark.current());
        info!(
            cycles = summary.cycles,
            failed_cycles = summary.failed_cycles,
            "[CYCLE] Scheduler stopped"
        );
        summary
    }
}
