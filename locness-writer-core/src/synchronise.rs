//! One fetch → ingest → publish cycle.
//!
//! All mutable pipeline state lives in [`SyncState`], which the caller owns and
//! passes into every [`run_cycle`] call. Nothing here is global, so a cycle can be
//! driven by tests with mocks and a fixed clock.
//!
//! # Cycle contract
//! 1. Roll the batch writer over to the current hour.
//! 2. Fetch everything after the watermark. On failure: log, leave the watermark
//!    untouched, write nothing, return [`CycleError`].
//!    A fresh [`SyncState`] first rehydrates: its opening fetch starts at the top
//!    of the watermark's hour minus the late window, so buckets that may already
//!    have files are rebuilt in full. Nothing is published until that pass is
//!    complete.
//! 3. Ingest the records into hour buckets (de-duplicated).
//! 4. Replace-publish every bucket with unpublished changes. A failed publish keeps
//!    the bucket pending for the next cycle and does not fail the cycle.
//! 5. Advance the watermark to the newest timestamp fetched.

use chrono::{DateTime, Duration, Utc};
use std::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::batch::{BatchWriter, BucketKey};
use crate::contract::{Publisher, RecordStore};
use crate::fetch::{FetchError, FetchSettings, FetchStrategy, Fetcher};
use crate::record::RecordSchema;
use crate::watermark::Watermark;

/// Static settings of the pipeline.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub schema: RecordSchema,
    pub fetch: FetchSettings,
    /// File name prefix, e.g. `locness_data`.
    pub prefix: String,
    /// How many hours before the current one still accept late rows.
    pub late_window_hours: i64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            schema: RecordSchema::default(),
            fetch: FetchSettings::default(),
            prefix: "locness_data".to_string(),
            late_window_hours: 2,
        }
    }
}

/// Everything a cycle reads and updates.
#[derive(Debug, Clone)]
pub struct SyncState {
    pub watermark: Watermark,
    pub fetcher: Fetcher,
    pub writer: BatchWriter,
    /// Lower bound of the rehydration pass, cleared once that pass completes.
    rehydrate_from: Option<DateTime<Utc>>,
}

/// Exclusive lower bound that re-reads every bucket a restart may have to
/// republish: the start of `watermark`'s hour minus `late_window`.
pub fn rehydration_floor(watermark: DateTime<Utc>, late_window: Duration) -> DateTime<Utc> {
    BucketKey::for_time(watermark).start() - late_window - Duration::nanoseconds(1)
}

impl SyncState {
    pub fn new(settings: &SyncSettings, watermark: Watermark) -> Self {
        let late_window = Duration::hours(settings.late_window_hours.max(0));
        Self {
            rehydrate_from: Some(rehydration_floor(watermark.current(), late_window)),
            watermark,
            fetcher: Fetcher::new(settings.schema.clone(), settings.fetch.clone()),
            writer: BatchWriter::new(
                settings.prefix.clone(),
                settings.schema.timestamp_field.clone(),
                late_window,
            ),
        }
    }

    /// Still rebuilding buckets after start; publishing is held back.
    pub fn is_rehydrating(&self) -> bool {
        self.rehydrate_from.is_some()
    }

    /// Watermark that is safe to persist: never past a row that is not yet
    /// published.
    pub fn checkpoint(&self) -> Watermark {
        let current = self.watermark.current();
        match self.writer.oldest_pending() {
            Some(oldest) if oldest <= current => Watermark::new(oldest - Duration::nanoseconds(1)),
            _ => Watermark::new(current),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedFile {
    pub bucket: BucketKey,
    pub name: String,
    pub file_id: String,
    pub rows: usize,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedPublish {
    pub bucket: BucketKey,
    pub name: String,
    pub error: String,
}

/// Outcome of publishing all pending buckets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub published: Vec<PublishedFile>,
    /// Buckets whose rendered content matched the last publish.
    pub unchanged: Vec<BucketKey>,
    pub failed: Vec<FailedPublish>,
}

impl PublishSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub strategy: FetchStrategy,
    pub fetched: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub dropped_late: usize,
    pub malformed: usize,
    /// `false` when the fetch hit its page cap.
    pub fetch_complete: bool,
    /// Publishing was held back because the rehydration pass is not complete.
    pub publish_deferred: bool,
    pub publish: PublishSummary,
    pub watermark_before: DateTime<Utc>,
    pub watermark_after: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl CycleReport {
    pub fn watermark_advanced(&self) -> bool {
        self.watermark_after > self.watermark_before
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("cycle {cycle_id} aborted: {source}")]
    Fetch {
        cycle_id: Uuid,
        #[source]
        source: FetchError,
    },
}

/// Renders and replace-publishes every bucket with unpublished changes.
pub async fn publish_pending<P>(writer: &mut BatchWriter, publisher: &P) -> PublishSummary
where
    P: Publisher + ?Sized,
{
    let mut summary = PublishSummary::default();
    for key in writer.pending() {
        let rendered = match writer.render(key) {
            Ok(r) => r,
            Err(e) => {
                error!(bucket = %key, error = %e, "[PUBLISH] Failed to render bucket");
                summary.failed.push(FailedPublish {
                    bucket: key,
                    name: key.to_string(),
                    error: e.to_string(),
                });
                continue;
            }
        };
        if writer.is_unchanged(&rendered) {
            info!(file = %rendered.name, "[PUBLISH] Content unchanged, skipping upload");
            writer.mark_published(&rendered);
            summary.unchanged.push(key);
            continue;
        }

        let started = Instant::now();
        match publisher.publish(&rendered.name, &rendered.content).await {
            Ok(receipt) => {
                info!(
                    file = %rendered.name,
                    file_id = %receipt.file_id,
                    created = receipt.created,
                    rows = rendered.rows,
                    bytes = rendered.content.len(),
                    sha256 = %rendered.digest_hex(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "[PUBLISH] Replaced bucket file"
                );
                writer.mark_published(&rendered);
                summary.published.push(PublishedFile {
                    bucket: key,
                    name: rendered.name.clone(),
                    file_id: receipt.file_id,
                    rows: rendered.rows,
                    created: receipt.created,
                });
            }
            Err(e) => {
                error!(
                    file = %rendered.name,
                    rows = rendered.rows,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "[PUBLISH] Publish failed, bucket kept for retry"
                );
                summary.failed.push(FailedPublish {
                    bucket: key,
                    name: rendered.name.clone(),
                    error: e.to_string(),
                });
            }
        }
    }
    summary
}

/// Runs one full cycle against `store` and `publisher` at wall-clock time `now`.
pub async fn run_cycle<S, P>(
    state: &mut SyncState,
    store: &S,
    publisher: &P,
    now: DateTime<Utc>,
) -> Result<CycleReport, CycleError>
where
    S: RecordStore + ?Sized,
    P: Publisher + ?Sized,
{
    let cycle_id = Uuid::new_v4();
    let span = info_span!("cycle", %cycle_id);
    async move {
        let started = Instant::now();
        let watermark_before = state.watermark.current();
        info!(watermark = %watermark_before, now = %now, "[CYCLE] Starting");

        state.writer.roll_over(now);

        let since = state.rehydrate_from.unwrap_or(watermark_before);
        let outcome = match state.fetcher.fetch_since(store, since, now).await {
            Ok(o) => o,
            Err(source) => {
                error!(
                    watermark = %watermark_before,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %source,
                    "[CYCLE] Fetch failed; watermark unchanged, nothing written"
                );
                return Err(CycleError::Fetch { cycle_id, source });
            }
        };

        let max_ts = outcome.max_timestamp();
        let fetched = outcome.records.len();
        let outcome_complete = outcome.complete;
        let ingest = state.writer.ingest(outcome.records, now);
        if ingest.dropped_late > 0 {
            warn!(dropped = ingest.dropped_late, "[CYCLE] Late records dropped");
        }

        if state.rehydrate_from.is_some() && outcome_complete {
            info!(
                buckets = state.writer.pending().len(),
                "[CYCLE] Rehydration complete, buckets rebuilt from the store"
            );
            state.rehydrate_from = None;
        }
        let publish_deferred = state.is_rehydrating();
        let publish = if publish_deferred {
            info!(
                pending = state.writer.pending().len(),
                "[PUBLISH] Rehydration pass incomplete, publishing deferred"
            );
            PublishSummary::default()
        } else {
            publish_pending(&mut state.writer, publisher).await
        };

        if let Some(ts) = max_ts {
            state.watermark.advance(ts);
        }
        let watermark_after = state.watermark.current();

        let report = CycleReport {
            cycle_id,
            strategy: outcome.strategy,
            fetched,
            accepted: ingest.accepted,
            duplicates: ingest.duplicates,
            dropped_late: ingest.dropped_late,
            malformed: outcome.malformed,
            fetch_complete: outcome_complete,
            publish_deferred,
            publish,
            watermark_before,
            watermark_after,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            fetched = report.fetched,
            accepted = report.accepted,
            duplicates = report.duplicates,
            published = report.publish.published.len(),
            failed = report.publish.failed.len(),
            watermark = %watermark_after,
            elapsed_ms = report.elapsed_ms,
            "[CYCLE] Finished"
        );
        Ok(report)
    }
    .instrument(span)
    .await
}
