//! Hourly batch writer.
//!
//! Records are grouped into [`HourBucket`]s keyed by the UTC hour of their own
//! timestamp. Exactly one bucket is *current* (the wall-clock hour of the last
//! rollover); older buckets are sealed. A sealed bucket inside the late window is
//! reopened when late data arrives for it. Once a published bucket falls out of
//! the window it is evicted, and later records for that hour are dropped. An hour
//! this writer never published always gets a fresh bucket, however old.
//!
//! Publishing always renders the bucket's full accumulated contents, so a
//! republish replaces the previous file. Buckets with unpublished changes are
//! *dirty*; dirty buckets are never evicted, which is what keeps a failed publish
//! retryable on the next cycle.

use chrono::{DateTime, Duration, DurationRound, Utc};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, warn};

use crate::csv::{self, RenderError};
use crate::record::{Record, RecordId};

/// An instant truncated to the hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketKey(DateTime<Utc>);

impl BucketKey {
    pub fn for_time(ts: DateTime<Utc>) -> Self {
        // Hour truncation on a UTC instant cannot overflow for dates chrono can represent.
        let floored = ts.duration_trunc(Duration::hours(1)).unwrap_or(ts);
        BucketKey(floored)
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.0
    }

    /// `YYYYMMDD_HH`
    pub fn label(&self) -> String {
        self.0.format("%Y%m%d_%H").to_string()
    }

    /// `{prefix}_{YYYYMMDD_HH}.csv`
    pub fn file_name(&self, prefix: &str) -> String {
        format!("{}_{}.csv", prefix, self.label())
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct RowKey {
    timestamp: DateTime<Utc>,
    id: RecordId,
}

/// One hour of records, ordered by timestamp then identity.
#[derive(Debug, Clone)]
pub struct HourBucket {
    key: BucketKey,
    rows: BTreeMap<RowKey, Record>,
    sealed: bool,
    dirty: bool,
    published_digest: Option<[u8; 32]>,
}

impl HourBucket {
    fn new(key: BucketKey) -> Self {
        Self {
            key,
            rows: BTreeMap::new(),
            sealed: false,
            dirty: false,
            published_digest: None,
        }
    }

    pub fn key(&self) -> BucketKey {
        self.key
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> + Clone {
        self.rows.values()
    }

    /// Returns `false` if the record was already present.
    fn insert(&mut self, record: Record) -> bool {
        let key = RowKey {
            timestamp: record.timestamp(),
            id: record.id().clone(),
        };
        if self.rows.contains_key(&key) {
            return false;
        }
        self.rows.insert(key, record);
        self.dirty = true;
        true
    }
}

/// Counters for one `ingest` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub accepted: usize,
    pub duplicates: usize,
    pub dropped_late: usize,
    /// Sealed buckets that received late rows.
    pub reopened: Vec<BucketKey>,
}

/// A bucket rendered and ready to publish.
#[derive(Debug, Clone)]
pub struct RenderedBucket {
    pub key: BucketKey,
    pub name: String,
    pub content: Vec<u8>,
    pub rows: usize,
    digest: [u8; 32],
}

impl RenderedBucket {
    pub fn digest_hex(&self) -> String {
        self.digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Owns every bucket that is open, inside the late window, or still unpublished.
#[derive(Debug, Clone)]
pub struct BatchWriter {
    prefix: String,
    timestamp_field: String,
    late_window: Duration,
    current: Option<BucketKey>,
    buckets: BTreeMap<BucketKey, HourBucket>,
    /// Published buckets dropped from memory; their files cannot be rebuilt.
    evicted: BTreeSet<BucketKey>,
}

impl BatchWriter {
    pub fn new(
        prefix: impl Into<String>,
        timestamp_field: impl Into<String>,
        late_window: Duration,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            timestamp_field: timestamp_field.into(),
            late_window,
            current: None,
            buckets: BTreeMap::new(),
            evicted: BTreeSet::new(),
        }
    }

    pub fn current(&self) -> Option<BucketKey> {
        self.current
    }

    pub fn bucket(&self, key: BucketKey) -> Option<&HourBucket> {
        self.buckets.get(&key)
    }

    pub fn buckets(&self) -> impl Iterator<Item = &HourBucket> {
        self.buckets.values()
    }

    /// Oldest key that still accepts late rows.
    fn late_cutoff(&self) -> Option<BucketKey> {
        self.current
            .map(|c| BucketKey::for_time(c.start() - self.late_window))
    }

    /// Opens the bucket for `now`'s hour, seals older ones and evicts clean sealed
    /// buckets that fell out of the late window.
    pub fn roll_over(&mut self, now: DateTime<Utc>) {
        let key = BucketKey::for_time(now);
        if self.current == Some(key) {
            return;
        }
        if let Some(prev) = self.current {
            if key < prev {
                // Wall clock went backwards; keep the newer bucket open.
                warn!(current = %prev, clock = %key, "Clock moved backwards, keeping current bucket");
                return;
            }
            info!(from = %prev, to = %key, "[BATCH] Hour rollover");
        }
        self.current = Some(key);
        self.buckets.entry(key).or_insert_with(|| HourBucket::new(key));
        for bucket in self.buckets.values_mut() {
            if bucket.key < key && !bucket.sealed {
                bucket.sealed = true;
                debug!(bucket = %bucket.key, rows = bucket.len(), dirty = bucket.dirty, "Sealed bucket");
            }
        }

        let cutoff = self.late_cutoff();
        let evicted = &mut self.evicted;
        self.buckets.retain(|k, b| {
            let keep = b.dirty || cutoff.map_or(true, |c| *k >= c);
            if !keep && b.published_digest.is_some() {
                debug!(bucket = %k, "Evicted published bucket outside late window");
                evicted.insert(*k);
            }
            keep
        });
    }

    pub fn is_evicted(&self, key: BucketKey) -> bool {
        self.evicted.contains(&key)
    }

    /// Rolls over to `now`'s hour, then buckets `records` by their own timestamps.
    pub fn ingest(&mut self, records: Vec<Record>, now: DateTime<Utc>) -> IngestReport {
        self.roll_over(now);
        let mut report = IngestReport::default();
        let current = self.current;

        for record in records {
            let key = BucketKey::for_time(record.timestamp());
            let existing = self.buckets.contains_key(&key);
            if !existing && self.evicted.contains(&key) {
                warn!(
                    bucket = %key,
                    record_id = %record.id(),
                    timestamp = %record.timestamp(),
                    "[BATCH] Dropping record for a published bucket outside the late window"
                );
                report.dropped_late += 1;
                continue;
            }
            let bucket = self.buckets.entry(key).or_insert_with(|| {
                let mut fresh = HourBucket::new(key);
                fresh.sealed = current.is_some_and(|c| key < c);
                fresh
            });
            if existing && bucket.sealed && !bucket.dirty && !report.reopened.contains(&key) {
                report.reopened.push(key);
            }
            if bucket.insert(record) {
                report.accepted += 1;
            } else {
                report.duplicates += 1;
            }
        }
        // A sealed bucket counts as reopened only if it actually gained rows.
        report
            .reopened
            .retain(|k| self.buckets.get(k).is_some_and(|b| b.dirty));
        for key in &report.reopened {
            info!(bucket = %key, "[BATCH] Late rows reopened sealed bucket");
        }
        report
    }

    /// Keys of buckets with unpublished changes, oldest first.
    pub fn pending(&self) -> Vec<BucketKey> {
        self.buckets
            .values()
            .filter(|b| b.dirty)
            .map(|b| b.key)
            .collect()
    }

    /// Timestamp of the oldest row held in any bucket with unpublished changes.
    pub fn oldest_pending(&self) -> Option<DateTime<Utc>> {
        self.buckets
            .values()
            .filter(|b| b.dirty)
            .filter_map(|b| b.rows.keys().next().map(|k| k.timestamp))
            .min()
    }

    pub fn render(&self, key: BucketKey) -> Result<RenderedBucket, RenderError> {
        let bucket = self.buckets.get(&key).ok_or(RenderError::EmptyBatch)?;
        let content = csv::render(bucket.records(), &self.timestamp_field)?;
        let digest: [u8; 32] = Sha256::digest(&content).into();
        Ok(RenderedBucket {
            key,
            name: key.file_name(&self.prefix),
            rows: bucket.len(),
            content,
            digest,
        })
    }

    /// Whether `rendered` is byte-identical to the last successful publish.
    pub fn is_unchanged(&self, rendered: &RenderedBucket) -> bool {
        self.buckets
            .get(&rendered.key)
            .and_then(|b| b.published_digest)
            .is_some_and(|d| d == rendered.digest)
    }

    pub fn mark_published(&mut self, rendered: &RenderedBucket) {
        if let Some(bucket) = self.buckets.get_mut(&rendered.key) {
            bucket.published_digest = Some(rendered.digest);
            // Rows may have been added since rendering only if the caller interleaved
            // ingest and publish; compare counts to stay dirty in that case.
            bucket.dirty = bucket.len() != rendered.rows;
        }
    }
}
