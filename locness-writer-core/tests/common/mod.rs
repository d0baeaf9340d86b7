//! In-memory store and publisher for multi-cycle scenarios.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use locness_writer_core::contract::{
    Page, PageToken, PublishError, PublishReceipt, Publisher, RecordStore, StoreError, TimeRange,
};
use locness_writer_core::fetch::FetchSettings;
use locness_writer_core::record::{parse_timestamp, FieldValue, RawRecord, RecordSchema};
use locness_writer_core::retry::RetryPolicy;
use locness_writer_core::synchronise::SyncSettings;

pub fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
}

/// Item shaped like a row of the sensor table.
pub fn item(ts: DateTime<Utc>, value: impl ToString) -> RawRecord {
    [
        ("data".to_string(), FieldValue::text("sensor")),
        (
            "datetime_utc".to_string(),
            FieldValue::text(ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()),
        ),
        ("value".to_string(), FieldValue::number(value.to_string())),
    ]
    .into_iter()
    .collect()
}

/// `count` items `step` apart, starting at `start`.
pub fn items_from(start: DateTime<Utc>, count: usize, step: Duration) -> Vec<RawRecord> {
    (0..count)
        .map(|i| item(start + step * i as i32, i))
        .collect()
}

pub fn settings() -> SyncSettings {
    SyncSettings {
        schema: RecordSchema {
            timestamp_field: "datetime_utc".to_string(),
            key_fields: vec!["data".to_string(), "datetime_utc".to_string()],
        },
        fetch: FetchSettings {
            page_size: 1000,
            max_pages: 10,
            reprobe_interval_secs: 3600,
            retry: RetryPolicy::fixed(2, std::time::Duration::from_millis(1)),
        },
        prefix: "locness_data".to_string(),
        late_window_hours: 2,
    }
}

fn offset_token(offset: usize) -> PageToken {
    PageToken(
        [("offset".to_string(), FieldValue::number(offset))]
            .into_iter()
            .collect(),
    )
}

fn token_offset(token: Option<PageToken>) -> usize {
    token
        .and_then(|t| t.0.get("offset").map(|v| v.as_cell()))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Vec-backed store. Scans return items in insertion order; queries return the
/// matching items sorted by timestamp.
#[derive(Default)]
pub struct MemoryStore {
    items: Mutex<Vec<RawRecord>>,
    indexed: bool,
    down: AtomicBool,
    pub scan_calls: AtomicUsize,
    pub query_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn scan_only() -> Self {
        Self::default()
    }

    pub fn indexed() -> Self {
        Self {
            indexed: true,
            ..Self::default()
        }
    }

    pub fn insert(&self, items: impl IntoIterator<Item = RawRecord>) {
        self.items.lock().unwrap().extend(items);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check_up(&self, operation: &'static str) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Transient {
                operation,
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    fn page(items: Vec<RawRecord>, offset: usize, limit: usize) -> Page {
        let end = (offset + limit).min(items.len());
        let slice = items.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        Page {
            items: slice,
            next: (end < items.len()).then(|| offset_token(end)),
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn query_page(
        &self,
        range: &TimeRange,
        start: Option<PageToken>,
        limit: usize,
    ) -> Result<Page, StoreError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        if !self.indexed {
            return Err(StoreError::IndexUnavailable("no sort key".to_string()));
        }
        self.check_up("query")?;
        let mut matching: Vec<(DateTime<Utc>, RawRecord)> = self
            .items
            .lock()
            .unwrap()
            .iter()
            .filter_map(|i| {
                let ts = i.get("datetime_utc").and_then(parse_timestamp)?;
                range.contains(ts).then(|| (ts, i.clone()))
            })
            .collect();
        matching.sort_by(|a, b| a.0.cmp(&b.0));
        let items = matching.into_iter().map(|(_, i)| i).collect();
        Ok(Self::page(items, token_offset(start), limit))
    }

    async fn scan_page(&self, start: Option<PageToken>, limit: usize) -> Result<Page, StoreError> {
        self.scan_calls.fetch_add(1, Ordering::SeqCst);
        self.check_up("scan")?;
        let items = self.items.lock().unwrap().clone();
        Ok(Self::page(items, token_offset(start), limit))
    }
}

/// Publisher that keeps the latest content per name, like a replace-by-name target.
#[derive(Default)]
pub struct RecordingPublisher {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    failing: AtomicBool,
    pub uploads: AtomicUsize,
}

impl RecordingPublisher {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn names(&self) -> Vec<String> {
        self.files.lock().unwrap().keys().cloned().collect()
    }

    pub fn content(&self, name: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(name)
            .map(|c| String::from_utf8(c.clone()).unwrap())
    }

    /// Data rows (header excluded) of the file `name`.
    pub fn rows(&self, name: &str) -> Vec<String> {
        self.content(name)
            .map(|c| c.lines().skip(1).map(str::to_string).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, name: &str, content: &[u8]) -> Result<PublishReceipt, PublishError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError::Unreachable("drive offline".to_string()));
        }
        self.uploads.fetch_add(1, Ordering::SeqCst);
        let previous = self
            .files
            .lock()
            .unwrap()
            .insert(name.to_string(), content.to_vec());
        Ok(PublishReceipt {
            file_id: format!("id-{name}"),
            created: previous.is_none(),
        })
    }
}
