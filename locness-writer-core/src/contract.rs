//! # contract: collaborator interfaces for the sync pipeline
//!
//! The pipeline talks to exactly two external systems:
//!
//! - a **record store** it reads from ([`RecordStore`]): paged range queries when the
//!   store has a suitable key/index, otherwise paged full scans;
//! - a **publish target** it writes to ([`Publisher`]): create-or-replace of a named file.
//!
//! Both traits are async and annotated for `mockall` so the cycle logic can be driven
//! by deterministic mocks. Real implementations (DynamoDB, Google Drive) live in the
//! `locness-writer` crate; this crate never links a vendor SDK.
//!
//! ## Errors
//! Store errors are classified by the implementor, because only it knows what a
//! throttling response or a missing index looks like:
//! - [`StoreError::Transient`] is retried with backoff by the fetcher;
//! - [`StoreError::IndexUnavailable`] makes the fetcher fall back to scanning;
//! - everything else ends the current cycle's fetch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use mockall::automock;

use crate::record::{FieldValue, RawRecord};

/// Half-open time range `(after, until]` used for incremental reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Exclusive lower bound (the watermark).
    pub after: DateTime<Utc>,
    /// Inclusive upper bound (cycle start time).
    pub until: DateTime<Utc>,
}

impl TimeRange {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts > self.after && ts <= self.until
    }
}

/// Opaque resume position handed out by a store with each non-final page.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PageToken(pub BTreeMap<String, FieldValue>);

/// One page of raw items.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<RawRecord>,
    /// Present when the store has more items after this page.
    pub next: Option<PageToken>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Network blip, throttling, timeout. Worth retrying.
    #[error("transient store error during {operation}: {message}")]
    Transient {
        operation: &'static str,
        message: String,
    },
    /// The indexed range query is not possible against this store.
    #[error("indexed query unavailable: {0}")]
    IndexUnavailable(String),
    /// The store answered with something that cannot be interpreted.
    #[error("malformed store response during {operation}: {message}")]
    Malformed {
        operation: &'static str,
        message: String,
    },
    #[error("store error during {operation}: {message}")]
    Other {
        operation: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient { .. })
    }
}

/// Read-only access to the record store.
///
/// Implementors must not filter scan pages: the fetcher applies the time filter
/// client-side so that server-side string comparison quirks cannot drop records.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch one page of items whose timestamp lies in `range`, using the store's
    /// key or index. Returns [`StoreError::IndexUnavailable`] if that is not possible.
    async fn query_page(
        &self,
        range: &TimeRange,
        start: Option<PageToken>,
        limit: usize,
    ) -> Result<Page, StoreError>;

    /// Fetch one page of a full collection scan, in store-defined order.
    async fn scan_page(&self, start: Option<PageToken>, limit: usize)
        -> Result<Page, StoreError>;
}

#[async_trait]
impl<T: RecordStore + ?Sized> RecordStore for Arc<T> {
    async fn query_page(
        &self,
        range: &TimeRange,
        start: Option<PageToken>,
        limit: usize,
    ) -> Result<Page, StoreError> {
        (**self).query_page(range, start, limit).await
    }

    async fn scan_page(&self, start: Option<PageToken>, limit: usize) -> Result<Page, StoreError> {
        (**self).scan_page(start, limit).await
    }
}

/// Result of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Identifier the target assigned to the file.
    pub file_id: String,
    /// `true` when the file did not exist before this publish.
    pub created: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("publish target unreachable: {0}")]
    Unreachable(String),
    #[error("publish target rejected '{name}': {message}")]
    Rejected { name: String, message: String },
    #[error("publish authentication failed: {0}")]
    Auth(String),
}

/// Write-only access to the publish target. Publishing a name that already exists
/// replaces the previous content entirely.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, name: &str, content: &[u8]) -> Result<PublishReceipt, PublishError>;
}

#[async_trait]
impl<T: Publisher + ?Sized> Publisher for Arc<T> {
    async fn publish(&self, name: &str, content: &[u8]) -> Result<PublishReceipt, PublishError> {
        (**self).publish(name, content).await
    }
}
