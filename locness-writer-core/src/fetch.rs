//! Incremental fetcher.
//!
//! Reads every record with a timestamp in `(watermark, now]` from a [`RecordStore`].
//!
//! # Strategy
//! Two ways to read, resolved once and cached in [`FetchStrategy`]:
//! - `Indexed`: the store's range query. Tried first; if the store reports
//!   [`StoreError::IndexUnavailable`] the fetcher switches to scanning on the spot.
//! - `Scan`: full collection scan with the time filter applied here, client-side.
//!
//! A cached `Scan` decision is re-probed every `reprobe_interval` so a table that
//! gains a suitable key later is picked up without a restart.
//!
//! # Bounded passes
//! A pass reads at most `max_pages` pages of `page_size` items. When the cap is
//! hit the outcome is partial (`complete == false`) and the pass is parked as a
//! continuation: the next call resumes the same range from the saved page token
//! instead of starting over. Store order is never assumed.
//!
//! # Failures
//! Every page read goes through [`with_retry`]. A terminal error aborts the pass
//! and is returned as [`FetchError`]; a parked continuation survives the failure.
//! If the index disappears partway through a pass, the pass is parked again as a
//! scan over the same range, started from the beginning.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::contract::{Page, PageToken, RecordStore, StoreError, TimeRange};
use crate::record::{Record, RecordSchema};
use crate::retry::{with_retry, RetryPolicy};

/// Page limits and probing cadence.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub page_size: usize,
    pub max_pages: usize,
    pub reprobe_interval_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            page_size: 1000,
            max_pages: 10,
            reprobe_interval_secs: 3600,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStrategy {
    Indexed,
    Scan,
}

impl FetchStrategy {
    fn operation(&self) -> &'static str {
        match self {
            FetchStrategy::Indexed => "query",
            FetchStrategy::Scan => "scan",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Resolved {
    strategy: FetchStrategy,
    at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Continuation {
    strategy: FetchStrategy,
    range: TimeRange,
    /// `None` restarts the range from its first page.
    token: Option<PageToken>,
}

/// Records read by one pass plus bookkeeping for logs and reports.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub records: Vec<Record>,
    pub strategy: FetchStrategy,
    pub range: TimeRange,
    pub pages: usize,
    /// Raw items returned by the store, before filtering.
    pub scanned: usize,
    /// Raw items without a usable timestamp.
    pub malformed: usize,
    /// `false` when the page cap stopped the pass early.
    pub complete: bool,
    /// `true` when this pass resumed a parked continuation.
    pub resumed: bool,
}

impl FetchOutcome {
    fn empty(strategy: FetchStrategy, range: TimeRange) -> Self {
        Self {
            records: Vec::new(),
            strategy,
            range,
            pages: 0,
            scanned: 0,
            malformed: 0,
            complete: true,
            resumed: false,
        }
    }

    /// Newest timestamp among the records. Computed over the whole set since scan
    /// order is store-defined.
    pub fn max_timestamp(&self) -> Option<DateTime<Utc>> {
        self.records.iter().map(Record::timestamp).max()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("fetch via {strategy:?} failed after {pages_read} page(s): {source}")]
pub struct FetchError {
    pub strategy: FetchStrategy,
    pub pages_read: usize,
    #[source]
    pub source: StoreError,
}

/// Stateful fetcher: caches the resolved strategy and any parked continuation.
#[derive(Debug, Clone)]
pub struct Fetcher {
    schema: RecordSchema,
    settings: FetchSettings,
    resolved: Option<Resolved>,
    continuation: Option<Continuation>,
}

impl Fetcher {
    pub fn new(schema: RecordSchema, settings: FetchSettings) -> Self {
        Self {
            schema,
            settings,
            resolved: None,
            continuation: None,
        }
    }

    /// Strategy currently cached, if any pass has resolved one.
    pub fn strategy(&self) -> Option<FetchStrategy> {
        self.resolved.map(|r| r.strategy)
    }

    pub fn has_continuation(&self) -> bool {
        self.continuation.is_some()
    }

    fn choose_strategy(&self, now: DateTime<Utc>) -> FetchStrategy {
        let reprobe = Duration::seconds(self.settings.reprobe_interval_secs as i64);
        match self.resolved {
            None => FetchStrategy::Indexed,
            Some(Resolved {
                strategy: FetchStrategy::Scan,
                at,
            }) if now - at >= reprobe => {
                debug!("[FETCH] Re-probing indexed query");
                FetchStrategy::Indexed
            }
            Some(r) => r.strategy,
        }
    }

    async fn read_page<S>(
        &self,
        store: &S,
        strategy: FetchStrategy,
        range: TimeRange,
        token: Option<PageToken>,
    ) -> Result<Page, StoreError>
    where
        S: RecordStore + ?Sized,
    {
        let limit = self.settings.page_size.max(1);
        let policy = &self.settings.retry;
        match strategy {
            FetchStrategy::Indexed => {
                with_retry(policy, "query", move || {
                    let range = range;
                    let token = token.clone();
                    async move { store.query_page(&range, token, limit).await }
                })
                .await
            }
            FetchStrategy::Scan => {
                with_retry(policy, "scan", move || store.scan_page(token.clone(), limit)).await
            }
        }
    }

    /// Reads the next pass: a parked continuation if there is one, otherwise
    /// everything in `(since, now]`.
    pub async fn fetch_since<S>(
        &mut self,
        store: &S,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<FetchOutcome, FetchError>
    where
        S: RecordStore + ?Sized,
    {
        let started = Instant::now();
        let parked = self.continuation.take();
        let resumed = parked.is_some();
        let (mut strategy, range, mut token) = match &parked {
            Some(c) => {
                info!(
                    strategy = ?c.strategy,
                    after = %c.range.after,
                    until = %c.range.until,
                    "[FETCH] Resuming capped pass"
                );
                (c.strategy, c.range, c.token.clone())
            }
            None => (
                self.choose_strategy(now),
                TimeRange {
                    after: since,
                    until: now,
                },
                None,
            ),
        };

        if !resumed && range.until <= range.after {
            debug!(after = %range.after, until = %range.until, "[FETCH] Empty range, nothing to read");
            return Ok(FetchOutcome::empty(strategy, range));
        }

        let max_pages = self.settings.max_pages.max(1);
        let mut outcome = FetchOutcome::empty(strategy, range);
        outcome.resumed = resumed;

        while outcome.pages < max_pages {
            let read = self.read_page(store, strategy, range, token.clone()).await;
            let page = match read {
                Ok(page) => page,
                Err(StoreError::IndexUnavailable(reason)) if strategy == FetchStrategy::Indexed => {
                    let first_probe = self.resolved.is_none();
                    self.resolved = Some(Resolved {
                        strategy: FetchStrategy::Scan,
                        at: now,
                    });
                    if resumed || outcome.pages > 0 {
                        // A scan cannot resume a query token; rescan the whole range.
                        warn!(reason = %reason, "[FETCH] Index vanished mid-pass, range parked for a scan");
                        self.continuation = Some(Continuation {
                            strategy: FetchStrategy::Scan,
                            range,
                            token: None,
                        });
                        return Err(FetchError {
                            strategy,
                            pages_read: outcome.pages,
                            source: StoreError::IndexUnavailable(reason),
                        });
                    }
                    if first_probe {
                        info!(reason = %reason, "[FETCH] Indexed query unavailable, falling back to scan");
                    } else {
                        debug!(reason = %reason, "[FETCH] Indexed query still unavailable");
                    }
                    strategy = FetchStrategy::Scan;
                    outcome.strategy = strategy;
                    continue;
                }
                Err(source) => {
                    warn!(
                        strategy = ?strategy,
                        pages_read = outcome.pages,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        error = %source,
                        "[FETCH] Pass failed"
                    );
                    self.continuation = parked;
                    return Err(FetchError {
                        strategy,
                        pages_read: outcome.pages,
                        source,
                    });
                }
            };

            if strategy == FetchStrategy::Indexed
                && self.resolved.map(|r| r.strategy) != Some(FetchStrategy::Indexed)
            {
                info!("[FETCH] Using indexed range query");
                self.resolved = Some(Resolved {
                    strategy,
                    at: now,
                });
            }

            outcome.pages += 1;
            outcome.scanned += page.items.len();
            for raw in page.items {
                match Record::from_raw(raw, &self.schema) {
                    Ok(record) if range.contains(record.timestamp()) => outcome.records.push(record),
                    Ok(_) => {}
                    Err(e) => {
                        outcome.malformed += 1;
                        warn!(error = %e, "[FETCH] Skipping item without usable timestamp");
                    }
                }
            }

            token = page.next;
            if token.is_none() {
                break;
            }
        }

        match token {
            Some(token) => {
                outcome.complete = false;
                warn!(
                    pages = outcome.pages,
                    page_size = self.settings.page_size,
                    matched = outcome.records.len(),
                    "[FETCH] Page cap reached, more data may remain; resuming next cycle"
                );
                self.continuation = Some(Continuation {
                    strategy,
                    range,
                    token: Some(token),
                });
            }
            None => outcome.complete = true,
        }

        info!(
            strategy = ?outcome.strategy,
            op = outcome.strategy.operation(),
            pages = outcome.pages,
            scanned = outcome.scanned,
            matched = outcome.records.len(),
            malformed = outcome.malformed,
            complete = outcome.complete,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "[FETCH] Pass finished"
        );
        Ok(outcome)
    }
}
