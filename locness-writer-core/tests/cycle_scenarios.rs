mod common;

use chrono::Duration;
use common::{at, item, items_from, settings, MemoryStore, RecordingPublisher};
use std::sync::atomic::{AtomicUsize, Ordering};

use locness_writer_core::batch::BucketKey;
use locness_writer_core::contract::{
    MockPublisher, MockRecordStore, Page, PageToken, PublishReceipt, StoreError, TimeRange,
};
use locness_writer_core::fetch::FetchStrategy;
use locness_writer_core::record::FieldValue;
use locness_writer_core::synchronise::{run_cycle, CycleError, SyncState};
use locness_writer_core::watermark::Watermark;

fn state_from(h: u32, m: u32) -> SyncState {
    SyncState::new(&settings(), Watermark::new(at(h, m, 0)))
}

const HOUR_07: &str = "locness_data_20240501_07.csv";
const HOUR_08: &str = "locness_data_20240501_08.csv";
const HOUR_09: &str = "locness_data_20240501_09.csv";
const HOUR_10: &str = "locness_data_20240501_10.csv";
const HOUR_11: &str = "locness_data_20240501_11.csv";

#[tokio::test]
async fn capped_fetch_takes_two_cycles_for_15000_records() {
    let store = MemoryStore::scan_only();
    let publisher = RecordingPublisher::default();
    store.insert(items_from(
        at(10, 0, 0) + Duration::milliseconds(200),
        15_000,
        Duration::milliseconds(200),
    ));
    let mut state = state_from(9, 59);

    let first = run_cycle(&mut state, &store, &publisher, at(10, 55, 0))
        .await
        .unwrap();
    assert_eq!(first.fetched, 10_000);
    assert!(!first.fetch_complete);
    assert!(first.publish_deferred);
    assert_eq!(state.watermark.current(), at(10, 33, 20));
    // A partial first pass must not overwrite a file that may hold more rows.
    assert_eq!(publisher.uploads(), 0);

    let second = run_cycle(&mut state, &store, &publisher, at(10, 56, 0))
        .await
        .unwrap();
    assert_eq!(second.fetched, 5_000);
    assert!(second.fetch_complete);
    assert!(!second.publish_deferred);
    assert!(!state.is_rehydrating());
    assert_eq!(state.watermark.current(), at(10, 50, 0));
    assert_eq!(publisher.rows(HOUR_10).len(), 15_000);
    assert_eq!(publisher.uploads(), 1);
}

#[tokio::test]
async fn capped_scan_in_reverse_order_loses_nothing() {
    let store = MemoryStore::scan_only();
    let publisher = RecordingPublisher::default();
    let mut items = items_from(
        at(10, 0, 0) + Duration::milliseconds(200),
        15_000,
        Duration::milliseconds(200),
    );
    items.reverse();
    store.insert(items);
    let mut state = state_from(9, 59);

    let first = run_cycle(&mut state, &store, &publisher, at(10, 55, 0))
        .await
        .unwrap();
    assert_eq!(first.fetched, 10_000);
    // Newest records came first, so the watermark is already at the top.
    assert_eq!(state.watermark.current(), at(10, 50, 0));
    assert!(first.publish_deferred);
    assert!(publisher.names().is_empty());

    let second = run_cycle(&mut state, &store, &publisher, at(10, 56, 0))
        .await
        .unwrap();
    assert_eq!(second.fetched, 5_000);
    assert_eq!(publisher.rows(HOUR_10).len(), 15_000);
}

#[tokio::test]
async fn capped_indexed_query_resumes_from_page_token() {
    let store = MemoryStore::indexed();
    let publisher = RecordingPublisher::default();
    store.insert(items_from(
        at(10, 0, 0) + Duration::milliseconds(200),
        15_000,
        Duration::milliseconds(200),
    ));
    let mut state = state_from(9, 59);

    let first = run_cycle(&mut state, &store, &publisher, at(10, 55, 0))
        .await
        .unwrap();
    assert_eq!(first.strategy, FetchStrategy::Indexed);
    assert_eq!(first.fetched, 10_000);
    assert!(first.publish_deferred);

    let second = run_cycle(&mut state, &store, &publisher, at(10, 56, 0))
        .await
        .unwrap();
    assert_eq!(second.fetched, 5_000);
    assert_eq!(publisher.rows(HOUR_10).len(), 15_000);
    assert_eq!(
        store.scan_calls.load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}

#[tokio::test]
async fn store_outage_keeps_watermark_and_recovers_everything() {
    let store = MemoryStore::scan_only();
    let publisher = RecordingPublisher::default();
    store.insert([item(at(10, 1, 0), 1), item(at(10, 1, 30), 2), item(at(10, 2, 0), 3)]);
    let mut state = state_from(10, 0);

    store.set_down(true);
    for minute in 2..5 {
        let result = run_cycle(&mut state, &store, &publisher, at(10, minute, 30)).await;
        assert!(matches!(result, Err(CycleError::Fetch { .. })));
        assert_eq!(state.watermark.current(), at(10, 0, 0));
    }
    assert_eq!(publisher.uploads(), 0);

    store.insert([item(at(10, 3, 30), 4)]);
    store.set_down(false);
    let report = run_cycle(&mut state, &store, &publisher, at(10, 5, 0))
        .await
        .unwrap();
    assert_eq!(report.fetched, 4);
    assert_eq!(state.watermark.current(), at(10, 3, 30));
    assert_eq!(publisher.rows(HOUR_10).len(), 4);
}

#[tokio::test]
async fn hour_boundary_splits_files_and_idle_ticks_do_not_upload() {
    let store = MemoryStore::scan_only();
    let publisher = RecordingPublisher::default();
    let mut state = state_from(10, 50);

    store.insert([item(at(10, 59, 30), 1)]);
    run_cycle(&mut state, &store, &publisher, at(10, 59, 45))
        .await
        .unwrap();
    store.insert([item(at(11, 0, 10), 2)]);
    run_cycle(&mut state, &store, &publisher, at(11, 0, 30))
        .await
        .unwrap();

    assert_eq!(publisher.names(), vec![HOUR_10.to_string(), HOUR_11.to_string()]);
    let old = publisher.rows(HOUR_10);
    let new = publisher.rows(HOUR_11);
    assert_eq!(old.len(), 1);
    assert_eq!(new.len(), 1);
    assert!(old[0].contains("10:59:30"));
    assert!(new[0].contains("11:00:10"));
    assert_eq!(publisher.uploads(), 2);

    for second in [40, 50] {
        let idle = run_cycle(&mut state, &store, &publisher, at(11, 0, second))
            .await
            .unwrap();
        assert_eq!(idle.fetched, 0);
        assert!(idle.publish.published.is_empty());
    }
    assert_eq!(publisher.uploads(), 2);
}

#[tokio::test]
async fn failed_publish_is_retried_with_the_grown_bucket() {
    let store = MemoryStore::scan_only();
    let publisher = RecordingPublisher::default();
    let mut state = state_from(10, 0);

    store.insert([item(at(10, 1, 0), 1)]);
    publisher.set_failing(true);
    let report = run_cycle(&mut state, &store, &publisher, at(10, 2, 0))
        .await
        .unwrap();
    assert_eq!(report.publish.failed.len(), 1);
    assert_eq!(report.publish.failed[0].name, HOUR_10);
    assert_eq!(state.watermark.current(), at(10, 1, 0));
    assert_eq!(state.writer.pending().len(), 1);

    publisher.set_failing(false);
    store.insert([item(at(10, 2, 30), 2)]);
    let report = run_cycle(&mut state, &store, &publisher, at(10, 3, 0))
        .await
        .unwrap();
    assert!(report.publish.is_clean());
    assert_eq!(publisher.rows(HOUR_10).len(), 2);
    assert!(state.writer.pending().is_empty());
}

#[tokio::test]
async fn late_record_reopens_sealed_bucket_inside_window() {
    let store = MemoryStore::scan_only();
    let publisher = RecordingPublisher::default();
    let mut state = state_from(9, 0);

    store.insert([item(at(9, 10, 0), 1)]);
    run_cycle(&mut state, &store, &publisher, at(9, 20, 0))
        .await
        .unwrap();
    assert_eq!(publisher.rows("locness_data_20240501_09.csv").len(), 1);

    store.insert([item(at(9, 30, 0), 2), item(at(11, 5, 0), 3)]);
    let report = run_cycle(&mut state, &store, &publisher, at(11, 10, 0))
        .await
        .unwrap();
    assert_eq!(report.dropped_late, 0);
    assert_eq!(publisher.rows("locness_data_20240501_09.csv").len(), 2);
    assert_eq!(publisher.rows(HOUR_11).len(), 1);
}

#[tokio::test]
async fn old_hour_never_published_is_still_written() {
    let store = MemoryStore::scan_only();
    let publisher = RecordingPublisher::default();
    let mut state = state_from(8, 0);

    store.insert([item(at(8, 30, 0), 1), item(at(10, 30, 0), 2)]);
    let report = run_cycle(&mut state, &store, &publisher, at(11, 10, 0))
        .await
        .unwrap();
    assert_eq!(report.dropped_late, 0);
    assert_eq!(report.accepted, 2);
    assert_eq!(publisher.names(), vec![HOUR_08.to_string(), HOUR_10.to_string()]);
    assert_eq!(state.watermark.current(), at(10, 30, 0));
}

#[tokio::test]
async fn record_for_evicted_published_hour_is_dropped() {
    let store = MemoryStore::scan_only();
    let publisher = RecordingPublisher::default();
    let mut state = state_from(8, 0);

    store.insert([item(at(8, 10, 0), 1)]);
    run_cycle(&mut state, &store, &publisher, at(8, 20, 0))
        .await
        .unwrap();
    assert_eq!(publisher.rows(HOUR_08).len(), 1);

    // Quiet table; hour 08 falls out of the two-hour window at 11:00.
    run_cycle(&mut state, &store, &publisher, at(11, 10, 0))
        .await
        .unwrap();
    assert!(state.writer.is_evicted(BucketKey::for_time(at(8, 0, 0))));

    store.insert([item(at(8, 40, 0), 2)]);
    let report = run_cycle(&mut state, &store, &publisher, at(11, 15, 0))
        .await
        .unwrap();
    assert_eq!(report.fetched, 1);
    assert_eq!(report.dropped_late, 1);
    assert_eq!(publisher.rows(HOUR_08).len(), 1);
    assert_eq!(publisher.uploads(), 1);
}

#[tokio::test]
async fn multi_hour_outage_writes_every_hour_once_the_store_returns() {
    let store = MemoryStore::scan_only();
    let publisher = RecordingPublisher::default();
    let mut state = state_from(7, 0);

    store.insert([item(at(7, 30, 0), 1)]);
    store.set_down(true);
    for hour in 7..10 {
        let result = run_cycle(&mut state, &store, &publisher, at(hour, 40, 0)).await;
        assert!(result.is_err());
    }
    assert_eq!(state.watermark.current(), at(7, 0, 0));

    store.insert([item(at(11, 5, 0), 2)]);
    store.set_down(false);
    let report = run_cycle(&mut state, &store, &publisher, at(11, 10, 0))
        .await
        .unwrap();
    assert_eq!(report.fetched, 2);
    assert_eq!(report.dropped_late, 0);
    assert_eq!(publisher.names(), vec![HOUR_07.to_string(), HOUR_11.to_string()]);
    assert_eq!(publisher.rows(HOUR_07).len(), 1);
    assert_eq!(state.watermark.current(), at(11, 5, 0));
}

#[tokio::test]
async fn restart_mid_hour_keeps_rows_published_before_the_restart() {
    let store = MemoryStore::scan_only();
    let publisher = RecordingPublisher::default();
    let mut state = state_from(9, 30);

    store.insert([item(at(9, 50, 0), 1), item(at(10, 5, 0), 2)]);
    run_cycle(&mut state, &store, &publisher, at(10, 10, 0))
        .await
        .unwrap();
    assert_eq!(publisher.rows(HOUR_09).len(), 1);
    assert_eq!(publisher.rows(HOUR_10).len(), 1);
    let saved = state.checkpoint();
    assert_eq!(saved.current(), at(10, 5, 0));

    // New process, same store and Drive folder.
    let mut restarted = SyncState::new(&settings(), saved);
    assert!(restarted.is_rehydrating());
    store.insert([item(at(10, 15, 0), 3)]);
    let report = run_cycle(&mut restarted, &store, &publisher, at(10, 20, 0))
        .await
        .unwrap();
    assert!(!report.publish_deferred);
    assert_eq!(report.accepted, 3);

    let rows = publisher.rows(HOUR_10);
    assert_eq!(rows.len(), 2);
    assert!(rows[0].contains("10:05:00"));
    assert!(rows[1].contains("10:15:00"));
    assert_eq!(publisher.rows(HOUR_09).len(), 1);
    assert_eq!(restarted.watermark.current(), at(10, 15, 0));
}

#[tokio::test]
async fn duplicate_items_from_the_store_appear_once() {
    let store = MemoryStore::scan_only();
    let publisher = RecordingPublisher::default();
    let mut state = state_from(10, 0);

    store.insert([item(at(10, 1, 0), 1), item(at(10, 1, 0), 1)]);
    let report = run_cycle(&mut state, &store, &publisher, at(10, 2, 0))
        .await
        .unwrap();
    assert_eq!(report.duplicates, 1);
    assert_eq!(publisher.rows(HOUR_10).len(), 1);
}

#[tokio::test]
async fn missing_index_falls_back_to_scan_and_reprobes_hourly() {
    let mut store = MockRecordStore::new();
    store
        .expect_query_page()
        .times(2)
        .returning(|_: &TimeRange, _: Option<PageToken>, _: usize| {
            Err(StoreError::IndexUnavailable(
                "ValidationException: Query condition missed key schema element".to_string(),
            ))
        });
    store
        .expect_scan_page()
        .times(3)
        .returning(|_: Option<PageToken>, _: usize| {
            Ok(Page {
                items: vec![item(at(10, 1, 0), 1)],
                next: None,
            })
        });

    let mut publisher = MockPublisher::new();
    publisher
        .expect_publish()
        .times(1)
        .returning(|name: &str, _content: &[u8]| {
            Ok(PublishReceipt {
                file_id: format!("file-{name}"),
                created: true,
            })
        });

    let mut state = state_from(10, 0);
    let first = run_cycle(&mut state, &store, &publisher, at(10, 2, 0))
        .await
        .unwrap();
    assert_eq!(first.strategy, FetchStrategy::Scan);
    assert_eq!(first.fetched, 1);

    let second = run_cycle(&mut state, &store, &publisher, at(10, 3, 0))
        .await
        .unwrap();
    assert_eq!(second.strategy, FetchStrategy::Scan);
    assert_eq!(second.fetched, 0);

    // Past the re-probe interval the indexed query is tried again.
    let third = run_cycle(&mut state, &store, &publisher, at(11, 3, 0))
        .await
        .unwrap();
    assert_eq!(third.strategy, FetchStrategy::Scan);
    assert_eq!(state.fetcher.strategy(), Some(FetchStrategy::Scan));
}

#[tokio::test]
async fn terminal_store_error_aborts_without_publishing() {
    let mut store = MockRecordStore::new();
    store
        .expect_query_page()
        .times(1)
        .returning(|_: &TimeRange, _: Option<PageToken>, _: usize| {
            Err(StoreError::Other {
                operation: "query",
                message: "AccessDeniedException".to_string(),
            })
        });
    store.expect_scan_page().never();
    let mut publisher = MockPublisher::new();
    publisher.expect_publish().never();

    let mut state = state_from(10, 0);
    let err = run_cycle(&mut state, &store, &publisher, at(10, 2, 0))
        .await
        .unwrap_err();
    let CycleError::Fetch { source, .. } = err;
    assert_eq!(source.strategy, FetchStrategy::Indexed);
    assert_eq!(state.watermark.current(), at(10, 0, 0));
}

#[tokio::test]
async fn index_lost_mid_pass_rescans_the_parked_range() {
    let mut capped = settings();
    capped.fetch.max_pages = 1;

    let mut store = MockRecordStore::new();
    let query_calls = AtomicUsize::new(0);
    store
        .expect_query_page()
        .times(2)
        .returning(move |_: &TimeRange, _: Option<PageToken>, _: usize| {
            if query_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Page {
                    items: vec![item(at(10, 1, 0), 1)],
                    next: Some(PageToken(
                        [("offset".to_string(), FieldValue::number(1))]
                            .into_iter()
                            .collect(),
                    )),
                })
            } else {
                Err(StoreError::IndexUnavailable("index deleted".to_string()))
            }
        });
    store
        .expect_scan_page()
        .times(1)
        .returning(|_: Option<PageToken>, _: usize| {
            let mut other = item(at(10, 1, 0), 2);
            other.insert("data".to_string(), FieldValue::text("sensor-b"));
            Ok(Page {
                items: vec![item(at(10, 1, 0), 1), other],
                next: None,
            })
        });

    let mut publisher = MockPublisher::new();
    publisher
        .expect_publish()
        .times(1)
        .returning(|name: &str, content: &[u8]| {
            assert_eq!(name, HOUR_10);
            assert_eq!(String::from_utf8_lossy(content).lines().count(), 3);
            Ok(PublishReceipt {
                file_id: format!("file-{name}"),
                created: true,
            })
        });

    let mut state = SyncState::new(&capped, Watermark::new(at(10, 0, 0)));
    let first = run_cycle(&mut state, &store, &publisher, at(10, 2, 0))
        .await
        .unwrap();
    assert_eq!(first.strategy, FetchStrategy::Indexed);
    assert!(!first.fetch_complete);

    let second = run_cycle(&mut state, &store, &publisher, at(10, 3, 0)).await;
    assert!(second.is_err());
    assert!(state.fetcher.has_continuation());

    let third = run_cycle(&mut state, &store, &publisher, at(10, 4, 0))
        .await
        .unwrap();
    assert_eq!(third.strategy, FetchStrategy::Scan);
    assert!(third.fetch_complete);
    assert_eq!(third.duplicates, 1);
    assert_eq!(third.accepted, 1);
    assert!(!state.fetcher.has_continuation());
}
