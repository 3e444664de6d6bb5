//! End-to-end runs of the joiner pipeline against in-memory collaborators
//!
//! These tests cover:
//! - One row per source record, including malformed records and bad responses
//! - Link id sequencing from the configured seed
//! - Identical links regardless of worker count
//! - Append-only output across runs and the resumable page cursor
//! - Empty page handling and fatal shutdown, including output failures

mod common;

use common::{
    malformed_row, output_path, read_rows, row, test_config, MemoryResolver, MemorySource, Reply,
};
use async_trait::async_trait;
use linkset_common::Point;
use linkset_joiner::cursor::CursorFile;
use linkset_joiner::resolver::PolygonResolver;
use linkset_joiner::scheduler::StopReason;
use linkset_joiner::{JoinError, Joiner};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

fn rows(count: usize) -> Vec<common::Row> {
    (0..count)
        .map(|i| row(&format!("GAACT{i:09}"), 149.0 + i as f64 / 100.0, -35.0))
        .collect()
}

fn links(path: &std::path::Path) -> BTreeSet<(String, String)> {
    read_rows(path)
        .into_iter()
        .map(|(_, source, reference)| (source, reference))
        .collect()
}

// ============================================================================
// Output Contents
// ============================================================================

#[tokio::test]
async fn test_two_record_page_yields_two_links() {
    let dir = tempfile::tempdir().unwrap();
    let output = output_path(&dir);

    let mut config = test_config(&output);
    config.run.batch_size = 2;
    config.run.stop = Some(1);
    config.run.batch_id = 100;

    let source = MemorySource::paged(vec![vec![row("A", 1.0, 1.0), row("B", 2.0, 2.0)]]);
    let resolver = MemoryResolver::new().reply(1.0, 1.0, Reply::Match("refX".into()));

    let outcome = Joiner::new(config, Arc::new(source), Arc::new(resolver))
        .run()
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.summary.processed, 2);
    assert_eq!(outcome.summary.matched, 1);
    assert_eq!(outcome.summary.unmatched, 1);

    let mut written = read_rows(&output);
    written.sort();
    let ids: Vec<u64> = written.iter().map(|(id, _, _)| *id).collect();
    assert_eq!(ids, vec![100, 101]);

    let links: HashSet<(String, String)> = written
        .into_iter()
        .map(|(_, source, reference)| (source, reference))
        .collect();
    assert!(links.contains(&("A".to_string(), "refX".to_string())));
    assert!(links.contains(&("B".to_string(), String::new())));
}

#[tokio::test]
async fn test_every_record_gets_exactly_one_row() {
    let dir = tempfile::tempdir().unwrap();
    let output = output_path(&dir);

    let mut config = test_config(&output);
    config.run.batch_size = 7;
    config.run.threads = 5;
    config.run.batch_id = 1000;

    let source = Arc::new(MemorySource::chunked(rows(50), 7));
    let resolver = MemoryResolver::new().with_jitter();

    let outcome = Joiner::new(config, source.clone(), Arc::new(resolver))
        .run()
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.stop_reason, Some(StopReason::SourceExhausted));
    assert_eq!(outcome.summary.processed, 50);
    assert_eq!(outcome.summary.first_link_id, Some(1000));
    assert_eq!(outcome.summary.last_link_id, Some(1049));

    let written = read_rows(&output);
    assert_eq!(written.len(), 50);

    // ids increase down the file and cover the seed range exactly once
    let ids: Vec<u64> = written.iter().map(|(id, _, _)| *id).collect();
    assert_eq!(ids, (1000..1050).collect::<Vec<_>>());

    let sources: HashSet<&String> = written.iter().map(|(_, source, _)| source).collect();
    assert_eq!(sources.len(), 50);

    // pages fetched once each, in order
    assert_eq!(source.fetches(), (0..8).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_links_do_not_depend_on_thread_count() {
    let dir = tempfile::tempdir().unwrap();
    let records = rows(40);

    let mut resolver = MemoryResolver::new().with_jitter();
    for (i, (_, point)) in records.iter().enumerate() {
        if i % 3 == 0 {
            let point = point.unwrap();
            resolver = resolver.reply(point.x, point.y, Reply::Match(format!("catchment-{i}")));
        }
    }
    let resolver = Arc::new(resolver);

    let mut results = Vec::new();
    for threads in [1, 8] {
        let output = dir.path().join(format!("linkset-{threads}.csv"));
        let mut config = test_config(&output);
        config.run.batch_size = 6;
        config.run.threads = threads;

        let source = MemorySource::chunked(records.clone(), 6);
        let outcome = Joiner::new(config, Arc::new(source), resolver.clone())
            .run()
            .await
            .unwrap();
        assert!(outcome.is_success());
        results.push(links(&output));
    }

    assert_eq!(results[0].len(), 40);
    assert_eq!(results[0], results[1]);
}

#[tokio::test]
async fn test_malformed_records_and_bad_responses_still_produce_rows() {
    let dir = tempfile::tempdir().unwrap();
    let output = output_path(&dir);

    let mut config = test_config(&output);
    config.run.batch_size = 3;

    let source = MemorySource::paged(vec![vec![
        row("A", 1.0, 1.0),
        malformed_row("B"),
        row("C", 3.0, 3.0),
    ]]);
    let resolver = MemoryResolver::new()
        .reply(1.0, 1.0, Reply::Match("refA".into()))
        .reply(3.0, 3.0, Reply::Garbled);
    let resolver = Arc::new(resolver);

    let outcome = Joiner::new(config, Arc::new(source), resolver.clone())
        .run()
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.summary.processed, 3);
    assert_eq!(outcome.summary.matched, 1);
    assert_eq!(outcome.summary.errored, 2);

    // the malformed record never reaches the resolver; parse errors are not retried
    assert_eq!(resolver.calls(), 2);

    let links = links(&output);
    assert!(links.contains(&("A".to_string(), "refA".to_string())));
    assert!(links.contains(&("B".to_string(), String::new())));
    assert!(links.contains(&("C".to_string(), String::new())));
}

// ============================================================================
// Restart and Cursor
// ============================================================================

#[tokio::test]
async fn test_advancing_start_appends_new_pages_only() {
    let dir = tempfile::tempdir().unwrap();
    let output = output_path(&dir);
    let records = rows(12);

    let mut first = test_config(&output);
    first.run.batch_size = 3;
    first.run.stop = Some(2);
    let outcome = Joiner::new(
        first,
        Arc::new(MemorySource::chunked(records.clone(), 3)),
        Arc::new(MemoryResolver::new()),
    )
    .run()
    .await
    .unwrap();
    assert_eq!(outcome.stop_reason, Some(StopReason::RangeComplete));
    let after_first = read_rows(&output);
    assert_eq!(after_first.len(), 6);

    let mut second = test_config(&output);
    second.run.batch_size = 3;
    second.run.start = 2;
    second.run.stop = Some(4);
    second.run.batch_id = 7;
    Joiner::new(
        second,
        Arc::new(MemorySource::chunked(records.clone(), 3)),
        Arc::new(MemoryResolver::new()),
    )
    .run()
    .await
    .unwrap();

    let after_second = read_rows(&output);
    assert_eq!(after_second.len(), 12);
    assert_eq!(&after_second[..6], &after_first[..]);

    let ids: HashSet<u64> = after_second.iter().map(|(id, _, _)| *id).collect();
    let sources: HashSet<&String> = after_second.iter().map(|(_, s, _)| s).collect();
    assert_eq!(ids.len(), 12);
    assert_eq!(sources.len(), 12);
}

#[tokio::test]
async fn test_stored_cursor_resumes_after_last_complete_page() {
    let dir = tempfile::tempdir().unwrap();
    let output = output_path(&dir);
    let cursor = dir.path().join("joiner.cursor");
    let records = rows(10);

    let mut config = test_config(&output);
    config.run.batch_size = 2;
    config.run.stop = Some(3);
    config.run.cursor_file = Some(cursor.clone());

    let outcome = Joiner::new(
        config.clone(),
        Arc::new(MemorySource::chunked(records.clone(), 2)),
        Arc::new(MemoryResolver::new()),
    )
    .run()
    .await
    .unwrap();
    assert_eq!(outcome.start_page, 0);
    let stored = CursorFile::new(&cursor).read().unwrap().unwrap();
    assert_eq!(stored.page, 3);
    assert_eq!(stored.next_link_id, 7);
    assert!(stored.written.is_empty());

    // same start, wider range: pages 0..3 are skipped
    config.run.stop = None;
    config.run.batch_id = 100;
    let source = Arc::new(MemorySource::chunked(records, 2));
    let outcome = Joiner::new(config, source.clone(), Arc::new(MemoryResolver::new()))
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.start_page, 3);
    assert_eq!(source.fetches(), vec![3, 4]);
    assert_eq!(outcome.summary.processed, 4);

    let written = read_rows(&output);
    let sources: HashSet<&String> = written.iter().map(|(_, s, _)| s).collect();
    assert_eq!(written.len(), 10);
    assert_eq!(sources.len(), 10);
    assert_eq!(CursorFile::new(&cursor).read().unwrap().unwrap().page, 5);
}

#[tokio::test]
async fn test_resume_after_abort_mid_page_writes_each_record_once() {
    let dir = tempfile::tempdir().unwrap();
    let output = output_path(&dir);
    let cursor = dir.path().join("joiner.cursor");
    let page = vec![
        row("A", 1.0, 1.0),
        row("DOWN", 500.0, 500.0),
        row("C", 3.0, 3.0),
        row("D", 4.0, 4.0),
    ];

    let mut config = test_config(&output);
    config.run.batch_size = 4;
    config.run.threads = 1;
    config.run.cursor_file = Some(cursor.clone());

    let outcome = Joiner::new(
        config.clone(),
        Arc::new(MemorySource::paged(vec![page.clone()])),
        Arc::new(MemoryResolver::new().reply(500.0, 500.0, Reply::Down)),
    )
    .run()
    .await
    .unwrap();
    assert!(matches!(outcome.error, Some(JoinError::ResolverUnavailable(_))));
    assert_eq!(read_rows(&output), vec![(1, "A".to_string(), String::new())]);

    let stored = CursorFile::new(&cursor).read().unwrap().unwrap();
    assert_eq!(stored.page, 0);
    assert_eq!(stored.next_link_id, 2);
    assert_eq!(stored.written, vec!["A"]);

    // the service is back
    let resolver = MemoryResolver::new().reply(500.0, 500.0, Reply::Match("ref500".into()));
    let outcome = Joiner::new(config, Arc::new(MemorySource::paged(vec![page])), Arc::new(resolver))
        .run()
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.start_page, 0);
    assert_eq!(outcome.summary.processed, 3);
    assert_eq!(
        read_rows(&output),
        vec![
            (1, "A".to_string(), String::new()),
            (2, "DOWN".to_string(), "ref500".to_string()),
            (3, "C".to_string(), String::new()),
            (4, "D".to_string(), String::new()),
        ]
    );

    let stored = CursorFile::new(&cursor).read().unwrap().unwrap();
    assert_eq!(stored.page, 1);
    assert_eq!(stored.next_link_id, 5);
    assert!(stored.written.is_empty());
}

// ============================================================================
// Empty Pages
// ============================================================================

#[tokio::test]
async fn test_unbounded_run_ends_at_first_empty_page() {
    let dir = tempfile::tempdir().unwrap();
    let output = output_path(&dir);

    let source = Arc::new(MemorySource::paged(vec![
        vec![row("A", 1.0, 1.0)],
        vec![],
        vec![row("B", 2.0, 2.0)],
    ]));
    let outcome = Joiner::new(test_config(&output), source.clone(), Arc::new(MemoryResolver::new()))
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.stop_reason, Some(StopReason::SourceExhausted));
    assert_eq!(outcome.summary.processed, 1);
    assert_eq!(source.fetches(), vec![0, 1]);
}

#[tokio::test]
async fn test_bounded_run_skips_gaps_until_empty_page_limit() {
    let dir = tempfile::tempdir().unwrap();
    let output = output_path(&dir);

    let mut config = test_config(&output);
    config.run.stop = Some(20);
    config.run.max_empty_pages = 3;

    let source = Arc::new(MemorySource::paged(vec![
        vec![row("A", 1.0, 1.0)],
        vec![],
        vec![row("B", 2.0, 2.0)],
        vec![],
        vec![],
        vec![],
        vec![row("C", 3.0, 3.0)],
    ]));
    let outcome = Joiner::new(config, source.clone(), Arc::new(MemoryResolver::new()))
        .run()
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.stop_reason, Some(StopReason::TooManyEmptyPages));
    assert_eq!(source.fetches(), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(
        links(&output),
        BTreeSet::from([("A".to_string(), String::new()), ("B".to_string(), String::new())])
    );
}

// ============================================================================
// Fatal Errors
// ============================================================================

#[tokio::test]
async fn test_unreachable_resolver_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let output = output_path(&dir);

    let mut config = test_config(&output);
    config.run.batch_size = 5;
    config.run.threads = 2;

    let mut records = rows(20);
    records[6] = row("DOWN", 500.0, 500.0);
    let resolver = Arc::new(MemoryResolver::new().reply(500.0, 500.0, Reply::Down));

    let outcome = Joiner::new(config, Arc::new(MemorySource::chunked(records, 5)), resolver)
        .run()
        .await
        .unwrap();

    assert!(!outcome.is_success());
    assert!(matches!(outcome.error, Some(JoinError::ResolverUnavailable(ref msg)) if msg.contains("after 2 attempts")));

    // every written row is complete and the failed record has none
    let written = read_rows(&output);
    assert!(written.len() < 20);
    assert_eq!(written.len() as u64, outcome.summary.processed);
    assert!(written.iter().all(|(_, source, _)| source != "DOWN"));
}

#[tokio::test]
async fn test_resolver_timeout_is_fatal_after_retries() {
    let dir = tempfile::tempdir().unwrap();
    let output = output_path(&dir);

    let mut config = test_config(&output);
    config.polygon.timeout = Duration::from_millis(20);
    config.run.threads = 1;

    let source = MemorySource::paged(vec![vec![row("SLOW", 9.0, 9.0)]]);
    let resolver = Arc::new(MemoryResolver::new().reply(9.0, 9.0, Reply::Slow(Duration::from_secs(30))));

    let outcome = Joiner::new(config, Arc::new(source), resolver.clone())
        .run()
        .await
        .unwrap();

    assert!(matches!(outcome.error, Some(JoinError::ResolverUnavailable(_))));
    assert_eq!(resolver.calls(), 2);
    assert!(read_rows(&output).is_empty());
}

#[tokio::test]
async fn test_unreachable_source_is_fatal_after_retries() {
    let dir = tempfile::tempdir().unwrap();
    let output = output_path(&dir);

    let source = Arc::new(MemorySource::unavailable());
    let outcome = Joiner::new(test_config(&output), source.clone(), Arc::new(MemoryResolver::new()))
        .run()
        .await
        .unwrap();

    assert!(matches!(outcome.error, Some(JoinError::SourceUnavailable(_))));
    assert_eq!(outcome.stop_reason, None);
    assert_eq!(source.fetches(), vec![0, 0]);
    assert_eq!(outcome.summary.processed, 0);
}

/// Resolver that removes a directory when it sees a given point
struct RemovingResolver {
    trigger: Point,
    dir: PathBuf,
}

#[async_trait]
impl PolygonResolver for RemovingResolver {
    async fn resolve(&self, point: &Point) -> linkset_joiner::Result<Option<String>> {
        if *point == self.trigger {
            std::fs::remove_dir_all(&self.dir).unwrap();
        }
        Ok(None)
    }
}

#[tokio::test]
async fn test_output_failure_mid_run_stops_the_pool() {
    let dir = tempfile::tempdir().unwrap();
    let output = output_path(&dir);
    let state_dir = dir.path().join("state");
    std::fs::create_dir(&state_dir).unwrap();

    let mut config = test_config(&output);
    config.run.batch_size = 5;
    config.run.threads = 1;
    config.run.cursor_file = Some(state_dir.join("joiner.cursor"));

    let records = rows(20);
    let trigger = records[3].1.unwrap();
    let source = Arc::new(MemorySource::chunked(records, 5));
    let resolver = RemovingResolver {
        trigger,
        dir: state_dir,
    };

    let outcome = Joiner::new(config, source.clone(), Arc::new(resolver))
        .run()
        .await
        .unwrap();

    assert!(!outcome.is_success());
    assert!(matches!(outcome.error, Some(JoinError::OutputIo(_))));
    assert!(matches!(outcome.stop_reason, None | Some(StopReason::Cancelled)));

    // rows up to the one whose cursor update failed, all complete
    let written = read_rows(&output);
    assert_eq!(written.len(), 4);
    assert_eq!(outcome.summary.processed, 4);
    assert_eq!(
        written.iter().map(|(id, _, _)| *id).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );
    assert!(source.fetches().len() < 4);
}

#[tokio::test]
async fn test_full_disk_stops_the_run() {
    // writes to /dev/full fail with ENOSPC
    let full = Path::new("/dev/full");
    if !full.exists() {
        return;
    }

    let mut config = test_config(full);
    config.run.batch_size = 3;
    config.run.threads = 2;

    let source = Arc::new(MemorySource::chunked(rows(30), 3));
    let outcome = Joiner::new(config, source.clone(), Arc::new(MemoryResolver::new()))
        .run()
        .await
        .unwrap();

    assert!(matches!(outcome.error, Some(JoinError::OutputIo(_))));
    assert_eq!(outcome.summary.processed, 0);
    assert!(source.fetches().len() < 10);
}

#[tokio::test]
async fn test_unwritable_output_fails_before_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("missing").join("linkset.csv");

    let result = Joiner::new(
        test_config(&output),
        Arc::new(MemorySource::chunked(rows(2), 2)),
        Arc::new(MemoryResolver::new()),
    )
    .run()
    .await;

    assert!(matches!(result, Err(JoinError::OutputIo(_))));
}
