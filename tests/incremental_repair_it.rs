//! Incremental repair: a range with one missing day in the middle fetches
//! exactly that day and returns one contiguous, sorted frame.

mod common;

use common::{FixtureAdapter, day, day_start_ms, quote_tick, test_config, ts};
use std::sync::{Arc, atomic::Ordering};

use rewind::{
    Col, DayCache, frame_to_ticks,
    domain::{DataKind, DataSource, TickType},
    loader::DataLoader,
};

fn ticks_for(d: &str, count: usize) -> Vec<rewind::domain::Tick> {
    let base = day_start_ms(day(d));
    (0..count)
        .map(|i| quote_tick(base + (i as i64) * 60_000, 1.10, 1.1002))
        .collect()
}

#[test]
fn only_the_hole_is_fetched_and_the_frame_is_contiguous() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(
        dir.path(),
        &["EURUSD"],
        "2025-01-15T00:00:00Z",
        "2025-01-19T23:59:59Z",
    );

    // Cache D1, D2, D4, D5 directly; D3 is the hole.
    let cache = Arc::new(DayCache::new(config.cache.clone()));
    for d in ["2025-01-15", "2025-01-16", "2025-01-18", "2025-01-19"] {
        let mut frame = rewind::ticks_to_frame(&ticks_for(d, 10)).unwrap();
        cache
            .save(
                "EURUSD",
                day(d),
                DataKind::Ticks(TickType::All),
                &mut frame,
                DataSource::Exchange,
            )
            .unwrap();
    }

    let adapter = Arc::new(
        FixtureAdapter::default().with_ticks("EURUSD", day("2025-01-17"), ticks_for("2025-01-17", 10)),
    );
    let loader = DataLoader::new(&config, Arc::clone(&cache), adapter.clone(), None);

    let loaded = loader
        .load_ticks("EURUSD", ts("2025-01-15T00:00:00Z"), ts("2025-01-19T23:59:59Z"))
        .unwrap();

    assert!(loaded.failed_days.is_empty());
    assert_eq!(
        adapter.tick_calls.load(Ordering::Relaxed),
        1,
        "only the missing middle day may touch the adapter"
    );

    // One contiguous frame, strictly increasing timestamps, no duplication.
    let frame = loaded.frame.unwrap();
    assert_eq!(frame.height(), 50);
    let ticks = frame_to_ticks(&frame).unwrap();
    for pair in ticks.windows(2) {
        assert!(
            pair[0].time_ms < pair[1].time_ms,
            "timestamps must be strictly increasing across day boundaries"
        );
    }
    assert_eq!(frame.column(Col::Time.as_str()).unwrap().null_count(), 0);

    // The repaired day landed on disk with its provenance.
    let repaired = dir.path().join("2025/01/17/ticks/EURUSD_all.parquet");
    assert!(repaired.exists());
    let sidecar: serde_json::Value = serde_json::from_slice(
        &std::fs::read(repaired.with_file_name("EURUSD_all.parquet.meta.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(sidecar["source"], "exchange");
    assert_eq!(sidecar["row_count"], 10);
}

#[test]
fn non_incremental_mode_reloads_the_whole_range() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(
        dir.path(),
        &["EURUSD"],
        "2025-01-15T00:00:00Z",
        "2025-01-16T23:59:59Z",
    );
    config.cache.incremental_cache_loading = false;

    let cache = Arc::new(DayCache::new(config.cache.clone()));
    let mut frame = rewind::ticks_to_frame(&ticks_for("2025-01-15", 10)).unwrap();
    cache
        .save(
            "EURUSD",
            day("2025-01-15"),
            DataKind::Ticks(TickType::All),
            &mut frame,
            DataSource::Exchange,
        )
        .unwrap();

    let adapter = Arc::new(
        FixtureAdapter::default()
            .with_ticks("EURUSD", day("2025-01-15"), ticks_for("2025-01-15", 10))
            .with_ticks("EURUSD", day("2025-01-16"), ticks_for("2025-01-16", 10)),
    );
    let loader = DataLoader::new(&config, Arc::clone(&cache), adapter.clone(), None);

    let loaded = loader
        .load_ticks("EURUSD", ts("2025-01-15T00:00:00Z"), ts("2025-01-16T23:59:59Z"))
        .unwrap();

    assert_eq!(loaded.frame.unwrap().height(), 20);
    assert_eq!(
        adapter.tick_calls.load(Ordering::Relaxed),
        2,
        "a single miss in non-incremental mode refetches every day"
    );
}
