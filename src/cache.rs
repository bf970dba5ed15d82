pub mod day_file;
pub mod index;

use chrono::{DateTime, NaiveDate, Utc};
use polars::frame::DataFrame;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};
use tracing::{debug, info};

use crate::{
    config::CacheSettings,
    domain::{DataKind, DataSource, SymbolInfo, days_in_range},
    error::{CacheError, IoError, RewindResult},
    schema,
};
use day_file::DayFileMeta;
use index::CacheIndex;

// ================================================================================================
// Validation Verdict
// ================================================================================================

/// Outcome of the pure validity query for one day entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheVerdict {
    ValidOk,
    Stale(String),
    MissingMeta,
    NoFile,
}

impl CacheVerdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, CacheVerdict::ValidOk)
    }
}

/// Result of a range load: the concatenation of the valid cached days plus
/// the deterministic (sorted) list of days needing repair.
#[derive(Debug)]
pub struct RangeLoad {
    pub frame: Option<DataFrame>,
    pub missing_days: Vec<NaiveDate>,
}

/// Cache traffic counters surfaced in the run diagnostics.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub day_hits: AtomicU64,
    pub day_misses: AtomicU64,
}

impl CacheStats {
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.day_hits.load(Ordering::Relaxed),
            self.day_misses.load(Ordering::Relaxed),
        )
    }
}

// ================================================================================================
// DayCache
// ================================================================================================

/// Content-addressed, day-partitioned store of bars and ticks.
///
/// Every physical unit is one `(symbol, UTC day, data kind)` Parquet file
/// plus its metadata sidecar. Day files are immutable once written; an update
/// rewrites the whole day atomically. Validity is self-describing through the
/// sidecar, accelerated by an optional index document.
pub struct DayCache {
    settings: CacheSettings,
    index: Mutex<Option<CacheIndex>>,
    stats: CacheStats,
}

impl DayCache {
    pub fn new(settings: CacheSettings) -> Self {
        let index = settings
            .cache_index_enabled
            .then(|| CacheIndex::load(&settings.cache_root));
        Self {
            settings,
            index: Mutex::new(index),
            stats: CacheStats::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.settings.cache_root
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    fn data_path(&self, symbol: &str, day: NaiveDate, kind: DataKind) -> PathBuf {
        day_file::day_file_path(&self.settings.cache_root, symbol, day, kind)
    }

    // ============================================================================================
    // Validation
    // ============================================================================================

    /// Pure validity query for one day entry, evaluated against `now`.
    ///
    /// The gap rule (`first_data_time` vs. the requested range start) is
    /// contextual and applied by [`DayCache::load`], not here.
    pub fn validate(&self, symbol: &str, day: NaiveDate, kind: DataKind) -> CacheVerdict {
        self.validate_at(symbol, day, kind, Utc::now())
    }

    pub fn validate_at(
        &self,
        symbol: &str,
        day: NaiveDate,
        kind: DataKind,
        now: DateTime<Utc>,
    ) -> CacheVerdict {
        let path = self.data_path(symbol, day, kind);
        if !path.exists() {
            return CacheVerdict::NoFile;
        }

        let meta = match self.lookup_meta(symbol, day, kind, &path) {
            Some(meta) => meta,
            None => return CacheVerdict::MissingMeta,
        };

        if !self.settings.cache_validation_enabled {
            return CacheVerdict::ValidOk;
        }

        self.judge_meta(&meta, day, now)
    }

    fn judge_meta(&self, meta: &DayFileMeta, day: NaiveDate, now: DateTime<Utc>) -> CacheVerdict {
        if meta.cache_version != self.settings.cache_version {
            return CacheVerdict::Stale(format!(
                "cache_version '{}' != '{}'",
                meta.cache_version, self.settings.cache_version
            ));
        }
        // Age exactly equal to the TTL is still fresh.
        let ttl_seconds = self.settings.cache_ttl_days * 86_400;
        let age = meta.age_seconds(now);
        if age > ttl_seconds {
            return CacheVerdict::Stale(format!("cached_at age {age}s exceeds ttl {ttl_seconds}s"));
        }
        if !meta.bounds_within(day) {
            return CacheVerdict::Stale(format!(
                "data bounds [{}, {}] outside UTC day {day}",
                meta.first_data_time, meta.last_data_time
            ));
        }
        CacheVerdict::ValidOk
    }

    /// Sidecar lookup through the index when enabled, falling back to the
    /// per-file sidecar.
    fn lookup_meta(
        &self,
        symbol: &str,
        day: NaiveDate,
        kind: DataKind,
        path: &Path,
    ) -> Option<DayFileMeta> {
        if let Some(index) = self.index.lock().expect("cache index poisoned").as_ref() {
            if let Some(meta) = index.get(symbol, kind, day) {
                return Some(meta.clone());
            }
        }
        day_file::read_meta(path)
    }

    // ============================================================================================
    // Load
    // ============================================================================================

    /// Loads every valid cached day of `[start, end]` for one symbol and
    /// data kind. Partial hits always return both the concatenated frame and
    /// exactly the days needed to repair; with incremental loading disabled,
    /// any invalid day forces the whole range into `missing_days`.
    #[tracing::instrument(skip(self), fields(symbol, %kind))]
    pub fn load(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        kind: DataKind,
    ) -> RewindResult<RangeLoad> {
        let now = Utc::now();
        let days = days_in_range(start, end);
        let mut valid_frames = Vec::new();
        let mut missing_days = Vec::new();
        let mut first_present_checked = false;

        for day in &days {
            let mut verdict = self.validate_at(symbol, *day, kind, now);

            // The first valid day must begin close enough to the requested
            // start; a larger gap means the cached day is not the day the
            // caller thinks it is.
            if verdict.is_valid() && !first_present_checked {
                first_present_checked = true;
                if self.settings.cache_validation_enabled {
                    let path = self.data_path(symbol, *day, kind);
                    if let Some(meta) = self.lookup_meta(symbol, *day, kind, &path) {
                        let gap_ms = meta.first_data_time - start.timestamp_millis();
                        let threshold_ms =
                            (self.settings.cache_gap_threshold_days * 86_400_000.0) as i64;
                        if gap_ms > threshold_ms {
                            verdict = CacheVerdict::Stale(format!(
                                "start gap {gap_ms}ms exceeds threshold {threshold_ms}ms"
                            ));
                        }
                    }
                }
            }

            if verdict.is_valid() {
                let path = self.data_path(symbol, *day, kind);
                match day_file::read_day(&path) {
                    Ok(frame) => {
                        self.stats.day_hits.fetch_add(1, Ordering::Relaxed);
                        valid_frames.push(frame);
                        continue;
                    }
                    Err(e) => {
                        // Unreadable data behind a valid sidecar: corrupt
                        // entry, route to repair.
                        debug!(%symbol, %day, error = %e, "Day file unreadable; repairing");
                    }
                }
            } else {
                debug!(%symbol, %day, ?verdict, "Cache miss");
            }
            self.stats.day_misses.fetch_add(1, Ordering::Relaxed);
            missing_days.push(*day);
        }

        if !self.settings.incremental_cache_loading && !missing_days.is_empty() {
            // Non-incremental mode repairs the full range on any miss.
            return Ok(RangeLoad {
                frame: None,
                missing_days: days,
            });
        }

        let frame = if valid_frames.is_empty() {
            None
        } else {
            Some(schema::concat_days(valid_frames)?)
        };
        Ok(RangeLoad {
            frame,
            missing_days,
        })
    }

    /// Validated single-day read; `None` routes the caller into the
    /// fallback chain.
    pub fn load_day(
        &self,
        symbol: &str,
        day: NaiveDate,
        kind: DataKind,
    ) -> RewindResult<Option<DataFrame>> {
        if !self.validate(symbol, day, kind).is_valid() {
            self.stats.day_misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        let path = self.data_path(symbol, day, kind);
        match day_file::read_day(&path) {
            Ok(frame) => {
                self.stats.day_hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(frame))
            }
            Err(_) => {
                self.stats.day_misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    // ============================================================================================
    // Save
    // ============================================================================================

    /// Writes one full day atomically and stamps its sidecar. The frame must
    /// already be restricted to `day`; out-of-day rows are a caller bug and
    /// are rejected.
    #[tracing::instrument(skip(self, frame), fields(symbol, %day, %kind, rows = frame.height()))]
    pub fn save(
        &self,
        symbol: &str,
        day: NaiveDate,
        kind: DataKind,
        frame: &mut DataFrame,
        source: DataSource,
    ) -> RewindResult<()> {
        // Day files are chronological on disk; the stream layer relies on it.
        *frame = frame
            .sort(
                [schema::Col::Time.as_str()],
                polars::prelude::SortMultipleOptions::default(),
            )
            .map_err(crate::error::DataError::from)?;
        let meta =
            day_file::meta_for_frame(frame, source, &self.settings.cache_version, Utc::now())?;
        if !meta.bounds_within(day) {
            return Err(CacheError::MetaOutOfDay(format!(
                "{symbol} {kind} {day}: [{}, {}]",
                meta.first_data_time, meta.last_data_time
            ))
            .into());
        }

        let path = self.data_path(symbol, day, kind);
        day_file::write_day(&path, frame, &meta)?;

        if let Some(index) = self.index.lock().expect("cache index poisoned").as_mut() {
            index.insert(symbol, kind, day, meta);
            index.save(&self.settings.cache_root)?;
        }
        info!(%symbol, %day, %kind, %source, "Day file written");
        Ok(())
    }

    // ============================================================================================
    // Symbol Info Sidecars
    // ============================================================================================

    /// Snapshot of the contract specification, written next to the first
    /// loaded day so re-runs never need the adapter for it.
    pub fn save_symbol_info(
        &self,
        day: NaiveDate,
        info: &SymbolInfo,
    ) -> RewindResult<()> {
        let path = day_file::symbol_info_path(&self.settings.cache_root, &info.name, day);
        let dir = path
            .parent()
            .ok_or_else(|| IoError::FileSystem(format!("no parent dir for {path:?}")))?;
        fs::create_dir_all(dir).map_err(IoError::from)?;
        let json = serde_json::to_vec_pretty(info).map_err(IoError::from)?;
        fs::write(&path, json).map_err(IoError::from)?;
        Ok(())
    }

    pub fn load_symbol_info(&self, symbol: &str, day: NaiveDate) -> Option<SymbolInfo> {
        let path = day_file::symbol_info_path(&self.settings.cache_root, symbol, day);
        let bytes = fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

}
