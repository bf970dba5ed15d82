use chrono::{DateTime, NaiveDate, Utc};
use polars::{
    frame::DataFrame,
    prelude::{ParquetCompression, ParquetReader, ParquetWriter, SerReader},
};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};

use crate::{
    domain::{DataKind, DataSource, day_end_ms, day_start_ms},
    error::{CacheError, IoError, RewindResult},
    schema,
};

/// Extension of the columnar data file.
pub const DATA_EXT: &str = "parquet";
/// Suffix of the metadata sidecar carried with every day file.
pub const META_SUFFIX: &str = "meta.json";

// ================================================================================================
// Metadata Sidecar
// ================================================================================================

/// The self-describing metadata carried by every day file.
///
/// A day file without a readable sidecar is invalid regardless of the state
/// of the data file itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayFileMeta {
    /// Write instant, ISO-8601.
    pub cached_at: DateTime<Utc>,
    pub source: DataSource,
    /// First row's timestamp, epoch milliseconds.
    pub first_data_time: i64,
    /// Last row's timestamp, epoch milliseconds.
    pub last_data_time: i64,
    pub row_count: u64,
    pub cache_version: String,
}

impl DayFileMeta {
    /// Both data bounds must lie inside the file's UTC day.
    pub fn bounds_within(&self, day: NaiveDate) -> bool {
        let start = day_start_ms(day);
        let end = day_end_ms(day);
        self.first_data_time >= start
            && self.first_data_time < end
            && self.last_data_time >= start
            && self.last_data_time < end
            && self.first_data_time <= self.last_data_time
    }

    /// Age in whole seconds relative to `now`.
    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.cached_at).num_seconds()
    }
}

// ================================================================================================
// Path Layout
// ================================================================================================

/// Resolves the data-file path for one `(symbol, day, data-kind)` cell:
/// `root/YYYY/MM/DD/candles/<SYMBOL>_<TF>.parquet` or
/// `root/YYYY/MM/DD/ticks/<SYMBOL>_<TICKTYPE>.parquet`.
pub fn day_file_path(root: &Path, symbol: &str, day: NaiveDate, kind: DataKind) -> PathBuf {
    let (bucket, tag) = match kind {
        DataKind::Candles(tf) => ("candles", tf.to_string()),
        DataKind::Ticks(tt) => ("ticks", tt.to_string()),
    };
    root.join(format!("{:04}", day_year(day)))
        .join(format!("{:02}", day_month(day)))
        .join(format!("{:02}", day_of_month(day)))
        .join(bucket)
        .join(format!("{symbol}_{tag}.{DATA_EXT}"))
}

/// Sidecar path belonging to a data-file path.
pub fn meta_path(data_path: &Path) -> PathBuf {
    let mut name = data_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push('.');
    name.push_str(META_SUFFIX);
    data_path.with_file_name(name)
}

/// `root/YYYY/MM/DD/symbol_info/<SYMBOL>.json`.
pub fn symbol_info_path(root: &Path, symbol: &str, day: NaiveDate) -> PathBuf {
    root.join(format!("{:04}", day_year(day)))
        .join(format!("{:02}", day_month(day)))
        .join(format!("{:02}", day_of_month(day)))
        .join("symbol_info")
        .join(format!("{symbol}.json"))
}

fn day_year(day: NaiveDate) -> i32 {
    use chrono::Datelike;
    day.year()
}

fn day_month(day: NaiveDate) -> u32 {
    use chrono::Datelike;
    day.month()
}

fn day_of_month(day: NaiveDate) -> u32 {
    use chrono::Datelike;
    day.day()
}

// ================================================================================================
// Atomic Read / Write
// ================================================================================================

/// Writes a full day atomically: data and sidecar each go to a temp name in
/// the target directory and are renamed into place, data first. A reader that
/// races the rename sees either nothing (`NoFile`) or data without its
/// sidecar (`MissingMeta`); both verdicts route into the repair path.
pub fn write_day(
    data_path: &Path,
    frame: &mut DataFrame,
    meta: &DayFileMeta,
) -> RewindResult<()> {
    let dir = data_path
        .parent()
        .ok_or_else(|| IoError::FileSystem(format!("no parent dir for {data_path:?}")))?;
    fs::create_dir_all(dir).map_err(IoError::from)?;

    let tmp_data = data_path.with_extension(format!("{DATA_EXT}.tmp"));
    let file = File::create(&tmp_data).map_err(|e| IoError::WriterCreation(e.to_string()))?;
    ParquetWriter::new(file)
        .with_compression(ParquetCompression::Zstd(None))
        .finish(frame)
        .map_err(|e| CacheError::WriteFailed(format!("{data_path:?}: {e}")))?;

    let meta_file = meta_path(data_path);
    let tmp_meta = meta_file.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(meta).map_err(IoError::from)?;
    fs::write(&tmp_meta, json).map_err(IoError::from)?;

    fs::rename(&tmp_data, data_path).map_err(IoError::from)?;
    fs::rename(&tmp_meta, &meta_file).map_err(IoError::from)?;
    Ok(())
}

/// Reads the data file of a day entry. Corruption surfaces as a
/// [`CacheError::ReadFailed`], which callers map onto the repair path.
pub fn read_day(data_path: &Path) -> RewindResult<DataFrame> {
    let file = File::open(data_path).map_err(|e| IoError::ReaderCreation(e.to_string()))?;
    let frame = ParquetReader::new(file)
        .finish()
        .map_err(|e| CacheError::ReadFailed(format!("{data_path:?}: {e}")))?;
    Ok(frame)
}

/// Reads the sidecar of a day entry; `None` when the sidecar is missing or
/// unparseable (the `MissingMeta` verdict).
pub fn read_meta(data_path: &Path) -> Option<DayFileMeta> {
    let bytes = fs::read(meta_path(data_path)).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Builds a sidecar from a frame about to be written.
pub fn meta_for_frame(
    frame: &DataFrame,
    source: DataSource,
    cache_version: &str,
    now: DateTime<Utc>,
) -> RewindResult<DayFileMeta> {
    let (first, last) = schema::time_bounds(frame)?.ok_or_else(|| {
        crate::error::DataError::Empty("refusing to cache an empty day frame".to_string())
    })?;
    Ok(DayFileMeta {
        cached_at: now,
        source,
        first_data_time: first,
        last_data_time: last,
        row_count: frame.height() as u64,
        cache_version: cache_version.to_string(),
    })
}
