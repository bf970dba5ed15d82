use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};
use tracing::warn;

use crate::{
    cache::day_file::{self, DayFileMeta},
    domain::DataKind,
    error::{IoError, RewindResult},
};

/// File name of the index sidecar under the cache root.
pub const INDEX_FILE: &str = ".cache_index.json";

/// In-memory presence map `symbol -> data-kind -> date -> metadata`,
/// persisted as a single sidecar document so `load` can validate a range
/// without touching one sidecar file per day.
///
/// The index is a pure accelerator: it is rebuildable from the filesystem,
/// and a corrupt or missing index degrades to per-file sidecar reads.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CacheIndex {
    entries: HashMap<String, DayFileMeta>,
}

impl CacheIndex {
    fn key(symbol: &str, kind: DataKind, day: NaiveDate) -> String {
        format!("{symbol}/{kind}/{day}")
    }

    pub fn get(&self, symbol: &str, kind: DataKind, day: NaiveDate) -> Option<&DayFileMeta> {
        self.entries.get(&Self::key(symbol, kind, day))
    }

    pub fn insert(&mut self, symbol: &str, kind: DataKind, day: NaiveDate, meta: DayFileMeta) {
        self.entries.insert(Self::key(symbol, kind, day), meta);
    }

    pub fn remove(&mut self, symbol: &str, kind: DataKind, day: NaiveDate) {
        self.entries.remove(&Self::key(symbol, kind, day));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // ============================================================================================
    // Persistence
    // ============================================================================================

    pub fn index_path(root: &Path) -> PathBuf {
        root.join(INDEX_FILE)
    }

    /// Loads the sidecar; a missing or corrupt sidecar yields an empty index
    /// (the per-file sidecars remain authoritative).
    pub fn load(root: &Path) -> Self {
        let path = Self::index_path(root);
        match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(index) => index,
                Err(e) => {
                    warn!(?path, error = %e, "Cache index corrupt; starting empty");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Persists the index atomically next to the cache tree.
    pub fn save(&self, root: &Path) -> RewindResult<()> {
        fs::create_dir_all(root).map_err(IoError::from)?;
        let path = Self::index_path(root);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec(self).map_err(IoError::from)?;
        fs::write(&tmp, json).map_err(IoError::from)?;
        fs::rename(&tmp, &path).map_err(IoError::from)?;
        Ok(())
    }

    /// Rebuilds the index by walking the day-partitioned tree and reading
    /// every sidecar found. Files without a sidecar are skipped; they are
    /// invalid anyway.
    pub fn rebuild(root: &Path) -> Self {
        let mut index = Self::default();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path
                    .extension()
                    .is_some_and(|e| e == day_file::DATA_EXT)
                {
                    if let Some((symbol, kind, day)) = parse_day_file_path(root, &path) {
                        if let Some(meta) = day_file::read_meta(&path) {
                            index.insert(&symbol, kind, day, meta);
                        }
                    }
                }
            }
        }
        index
    }
}

/// Recovers `(symbol, kind, day)` from a data-file path under the cache
/// layout `root/YYYY/MM/DD/<bucket>/<SYMBOL>_<TAG>.parquet`.
fn parse_day_file_path(root: &Path, path: &Path) -> Option<(String, DataKind, NaiveDate)> {
    use crate::domain::{TickType, Timeframe};
    use std::str::FromStr;

    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = rel.iter().map(|p| p.to_string_lossy()).collect();
    if parts.len() != 5 {
        return None;
    }

    let year: i32 = parts[0].parse().ok()?;
    let month: u32 = parts[1].parse().ok()?;
    let dom: u32 = parts[2].parse().ok()?;
    let day = NaiveDate::from_ymd_opt(year, month, dom)?;

    let stem = Path::new(parts[4].as_ref())
        .file_stem()?
        .to_string_lossy()
        .into_owned();
    let (symbol, tag) = stem.rsplit_once('_')?;

    let kind = match parts[3].as_ref() {
        "candles" => DataKind::Candles(Timeframe::from_str(tag).ok()?),
        "ticks" => DataKind::Ticks(TickType::from_str(tag).ok()?),
        _ => return None,
    };
    Some((symbol.to_string(), kind, day))
}
