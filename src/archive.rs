use chrono::{Datelike, NaiveDate};
use polars::{frame::DataFrame, prelude::{CsvReadOptions, SerReader}};
use std::{
    collections::HashSet,
    io::{Cursor, Read},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};
use tracing::{debug, info, warn};

use crate::{
    cache::DayCache,
    config::ArchiveSettings,
    domain::{DataKind, DataSource, TickType, day_end_ms, day_start_ms},
    error::{ArchiveError, ConfigError, RewindError, RewindResult},
    schema::{self, Col},
};

/// Publication unit of the external archive, tried widest-last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granule {
    Day,
    Month,
    Year,
}

/// Identity of one published archive object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GranuleKey {
    pub symbol: String,
    pub granule: Granule,
    pub year: i32,
    /// 1-12 for month granules, 0 otherwise.
    pub month: u32,
    /// 1-31 for day granules, 0 otherwise.
    pub day: u32,
}

impl GranuleKey {
    fn day(symbol: &str, date: NaiveDate) -> Self {
        Self {
            symbol: symbol.to_string(),
            granule: Granule::Day,
            year: date.year(),
            month: date.month(),
            day: date.day(),
        }
    }

    fn month(symbol: &str, date: NaiveDate) -> Self {
        Self {
            symbol: symbol.to_string(),
            granule: Granule::Month,
            year: date.year(),
            month: date.month(),
            day: 0,
        }
    }

    fn year(symbol: &str, date: NaiveDate) -> Self {
        Self {
            symbol: symbol.to_string(),
            granule: Granule::Year,
            year: date.year(),
            month: 0,
            day: 0,
        }
    }
}

// ================================================================================================
// Transport Seam
// ================================================================================================

/// Blocking byte-level transport for archive objects. The production
/// implementation is HTTP; tests inject an in-memory map.
pub trait ArchiveTransport: Send + Sync {
    /// `Ok(None)` means the object is not published (HTTP 404); anything
    /// retryable is an `Err`.
    fn get(&self, url: &str) -> Result<Option<Vec<u8>>, ArchiveError>;
}

/// HTTP transport over a blocking reqwest client with rustls.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(timeout_seconds: u64) -> RewindResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| ArchiveError::Download {
                url: String::new(),
                msg: format!("client build failed: {e}"),
            })?;
        Ok(Self { client })
    }
}

impl ArchiveTransport for HttpTransport {
    fn get(&self, url: &str) -> Result<Option<Vec<u8>>, ArchiveError> {
        let response = self.client.get(url).send().map_err(|e| {
            if e.is_timeout() {
                ArchiveError::Timeout(url.to_string())
            } else {
                ArchiveError::Download {
                    url: url.to_string(),
                    msg: e.to_string(),
                }
            }
        })?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ArchiveError::Download {
                url: url.to_string(),
                msg: format!("status {}", response.status()),
            });
        }
        let bytes = response.bytes().map_err(|e| ArchiveError::Download {
            url: url.to_string(),
            msg: e.to_string(),
        })?;
        Ok(Some(bytes.to_vec()))
    }
}

// ================================================================================================
// ArchiveFetcher
// ================================================================================================

/// Downloads ticks from the external day/month/year archive and populates
/// the day cache with the widest granule obtained.
///
/// A month or year object is downloaded at most once per run for a given
/// `(symbol, granule)`: after the split-into-days write, later days of the
/// same granule are pure cache hits.
pub struct ArchiveFetcher {
    settings: ArchiveSettings,
    archive_symbol: Box<dyn Fn(&str) -> String + Send + Sync>,
    broker: String,
    /// Cache bucket the downloaded ticks are filed under.
    tick_type: TickType,
    transport: Box<dyn ArchiveTransport>,
    cache: Arc<DayCache>,
    /// Granules already downloaded and split into day files this run.
    populated: Mutex<HashSet<GranuleKey>>,
    /// Granules the archive answered 404 for this run.
    unpublished: Mutex<HashSet<GranuleKey>>,
    /// Serializes the whole fetch path so concurrent day workers cannot
    /// download the same granule twice.
    fetch_lock: Mutex<()>,
    downloads: AtomicU64,
}

impl ArchiveFetcher {
    pub fn new(
        settings: ArchiveSettings,
        broker: String,
        tick_type: TickType,
        symbol_mapper: impl Fn(&str) -> String + Send + Sync + 'static,
        transport: Box<dyn ArchiveTransport>,
        cache: Arc<DayCache>,
    ) -> Self {
        Self {
            settings,
            archive_symbol: Box::new(symbol_mapper),
            broker,
            tick_type,
            transport,
            cache,
            populated: Mutex::new(HashSet::new()),
            unpublished: Mutex::new(HashSet::new()),
            fetch_lock: Mutex::new(()),
            downloads: AtomicU64::new(0),
        }
    }

    /// Number of archive objects downloaded during this run.
    pub fn download_count(&self) -> u64 {
        self.downloads.load(Ordering::Relaxed)
    }

    /// Fetches one day of ticks, walking day -> month -> year. `None` when
    /// every granule is unpublished; the caller surfaces the incomplete day.
    #[tracing::instrument(skip(self), fields(symbol, %day))]
    pub fn fetch(&self, symbol: &str, day: NaiveDate) -> RewindResult<Option<DataFrame>> {
        if !self.settings.tick_archive_enabled {
            return Err(ArchiveError::Disabled.into());
        }
        let _fetch_guard = self.fetch_lock.lock().expect("fetch lock poisoned");

        let attempts = [
            (Granule::Day, GranuleKey::day(symbol, day)),
            (Granule::Month, GranuleKey::month(symbol, day)),
            (Granule::Year, GranuleKey::year(symbol, day)),
        ];

        for (granule, key) in attempts {
            // A granule already split into day files this run answers from
            // the cache, including "no data published for that day".
            if self
                .populated
                .lock()
                .expect("granule set poisoned")
                .contains(&key)
            {
                return self
                    .cache
                    .load_day(symbol, day, DataKind::Ticks(self.tick_type));
            }
            // A granule known to be 404 this run widens without a request.
            if self
                .unpublished
                .lock()
                .expect("granule set poisoned")
                .contains(&key)
            {
                continue;
            }

            let Some(url) = self.url_for(granule, symbol, day) else {
                continue;
            };
            self.check_host(&url)?;

            match self.download_with_backoff(&url)? {
                Some(bytes) => {
                    let frame = self.parse_archive(&bytes, &url)?;
                    self.split_and_cache(frame, symbol)?;
                    self.populated
                        .lock()
                        .expect("granule set poisoned")
                        .insert(key);
                    return self
                        .cache
                        .load_day(symbol, day, DataKind::Ticks(self.tick_type));
                }
                None => {
                    debug!(%url, "Archive object not published; widening granule");
                    self.unpublished
                        .lock()
                        .expect("granule set poisoned")
                        .insert(key);
                    continue;
                }
            }
        }

        Ok(None)
    }

    /// Groups a parsed archive frame by UTC day and writes every day file,
    /// including days outside the originally requested range.
    pub fn split_and_cache(&self, frame: DataFrame, symbol: &str) -> RewindResult<()> {
        let (first_ms, last_ms) = match schema::time_bounds(&frame)? {
            Some(bounds) => bounds,
            None => return Ok(()),
        };

        let first_day = ms_to_day(first_ms);
        let last_day = ms_to_day(last_ms);
        let mut day = first_day;
        let mut written = 0usize;
        while day <= last_day {
            let slice =
                schema::slice_time_range(frame.clone(), day_start_ms(day), day_end_ms(day))?;
            if slice.height() >= self.settings.min_ticks_per_day {
                sanity_check(&slice)?;
                let mut slice = slice;
                self.cache.save(
                    symbol,
                    day,
                    DataKind::Ticks(self.tick_type),
                    &mut slice,
                    DataSource::Archive,
                )?;
                written += 1;
            } else if slice.height() > 0 {
                warn!(%symbol, %day, rows = slice.height(), "Archive day below minimum tick count; skipped");
            }
            day = day.succ_opt().expect("date overflow");
        }
        info!(%symbol, days = written, "Archive split into day files");
        Ok(())
    }

    // ============================================================================================
    // Download
    // ============================================================================================

    fn url_for(&self, granule: Granule, symbol: &str, day: NaiveDate) -> Option<String> {
        let pattern = match granule {
            Granule::Day => &self.settings.tick_archive_url_pattern_day,
            Granule::Month => &self.settings.tick_archive_url_pattern_month,
            Granule::Year => &self.settings.tick_archive_url_pattern_year,
        };
        if pattern.is_empty() {
            return None;
        }
        let mapped = (self.archive_symbol)(symbol);
        Some(
            pattern
                .replace("{SYMBOL}", &mapped)
                .replace("{BROKER}", &self.broker)
                .replace("{YEAR}", &format!("{:04}", day.year()))
                .replace("{MONTH}", &format!("{:02}", day.month()))
                .replace("{DAY}", &format!("{:02}", day.day())),
        )
    }

    fn check_host(&self, url: &str) -> RewindResult<()> {
        let host = url
            .split("://")
            .nth(1)
            .and_then(|rest| rest.split('/').next())
            .unwrap_or_default()
            .to_string();
        if self
            .settings
            .trusted_hosts
            .iter()
            .any(|trusted| trusted == &host)
        {
            Ok(())
        } else {
            Err(RewindError::Config(ConfigError::UntrustedArchiveHost(host)))
        }
    }

    fn download_with_backoff(&self, url: &str) -> RewindResult<Option<Vec<u8>>> {
        let mut delay = Duration::from_millis(250);
        let mut last_err: Option<ArchiveError> = None;

        for attempt in 0..=self.settings.tick_archive_max_retries {
            match self.transport.get(url) {
                Ok(Some(bytes)) => {
                    self.downloads.fetch_add(1, Ordering::Relaxed);
                    self.persist_raw(url, &bytes);
                    return Ok(Some(bytes));
                }
                // 404 is a definitive answer, never retried.
                Ok(None) => return Ok(None),
                Err(e) => {
                    warn!(%url, attempt, error = %e, "Archive download failed");
                    last_err = Some(e);
                    if attempt < self.settings.tick_archive_max_retries {
                        thread::sleep(delay);
                        delay = delay.saturating_mul(2);
                    }
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| ArchiveError::Download {
                url: url.to_string(),
                msg: "exhausted retries".to_string(),
            })
            .into())
    }

    fn persist_raw(&self, url: &str, bytes: &[u8]) {
        let Some(dir) = &self.settings.tick_archive_save else {
            return;
        };
        let name = url.rsplit('/').next().unwrap_or("archive.bin");
        if std::fs::create_dir_all(dir).is_ok() {
            let _ = std::fs::write(dir.join(name), bytes);
        }
    }

    // ============================================================================================
    // Parse
    // ============================================================================================

    /// Decodes a ZIP-of-CSV archive into a single sorted tick frame.
    fn parse_archive(&self, bytes: &[u8], url: &str) -> RewindResult<DataFrame> {
        let mut zip = zip::ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| ArchiveError::Parse(format!("{url}: {e}")))?;

        let mut frames = Vec::new();
        for i in 0..zip.len() {
            let mut entry = zip
                .by_index(i)
                .map_err(|e| ArchiveError::Parse(format!("{url}: {e}")))?;
            if !entry.name().to_ascii_lowercase().ends_with(".csv") {
                continue;
            }
            let mut csv = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut csv)
                .map_err(|e| ArchiveError::Parse(format!("{url}: {e}")))?;

            let frame = CsvReadOptions::default()
                .with_has_header(true)
                .into_reader_with_file_handle(Cursor::new(csv))
                .finish()
                .map_err(|e| ArchiveError::Parse(format!("{url}: {e}")))?;
            frames.push(normalize_columns(frame)?);
        }

        if frames.is_empty() {
            return Err(ArchiveError::Parse(format!("{url}: no csv entries in zip")).into());
        }
        schema::concat_days(frames)
    }
}

/// Maps vendor CSV columns onto the tick schema and backfills the optional
/// ones. Required: time, bid, ask.
fn normalize_columns(frame: DataFrame) -> RewindResult<DataFrame> {
    use polars::prelude::{DataType, IntoLazy, col, lit};

    for required in [Col::Time, Col::Bid, Col::Ask] {
        if frame.column(required.as_str()).is_err() {
            return Err(ArchiveError::Parse(format!(
                "archive csv missing required column '{}'",
                required.as_str()
            ))
            .into());
        }
    }

    let mut lazy = frame.clone().lazy().with_columns([
        col(Col::Time.as_str()).cast(DataType::Int64),
        col(Col::Bid.as_str()).cast(DataType::Float64),
        col(Col::Ask.as_str()).cast(DataType::Float64),
    ]);
    if frame.column(Col::Last.as_str()).is_err() {
        lazy = lazy.with_column(lit(0.0f64).alias(Col::Last.as_str()));
    } else {
        lazy = lazy.with_column(col(Col::Last.as_str()).cast(DataType::Float64));
    }
    if frame.column(Col::Volume.as_str()).is_err() {
        lazy = lazy.with_column(lit(0u64).cast(DataType::UInt64).alias(Col::Volume.as_str()));
    } else {
        lazy = lazy.with_column(col(Col::Volume.as_str()).cast(DataType::UInt64));
    }
    if frame.column(Col::Flags.as_str()).is_err() {
        lazy = lazy.with_column(lit(0u32).cast(DataType::UInt32).alias(Col::Flags.as_str()));
    } else {
        lazy = lazy.with_column(col(Col::Flags.as_str()).cast(DataType::UInt32));
    }

    let out = lazy
        .select([
            col(Col::Time.as_str()),
            col(Col::Bid.as_str()),
            col(Col::Ask.as_str()),
            col(Col::Last.as_str()),
            col(Col::Volume.as_str()),
            col(Col::Flags.as_str()),
        ])
        .collect()
        .map_err(crate::error::DataError::from)?;
    Ok(out)
}

/// Price sanity: ask >= bid and strictly positive quotes. A violating day is
/// rejected rather than cached.
fn sanity_check(frame: &DataFrame) -> RewindResult<()> {
    let ticks = schema::frame_to_ticks(frame)?;
    for tick in &ticks {
        if tick.bid.0 <= 0.0 || tick.ask.0 <= 0.0 {
            return Err(ArchiveError::Sanity(format!(
                "non-positive quote at {}: bid {} ask {}",
                tick.time_ms, tick.bid.0, tick.ask.0
            ))
            .into());
        }
        if tick.ask.0 < tick.bid.0 {
            return Err(ArchiveError::Sanity(format!(
                "crossed quote at {}: bid {} ask {}",
                tick.time_ms, tick.bid.0, tick.ask.0
            ))
            .into());
        }
    }
    Ok(())
}

fn ms_to_day(ms: i64) -> NaiveDate {
    chrono::DateTime::from_timestamp_millis(ms)
        .expect("timestamp in range")
        .date_naive()
}
