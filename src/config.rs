use chrono::{DateTime, Utc};
use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf};

use crate::{
    domain::{TickType, Timeframe},
    error::{ConfigError, RewindResult},
};

/// The availability bitmap is a single 64-bit word per buffer.
pub const MAX_SYMBOLS: usize = 64;

// ================================================================================================
// Cache Settings
// ================================================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Root of the day-partitioned cache tree.
    pub cache_root: PathBuf,
    /// Toggles the validity pipeline (metadata, TTL, gap checks).
    pub cache_validation_enabled: bool,
    /// Staleness threshold on `cached_at`, in days. Age equal to the
    /// threshold is still fresh; strictly greater is stale.
    pub cache_ttl_days: i64,
    /// Maximum start-side gap before a cached day is invalidated, in days.
    pub cache_gap_threshold_days: f64,
    /// On: use the sidecar index for O(1) validation. Off: scan the tree.
    pub cache_index_enabled: bool,
    /// On: partial hits return a repair list. Off: any miss reloads the range.
    pub incremental_cache_loading: bool,
    /// Bump to invalidate every previously written day file.
    pub cache_version: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("cache"),
            cache_validation_enabled: true,
            cache_ttl_days: 7,
            cache_gap_threshold_days: 1.0,
            cache_index_enabled: true,
            incremental_cache_loading: true,
            cache_version: "1".to_string(),
        }
    }
}

// ================================================================================================
// Archive Settings
// ================================================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveSettings {
    pub tick_archive_enabled: bool,
    /// URL templates substituting `{SYMBOL}`, `{BROKER}`, `{YEAR}`, `{MONTH}`, `{DAY}`.
    pub tick_archive_url_pattern_day: String,
    pub tick_archive_url_pattern_month: String,
    pub tick_archive_url_pattern_year: String,
    /// Request timeout in seconds.
    pub tick_archive_timeout: u64,
    pub tick_archive_max_retries: u32,
    /// Optional directory where raw downloaded archives are kept.
    pub tick_archive_save: Option<PathBuf>,
    /// Only hosts on this list are contacted.
    pub trusted_hosts: Vec<String>,
    /// Downloads with fewer ticks per day are rejected as truncated.
    pub min_ticks_per_day: usize,
    /// Maps the configured broker name onto the archive's vendor naming.
    pub broker_name_mapping: HashMap<String, String>,
    /// Maps configured symbols onto the archive's symbol naming.
    pub symbol_name_mapping: HashMap<String, String>,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            tick_archive_enabled: true,
            tick_archive_url_pattern_day: String::new(),
            tick_archive_url_pattern_month: String::new(),
            tick_archive_url_pattern_year: String::new(),
            tick_archive_timeout: 30,
            tick_archive_max_retries: 3,
            tick_archive_save: None,
            trusted_hosts: Vec::new(),
            min_ticks_per_day: 10,
            broker_name_mapping: HashMap::new(),
            symbol_name_mapping: HashMap::new(),
        }
    }
}

// ================================================================================================
// Session Settings
// ================================================================================================

/// Session-gating knobs consumed by the live collaborator only. The replay
/// engine treats every session as open and never consults these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub session_check_enabled: bool,
    pub wait_for_session: bool,
    pub session_wait_timeout_minutes: u64,
    pub session_check_interval_seconds: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            session_check_enabled: false,
            wait_for_session: false,
            session_wait_timeout_minutes: 60,
            session_check_interval_seconds: 30,
        }
    }
}

// ================================================================================================
// Backtest Config
// ================================================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub symbols: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub initial_balance: f64,
    pub leverage: f64,

    /// Tick-level replay when true; minute-level synthesis from M1 bars
    /// when false.
    pub use_tick_data: bool,
    /// Which tick stream to request from the sources.
    pub tick_type: TickType,
    /// Streaming tick delivery (bounded memory) vs eager full-range load.
    pub stream_ticks_from_disk: bool,
    /// Rows per batch for the streaming tick reader.
    pub chunk_size: usize,
    /// Worker pool width for per-day loading.
    pub parallel_days: usize,
    /// Proceed with gaps in the data instead of failing the run.
    pub allow_partial_data: bool,

    /// Timeframes pre-built during the load phase; strategies may request
    /// more at registration.
    pub preload_timeframes: Vec<Timeframe>,

    /// Abort the run when equity falls to or below this value.
    pub equity_kill_threshold: Option<f64>,
    /// Force-close the worst position when margin level (equity / used
    /// margin, percent) falls below this value.
    pub margin_call_level: Option<f64>,
    /// Per-lot round-turn commission charged on close.
    pub commission_per_lot: f64,
    /// Cap on concurrently open positions across all symbols.
    pub max_positions: usize,
    /// Equity snapshot stride: one sample every N ticks.
    pub equity_sample_stride: u64,
    /// Barrier sync timeout in milliseconds.
    pub barrier_timeout_ms: u64,
    /// Seed for stochastic strategy collaborators. The engine itself is
    /// deterministic regardless.
    pub seed: u64,

    pub broker_name: String,
    pub cache: CacheSettings,
    pub archive: ArchiveSettings,
    pub session: SessionSettings,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MIN_UTC,
            initial_balance: 10_000.0,
            leverage: 100.0,
            use_tick_data: true,
            tick_type: TickType::All,
            stream_ticks_from_disk: true,
            chunk_size: 16_384,
            parallel_days: 4,
            allow_partial_data: false,
            preload_timeframes: vec![Timeframe::M1],
            equity_kill_threshold: None,
            margin_call_level: Some(50.0),
            commission_per_lot: 0.0,
            max_positions: 200,
            equity_sample_stride: 1_000,
            barrier_timeout_ms: 30_000,
            seed: 0,
            broker_name: String::new(),
            cache: CacheSettings::default(),
            archive: ArchiveSettings::default(),
            session: SessionSettings::default(),
        }
    }
}

impl BacktestConfig {
    /// Fatal pre-start validation. Every rejection here maps to exit code 1.
    pub fn validate(&self) -> RewindResult<()> {
        if self.symbols.is_empty() {
            return Err(ConfigError::NoSymbols.into());
        }
        if self.symbols.len() > MAX_SYMBOLS {
            return Err(ConfigError::TooManySymbols(self.symbols.len()).into());
        }
        if self.start >= self.end {
            return Err(ConfigError::InvalidDateRange {
                start: self.start.to_rfc3339(),
                end: self.end.to_rfc3339(),
            }
            .into());
        }
        if self.leverage <= 0.0 {
            return Err(ConfigError::InvalidLeverage(self.leverage).into());
        }
        if self.initial_balance <= 0.0 {
            return Err(ConfigError::InvalidInitialBalance(self.initial_balance).into());
        }
        if self.parallel_days == 0 {
            return Err(ConfigError::Invalid("parallel_days must be >= 1".to_string()).into());
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be >= 1".to_string()).into());
        }
        if self.equity_sample_stride == 0 {
            return Err(
                ConfigError::Invalid("equity_sample_stride must be >= 1".to_string()).into(),
            );
        }
        if !self.use_tick_data && self.stream_ticks_from_disk {
            return Err(ConfigError::ContradictoryFlags(
                "stream_ticks_from_disk requires use_tick_data".to_string(),
            )
            .into());
        }
        let mut seen = std::collections::HashSet::new();
        for symbol in &self.symbols {
            if !seen.insert(symbol.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate symbol '{symbol}'")).into());
            }
        }
        Ok(())
    }

    /// Deterministic PRNG for stochastic strategy collaborators. The engine
    /// itself never draws from it; handing every strategy a generator seeded
    /// from the config keeps randomized strategies reproducible.
    pub fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed)
    }

    /// Per-symbol variant of [`BacktestConfig::rng`] so concurrent strategy
    /// workers do not share a stream.
    pub fn rng_for(&self, symbol_index: usize) -> StdRng {
        StdRng::seed_from_u64(self.seed ^ (symbol_index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }

    /// The archive vendor's name for a configured symbol.
    pub fn archive_symbol(&self, symbol: &str) -> String {
        self.archive
            .symbol_name_mapping
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| symbol.to_string())
    }

    /// The archive vendor's name for the configured broker.
    pub fn archive_broker(&self) -> String {
        self.archive
            .broker_name_mapping
            .get(&self.broker_name)
            .cloned()
            .unwrap_or_else(|| self.broker_name.clone())
    }
}
