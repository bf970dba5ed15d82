use std::num::{ParseFloatError, ParseIntError};

use thiserror::Error;

pub type RewindResult<T> = Result<T, RewindError>;

#[derive(Debug, Error)]
pub enum RewindError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Io(#[from] IoError),
}

impl RewindError {
    /// Maps the error kind onto the process exit codes of the orchestration
    /// surface: 1 = config error, 2 = data error, 3 = runtime abort.
    pub fn exit_code(&self) -> i32 {
        match self {
            RewindError::Config(_) => 1,
            RewindError::Cache(_) | RewindError::Archive(_) | RewindError::Data(_) => 2,
            RewindError::Runtime(_) => 3,
            RewindError::Broker(_) | RewindError::Io(_) => 2,
        }
    }
}

/// Errors detected while validating a [`crate::config::BacktestConfig`].
/// All of these are fatal before startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid date range: start {start} is not before end {end}")]
    InvalidDateRange { start: String, end: String },

    #[error("No symbols configured")]
    NoSymbols,

    #[error("Unknown symbol: '{0}'")]
    UnknownSymbol(String),

    #[error("Too many symbols: {0} exceeds the 64-symbol availability bitmap")]
    TooManySymbols(usize),

    #[error("Leverage must be positive, got {0}")]
    InvalidLeverage(f64),

    #[error("Initial balance must be positive, got {0}")]
    InvalidInitialBalance(f64),

    #[error("Contradictory flags: {0}")]
    ContradictoryFlags(String),

    #[error("Archive host '{0}' is not in the trusted-source allowlist")]
    UntrustedArchiveHost(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Structural cache failures. Invalid-but-recoverable day states (missing
/// metadata, staleness, start gaps) travel as verdicts, not errors, because
/// the loader repairs them locally.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Metadata timestamps outside the file's UTC day: {0}")]
    MetaOutOfDay(String),

    #[error("Failed to write day file: {0}")]
    WriteFailed(String),

    #[error("Failed to read day file: {0}")]
    ReadFailed(String),
}

/// Errors from the external tick archive chain. Retried with backoff; a
/// terminal failure escalates to [`DataError::Unavailable`] for that day.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Archive download failed for {url}: {msg}")]
    Download { url: String, msg: String },

    #[error("Archive request timed out: {0}")]
    Timeout(String),

    #[error("Archive parse failed: {0}")]
    Parse(String),

    #[error("Archive rejected by sanity check: {0}")]
    Sanity(String),

    #[error("Archive fetching disabled by configuration")]
    Disabled,
}

/// Errors related to data loading, frame handling, and availability.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("Data unavailable for {symbol} on {day}: all tiers exhausted")]
    Unavailable { symbol: String, day: String },

    #[error("Data frame error: {0}")]
    DataFrame(String),

    #[error("Missing column '{0}' in data frame")]
    MissingColumn(String),

    #[error("Failed timestamp conversion: {0}")]
    TimestampConversion(String),

    #[error("Unsorted input: {0}")]
    Unsorted(String),

    #[error("Empty frame where data was required: {0}")]
    Empty(String),

    #[error("Failed to parse integer: {0}")]
    ParseInt(#[from] ParseIntError),

    #[error("Failed to parse float: {0}")]
    ParseFloat(#[from] ParseFloatError),

    #[error("Failed to parse enum: {0}")]
    ParseEnum(#[from] strum::ParseError),
}

impl From<polars::error::PolarsError> for DataError {
    fn from(value: polars::error::PolarsError) -> Self {
        DataError::DataFrame(value.to_string())
    }
}

impl From<polars::error::PolarsError> for RewindError {
    fn from(value: polars::error::PolarsError) -> Self {
        RewindError::Data(value.into())
    }
}

/// Errors raised by the simulated broker outside the order-rejection path.
/// Order rejections are *returned* as retcodes, never raised.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Unknown ticket: {0}")]
    UnknownTicket(u64),

    #[error("Unknown symbol in broker: '{0}'")]
    UnknownSymbol(String),
}

/// Errors that abort a running replay. A partial ledger is still returned.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Barrier sync timed out after {0} ms")]
    BarrierTimeout(u64),

    #[error("Equity kill threshold breached: equity {equity:.2} below {threshold:.2}")]
    EquityKill { equity: f64, threshold: f64 },

    #[error("Replay aborted: {0}")]
    Aborted(String),
}

/// Errors related to file I/O and serialization.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("IO operation failed")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed")]
    Json(#[from] serde_json::Error),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("Failed to create writer: {0}")]
    WriterCreation(String),

    #[error("Failed to create reader: {0}")]
    ReaderCreation(String),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exit_codes_follow_the_orchestration_contract() {
        let config: RewindError = ConfigError::NoSymbols.into();
        assert_eq!(config.exit_code(), 1);

        let data: RewindError = DataError::Unavailable {
            symbol: "EURUSD".to_string(),
            day: "2025-01-15".to_string(),
        }
        .into();
        assert_eq!(data.exit_code(), 2);

        let runtime: RewindError = RuntimeError::BarrierTimeout(5000).into();
        assert_eq!(runtime.exit_code(), 3);
    }
}
