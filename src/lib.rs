// === Public Modules (The Canonical Paths) ===
pub mod broker;
pub mod candles;
pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod loader;
pub mod recorder;
pub mod replay;
pub mod validation;

// === Private Implementation Details ===
mod archive;
mod cache;
mod macros;
mod schema;
mod stream;

// === Facades (Re-exporting internals) ===
// Expose the cache surface without making the whole module public.
pub use crate::archive::{ArchiveFetcher, ArchiveTransport, HttpTransport};
pub use crate::cache::{CacheVerdict, DayCache, RangeLoad};
pub use crate::schema::{
    Col, bars_schema, bars_to_frame, frame_to_bars, frame_to_ticks, ticks_schema, ticks_to_frame,
};
pub use crate::stream::{StreamProgress, TickStream};

// === Convenience ===
pub use crate::config::BacktestConfig;
pub use crate::error::{RewindError, RewindResult};
pub use crate::loader::ExchangeApiAdapter;
pub use crate::replay::{
    BacktestResult, Diagnostics, EngineView, PositionMonitor, ReplayController, Signal,
    StrategyInstance,
};
