use polars::prelude::{LazyFrame, ScanArgsParquet};
use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::debug;

use crate::{
    domain::{SymbolId, Tick},
    error::{CacheError, RewindResult},
    loader::DayFileSet,
    schema,
};

/// Rough bytes-per-row used when a day file has no row-count metadata.
const ROW_SIZE_HINT: u64 = 48;

/// Shared progress counters: `(ticks_produced, ticks_estimated)`.
///
/// `ticks_estimated` is computed once at open from per-file row counts (or a
/// file-size heuristic) and never revised; the produced counter is updated on
/// every emission so an external progress layer can poll it.
#[derive(Debug, Default)]
pub struct StreamProgress {
    produced: AtomicU64,
    estimated: AtomicU64,
}

impl StreamProgress {
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.produced.load(Ordering::Relaxed),
            self.estimated.load(Ordering::Relaxed),
        )
    }
}

// ================================================================================================
// Per-Symbol Source
// ================================================================================================

enum Backing {
    /// Lazy chunked reads over an ordered per-day file list.
    Files {
        files: Vec<crate::loader::DayFileRef>,
        file_idx: usize,
        /// Row offset of the next chunk within the current file.
        row_offset: usize,
    },
    /// Fully materialized ticks (eager mode and synthetic minute replay).
    Eager { ticks: Vec<Tick>, pos: usize },
}

struct SymbolSource {
    backing: Backing,
    /// Current batch, drained front to back.
    chunk: Vec<Tick>,
    chunk_pos: usize,
    chunk_size: usize,
}

impl SymbolSource {
    fn next_tick(&mut self) -> RewindResult<Option<Tick>> {
        loop {
            if self.chunk_pos < self.chunk.len() {
                let tick = self.chunk[self.chunk_pos];
                self.chunk_pos += 1;
                return Ok(Some(tick));
            }
            if !self.refill()? {
                return Ok(None);
            }
        }
    }

    /// Loads the next batch; `false` when the source is exhausted.
    fn refill(&mut self) -> RewindResult<bool> {
        self.chunk.clear();
        self.chunk_pos = 0;

        match &mut self.backing {
            Backing::Eager { ticks, pos } => {
                if *pos >= ticks.len() {
                    return Ok(false);
                }
                let end = (*pos + self.chunk_size).min(ticks.len());
                self.chunk.extend_from_slice(&ticks[*pos..end]);
                *pos = end;
                Ok(true)
            }
            Backing::Files {
                files,
                file_idx,
                row_offset,
            } => {
                while *file_idx < files.len() {
                    let file = &files[*file_idx];
                    let path = file.path.to_string_lossy().into_owned();
                    let frame = LazyFrame::scan_parquet(
                        polars::prelude::PlPath::new(path.as_str()),
                        ScanArgsParquet::default(),
                    )
                    .map_err(|e| CacheError::ReadFailed(format!("{path}: {e}")))?
                    .slice(*row_offset as i64, self.chunk_size as u32)
                    .collect()
                    .map_err(|e| CacheError::ReadFailed(format!("{path}: {e}")))?;

                    if frame.height() == 0 {
                        // Day exhausted; move to the next file.
                        *file_idx += 1;
                        *row_offset = 0;
                        continue;
                    }
                    *row_offset += frame.height();
                    self.chunk = schema::frame_to_ticks(&frame)?;
                    return Ok(true);
                }
                Ok(false)
            }
        }
    }
}

// ================================================================================================
// TickStream
// ================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct HeapKey {
    time_ms: i64,
    symbol: usize,
}

/// Heap slot ordered by `(time, symbol)` only; the payload tick does not
/// participate in the ordering.
struct HeapEntry {
    key: HeapKey,
    tick: Tick,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

/// A global, chronologically merged tick sequence across all symbols with
/// bounded memory.
///
/// Contract: every emitted tick satisfies `tick.time >= last_emitted.time`;
/// ties resolve by symbol-list order. Peak residency is one chunk per symbol
/// plus the pending batch. The stream is not restartable; a second pass
/// requires reopening.
pub struct TickStream {
    sources: Vec<SymbolSource>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    progress: StreamProgress,
    last_emitted_ms: i64,
    primed: bool,
    /// Bit `i` set = source `i` has no ticks left.
    dry_mask: u64,
}

impl TickStream {
    /// Opens a lazy stream over per-symbol day-file sets, in symbol-list
    /// order (the set index becomes the [`SymbolId`] and tie-break rank).
    pub fn open(sets: Vec<DayFileSet>, chunk_size: usize) -> RewindResult<Self> {
        let mut estimated = 0u64;
        let mut sources = Vec::with_capacity(sets.len());
        for set in sets {
            for file in &set.files {
                estimated += if file.row_count > 0 {
                    file.row_count
                } else {
                    std::fs::metadata(&file.path)
                        .map(|m| m.len() / ROW_SIZE_HINT)
                        .unwrap_or(0)
                };
            }
            sources.push(SymbolSource {
                backing: Backing::Files {
                    files: set.files,
                    file_idx: 0,
                    row_offset: 0,
                },
                chunk: Vec::new(),
                chunk_pos: 0,
                chunk_size: chunk_size.max(1),
            });
        }
        debug!(symbols = sources.len(), estimated, "Tick stream opened");
        Ok(Self {
            sources,
            heap: BinaryHeap::new(),
            progress: {
                let p = StreamProgress::default();
                p.estimated.store(estimated, Ordering::Relaxed);
                p
            },
            last_emitted_ms: i64::MIN,
            primed: false,
            dry_mask: 0,
        })
    }

    /// Opens an eager stream over pre-materialized per-symbol tick vectors
    /// (the non-streaming mode, and the synthetic minute-replay feed). Each
    /// vector must already be chronologically sorted.
    pub fn from_ticks(per_symbol: Vec<Vec<Tick>>) -> Self {
        let estimated: u64 = per_symbol.iter().map(|t| t.len() as u64).sum();
        let sources = per_symbol
            .into_iter()
            .map(|ticks| SymbolSource {
                backing: Backing::Eager { ticks, pos: 0 },
                chunk: Vec::new(),
                chunk_pos: 0,
                chunk_size: 16_384,
            })
            .collect();
        Self {
            sources,
            heap: BinaryHeap::new(),
            progress: {
                let p = StreamProgress::default();
                p.estimated.store(estimated, Ordering::Relaxed);
                p
            },
            last_emitted_ms: i64::MIN,
            primed: false,
            dry_mask: 0,
        }
    }

    pub fn progress(&self) -> &StreamProgress {
        &self.progress
    }

    fn prime(&mut self) -> RewindResult<()> {
        for idx in 0..self.sources.len() {
            if let Some(tick) = self.sources[idx].next_tick()? {
                self.heap.push(Reverse(HeapEntry {
                    key: HeapKey {
                        time_ms: tick.time_ms,
                        symbol: idx,
                    },
                    tick,
                }));
            } else {
                self.dry_mask |= 1u64 << idx;
            }
        }
        self.primed = true;
        Ok(())
    }

    /// Pops the globally next tick; `Ok(None)` when every source is dry.
    pub fn next_tick(&mut self) -> RewindResult<Option<(SymbolId, Tick)>> {
        if !self.primed {
            self.prime()?;
        }
        let Some(Reverse(entry)) = self.heap.pop() else {
            return Ok(None);
        };
        let HeapEntry { key, tick } = entry;
        debug_assert!(
            tick.time_ms >= self.last_emitted_ms,
            "tick stream went backwards"
        );
        self.last_emitted_ms = tick.time_ms;

        // Refill the source the emitted tick came from.
        if let Some(next) = self.sources[key.symbol].next_tick()? {
            self.heap.push(Reverse(HeapEntry {
                key: HeapKey {
                    time_ms: next.time_ms,
                    symbol: key.symbol,
                },
                tick: next,
            }));
        } else {
            self.dry_mask |= 1u64 << key.symbol;
        }

        self.progress.produced.fetch_add(1, Ordering::Relaxed);
        Ok(Some((SymbolId(key.symbol), tick)))
    }

    /// Bitmask of sources with nothing left to emit. A symbol's bit turns on
    /// together with (or before) its final tick being handed out.
    pub fn dry_mask(&self) -> u64 {
        self.dry_mask
    }

    /// Timestamp of the next tick without consuming it.
    pub fn peek_time_ms(&mut self) -> RewindResult<Option<i64>> {
        if !self.primed {
            self.prime()?;
        }
        Ok(self.heap.peek().map(|Reverse(entry)| entry.key.time_ms))
    }
}
