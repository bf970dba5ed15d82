use polars::{
    df,
    frame::DataFrame,
    prelude::{
        DataType, Field, IntoLazy, PlSmallStr, Schema, SchemaRef, SortMultipleOptions, UnionArgs,
        concat,
    },
};
use std::sync::Arc;
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    domain::{Bar, Price, Tick},
    error::{DataError, RewindResult},
};

/// The standardized vocabulary for all day-file columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Col {
    /// The primary index: UTC instant in epoch milliseconds.
    Time,

    // === Bars ===
    Open,
    High,
    Low,
    Close,
    TickVolume,
    RealVolume,
    Spread,

    // === Ticks ===
    Bid,
    Ask,
    Last,
    Volume,
    Flags,
}

impl Col {
    pub fn name(self) -> PlSmallStr {
        let s: &'static str = self.into();
        s.into()
    }

    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Logical schema of a bars day file.
pub fn bars_schema() -> SchemaRef {
    Arc::new(Schema::from_iter([
        Field::new(Col::Time.name(), DataType::Int64),
        Field::new(Col::Open.name(), DataType::Float64),
        Field::new(Col::High.name(), DataType::Float64),
        Field::new(Col::Low.name(), DataType::Float64),
        Field::new(Col::Close.name(), DataType::Float64),
        Field::new(Col::TickVolume.name(), DataType::UInt64),
        Field::new(Col::RealVolume.name(), DataType::UInt64),
    ]))
}

/// Logical schema of a ticks day file.
pub fn ticks_schema() -> SchemaRef {
    Arc::new(Schema::from_iter([
        Field::new(Col::Time.name(), DataType::Int64),
        Field::new(Col::Bid.name(), DataType::Float64),
        Field::new(Col::Ask.name(), DataType::Float64),
        Field::new(Col::Last.name(), DataType::Float64),
        Field::new(Col::Volume.name(), DataType::UInt64),
        Field::new(Col::Flags.name(), DataType::UInt32),
    ]))
}

// ================================================================================================
// Row <-> Frame Conversion
// ================================================================================================

pub fn ticks_to_frame(ticks: &[Tick]) -> RewindResult<DataFrame> {
    let frame = df![
        Col::Time.as_str() => ticks.iter().map(|t| t.time_ms).collect::<Vec<_>>(),
        Col::Bid.as_str() => ticks.iter().map(|t| t.bid.0).collect::<Vec<_>>(),
        Col::Ask.as_str() => ticks.iter().map(|t| t.ask.0).collect::<Vec<_>>(),
        Col::Last.as_str() => ticks.iter().map(|t| t.last.0).collect::<Vec<_>>(),
        Col::Volume.as_str() => ticks.iter().map(|t| t.volume).collect::<Vec<_>>(),
        Col::Flags.as_str() => ticks.iter().map(|t| t.flags).collect::<Vec<_>>(),
    ]
    .map_err(DataError::from)?;
    Ok(frame)
}

pub fn frame_to_ticks(frame: &DataFrame) -> RewindResult<Vec<Tick>> {
    let time = frame
        .column(Col::Time.as_str())
        .map_err(|_| DataError::MissingColumn(Col::Time.as_str().to_string()))?
        .i64()
        .map_err(DataError::from)?;
    let bid = frame
        .column(Col::Bid.as_str())
        .map_err(|_| DataError::MissingColumn(Col::Bid.as_str().to_string()))?
        .f64()
        .map_err(DataError::from)?;
    let ask = frame
        .column(Col::Ask.as_str())
        .map_err(|_| DataError::MissingColumn(Col::Ask.as_str().to_string()))?
        .f64()
        .map_err(DataError::from)?;
    let last = frame
        .column(Col::Last.as_str())
        .map_err(|_| DataError::MissingColumn(Col::Last.as_str().to_string()))?
        .f64()
        .map_err(DataError::from)?;
    let volume = frame
        .column(Col::Volume.as_str())
        .map_err(|_| DataError::MissingColumn(Col::Volume.as_str().to_string()))?
        .u64()
        .map_err(DataError::from)?;
    let flags = frame
        .column(Col::Flags.as_str())
        .map_err(|_| DataError::MissingColumn(Col::Flags.as_str().to_string()))?
        .u32()
        .map_err(DataError::from)?;

    let mut ticks = Vec::with_capacity(frame.height());
    for i in 0..frame.height() {
        ticks.push(Tick {
            time_ms: time.get(i).ok_or_else(null_cell)?,
            bid: Price(bid.get(i).ok_or_else(null_cell)?),
            ask: Price(ask.get(i).ok_or_else(null_cell)?),
            last: Price(last.get(i).unwrap_or(0.0)),
            volume: volume.get(i).unwrap_or(0),
            flags: flags.get(i).unwrap_or(0),
        });
    }
    Ok(ticks)
}

pub fn bars_to_frame(bars: &[Bar]) -> RewindResult<DataFrame> {
    let frame = df![
        Col::Time.as_str() => bars.iter().map(|b| b.start_ms).collect::<Vec<_>>(),
        Col::Open.as_str() => bars.iter().map(|b| b.open.0).collect::<Vec<_>>(),
        Col::High.as_str() => bars.iter().map(|b| b.high.0).collect::<Vec<_>>(),
        Col::Low.as_str() => bars.iter().map(|b| b.low.0).collect::<Vec<_>>(),
        Col::Close.as_str() => bars.iter().map(|b| b.close.0).collect::<Vec<_>>(),
        Col::TickVolume.as_str() => bars.iter().map(|b| b.tick_volume).collect::<Vec<_>>(),
        Col::RealVolume.as_str() => bars.iter().map(|b| b.real_volume).collect::<Vec<_>>(),
    ]
    .map_err(DataError::from)?;
    Ok(frame)
}

pub fn frame_to_bars(frame: &DataFrame) -> RewindResult<Vec<Bar>> {
    let time = frame
        .column(Col::Time.as_str())
        .map_err(|_| DataError::MissingColumn(Col::Time.as_str().to_string()))?
        .i64()
        .map_err(DataError::from)?;
    let open = frame
        .column(Col::Open.as_str())
        .map_err(|_| DataError::MissingColumn(Col::Open.as_str().to_string()))?
        .f64()
        .map_err(DataError::from)?;
    let high = frame
        .column(Col::High.as_str())
        .map_err(|_| DataError::MissingColumn(Col::High.as_str().to_string()))?
        .f64()
        .map_err(DataError::from)?;
    let low = frame
        .column(Col::Low.as_str())
        .map_err(|_| DataError::MissingColumn(Col::Low.as_str().to_string()))?
        .f64()
        .map_err(DataError::from)?;
    let close = frame
        .column(Col::Close.as_str())
        .map_err(|_| DataError::MissingColumn(Col::Close.as_str().to_string()))?
        .f64()
        .map_err(DataError::from)?;
    let tick_volume = frame
        .column(Col::TickVolume.as_str())
        .map_err(|_| DataError::MissingColumn(Col::TickVolume.as_str().to_string()))?
        .u64()
        .map_err(DataError::from)?;
    let real_volume = frame
        .column(Col::RealVolume.as_str())
        .ok()
        .and_then(|c| c.u64().ok());

    let mut bars = Vec::with_capacity(frame.height());
    for i in 0..frame.height() {
        bars.push(Bar {
            start_ms: time.get(i).ok_or_else(null_cell)?,
            open: Price(open.get(i).ok_or_else(null_cell)?),
            high: Price(high.get(i).ok_or_else(null_cell)?),
            low: Price(low.get(i).ok_or_else(null_cell)?),
            close: Price(close.get(i).ok_or_else(null_cell)?),
            tick_volume: tick_volume.get(i).unwrap_or(0),
            real_volume: real_volume.as_ref().and_then(|c| c.get(i)),
        });
    }
    Ok(bars)
}

fn null_cell() -> DataError {
    DataError::DataFrame("unexpected null cell in day file".to_string())
}

// ================================================================================================
// Frame Combinators
// ================================================================================================

/// Concatenates day frames and sorts by the time column, rechunked into one
/// contiguous frame.
pub fn concat_days(frames: Vec<DataFrame>) -> RewindResult<DataFrame> {
    if frames.is_empty() {
        return Err(DataError::Empty("no day frames to concatenate".to_string()).into());
    }
    let lazy: Vec<_> = frames.into_iter().map(IntoLazy::lazy).collect();
    let combined = concat(
        lazy,
        UnionArgs {
            parallel: true,
            rechunk: true,
            ..Default::default()
        },
    )
    .map_err(DataError::from)?
    .sort([Col::Time.as_str()], SortMultipleOptions::default())
    .collect()
    .map_err(DataError::from)?;
    Ok(combined)
}

/// First and last value of the time column, if the frame is non-empty.
pub fn time_bounds(frame: &DataFrame) -> RewindResult<Option<(i64, i64)>> {
    if frame.height() == 0 {
        return Ok(None);
    }
    let time = frame
        .column(Col::Time.as_str())
        .map_err(|_| DataError::MissingColumn(Col::Time.as_str().to_string()))?
        .i64()
        .map_err(DataError::from)?;
    let first = time.get(0).ok_or_else(null_cell)?;
    let last = time.get(frame.height() - 1).ok_or_else(null_cell)?;
    Ok(Some((first, last)))
}

/// Restricts a frame to rows with `start_ms <= time < end_ms`.
pub fn slice_time_range(frame: DataFrame, start_ms: i64, end_ms: i64) -> RewindResult<DataFrame> {
    use polars::prelude::{col, lit};
    let out = frame
        .lazy()
        .filter(
            col(Col::Time.as_str())
                .gt_eq(lit(start_ms))
                .and(col(Col::Time.as_str()).lt(lit(end_ms))),
        )
        .collect()
        .map_err(DataError::from)?;
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    fn tick(time_ms: i64, bid: f64) -> Tick {
        Tick {
            time_ms,
            bid: Price(bid),
            ask: Price(bid + 0.0002),
            last: Price(0.0),
            volume: 0,
            flags: 0,
        }
    }

    #[test]
    fn tick_frame_round_trip_preserves_rows() {
        let ticks = vec![tick(1_000, 1.10), tick(2_000, 1.11), tick(3_000, 1.12)];
        let frame = ticks_to_frame(&ticks).unwrap();
        assert_eq!(frame.height(), 3);

        let back = frame_to_ticks(&frame).unwrap();
        assert_eq!(back, ticks);
    }

    #[test]
    fn bar_frame_round_trip_preserves_optional_real_volume() {
        let bars = vec![
            Bar {
                start_ms: 0,
                open: Price(1.0),
                high: Price(2.0),
                low: Price(0.5),
                close: Price(1.5),
                tick_volume: 10,
                real_volume: Some(42),
            },
            Bar {
                start_ms: 60_000,
                open: Price(1.5),
                high: Price(1.6),
                low: Price(1.4),
                close: Price(1.5),
                tick_volume: 4,
                real_volume: None,
            },
        ];
        let frame = bars_to_frame(&bars).unwrap();
        let back = frame_to_bars(&frame).unwrap();
        assert_eq!(back, bars);
    }

    #[test]
    fn concat_days_sorts_across_frames() {
        let day2 = ticks_to_frame(&[tick(90_000_000, 1.2)]).unwrap();
        let day1 = ticks_to_frame(&[tick(1_000, 1.1), tick(2_000, 1.1)]).unwrap();

        let combined = concat_days(vec![day2, day1]).unwrap();
        let (first, last) = time_bounds(&combined).unwrap().unwrap();
        assert_eq!(first, 1_000);
        assert_eq!(last, 90_000_000);
    }

    #[test]
    fn slice_time_range_is_half_open() {
        let frame =
            ticks_to_frame(&[tick(1_000, 1.0), tick(2_000, 1.0), tick(3_000, 1.0)]).unwrap();
        let sliced = slice_time_range(frame, 1_000, 3_000).unwrap();
        assert_eq!(sliced.height(), 2, "end bound is exclusive");
    }
}
