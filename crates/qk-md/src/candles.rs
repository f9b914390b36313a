//! Candle series updated from terminal data sources.
//!
//! The terminal hands out candles two ways: as a fetched window (the
//! `getCandles` call, columnar JSON) and as single forming-candle pushes (the
//! `OnCandle` event). [`CandleSeries`] reconciles both: a fetched window is
//! *spliced* onto the stored series — it must overlap the stored tail, which
//! it then replaces — and a push either rewrites the forming last candle or
//! appends a new one. A window that does not reach back far enough to overlap
//! cannot be joined; the caller reacts by fetching a larger window.
//!
//! Timestamps are packed decimal time codes (`YYYYMMDDHHMMSSmmm`, see
//! [`qk_core::decoder::parse_timestamp`]), so ordering comparisons are plain
//! integer comparisons.

use anyhow::{Context, Result, bail};
use serde_json::Value;

use crate::json_util::{as_f64, as_i64, as_u64};

/// Time unit of a candle timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeframeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

/// A candle timeframe, e.g. `1m`, `4H`, `D`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeframe {
    pub period: u32,
    pub unit: TimeframeUnit,
}

impl Timeframe {
    /// Parses the config form: digits followed by a unit suffix
    /// (`s`/`m`/`H`/`D`, case-insensitive).
    pub fn parse(s: &str) -> Result<Self> {
        // The suffix char may be multi-byte, so split on its boundary.
        let Some((split, suffix)) = s.char_indices().next_back() else {
            bail!("illegal timeframe: {s}");
        };
        let unit = match suffix {
            's' | 'S' => TimeframeUnit::Seconds,
            'm' | 'M' => TimeframeUnit::Minutes,
            'h' | 'H' => TimeframeUnit::Hours,
            'd' | 'D' => TimeframeUnit::Days,
            _ => bail!("illegal timeframe: {s}"),
        };
        let period: u32 = s[..split].parse().with_context(|| format!("illegal timeframe: {s}"))?;
        if period == 0 {
            bail!("illegal timeframe: {s}");
        }
        Ok(Self { period, unit })
    }

    /// The key suffix used in data-source and callback keys, e.g. `5m`, `1H`.
    pub fn key_suffix(&self) -> String {
        let letter = match self.unit {
            TimeframeUnit::Seconds => 's',
            TimeframeUnit::Minutes => 'm',
            TimeframeUnit::Hours => 'H',
            TimeframeUnit::Days => 'D',
        };
        format!("{}{letter}", self.period)
    }

    /// The terminal's data-source interval, counted in minutes.
    ///
    /// Only minute and hour timeframes exist as terminal data sources.
    pub fn interval(&self) -> Result<u32> {
        match self.unit {
            TimeframeUnit::Minutes => Ok(self.period),
            TimeframeUnit::Hours => Ok(60 * self.period),
            _ => bail!("timeframe {} has no terminal data-source interval", self.key_suffix()),
        }
    }
}

/// One candle: packed time code, OHLC, volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle {
    pub time_code: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

/// Outcome of splicing a fetched window onto a stored series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Splice {
    /// The window was joined; this many candles were replaced or appended.
    Joined(usize),
    /// The window does not overlap the stored series and cannot be joined.
    Disjoint,
}

/// A bounded, time-ordered candle series.
#[derive(Debug)]
pub struct CandleSeries {
    candles: Vec<Candle>,
    /// Length at which the series is cut back to `target_size`.
    truncation_size: usize,
    target_size: usize,
}

impl CandleSeries {
    pub fn new(truncation_size: usize, target_size: usize) -> Self {
        Self { candles: Vec::new(), truncation_size, target_size }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    /// Splices a freshly fetched window onto the series.
    ///
    /// The window must be time-ordered. If the series is empty the window is
    /// adopted whole. Otherwise the window's first candle must not lie beyond
    /// the stored last candle; the stored tail from that point on is replaced
    /// by the window (re-fetched candles overwrite their earlier versions,
    /// the forming candle included). A window starting past the stored end
    /// leaves a gap and is reported [`Splice::Disjoint`].
    pub fn splice(&mut self, window: &[Candle]) -> Result<Splice> {
        if window.windows(2).any(|w| w[0].time_code >= w[1].time_code) {
            bail!("fetched window is not time-ordered");
        }
        let Some(first) = window.first() else {
            return Ok(Splice::Joined(0));
        };
        if let Some(stored_last) = self.candles.last() {
            if stored_last.time_code < first.time_code {
                return Ok(Splice::Disjoint);
            }
            let keep = self.candles.partition_point(|c| c.time_code < first.time_code);
            self.candles.truncate(keep);
        }
        self.candles.extend_from_slice(window);
        self.truncate_if_needed();
        Ok(Splice::Joined(window.len()))
    }

    /// Applies one pushed candle: rewrites the forming last candle when the
    /// time codes match, appends when it is newer. An older candle is
    /// rejected (`false`) — pushes must never reorder the series.
    pub fn update_last(&mut self, candle: Candle) -> bool {
        match self.candles.last_mut() {
            None => self.candles.push(candle),
            Some(last) if last.time_code == candle.time_code => *last = candle,
            Some(last) if last.time_code < candle.time_code => self.candles.push(candle),
            Some(_) => return false,
        }
        self.truncate_if_needed();
        true
    }

    fn truncate_if_needed(&mut self) {
        if self.truncation_size > 0 && self.candles.len() > self.truncation_size {
            let cut = self.candles.len() - self.target_size.min(self.candles.len());
            self.candles.drain(..cut);
        }
    }
}

/// Decodes the terminal's columnar candles JSON:
/// `{"size": N, "T": [...], "O": [...], "H": [...], "L": [...], "C": [...], "V": [...]}`
/// with timestamps as strings and numbers possibly string-encoded.
pub fn decode_candles(json: &Value) -> Result<Vec<Candle>> {
    let size = as_u64(json.get("size")).context("candles JSON has no size")? as usize;
    let column = |name: &str| -> Result<&[Value]> {
        json.get(name)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .with_context(|| format!("candles JSON has no {name} array"))
    };
    let t = column("T")?;
    let o = column("O")?;
    let h = column("H")?;
    let l = column("L")?;
    let c = column("C")?;
    let v = column("V")?;

    // size comes off the wire, so cap the preallocation at what the
    // columns can actually hold.
    let mut candles = Vec::with_capacity(size.min(t.len()));
    for i in 0..size {
        let timestamp = t
            .get(i)
            .and_then(Value::as_str)
            .with_context(|| format!("candle {i}: T is not a string"))?;
        let field = |name: &str, col: &[Value]| -> Result<f64> {
            as_f64(col.get(i)).with_context(|| format!("candle {i}: bad {name}"))
        };
        candles.push(Candle {
            time_code: qk_core::decoder::parse_timestamp(timestamp)
                .with_context(|| format!("candle {i}: bad T"))?,
            open: field("O", o)?,
            high: field("H", h)?,
            low: field("L", l)?,
            close: field("C", c)?,
            volume: as_i64(v.get(i)).with_context(|| format!("candle {i}: bad V"))?,
        });
    }
    Ok(candles)
}
