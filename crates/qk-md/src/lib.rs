//! # qk-md
//!
//! Market-data consumers for the QUIK terminal bridge.
//!
//! Everything here sits on top of the qk-core request/response and event
//! primitives; no transport or correlation logic lives in this crate.
//!
//! - [`candles`] — timeframes, candle series with splice semantics, and the
//!   columnar `getCandles` decoder
//! - [`storage`] — keyed data-source series kept current from fetches and
//!   `OnCandle` pushes
//! - [`quotes`] — level-2 book snapshots from `getQuoteLevel2`
//! - [`json_util`] — string-or-number JSON field helpers

pub mod candles;
pub mod json_util;
pub mod quotes;
pub mod storage;

pub use candles::{Candle, CandleSeries, Splice, Timeframe};
pub use quotes::{QuoteEntry, QuoteLevel2};
pub use storage::CandlesStorage;
