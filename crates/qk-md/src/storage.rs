//! Keyed storage of data-source candle series.
//!
//! [`CandlesStorage`] owns one [`CandleSeries`] per `CLASS:SEC:TF` key and
//! drives the terminal side of each: `initDataSource`/`getDataSourceSize`
//! script chunks, `getCandles` fetches with escalating window sizes, and the
//! `OnCandle` subscription. It is a [`QuikListener`], so registering a clone
//! on the dispatch task keeps the series current from pushes while
//! application tasks read them through the same handle.
//!
//! The recommended bring-up for callback-driven sources: init the data
//! sources, wait until they report a non-zero size, subscribe to `OnCandle`,
//! then run one full refresh; pushes keep the forming candle current from
//! there on.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::AHashMap;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use qk_core::connect::QuikConnect;
use qk_core::decoder;
use qk_core::listener::{QuikEvent, QuikListener};

use crate::candles::{Candle, CandleSeries, Splice, Timeframe};
use crate::json_util::{as_i64, f64_field, i64_field};

/// When a series holds fewer candles than this, a refresh skips the small
/// windows and goes straight to the largest one.
const ESTABLISHED_LEN: usize = 10;

/// One terminal data source and its stored series.
struct DataSource {
    class_code: String,
    sec_code: String,
    timeframe: Timeframe,
    /// Ascending fetch window sizes; a refresh escalates through them until a
    /// window splices.
    update_sizes: Vec<u32>,
    use_callback: bool,
    series: CandleSeries,
}

impl DataSource {
    /// Parses one config entry:
    /// `CLASS:SEC:TF:[size1,...,sizeN]:truncation:target:use_callback`.
    fn parse(entry: &str) -> Result<Self> {
        let parts: Vec<&str> = entry.split(':').collect();
        let [class_code, sec_code, tf, sizes, truncation, target, callback] = parts[..] else {
            bail!("illegal candles entry: {entry}");
        };
        let timeframe = Timeframe::parse(tf)?;
        let Some(sizes) = sizes.strip_prefix('[').and_then(|s| s.strip_suffix(']')) else {
            bail!("illegal update sizes in: {entry}");
        };
        let update_sizes: Vec<u32> = sizes
            .split(',')
            .map(|s| s.trim().parse().with_context(|| format!("illegal update size {s:?}")))
            .collect::<Result<_>>()?;
        if update_sizes.is_empty() || update_sizes.windows(2).any(|w| w[0] >= w[1]) {
            bail!("update sizes must be ascending and non-empty: {entry}");
        }
        let truncation_size: usize = truncation.parse().context("illegal truncation size")?;
        let target_size: usize = target.parse().context("illegal target size")?;
        let use_callback: bool = callback.parse().context("illegal use_callback flag")?;
        Ok(Self {
            class_code: class_code.to_string(),
            sec_code: sec_code.to_string(),
            timeframe,
            update_sizes,
            use_callback,
            series: CandleSeries::new(truncation_size, target_size),
        })
    }

    fn key(&self) -> String {
        format!("{}:{}:{}", self.class_code, self.sec_code, self.timeframe.key_suffix())
    }
}

/// Shared handle over the keyed candle series.
///
/// Cloning is cheap; all clones see the same series. The inner lock is held
/// only for map lookups and series mutation, never across a request await.
#[derive(Clone)]
pub struct CandlesStorage {
    connect: Arc<QuikConnect>,
    response_timeout: Duration,
    sources: Arc<Mutex<AHashMap<String, DataSource>>>,
    label: String,
}

impl CandlesStorage {
    /// Builds the storage from config entries (see [`DataSource::parse`]).
    pub fn from_entries(
        connect: Arc<QuikConnect>,
        response_timeout: Duration,
        entries: &[String],
    ) -> Result<Self> {
        let mut sources = AHashMap::new();
        for entry in entries {
            let source = DataSource::parse(entry)?;
            // Data sources need a terminal interval; reject s/D here rather
            // than at the first request.
            source.timeframe.interval()?;
            sources.insert(source.key(), source);
        }
        Ok(Self {
            label: connect.client_id().to_string(),
            connect,
            response_timeout,
            sources: Arc::new(Mutex::new(sources)),
        })
    }

    /// All configured keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.sources.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Runs `f` against one series, if the key exists.
    pub fn with_series<R>(&self, key: &str, f: impl FnOnce(&CandleSeries) -> R) -> Option<R> {
        self.sources.lock().unwrap().get(key).map(|s| f(&s.series))
    }

    /// Initializes every data source in the terminal.
    ///
    /// Returns the per-key outcome: `"ok"` or the terminal's error text.
    pub async fn init_data_sources(&self) -> Result<AHashMap<String, String>> {
        let chunk = self.build_chunk("initDataSource");
        self.keyed_string_map(&chunk).await
    }

    /// Asks the terminal how many candles each data source currently holds.
    pub async fn data_source_sizes(&self) -> Result<AHashMap<String, u64>> {
        let chunk = self.build_chunk("getDataSourceSize");
        let map = self.keyed_value_map(&chunk).await?;
        map.into_iter()
            .map(|(key, value)| {
                let size = as_i64(Some(&value))
                    .with_context(|| format!("non-numeric size for {key}: {value}"))?;
                Ok((key, size.max(0) as u64))
            })
            .collect()
    }

    /// Builds `return { ["key"] = fname("CLASS", "SEC", interval), ... }`
    /// over all sources, keys sorted for a stable chunk.
    fn build_chunk(&self, fname: &str) -> String {
        let sources = self.sources.lock().unwrap();
        let mut keys: Vec<&String> = sources.keys().collect();
        keys.sort();
        let mut chunk = String::from("return { ");
        for key in keys {
            let s = &sources[key];
            // interval() was validated at construction.
            let interval = s.timeframe.interval().unwrap_or(0);
            chunk.push_str(&format!(
                "[\"{key}\"] = {fname}(\"{}\", \"{}\", {interval}), ",
                s.class_code, s.sec_code
            ));
        }
        chunk.push('}');
        chunk
    }

    async fn keyed_value_map(&self, chunk: &str) -> Result<AHashMap<String, Value>> {
        let reply = self.connect.eval_mn(chunk, self.response_timeout).await?;
        let frame = reply.recv().await?;
        let result = decoder::result(&frame)?;
        let object = result
            .as_object()
            .with_context(|| format!("expected a keyed object, got: {result}"))?;
        Ok(object.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    async fn keyed_string_map(&self, chunk: &str) -> Result<AHashMap<String, String>> {
        let map = self.keyed_value_map(chunk).await?;
        Ok(map
            .into_iter()
            .map(|(key, value)| {
                let text = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, text)
            })
            .collect())
    }

    /// Refreshes one series from `getCandles`, escalating through the
    /// configured window sizes until a window splices.
    ///
    /// An established series starts from the smallest window; an empty or
    /// short one goes straight to the largest. Returns [`Splice::Disjoint`]
    /// when even the largest window could not be joined.
    pub async fn refresh(&self, key: &str) -> Result<Splice> {
        let (class_code, sec_code, interval, sizes) = {
            let sources = self.sources.lock().unwrap();
            let s = sources.get(key).with_context(|| format!("unknown candles key {key}"))?;
            let start = if s.series.len() >= ESTABLISHED_LEN { 0 } else { s.update_sizes.len() - 1 };
            (
                s.class_code.clone(),
                s.sec_code.clone(),
                s.timeframe.interval()?,
                s.update_sizes[start..].to_vec(),
            )
        };
        for size in sizes {
            let args = json!([class_code, sec_code, interval, size]);
            let reply = self.connect.call_mn("getCandles", args, self.response_timeout).await?;
            let frame = reply.recv().await?;
            let window = crate::candles::decode_candles(decoder::result(&frame)?)
                .with_context(|| format!("bad getCandles result for {key}"))?;

            let mut sources = self.sources.lock().unwrap();
            let s = sources.get_mut(key).with_context(|| format!("unknown candles key {key}"))?;
            match s.series.splice(&window)? {
                Splice::Joined(n) => {
                    debug!("[{}] {key}: spliced {n} candles (window {size})", self.label);
                    return Ok(Splice::Joined(n));
                }
                Splice::Disjoint => {
                    debug!("[{}] {key}: window {size} too short, escalating", self.label);
                }
            }
        }
        warn!("[{}] {key}: no window spliced", self.label);
        Ok(Splice::Disjoint)
    }

    /// Refreshes every configured series.
    pub async fn refresh_all(&self) -> Result<()> {
        for key in self.keys() {
            self.refresh(&key).await?;
        }
        Ok(())
    }

    /// Subscribes to `OnCandle` pushes; fails on a refused subscription.
    pub async fn subscribe_on_candle(&self) -> Result<()> {
        self.set_on_candle_subscription(true).await
    }

    /// Cancels the `OnCandle` subscription.
    pub async fn unsubscribe_on_candle(&self) -> Result<()> {
        self.set_on_candle_subscription(false).await
    }

    async fn set_on_candle_subscription(&self, enable: bool) -> Result<()> {
        let filter = if enable { "function() return true end" } else { "function() return false end" };
        let reply = self.connect.subscribe("OnCandle", filter, self.response_timeout).await?;
        let frame = reply.recv().await?;
        if !decoder::status(&frame) {
            bail!(
                "cannot {} OnCandle: {}",
                if enable { "subscribe to" } else { "unsubscribe from" },
                decoder::err(&frame).unwrap_or("unspecified error")
            );
        }
        info!("[{}] OnCandle subscription: {enable}", self.label);
        Ok(())
    }

    /// Applies one pushed `OnCandle` frame to the matching series.
    fn apply_on_candle(&self, frame: &Value) {
        let Some(candle) = frame.get("arg1") else { return };
        let (Some(class_code), Some(sec_code), Some(tf_minutes)) = (
            candle.get("class_code").and_then(Value::as_str),
            candle.get("sec_code").and_then(Value::as_str),
            as_i64(candle.get("timeframe")),
        ) else {
            warn!("[{}] malformed OnCandle push: {frame}", self.label);
            return;
        };
        let decoded = (|| -> Option<Candle> {
            Some(Candle {
                time_code: qk_core::decoder::parse_timestamp(
                    candle.get("T").and_then(Value::as_str)?,
                )
                .ok()?,
                open: f64_field(candle, "O")?,
                high: f64_field(candle, "H")?,
                low: f64_field(candle, "L")?,
                close: f64_field(candle, "C")?,
                volume: i64_field(candle, "V")?,
            })
        })();
        let Some(decoded) = decoded else {
            warn!("[{}] malformed OnCandle push: {frame}", self.label);
            return;
        };

        let mut sources = self.sources.lock().unwrap();
        // Pushes report the timeframe in minutes; an hour source is keyed
        // with the H suffix, so fall back to it for timeframe >= 60.
        let key = format!("{class_code}:{sec_code}:{tf_minutes}m");
        let mut source = sources.get_mut(&key);
        if source.is_none() && tf_minutes >= 60 {
            let key = format!("{class_code}:{sec_code}:{}H", tf_minutes / 60);
            source = sources.get_mut(&key);
        }
        let Some(source) = source else { return };
        if !source.use_callback {
            return;
        }
        if !source.series.update_last(decoded) {
            debug!(
                "[{}] {}: out-of-order OnCandle push dropped (T={})",
                self.label,
                source.key(),
                decoded.time_code
            );
        }
    }
}

#[async_trait]
impl QuikListener for CandlesStorage {
    fn on_event(&mut self, event: &QuikEvent) {
        if let QuikEvent::Callback(frame) = event {
            if frame.get("callback").and_then(Value::as_str) == Some("OnCandle") {
                self.apply_on_candle(frame);
            }
        }
    }
}
