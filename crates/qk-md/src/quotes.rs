//! Level-2 order book snapshots from the terminal.
//!
//! Decodes the `getQuoteLevel2`-shaped JSON: `bid` and `offer` arrays of
//! `{price, quantity}` entries, with numbers possibly string-encoded. The
//! terminal does not promise level ordering, so best bid/offer scan for the
//! extreme price instead of trusting position.

use anyhow::{Context, Result};
use serde_json::Value;

use crate::json_util::{f64_field, i64_field};

/// One price level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuoteEntry {
    pub price: f64,
    pub quantity: i64,
}

/// A two-sided book snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteLevel2 {
    pub bids: Vec<QuoteEntry>,
    pub offers: Vec<QuoteEntry>,
}

impl QuoteLevel2 {
    /// Highest-priced bid, if any.
    pub fn best_bid(&self) -> Option<&QuoteEntry> {
        self.bids
            .iter()
            .reduce(|best, e| if e.price > best.price { e } else { best })
    }

    /// Lowest-priced offer, if any.
    pub fn best_offer(&self) -> Option<&QuoteEntry> {
        self.offers
            .iter()
            .reduce(|best, e| if e.price < best.price { e } else { best })
    }
}

/// Decodes a `getQuoteLevel2` result.
pub fn decode_quote_level2(json: &Value) -> Result<QuoteLevel2> {
    Ok(QuoteLevel2 {
        bids: decode_side(json, "bid")?,
        offers: decode_side(json, "offer")?,
    })
}

fn decode_side(json: &Value, side: &str) -> Result<Vec<QuoteEntry>> {
    // An empty side may arrive as an empty string instead of an array.
    let Some(levels) = json.get(side).and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    levels
        .iter()
        .enumerate()
        .map(|(i, level)| {
            Ok(QuoteEntry {
                price: f64_field(level, "price")
                    .with_context(|| format!("{side}[{i}]: bad price"))?,
                quantity: i64_field(level, "quantity")
                    .with_context(|| format!("{side}[{i}]: bad quantity"))?,
            })
        })
        .collect()
}
