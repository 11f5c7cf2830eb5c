//! Payload normalization — condenses raw provider rows into the typed
//! summaries the scoring engine reads from the cache.
//!
//! Thresholds are fixed: a call (or at-ask) share of at least 60 % is
//! bullish, at most 40 % bearish, anything between neutral. Conviction is
//! the distance from 50/50 scaled to 0–100, halved when fewer than three
//! rows back it.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::EndpointKind;

const BULLISH_SHARE: f64 = 0.60;
const BEARISH_SHARE: f64 = 0.40;
const MIN_ROWS_FOR_FULL_CONVICTION: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Bullish,
    Bearish,
    Neutral,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSummary {
    pub sentiment: Sentiment,
    pub conviction: u8,
    pub call_premium: f64,
    pub put_premium: f64,
    pub total_premium: f64,
    pub alert_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DarkPoolSummary {
    pub sentiment: Sentiment,
    pub conviction: u8,
    pub total_notional: f64,
    pub total_size: f64,
    pub vwap: Option<f64>,
    pub print_count: u64,
}

/// Normalize `raw` for an endpoint of kind `kind`.
///
/// An empty or row-less payload becomes `{}`: "polled, provider has
/// nothing", which the cache stores distinctly from "never polled".
pub fn normalize(kind: EndpointKind, raw: &Value) -> Value {
    let rows = rows(raw);
    match kind {
        EndpointKind::Flow => match summarize_flow(rows) {
            Some(summary) => json!(summary),
            None => json!({}),
        },
        EndpointKind::DarkPool => match summarize_dark_pool(rows) {
            Some(summary) => json!(summary),
            None => json!({}),
        },
        EndpointKind::Passthrough => {
            let data = raw.get("data").unwrap_or(raw);
            if crate::cache::is_empty(data) {
                json!({})
            } else {
                data.clone()
            }
        }
    }
}

pub fn summarize_flow(rows: &[Value]) -> Option<FlowSummary> {
    if rows.is_empty() {
        return None;
    }
    let (mut calls, mut puts) = (0.0, 0.0);
    for row in rows {
        let premium = number(row, "total_premium").or_else(|| number(row, "premium")).unwrap_or(0.0);
        match row.get("type").and_then(Value::as_str).map(str::to_ascii_lowercase).as_deref() {
            Some("call") => calls += premium,
            Some("put") => puts += premium,
            _ => {}
        }
    }
    let count = rows.len() as u64;
    let (sentiment, conviction) = score(calls, puts, count);
    Some(FlowSummary {
        sentiment,
        conviction,
        call_premium: calls,
        put_premium: puts,
        total_premium: calls + puts,
        alert_count: count,
    })
}

pub fn summarize_dark_pool(rows: &[Value]) -> Option<DarkPoolSummary> {
    if rows.is_empty() {
        return None;
    }
    let (mut notional, mut size_total) = (0.0, 0.0);
    let (mut at_ask, mut at_bid) = (0.0, 0.0);
    for row in rows {
        let (Some(price), Some(size)) = (number(row, "price"), number(row, "size")) else {
            continue;
        };
        let value = price * size;
        notional += value;
        size_total += size;
        if let Some(ask) = number(row, "nbbo_ask") {
            if price >= ask {
                at_ask += value;
                continue;
            }
        }
        if let Some(bid) = number(row, "nbbo_bid") {
            if price <= bid {
                at_bid += value;
            }
        }
    }
    let count = rows.len() as u64;
    let (sentiment, conviction) = score(at_ask, at_bid, count);
    Some(DarkPoolSummary {
        sentiment,
        conviction,
        total_notional: notional,
        total_size: size_total,
        vwap: (size_total > 0.0).then(|| notional / size_total),
        print_count: count,
    })
}

/// Sentiment and conviction from bullish vs bearish weight.
fn score(bullish: f64, bearish: f64, rows: u64) -> (Sentiment, u8) {
    let total = bullish + bearish;
    if total <= 0.0 {
        return (Sentiment::Neutral, 0);
    }
    let share = bullish / total;
    let sentiment = if share >= BULLISH_SHARE {
        Sentiment::Bullish
    } else if share <= BEARISH_SHARE {
        Sentiment::Bearish
    } else {
        Sentiment::Neutral
    };
    let mut conviction = ((share - 0.5).abs() * 200.0).round().clamp(0.0, 100.0);
    if rows < MIN_ROWS_FOR_FULL_CONVICTION {
        conviction = (conviction / 2.0).floor();
    }
    (sentiment, conviction as u8)
}

/// Rows of a payload: `{"data": [...]}` or a bare array.
fn rows(raw: &Value) -> &[Value] {
    raw.get("data")
        .and_then(Value::as_array)
        .or_else(|| raw.as_array())
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Providers send numbers as JSON numbers or numeric strings.
fn number(row: &Value, key: &str) -> Option<f64> {
    match row.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
