//! Flow cache — per-symbol records with graceful-degradation merge.
//!
//! Layout of `flow_cache.json`:
//!
//! ```json
//! {
//!   "SPY": {
//!     "flow_alerts": { ... },
//!     "greeks": {},
//!     "_last_update": 1792508400,
//!     "_field_updated": { "flow_alerts": 1792508400, "greeks": 1792501200 },
//!     "_preserved": ["dark_pool"]
//!   },
//!   "_metadata": { "last_update": 1792508400, "record_count": 1 }
//! }
//! ```
//!
//! Merge rules:
//! - an empty poll result for a field whose stored value is younger than
//!   the freshness threshold keeps the stored value verbatim and lists the
//!   field under `_preserved`;
//! - anything else replaces the field, including an explicit empty value
//!   ("polled, provider has nothing"), which is never the same as absent;
//! - a value equal to the stored one is not a replacement, so its
//!   `_field_updated` stamp stays put.
//!
//! The whole file is read, merged and atomically replaced on every write.
//! Consumers get presence/absence plus timestamps; staleness vetoes are
//! theirs to make.

use anyhow::Result;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::state;

pub const METADATA_KEY: &str = "_metadata";
pub const LAST_UPDATE_KEY: &str = "_last_update";
pub const FIELD_UPDATED_KEY: &str = "_field_updated";
pub const PRESERVED_KEY: &str = "_preserved";

/// Which fields a merge replaced and which it kept.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub replaced: Vec<String>,
    pub preserved: Vec<String>,
}

pub struct FlowCache {
    path: PathBuf,
    freshness: Duration,
    clock: Arc<dyn Clock>,
}

impl FlowCache {
    pub fn new(path: PathBuf, freshness: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { path, freshness, clock }
    }

    /// Merge `fields` into the record for `symbol` and rewrite the file.
    pub fn merge(&self, symbol: &str, fields: BTreeMap<String, Value>) -> Result<MergeOutcome> {
        let mut doc: Map<String, Value> = state::load_or_recover(&self.path)?;
        let now = self.clock.epoch();
        let threshold = self.freshness.as_secs() as i64;

        let mut record = match doc.remove(symbol) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let record_stamp = record.get(LAST_UPDATE_KEY).and_then(Value::as_i64);
        let mut field_updated = match record.remove(FIELD_UPDATED_KEY) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let mut preserved: BTreeSet<String> = match record.remove(PRESERVED_KEY) {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => BTreeSet::new(),
        };

        let mut outcome = MergeOutcome::default();
        for (field, value) in fields {
            if field.starts_with('_') {
                warn!(symbol, field = %field, "Refusing to merge reserved field name");
                continue;
            }

            if is_empty(&value) {
                if let Some(existing) = record.get(&field) {
                    let stamp = field_updated
                        .get(&field)
                        .and_then(Value::as_i64)
                        .or(record_stamp);
                    let fresh = stamp.map(|ts| now - ts < threshold).unwrap_or(false);
                    if fresh && !is_empty(existing) {
                        debug!(symbol, field = %field, "Empty poll — keeping fresh cached value");
                        preserved.insert(field.clone());
                        outcome.preserved.push(field);
                        continue;
                    }
                }
            }

            let unchanged = record.get(&field) == Some(&value) && field_updated.contains_key(&field);
            if !unchanged {
                record.insert(field.clone(), value);
                field_updated.insert(field.clone(), json!(now));
            }
            preserved.remove(&field);
            outcome.replaced.push(field);
        }

        record.insert(LAST_UPDATE_KEY.into(), json!(now));
        record.insert(FIELD_UPDATED_KEY.into(), Value::Object(field_updated));
        record.insert(PRESERVED_KEY.into(), json!(preserved));
        doc.insert(symbol.to_string(), Value::Object(record));

        let record_count = doc.keys().filter(|k| !k.starts_with('_')).count();
        doc.insert(
            METADATA_KEY.into(),
            json!({ "last_update": now, "record_count": record_count }),
        );

        state::atomic_write_json(&self.path, &doc)?;
        Ok(outcome)
    }

    /// Current record for `symbol`, read-only.
    pub fn get(&self, symbol: &str) -> Result<Option<Map<String, Value>>> {
        let doc: Option<Map<String, Value>> = state::read_json(&self.path)?;
        Ok(doc.and_then(|mut d| match d.remove(symbol) {
            Some(Value::Object(map)) => Some(map),
            _ => None,
        }))
    }

    /// Seconds since `field` of `symbol` was last replaced.
    pub fn field_age(&self, symbol: &str, field: &str) -> Result<Option<i64>> {
        let Some(record) = self.get(symbol)? else {
            return Ok(None);
        };
        let stamp = record
            .get(FIELD_UPDATED_KEY)
            .and_then(|m| m.get(field))
            .and_then(Value::as_i64)
            .or_else(|| record.get(LAST_UPDATE_KEY).and_then(Value::as_i64));
        Ok(stamp.map(|ts| self.clock.epoch() - ts))
    }
}

/// "Provider had nothing": null, empty object/array/string.
pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(m) => m.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
