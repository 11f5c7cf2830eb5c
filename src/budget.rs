//! Persisted call budget — pre-flight per-minute / per-day accounting.
//!
//! The tracker is the only gate in front of the network. Every call the
//! ingestion loop (or a retry inside it) wants to make asks
//! `try_reserve` first; an allowed reservation is charged immediately,
//! before the request goes out, so a flaky upstream cannot be retried
//! into a self-inflicted ban.
//!
//! State lives in `usage_state.json` and survives restarts. Counters reset
//! when the UTC date rolls over.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::BudgetLimits;
use crate::state;

/// Floor of the bound on remembered minute-window timestamps; a larger
/// per-minute cap raises the bound to the cap.
const MINUTE_WINDOW_MAX: usize = 1_000;
const MINUTE_SECS: i64 = 60;

/// On-disk budget state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetState {
    /// UTC date (`YYYY-MM-DD`) the daily counters belong to.
    pub date: String,
    pub calls_today: u64,
    #[serde(default)]
    pub by_endpoint: BTreeMap<String, u64>,
    /// Epoch seconds of calls in the trailing minute.
    #[serde(default)]
    pub minute_window: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    MinuteCap,
    DailyCap,
    EndpointCap,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DenyReason::MinuteCap => "minute_cap",
            DenyReason::DailyCap => "daily_cap",
            DenyReason::EndpointCap => "endpoint_cap",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDecision {
    Allow,
    Deny(DenyReason),
}

/// Point-in-time view of budget consumption, for logs.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetUsage {
    pub date: String,
    pub calls_today: u64,
    pub effective_daily_cap: u64,
    pub minute_calls: usize,
    pub by_endpoint: BTreeMap<String, u64>,
}

// ── Tracker ─────────────────────────────────────────────────────────

pub struct BudgetTracker {
    state: Mutex<BudgetState>,
    limits: BudgetLimits,
    path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl BudgetTracker {
    /// Load persisted state (recovering from corruption) and roll it
    /// forward to today. An unreadable state file is an error: starting
    /// from zero would overspend the day.
    pub fn load(path: PathBuf, limits: BudgetLimits, clock: Arc<dyn Clock>) -> Result<Self> {
        let loaded: BudgetState = state::load_or_recover(&path)?;
        let tracker = Self {
            state: Mutex::new(loaded),
            limits,
            path,
            clock,
        };
        {
            let mut st = tracker.state.lock().unwrap();
            tracker.roll_over(&mut st);
            info!(
                date = %st.date,
                calls_today = st.calls_today,
                effective_daily_cap = tracker.effective_daily_cap(),
                "Budget state loaded"
            );
        }
        Ok(tracker)
    }

    /// Daily cap after the safety buffer is applied.
    pub fn effective_daily_cap(&self) -> u64 {
        // Epsilon keeps e.g. 100 × 0.95 at 95 despite binary rounding.
        (self.limits.per_day_cap as f64 * self.limits.safety_buffer + 1e-9).floor() as u64
    }

    /// Check all caps and, if every one has headroom, charge the call.
    pub fn try_reserve(&self, endpoint: &str) -> BudgetDecision {
        let mut st = self.state.lock().unwrap();
        self.roll_over(&mut st);
        let now = self.clock.epoch();
        prune_minute_window(&mut st.minute_window, now);

        if st.calls_today >= self.effective_daily_cap() {
            return BudgetDecision::Deny(DenyReason::DailyCap);
        }
        if let Some(cap) = self.limits.per_endpoint_daily_cap {
            let used = st.by_endpoint.get(endpoint).copied().unwrap_or(0);
            if used >= cap as u64 {
                return BudgetDecision::Deny(DenyReason::EndpointCap);
            }
        }
        if st.minute_window.len() >= self.limits.per_minute_cap as usize {
            return BudgetDecision::Deny(DenyReason::MinuteCap);
        }

        st.calls_today += 1;
        *st.by_endpoint.entry(endpoint.to_string()).or_insert(0) += 1;
        st.minute_window.push(now);
        let bound = self.minute_window_bound();
        if st.minute_window.len() > bound {
            let excess = st.minute_window.len() - bound;
            st.minute_window.drain(..excess);
        }

        if let Err(e) = state::atomic_write_json(&self.path, &*st) {
            warn!(error = %e, "Failed to persist budget state — counters kept in memory");
        }
        BudgetDecision::Allow
    }

    /// Never below the per-minute cap, so truncation cannot hide calls
    /// the cap check needs to see.
    fn minute_window_bound(&self) -> usize {
        MINUTE_WINDOW_MAX.max(self.limits.per_minute_cap as usize)
    }

    pub fn usage(&self) -> BudgetUsage {
        let mut st = self.state.lock().unwrap();
        self.roll_over(&mut st);
        prune_minute_window(&mut st.minute_window, self.clock.epoch());
        BudgetUsage {
            date: st.date.clone(),
            calls_today: st.calls_today,
            effective_daily_cap: self.effective_daily_cap(),
            minute_calls: st.minute_window.len(),
            by_endpoint: st.by_endpoint.clone(),
        }
    }

    /// Reset daily counters if the UTC date changed since the last call.
    fn roll_over(&self, st: &mut BudgetState) {
        let today = self.clock.now().format("%Y-%m-%d").to_string();
        if st.date != today {
            if !st.date.is_empty() {
                info!(
                    previous_date = %st.date,
                    previous_calls = st.calls_today,
                    "UTC date rolled over — daily budget reset"
                );
            }
            st.date = today;
            st.calls_today = 0;
            st.by_endpoint.clear();
        }
    }
}

/// Drop timestamps outside the trailing 60 seconds.
fn prune_minute_window(window: &mut Vec<i64>, now: i64) {
    window.retain(|&t| now - t < MINUTE_SECS);
}
