//! Interval scheduler — decides whether an endpoint is due for a poll.
//!
//! Cadence is charged at decision time: when `should_poll` answers yes it
//! records the attempt (and persists it) before returning, so a broken
//! endpoint cannot be hot-looped and a reader never sees a cache write
//! whose interval was not yet charged.
//!
//! Cadence is keyed by endpoint name only. "Per-symbol" endpoints share
//! one timestamp across all symbols, so the ingestion loop asks once per
//! endpoint per cycle and then polls every symbol for the due endpoints.

use anyhow::{bail, Result};
use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::EndpointPolicy;
use crate::state;

/// `endpoint name -> epoch seconds of the last poll attempt`.
pub type PollState = BTreeMap<String, i64>;

// ── Trading Calendar ────────────────────────────────────────────────

/// Regular-session hours of the exchange the symbols trade on.
#[derive(Debug, Clone)]
pub enum TradingCalendar {
    /// Mon–Fri 09:30–16:00 in the exchange timezone.
    Exchange(Tz),
    /// Used when the timezone cannot be resolved: scheduling fails open.
    AlwaysOpen,
}

impl TradingCalendar {
    pub fn from_tz_name(name: &str) -> Self {
        match name.parse::<Tz>() {
            Ok(tz) => TradingCalendar::Exchange(tz),
            Err(e) => {
                warn!(
                    timezone = %name,
                    error = %e,
                    "Unknown exchange timezone — treating market as always open"
                );
                TradingCalendar::AlwaysOpen
            }
        }
    }

    pub fn is_open(&self, at: DateTime<Utc>) -> bool {
        let tz = match self {
            TradingCalendar::AlwaysOpen => return true,
            TradingCalendar::Exchange(tz) => tz,
        };
        let local = at.with_timezone(tz);
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        let open = NaiveTime::from_hms_opt(9, 30, 0).unwrap_or_default();
        let close = NaiveTime::from_hms_opt(16, 0, 0).unwrap_or_default();
        let t = local.time();
        t >= open && t < close
    }
}

// ── Scheduler ───────────────────────────────────────────────────────

pub struct IntervalScheduler {
    state: PollState,
    policies: HashMap<String, EndpointPolicy>,
    calendar: TradingCalendar,
    path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl IntervalScheduler {
    pub fn load(
        path: PathBuf,
        policies: &[EndpointPolicy],
        calendar: TradingCalendar,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let state: PollState = state::load_or_recover(&path)?;
        Ok(Self {
            state,
            policies: policies.iter().map(|p| (p.name.clone(), p.clone())).collect(),
            calendar,
            path,
            clock,
        })
    }

    /// Minimum seconds between attempts for `policy` at time `at`.
    pub fn effective_interval(&self, policy: &EndpointPolicy, at: DateTime<Utc>) -> i64 {
        let base = policy.base_interval_sec as i64;
        if self.calendar.is_open(at) {
            base
        } else {
            base * policy.off_hours_multiplier as i64
        }
    }

    /// Decide whether `endpoint` is due and, if so, charge the interval.
    ///
    /// `force_first` makes an endpoint with no recorded attempt due
    /// immediately (first cycle after a fresh start).
    pub fn should_poll(&mut self, endpoint: &str, force_first: bool) -> Result<bool> {
        let Some(policy) = self.policies.get(endpoint) else {
            bail!("No policy registered for endpoint '{}'", endpoint);
        };
        let now = self.clock.now();
        let now_epoch = now.timestamp();

        let due = match self.state.get(endpoint) {
            None if force_first => true,
            // No history: epoch 0 is older than any interval.
            None => now_epoch >= self.effective_interval(policy, now),
            Some(&last) => now_epoch - last >= self.effective_interval(policy, now),
        };
        if !due {
            return Ok(false);
        }

        self.state.insert(endpoint.to_string(), now_epoch);
        if let Err(e) = state::atomic_write_json(&self.path, &self.state) {
            warn!(endpoint, error = %e, "Failed to persist poll state — interval charged in memory only");
        }
        debug!(endpoint, "Endpoint due");
        Ok(true)
    }

    pub fn last_attempt(&self, endpoint: &str) -> Option<i64> {
        self.state.get(endpoint).copied()
    }

    pub fn calendar(&self) -> &TradingCalendar {
        &self.calendar
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EndpointKind;

    // 2026-10-20 is a Tuesday; 15:00Z is 11:00 in New York (EDT).
    const MARKET_OPEN: &str = "2026-10-20T15:00:00Z";
    // Saturday.
    const WEEKEND: &str = "2026-10-24T15:00:00Z";

    fn policies() -> Vec<EndpointPolicy> {
        vec![
            EndpointPolicy::new("greeks", "/greeks/{symbol}", 1800, EndpointKind::Passthrough),
            EndpointPolicy::new("flow_alerts", "/flow/{symbol}", 300, EndpointKind::Flow),
        ]
    }

    fn scheduler(dir: &tempfile::TempDir, clock: &ManualClock) -> IntervalScheduler {
        IntervalScheduler::load(
            dir.path().join("poll_state.json"),
            &policies(),
            TradingCalendar::from_tz_name("America/New_York"),
            Arc::new(clock.clone()),
        )
        .unwrap()
    }

    #[test]
    fn test_calendar_hours() {
        let cal = TradingCalendar::from_tz_name("America/New_York");
        let at = |s: &str| DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc);
        assert!(cal.is_open(at(MARKET_OPEN)));
        assert!(cal.is_open(at("2026-10-20T13:30:00Z"))); // 09:30 EDT
        assert!(!cal.is_open(at("2026-10-20T13:29:59Z")));
        assert!(!cal.is_open(at("2026-10-20T20:00:00Z"))); // 16:00 EDT
        assert!(!cal.is_open(at(WEEKEND)));
    }

    #[test]
    fn test_unknown_timezone_fails_open() {
        let cal = TradingCalendar::from_tz_name("Mars/Olympus_Mons");
        assert!(matches!(cal, TradingCalendar::AlwaysOpen));
        let saturday = DateTime::parse_from_rfc3339(WEEKEND).unwrap().with_timezone(&Utc);
        assert!(cal.is_open(saturday));
    }

    #[test]
    fn test_greeks_scenario_during_market_hours() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(MARKET_OPEN);
        let mut sched = scheduler(&dir, &clock);

        // Establish the charge at t.
        assert!(sched.should_poll("greeks", true).unwrap());

        assert!(!sched.should_poll("greeks", false).unwrap());
        clock.advance_secs(600);
        assert!(!sched.should_poll("greeks", false).unwrap());
        clock.advance_secs(1201); // t + 1801
        assert!(sched.should_poll("greeks", false).unwrap());
    }

    #[test]
    fn test_no_double_charge_within_interval() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(MARKET_OPEN);
        let mut sched = scheduler(&dir, &clock);

        assert!(sched.should_poll("flow_alerts", false).unwrap());
        let charged_at = sched.last_attempt("flow_alerts").unwrap();
        for step in [1, 60, 238] {
            clock.advance_secs(step);
            assert!(!sched.should_poll("flow_alerts", false).unwrap());
        }
        assert_eq!(sched.last_attempt("flow_alerts"), Some(charged_at));
    }

    #[test]
    fn test_off_hours_interval_is_multiplied() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(WEEKEND);
        let sched = scheduler(&dir, &clock);
        let open = DateTime::parse_from_rfc3339(MARKET_OPEN).unwrap().with_timezone(&Utc);
        let closed = DateTime::parse_from_rfc3339(WEEKEND).unwrap().with_timezone(&Utc);

        for policy in policies() {
            assert_eq!(
                sched.effective_interval(&policy, closed),
                3 * sched.effective_interval(&policy, open)
            );
        }
    }

    #[test]
    fn test_off_hours_poll_waits_for_multiplied_interval() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(WEEKEND);
        let mut sched = scheduler(&dir, &clock);

        assert!(sched.should_poll("flow_alerts", true).unwrap());
        clock.advance_secs(300);
        assert!(!sched.should_poll("flow_alerts", false).unwrap());
        clock.advance_secs(600);
        assert!(sched.should_poll("flow_alerts", false).unwrap());
    }

    #[test]
    fn test_state_persists_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(MARKET_OPEN);
        {
            let mut sched = scheduler(&dir, &clock);
            assert!(sched.should_poll("greeks", true).unwrap());
        }
        clock.advance_secs(60);
        let mut reloaded = scheduler(&dir, &clock);
        assert!(!reloaded.should_poll("greeks", true).unwrap(), "force_first only applies without history");
    }

    #[test]
    fn test_unknown_endpoint_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(MARKET_OPEN);
        let mut sched = scheduler(&dir, &clock);
        assert!(sched.should_poll("nope", false).is_err());
    }
}
