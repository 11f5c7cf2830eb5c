//! Ingestion loop — the daemon's only worker.
//!
//! One cooperative loop, no pool. Each cycle:
//!
//!   1. ask the scheduler which endpoints are due (this charges their
//!      intervals and persists `poll_state.json` before any cache write);
//!   2. walk the symbols serially, with an inter-symbol delay;
//!   3. for each due endpoint: reserve budget, fetch through the retry
//!      executor, normalize, merge into the cache.
//!
//! Cadence is keyed by endpoint name only. Once an endpoint is due, every
//! symbol is polled for it in the same cycle; (symbol, endpoint) pairs do
//! not have independent clocks.
//!
//! A failure in one (symbol, endpoint) unit is logged and the cycle moves
//! on. A provider 429 that survives every retry parks the work in the
//! deferred queue and puts the loop into a cooldown; a local daily-cap
//! denial parks the loop until the provider's daily reset. While parked
//! the cache file is left as is, so consumers keep reading the last good
//! values.

use anyhow::Result;
use chrono::{DateTime, NaiveTime, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::budget::{BudgetDecision, BudgetTracker, DenyReason};
use crate::cache::FlowCache;
use crate::clock::Clock;
use crate::config::{Config, EndpointPolicy};
use crate::error::{ErrorClass, FetchError};
use crate::fetcher::{FetchRequest, Fetcher};
use crate::normalize;
use crate::queue::{DeferredWorkQueue, OperationDescriptor, QueueItem};
use crate::retry::{RetryExecutor, RetryPolicy, Sleeper};
use crate::scheduler::{IntervalScheduler, TradingCalendar};
use crate::shutdown::ShutdownToken;

// ── Types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LoopTiming {
    pub inter_symbol_delay: Duration,
    pub cycle_interval: Duration,
    pub rate_limit_cooldown: Duration,
    pub rate_limited_check: Duration,
    pub daily_reset_offset: Duration,
}

impl LoopTiming {
    pub fn from_config(config: &Config) -> Self {
        Self {
            inter_symbol_delay: config.inter_symbol_delay,
            cycle_interval: config.cycle_interval,
            rate_limit_cooldown: config.rate_limit_cooldown,
            rate_limited_check: config.rate_limited_check,
            daily_reset_offset: config.daily_reset_offset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkReason {
    /// Provider kept answering 429.
    ProviderThrottled,
    /// Local daily budget spent.
    DailyCap,
}

impl ParkReason {
    fn as_str(&self) -> &'static str {
        match self {
            ParkReason::ProviderThrottled => "provider_throttled",
            ParkReason::DailyCap => "daily_cap",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    Normal,
    RateLimited { until: DateTime<Utc>, reason: ParkReason },
}

/// Result of one (symbol, endpoint) unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    /// Fetched and merged; `preserved` when the merge kept a fresh cached
    /// value over an empty answer.
    Stored { preserved: bool },
    /// Non-retryable failure, recorded as an explicit empty value.
    RecordedEmpty,
    /// Transient failure (or a failed write); cache untouched.
    Failed,
    Blocked(DenyReason),
    Deferred,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub due_endpoints: Vec<String>,
    pub polled: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub blocked: u32,
    pub deferred: u32,
    pub stopped_early: bool,
}

impl CycleReport {
    fn record(&mut self, outcome: &UnitOutcome) {
        match outcome {
            UnitOutcome::Blocked(_) => self.blocked += 1,
            UnitOutcome::Stored { .. } => {
                self.polled += 1;
                self.succeeded += 1;
            }
            UnitOutcome::RecordedEmpty | UnitOutcome::Failed => {
                self.polled += 1;
                self.failed += 1;
            }
            UnitOutcome::Deferred => {
                self.polled += 1;
                self.deferred += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub dropped: u32,
}

// ── Loop ────────────────────────────────────────────────────────────

pub struct IngestionLoop {
    symbols: Vec<String>,
    policies: Vec<EndpointPolicy>,
    scheduler: IntervalScheduler,
    budget: BudgetTracker,
    retry: RetryExecutor,
    fetcher: Arc<dyn Fetcher>,
    queue: DeferredWorkQueue,
    cache: FlowCache,
    shutdown: ShutdownToken,
    clock: Arc<dyn Clock>,
    timing: LoopTiming,
    mode: LoopMode,
    first_cycle: bool,
}

impl IngestionLoop {
    /// Load every owned state file from the configured state directory.
    /// The caller must already hold the instance lock.
    pub fn new(
        config: &Config,
        fetcher: Arc<dyn Fetcher>,
        sleeper: Arc<dyn Sleeper>,
        clock: Arc<dyn Clock>,
        shutdown: ShutdownToken,
    ) -> Result<Self> {
        let paths = config.paths();
        let calendar = TradingCalendar::from_tz_name(&config.market_tz);

        Ok(Self {
            symbols: config.symbols.clone(),
            policies: config.policies.clone(),
            scheduler: IntervalScheduler::load(
                paths.poll_state.clone(),
                &config.policies,
                calendar,
                Arc::clone(&clock),
            )?,
            budget: BudgetTracker::load(paths.usage_state.clone(), config.budget.clone(), Arc::clone(&clock))?,
            retry: RetryExecutor::new(RetryPolicy::default(), sleeper),
            fetcher,
            queue: DeferredWorkQueue::load(paths.deferred_queue.clone())?,
            cache: FlowCache::new(paths.cache.clone(), config.freshness, Arc::clone(&clock)),
            shutdown,
            clock,
            timing: LoopTiming::from_config(config),
            mode: LoopMode::Normal,
            first_cycle: true,
        })
    }

    pub fn mode(&self) -> LoopMode {
        self.mode
    }

    pub fn deferred_len(&self) -> usize {
        self.queue.size()
    }

    pub fn budget(&self) -> &BudgetTracker {
        &self.budget
    }

    /// Run until a stop is requested.
    pub async fn run(&mut self) {
        self.shutdown.arm();
        info!(
            symbols = ?self.symbols,
            endpoints = ?self.policies.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            deferred = self.queue.size(),
            "Ingestion loop entered"
        );

        loop {
            if self.shutdown.is_stopped() {
                break;
            }

            if let LoopMode::RateLimited { until, reason } = self.mode {
                let now = self.clock.now();
                if now >= until {
                    info!(reason = reason.as_str(), "Leaving rate-limited mode");
                    self.mode = LoopMode::Normal;
                } else {
                    let remaining = (until - now).to_std().unwrap_or_default();
                    let nap = remaining.min(self.timing.rate_limited_check);
                    debug!(
                        reason = reason.as_str(),
                        until = %until,
                        nap_secs = nap.as_secs(),
                        "Rate-limited — serving cached data only"
                    );
                    if self.shutdown.sleep(nap).await {
                        break;
                    }
                    continue;
                }
            }

            let report = self.run_cycle().await;
            if report.stopped_early {
                break;
            }
            if self.mode != LoopMode::Normal {
                continue;
            }
            if self.shutdown.sleep(self.timing.cycle_interval).await {
                break;
            }
        }

        let usage = self.budget.usage();
        info!(
            calls_today = usage.calls_today,
            effective_daily_cap = usage.effective_daily_cap,
            deferred = self.queue.size(),
            "Ingestion loop stopped cleanly"
        );
    }

    /// One pass over the due endpoints for every symbol.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let force_first = std::mem::replace(&mut self.first_cycle, false);
        let mut report = CycleReport::default();

        let mut due = Vec::new();
        for policy in &self.policies {
            match self.scheduler.should_poll(&policy.name, force_first) {
                Ok(true) => due.push(policy.clone()),
                Ok(false) => {}
                Err(e) => warn!(endpoint = %policy.name, error = %e, "Scheduler refused endpoint"),
            }
        }
        report.due_endpoints = due.iter().map(|p| p.name.clone()).collect();
        if due.is_empty() {
            debug!("No endpoints due this cycle");
            return report;
        }

        let symbols = self.symbols.clone();
        'symbols: for (i, symbol) in symbols.iter().enumerate() {
            if self.shutdown.is_stopped() {
                report.stopped_early = true;
                break;
            }
            if i > 0 && self.shutdown.sleep(self.timing.inter_symbol_delay).await {
                report.stopped_early = true;
                break;
            }

            for policy in &due {
                if self.shutdown.is_stopped() {
                    report.stopped_early = true;
                    break 'symbols;
                }
                let outcome = self.poll_unit(symbol, policy, true).await;
                report.record(&outcome);
                if self.mode != LoopMode::Normal {
                    break 'symbols;
                }
            }
        }

        let usage = self.budget.usage();
        info!(
            due = ?report.due_endpoints,
            polled = report.polled,
            succeeded = report.succeeded,
            failed = report.failed,
            blocked = report.blocked,
            deferred = report.deferred,
            calls_today = usage.calls_today,
            "Cycle complete"
        );
        report
    }

    /// Fetch one (symbol, endpoint) pair and write the result through.
    ///
    /// Every attempt, retries included, reserves budget first. With
    /// `defer_on_rate_limit` a 429 that outlives the retries is queued
    /// and the loop parks; without it (operator drain) it is just a
    /// failure, so a drained item is attempted at most once.
    pub async fn poll_unit(
        &mut self,
        symbol: &str,
        policy: &EndpointPolicy,
        defer_on_rate_limit: bool,
    ) -> UnitOutcome {
        let req = FetchRequest::for_policy(policy, symbol);
        let budget = &self.budget;
        let fetcher = &self.fetcher;

        let result = self
            .retry
            .execute(|attempt| {
                let req = &req;
                async move {
                    if let BudgetDecision::Deny(reason) = budget.try_reserve(&req.endpoint) {
                        return Err(FetchError::Blocked {
                            endpoint: req.endpoint.clone(),
                            reason,
                        });
                    }
                    if attempt > 0 {
                        debug!(symbol = %req.symbol, endpoint = %req.endpoint, attempt, "Retrying");
                    }
                    fetcher.fetch(req).await
                }
            })
            .await;

        let field = policy.cache_field().to_string();
        let err = match result {
            Ok(resp) => {
                let summary = normalize::normalize(policy.kind, &resp.body);
                return match self.cache.merge(symbol, BTreeMap::from([(field, summary)])) {
                    Ok(merged) => UnitOutcome::Stored {
                        preserved: !merged.preserved.is_empty(),
                    },
                    Err(e) => {
                        error!(symbol, endpoint = %policy.name, error = %e, "Cache write failed");
                        UnitOutcome::Failed
                    }
                };
            }
            Err(err) => err,
        };

        match err.class() {
            ErrorClass::Blocked => {
                let FetchError::Blocked { reason, .. } = err else {
                    return UnitOutcome::Failed;
                };
                warn!(
                    event = "budget_blocked",
                    symbol,
                    endpoint = %policy.name,
                    reason = %reason,
                    "Call blocked by local budget"
                );
                if reason == DenyReason::DailyCap {
                    let until = next_reset(self.clock.now(), self.timing.daily_reset_offset);
                    self.park(ParkReason::DailyCap, until);
                }
                UnitOutcome::Blocked(reason)
            }
            ErrorClass::NonRetryable => {
                warn!(symbol, endpoint = %policy.name, error = %err, "Non-retryable failure — recording empty");
                match self.cache.merge(symbol, BTreeMap::from([(field, json!({}))])) {
                    Ok(_) => UnitOutcome::RecordedEmpty,
                    Err(e) => {
                        error!(symbol, endpoint = %policy.name, error = %e, "Cache write failed");
                        UnitOutcome::Failed
                    }
                }
            }
            ErrorClass::Transient => {
                warn!(symbol, endpoint = %policy.name, error = %err, "Transient failure — cache left as is");
                UnitOutcome::Failed
            }
            ErrorClass::RateLimited if defer_on_rate_limit => {
                let item = QueueItem::new(
                    OperationDescriptor {
                        symbol: symbol.to_string(),
                        endpoint: policy.name.clone(),
                    },
                    err.to_string(),
                    self.clock.now(),
                );
                let id = item.id;
                if let Err(e) = self.queue.enqueue(item) {
                    error!(symbol, endpoint = %policy.name, error = %e, "Failed to persist deferred work");
                } else {
                    warn!(%id, symbol, endpoint = %policy.name, depth = self.queue.size(), "Rate limited — work deferred");
                }
                let until = self.clock.now()
                    + chrono::Duration::from_std(self.timing.rate_limit_cooldown)
                        .unwrap_or_else(|_| chrono::Duration::minutes(15));
                self.park(ParkReason::ProviderThrottled, until);
                UnitOutcome::Deferred
            }
            ErrorClass::RateLimited => {
                warn!(symbol, endpoint = %policy.name, error = %err, "Rate limited on deferred retry — dropped");
                UnitOutcome::Failed
            }
        }
    }

    /// Operator-triggered retry of deferred work: each queued item is
    /// dequeued and attempted once. Nothing is re-enqueued.
    pub async fn drain_deferred(&mut self) -> DrainReport {
        let mut report = DrainReport::default();
        let pending = self.queue.size();
        info!(pending, "Draining deferred work");

        for _ in 0..pending {
            if self.shutdown.is_stopped() || self.mode != LoopMode::Normal {
                break;
            }
            let item = match self.queue.dequeue() {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Failed to dequeue deferred work");
                    break;
                }
            };
            let Some(policy) = self.policies.iter().find(|p| p.name == item.operation.endpoint).cloned() else {
                warn!(id = %item.id, endpoint = %item.operation.endpoint, "Deferred item for unknown endpoint — dropped");
                report.dropped += 1;
                continue;
            };

            report.attempted += 1;
            match self.poll_unit(&item.operation.symbol, &policy, false).await {
                UnitOutcome::Stored { .. } => report.succeeded += 1,
                outcome => {
                    info!(id = %item.id, ?outcome, "Deferred item not stored");
                    report.failed += 1;
                }
            }
        }

        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            dropped = report.dropped,
            remaining = self.queue.size(),
            "Deferred drain finished"
        );
        report
    }

    fn park(&mut self, reason: ParkReason, until: DateTime<Utc>) {
        warn!(reason = reason.as_str(), until = %until, "Entering rate-limited mode");
        self.mode = LoopMode::RateLimited { until, reason };
    }
}

/// Next provider daily reset: UTC midnight plus `offset`, strictly after `now`.
pub fn next_reset(now: DateTime<Utc>, offset: Duration) -> DateTime<Utc> {
    let offset = chrono::Duration::from_std(offset).unwrap_or_else(|_| chrono::Duration::zero());
    let today = now.date_naive().and_time(NaiveTime::MIN).and_utc() + offset;
    if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PRESERVED_KEY;
    use crate::clock::ManualClock;
    use crate::config::EndpointKind;
    use crate::fetcher::FetchResponse;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;

    // Tuesday, 11:00 in New York.
    const MARKET_OPEN: &str = "2026-10-20T15:00:00Z";

    type Responder = Box<dyn Fn(&FetchRequest) -> Result<Value, u16> + Send + Sync>;

    struct ScriptedFetcher {
        respond: Responder,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedFetcher {
        fn new(respond: impl Fn(&FetchRequest) -> Result<Value, u16> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                respond: Box::new(respond),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }

        fn calls_for(&self, endpoint: &str) -> usize {
            self.calls().iter().filter(|(_, e)| e == endpoint).count()
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, req: &FetchRequest) -> Result<FetchResponse, FetchError> {
            self.calls
                .lock()
                .unwrap()
                .push((req.symbol.clone(), req.endpoint.clone()));
            match (self.respond)(req) {
                Ok(body) => Ok(FetchResponse {
                    status: 200,
                    body,
                    quota: None,
                    latency_ms: 1,
                }),
                Err(status) => Err(FetchError::Status {
                    endpoint: req.endpoint.clone(),
                    status,
                    body: String::new(),
                }),
            }
        }
    }

    struct NoSleep;

    #[async_trait]
    impl Sleeper for NoSleep {
        async fn sleep(&self, _delay: Duration) {}
    }

    fn config(dir: &std::path::Path, extra: &[(&str, &str)]) -> Config {
        let state_dir = dir.to_str().unwrap().to_string();
        let extra: Vec<(String, String)> = extra.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let mut cfg = Config::from_lookup(|k| {
            if k == "FLOWD_STATE_DIR" {
                return Some(state_dir.clone());
            }
            extra.iter().find(|(key, _)| key == k).map(|(_, v)| v.clone())
        })
        .unwrap();
        cfg.policies = vec![
            EndpointPolicy::new("flow_alerts", "/flow/{symbol}", 300, EndpointKind::Flow),
            EndpointPolicy::new("greeks", "/greeks/{symbol}", 1800, EndpointKind::Passthrough),
        ];
        cfg.inter_symbol_delay = Duration::ZERO;
        cfg.cycle_interval = Duration::ZERO;
        cfg
    }

    fn build(cfg: &Config, fetcher: Arc<ScriptedFetcher>, clock: &ManualClock) -> IngestionLoop {
        IngestionLoop::new(
            cfg,
            fetcher,
            Arc::new(NoSleep),
            Arc::new(clock.clone()),
            ShutdownToken::new(),
        )
        .unwrap()
    }

    fn flow_payload() -> Value {
        json!({"data": [
            {"type": "call", "total_premium": 900.0},
            {"type": "call", "total_premium": 100.0},
            {"type": "put", "total_premium": 100.0},
        ]})
    }

    fn ok_everywhere(req: &FetchRequest) -> Result<Value, u16> {
        match req.endpoint.as_str() {
            "flow_alerts" => Ok(flow_payload()),
            _ => Ok(json!({"data": [{"gamma": 1.5}]})),
        }
    }

    #[tokio::test]
    async fn test_first_cycle_polls_everything_then_respects_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &[("FLOWD_SYMBOLS", "SPY,QQQ")]);
        let clock = ManualClock::at(MARKET_OPEN);
        let fetcher = ScriptedFetcher::new(ok_everywhere);
        let mut ingest = build(&cfg, fetcher.clone(), &clock);

        let report = ingest.run_cycle().await;
        assert_eq!(report.due_endpoints, vec!["flow_alerts", "greeks"]);
        assert_eq!(report.succeeded, 4);
        assert_eq!(fetcher.calls().len(), 4);

        let cache = FlowCache::new(cfg.paths().cache, cfg.freshness, Arc::new(clock.clone()));
        let spy = cache.get("SPY").unwrap().unwrap();
        assert_eq!(spy["flow_alerts"]["sentiment"], "bullish");
        assert_eq!(spy["greeks"], json!([{"gamma": 1.5}]));

        // Intervals were charged: nothing is due yet.
        clock.advance_secs(60);
        let report = ingest.run_cycle().await;
        assert!(report.due_endpoints.is_empty());
        assert_eq!(fetcher.calls().len(), 4);

        // flow_alerts comes due after 300 s, greeks does not.
        clock.advance_secs(240);
        let report = ingest.run_cycle().await;
        assert_eq!(report.due_endpoints, vec!["flow_alerts"]);
        assert_eq!(fetcher.calls_for("flow_alerts"), 4);
        assert_eq!(fetcher.calls_for("greeks"), 2);
    }

    #[tokio::test]
    async fn test_poll_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &[("FLOWD_SYMBOLS", "SPY")]);
        let clock = ManualClock::at(MARKET_OPEN);
        let fetcher = ScriptedFetcher::new(ok_everywhere);

        build(&cfg, fetcher.clone(), &clock).run_cycle().await;
        clock.advance_secs(10);

        let report = build(&cfg, fetcher.clone(), &clock).run_cycle().await;
        assert!(report.due_endpoints.is_empty(), "recorded attempts must not be forced again");
        assert_eq!(fetcher.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_records_explicit_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &[("FLOWD_SYMBOLS", "SPY")]);
        let clock = ManualClock::at(MARKET_OPEN);
        let fetcher = ScriptedFetcher::new(|req| match req.endpoint.as_str() {
            "greeks" => Err(404),
            _ => Ok(flow_payload()),
        });
        let mut ingest = build(&cfg, fetcher.clone(), &clock);

        let report = ingest.run_cycle().await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(fetcher.calls_for("greeks"), 1, "404 must not be retried");

        let cache = FlowCache::new(cfg.paths().cache, cfg.freshness, Arc::new(clock.clone()));
        let spy = cache.get("SPY").unwrap().unwrap();
        assert_eq!(spy["greeks"], json!({}));
        assert!(spy.contains_key("flow_alerts"));
    }

    #[tokio::test]
    async fn test_transient_exhaustion_leaves_cache_and_charges_budget() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &[("FLOWD_SYMBOLS", "SPY")]);
        let clock = ManualClock::at(MARKET_OPEN);
        let fetcher = ScriptedFetcher::new(ok_everywhere);
        build(&cfg, fetcher, &clock).run_cycle().await;

        let failing = ScriptedFetcher::new(|req| match req.endpoint.as_str() {
            "greeks" => Err(503),
            _ => Ok(flow_payload()),
        });
        clock.advance_secs(1800);
        let mut ingest = build(&cfg, failing.clone(), &clock);
        let report = ingest.run_cycle().await;

        assert_eq!(failing.calls_for("greeks"), 5);
        assert_eq!(report.failed, 1);
        // 2 calls in the first cycle, 1 + 5 in this one.
        assert_eq!(ingest.budget().usage().calls_today, 8);

        let cache = FlowCache::new(cfg.paths().cache, cfg.freshness, Arc::new(clock.clone()));
        let spy = cache.get("SPY").unwrap().unwrap();
        assert_eq!(spy["greeks"], json!([{"gamma": 1.5}]), "transient failure must not touch the cache");
    }

    #[tokio::test]
    async fn test_rate_limit_defers_and_parks() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &[("FLOWD_SYMBOLS", "SPY,QQQ")]);
        let clock = ManualClock::at(MARKET_OPEN);
        let fetcher = ScriptedFetcher::new(|_| Err(429));
        let mut ingest = build(&cfg, fetcher.clone(), &clock);

        let report = ingest.run_cycle().await;
        assert_eq!(report.deferred, 1);
        assert_eq!(ingest.deferred_len(), 1);
        assert!(fetcher.calls().iter().all(|(symbol, _)| symbol == "SPY"), "cycle stops once parked");

        match ingest.mode() {
            LoopMode::RateLimited { until, reason } => {
                assert_eq!(reason, ParkReason::ProviderThrottled);
                assert_eq!(until, clock.now() + chrono::Duration::minutes(15));
            }
            LoopMode::Normal => panic!("expected rate-limited mode"),
        }

        let queue = DeferredWorkQueue::load(cfg.paths().deferred_queue).unwrap();
        let item = queue.peek().unwrap();
        assert_eq!(item.operation.symbol, "SPY");
        assert_eq!(item.operation.endpoint, "flow_alerts");
        assert_eq!(item.enqueued_at, clock.now());
    }

    #[tokio::test]
    async fn test_daily_cap_blocks_and_parks_until_reset() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(
            dir.path(),
            &[
                ("FLOWD_SYMBOLS", "SPY,QQQ"),
                ("FLOWD_DAILY_CAP", "3"),
                ("FLOWD_SAFETY_BUFFER", "1.0"),
            ],
        );
        let clock = ManualClock::at(MARKET_OPEN);
        let fetcher = ScriptedFetcher::new(ok_everywhere);
        let mut ingest = build(&cfg, fetcher.clone(), &clock);

        let report = ingest.run_cycle().await;
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.blocked, 1);
        assert_eq!(fetcher.calls().len(), 3, "denied reservation never reaches the network");
        assert_eq!(
            ingest.mode(),
            LoopMode::RateLimited {
                until: DateTime::parse_from_rfc3339("2026-10-21T00:00:00Z").unwrap().with_timezone(&Utc),
                reason: ParkReason::DailyCap,
            }
        );
    }

    #[tokio::test]
    async fn test_drain_attempts_each_item_once() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &[("FLOWD_SYMBOLS", "SPY")]);
        let clock = ManualClock::at(MARKET_OPEN);

        let mut queue = DeferredWorkQueue::load(cfg.paths().deferred_queue).unwrap();
        for (symbol, endpoint) in [("SPY", "flow_alerts"), ("QQQ", "greeks"), ("IWM", "retired")] {
            let op = OperationDescriptor {
                symbol: symbol.into(),
                endpoint: endpoint.into(),
            };
            queue.enqueue(QueueItem::new(op, "HTTP 429", clock.now())).unwrap();
        }

        let fetcher = ScriptedFetcher::new(|req| match req.endpoint.as_str() {
            "greeks" => Err(429),
            _ => Ok(flow_payload()),
        });
        let mut ingest = build(&cfg, fetcher.clone(), &clock);
        let report = ingest.drain_deferred().await;

        assert_eq!(
            report,
            DrainReport {
                attempted: 2,
                succeeded: 1,
                failed: 1,
                dropped: 1,
            }
        );
        assert_eq!(ingest.deferred_len(), 0, "failed items are not re-enqueued");
        assert_eq!(ingest.mode(), LoopMode::Normal);
        assert_eq!(fetcher.calls_for("flow_alerts"), 1);
    }

    #[tokio::test]
    async fn test_empty_answer_preserves_fresh_value() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &[("FLOWD_SYMBOLS", "SPY")]);
        let clock = ManualClock::at(MARKET_OPEN);
        build(&cfg, ScriptedFetcher::new(ok_everywhere), &clock).run_cycle().await;

        clock.advance_secs(300);
        let empty = ScriptedFetcher::new(|_| Ok(json!({"data": []})));
        let report = build(&cfg, empty, &clock).run_cycle().await;
        assert_eq!(report.due_endpoints, vec!["flow_alerts"]);

        let cache = FlowCache::new(cfg.paths().cache, cfg.freshness, Arc::new(clock.clone()));
        let spy = cache.get("SPY").unwrap().unwrap();
        assert_eq!(spy["flow_alerts"]["sentiment"], "bullish");
        assert_eq!(spy[PRESERVED_KEY], json!(["flow_alerts"]));
    }

    #[tokio::test]
    async fn test_stop_before_run_is_ignored_but_after_arming_exits() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), &[("FLOWD_SYMBOLS", "SPY")]);
        cfg.cycle_interval = Duration::from_millis(10);
        let clock = ManualClock::at(MARKET_OPEN);
        let fetcher = ScriptedFetcher::new(ok_everywhere);
        let token = ShutdownToken::new();
        let mut ingest = IngestionLoop::new(
            &cfg,
            fetcher.clone(),
            Arc::new(NoSleep),
            Arc::new(clock.clone()),
            token.clone(),
        )
        .unwrap();

        assert!(!token.request_stop(), "not armed before loop entry");

        let stopper = token.clone();
        tokio::spawn(async move {
            while !stopper.request_stop() {
                tokio::task::yield_now().await;
            }
        });
        tokio::time::timeout(Duration::from_secs(5), ingest.run())
            .await
            .expect("loop exits after stop");
        assert!(token.is_stopped());
    }

    #[test]
    fn test_next_reset() {
        let at = |s: &str| DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc);
        assert_eq!(
            next_reset(at("2026-10-20T15:00:00Z"), Duration::ZERO),
            at("2026-10-21T00:00:00Z")
        );
        assert_eq!(
            next_reset(at("2026-10-20T03:00:00Z"), Duration::from_secs(4 * 3600)),
            at("2026-10-20T04:00:00Z")
        );
        assert_eq!(
            next_reset(at("2026-10-20T04:00:00Z"), Duration::from_secs(4 * 3600)),
            at("2026-10-21T04:00:00Z")
        );
    }
}
