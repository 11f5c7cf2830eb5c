//! Health sentinel — an independent watchdog for the daemon.
//!
//! Each check gathers observations read-only (lock probe, pid liveness,
//! supervisor state, `poll_state.json`, the SQLite quota log), reduces
//! them with the pure `evaluate` function, optionally performs one
//! self-heal restart, and overwrites `daemon_health_state.json`.
//!
//! Verdicts:
//!
//! | condition                        | status   |
//! |----------------------------------|----------|
//! | owning pid not alive             | critical |
//! | lock not held by the owning pid  | critical |
//! | service not `active/running`     | critical |
//! | newest poll older than window    | warning  |
//! | endpoint error-rate spike        | warning  |
//! | restart storm                    | warning  |
//!
//! The overall status is the worst verdict; a dead pid is critical no
//! matter what else is observed.

pub mod service;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::fetcher::quota_log::{EndpointErrorRate, QuotaLog};
use crate::lock::{self, LockProbe};
use crate::scheduler::PollState;
use crate::state::{self, StatePaths};

pub use service::{ServiceManager, ServiceState, Systemd};

// ── Verdict Types ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfHealRecord {
    pub action: String,
    pub attempted_at: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Written in full on every check; never merged with a previous snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    pub pid_ok: bool,
    pub lock_ok: bool,
    pub poll_fresh: bool,
    pub crash_loop: bool,
    pub endpoint_error_spike: bool,
    pub restart_storm_detected: bool,
    pub details: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub self_heal: Option<SelfHealRecord>,
}

#[derive(Debug, Clone)]
pub struct SentinelThresholds {
    /// Newest poll must be at most this old.
    pub poll_freshness: Duration,
    pub error_window: Duration,
    pub error_ratio: f64,
    pub error_min_calls: u64,
    pub restart_window: Duration,
    pub restart_storm_count: u64,
}

impl Default for SentinelThresholds {
    fn default() -> Self {
        Self {
            poll_freshness: Duration::from_secs(2 * 3600),
            error_window: Duration::from_secs(15 * 60),
            error_ratio: 0.5,
            error_min_calls: 5,
            restart_window: Duration::from_secs(10 * 60),
            restart_storm_count: 5,
        }
    }
}

/// Everything one check saw, before judgement.
#[derive(Debug, Clone, Default)]
pub struct Observations {
    /// Pid the daemon should be running as (supervisor main pid, else
    /// the lock holder, else the pid recorded in the lock file).
    pub owning_pid: Option<u32>,
    pub owning_pid_alive: bool,
    /// `None` when the lock file could not be probed.
    pub lock: Option<LockProbe>,
    /// `None` when the supervisor could not be asked.
    pub service: Option<ServiceState>,
    pub newest_poll: Option<i64>,
    pub error_rates: HashMap<String, EndpointErrorRate>,
    pub recent_startups: Option<u64>,
    /// Collection problems, carried into `details`.
    pub notes: BTreeMap<String, Value>,
}

/// Reduce observations to a snapshot. Pure.
pub fn evaluate(obs: &Observations, thresholds: &SentinelThresholds, now: DateTime<Utc>) -> HealthSnapshot {
    let mut details = obs.notes.clone();

    let pid_ok = obs.owning_pid.is_some() && obs.owning_pid_alive;
    details.insert("owning_pid".into(), json!(obs.owning_pid));

    let lock_ok = match (&obs.lock, obs.owning_pid) {
        (Some(LockProbe::Held { holder_pid, recorded_pid }), Some(owner)) => {
            *holder_pid == owner && *recorded_pid == Some(owner)
        }
        _ => false,
    };
    match &obs.lock {
        Some(LockProbe::Held { holder_pid, recorded_pid }) => {
            details.insert("lock_holder_pid".into(), json!(holder_pid));
            details.insert("lock_recorded_pid".into(), json!(recorded_pid));
        }
        Some(LockProbe::Free { recorded_pid }) => {
            details.insert("lock_state".into(), json!("free"));
            details.insert("lock_recorded_pid".into(), json!(recorded_pid));
        }
        Some(LockProbe::Missing) => {
            details.insert("lock_state".into(), json!("missing"));
        }
        None => {}
    }

    let poll_fresh = match obs.newest_poll {
        Some(ts) => {
            let age = now.timestamp() - ts;
            details.insert("newest_poll_age_secs".into(), json!(age));
            age <= thresholds.poll_freshness.as_secs() as i64
        }
        None => false,
    };

    let crash_loop = match &obs.service {
        Some(svc) => {
            details.insert("service".into(), json!(svc));
            !svc.is_running()
        }
        None => false,
    };

    let mut spiking: Vec<&str> = obs
        .error_rates
        .iter()
        .filter(|(_, rate)| rate.total >= thresholds.error_min_calls && rate.ratio() >= thresholds.error_ratio)
        .map(|(endpoint, _)| endpoint.as_str())
        .collect();
    spiking.sort_unstable();
    let endpoint_error_spike = !spiking.is_empty();
    if endpoint_error_spike {
        details.insert("spiking_endpoints".into(), json!(spiking));
    }

    let restart_storm_detected = match obs.recent_startups {
        Some(count) => {
            details.insert("recent_startups".into(), json!(count));
            count >= thresholds.restart_storm_count
        }
        None => false,
    };

    let status = if !pid_ok || !lock_ok || crash_loop {
        HealthStatus::Critical
    } else if !poll_fresh || endpoint_error_spike || restart_storm_detected {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    };

    HealthSnapshot {
        status,
        checked_at: now,
        pid_ok,
        lock_ok,
        poll_fresh,
        crash_loop,
        endpoint_error_spike,
        restart_storm_detected,
        details,
        self_heal: None,
    }
}

// ── Sentinel ────────────────────────────────────────────────────────

pub struct HealthSentinel {
    paths: StatePaths,
    thresholds: SentinelThresholds,
    service: Arc<dyn ServiceManager>,
    clock: Arc<dyn Clock>,
    heal: bool,
}

impl HealthSentinel {
    pub fn new(
        paths: StatePaths,
        thresholds: SentinelThresholds,
        service: Arc<dyn ServiceManager>,
        clock: Arc<dyn Clock>,
        heal: bool,
    ) -> Self {
        Self {
            paths,
            thresholds,
            service,
            clock,
            heal,
        }
    }

    /// One full check: observe, judge, maybe heal once, write the snapshot.
    pub async fn check(&self) -> Result<HealthSnapshot> {
        let obs = self.observe().await;
        let now = self.clock.now();
        let mut snapshot = evaluate(&obs, &self.thresholds, now);

        if snapshot.status == HealthStatus::Critical && self.heal {
            snapshot.self_heal = Some(self.self_heal(now).await);
        }

        state::atomic_write_json(&self.paths.health, &snapshot)?;

        match snapshot.status {
            HealthStatus::Healthy => info!(status = "healthy", "Health check"),
            HealthStatus::Warning => warn!(
                status = "warning",
                poll_fresh = snapshot.poll_fresh,
                endpoint_error_spike = snapshot.endpoint_error_spike,
                restart_storm = snapshot.restart_storm_detected,
                "Health check"
            ),
            HealthStatus::Critical => error!(
                status = "critical",
                pid_ok = snapshot.pid_ok,
                lock_ok = snapshot.lock_ok,
                poll_fresh = snapshot.poll_fresh,
                crash_loop = snapshot.crash_loop,
                "Health check"
            ),
        }
        Ok(snapshot)
    }

    async fn observe(&self) -> Observations {
        let mut obs = Observations::default();

        obs.lock = match lock::probe(&self.paths.lock) {
            Ok(probe) => Some(probe),
            Err(e) => {
                obs.notes.insert("lock_error".into(), json!(e.to_string()));
                None
            }
        };

        obs.service = match self.service.state().await {
            Ok(svc) => Some(svc),
            Err(e) => {
                obs.notes.insert("service_error".into(), json!(e.to_string()));
                None
            }
        };

        let supervisor_pid = obs.service.as_ref().map(|s| s.main_pid).filter(|pid| *pid > 0);
        let (holder_pid, recorded_pid) = match &obs.lock {
            Some(LockProbe::Held { holder_pid, recorded_pid }) => (Some(*holder_pid), *recorded_pid),
            Some(LockProbe::Free { recorded_pid }) => (None, *recorded_pid),
            _ => (None, None),
        };
        obs.owning_pid = supervisor_pid.or(holder_pid).or(recorded_pid);
        obs.owning_pid_alive = obs.owning_pid.map(lock::pid_alive).unwrap_or(false);

        obs.newest_poll = match state::read_json::<PollState>(&self.paths.poll_state) {
            Ok(Some(poll_state)) => poll_state.values().copied().max(),
            Ok(None) => None,
            Err(e) => {
                obs.notes.insert("poll_state_error".into(), json!(e.to_string()));
                None
            }
        };

        if self.paths.quota_db.exists() {
            match self.read_quota_log() {
                Ok((rates, startups)) => {
                    obs.error_rates = rates;
                    obs.recent_startups = Some(startups);
                }
                Err(e) => {
                    obs.notes.insert("quota_log_error".into(), json!(e.to_string()));
                }
            }
        }

        obs
    }

    fn read_quota_log(&self) -> Result<(HashMap<String, EndpointErrorRate>, u64)> {
        let log = QuotaLog::open_read_only(&self.paths.quota_db)?;
        let now = self.clock.now();
        let since = |window: Duration| now - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        let rates = log.error_rates_since(since(self.thresholds.error_window))?;
        let startups = log.startups_since(since(self.thresholds.restart_window))?;
        Ok((rates, startups))
    }

    async fn self_heal(&self, now: DateTime<Utc>) -> SelfHealRecord {
        let action = self.service.restart_action();
        warn!(event = "self_heal", action = %action, "Critical health — attempting restart");
        match self.service.restart().await {
            Ok(()) => {
                info!(event = "self_heal", action = %action, success = true, "Self-heal restart issued");
                SelfHealRecord {
                    action,
                    attempted_at: now,
                    success: true,
                    error: None,
                }
            }
            Err(e) => {
                error!(event = "self_heal", action = %action, success = false, error = %e, "Self-heal restart failed");
                SelfHealRecord {
                    action,
                    attempted_at: now,
                    success: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fetcher::quota_log::CallRecord;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    const NOW: &str = "2026-10-20T15:00:00Z";

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(NOW).unwrap().with_timezone(&Utc)
    }

    fn healthy_obs() -> Observations {
        Observations {
            owning_pid: Some(4242),
            owning_pid_alive: true,
            lock: Some(LockProbe::Held {
                holder_pid: 4242,
                recorded_pid: Some(4242),
            }),
            service: Some(ServiceState {
                main_pid: 4242,
                active_state: "active".into(),
                sub_state: "running".into(),
                restarts: 0,
            }),
            newest_poll: Some(now().timestamp() - 120),
            error_rates: HashMap::from([("greeks".to_string(), EndpointErrorRate { total: 10, errors: 1 })]),
            recent_startups: Some(1),
            notes: BTreeMap::new(),
        }
    }

    #[test]
    fn test_healthy() {
        let snap = evaluate(&healthy_obs(), &SentinelThresholds::default(), now());
        assert_eq!(snap.status, HealthStatus::Healthy);
        assert!(snap.pid_ok && snap.lock_ok && snap.poll_fresh);
        assert!(!snap.crash_loop && !snap.endpoint_error_spike && !snap.restart_storm_detected);
    }

    #[test]
    fn test_dead_pid_forces_critical() {
        let mut obs = healthy_obs();
        obs.owning_pid_alive = false;
        let snap = evaluate(&obs, &SentinelThresholds::default(), now());
        assert!(!snap.pid_ok);
        assert_eq!(snap.status, HealthStatus::Critical);

        obs.owning_pid = None;
        let snap = evaluate(&obs, &SentinelThresholds::default(), now());
        assert_eq!(snap.status, HealthStatus::Critical);
    }

    #[test]
    fn test_lock_mismatch_is_critical() {
        let mut obs = healthy_obs();
        obs.lock = Some(LockProbe::Held {
            holder_pid: 4242,
            recorded_pid: Some(1111),
        });
        assert_eq!(evaluate(&obs, &SentinelThresholds::default(), now()).status, HealthStatus::Critical);

        obs.lock = Some(LockProbe::Free { recorded_pid: Some(4242) });
        let snap = evaluate(&obs, &SentinelThresholds::default(), now());
        assert!(!snap.lock_ok);
        assert_eq!(snap.details["lock_state"], "free");
    }

    #[test]
    fn test_crash_loop_is_critical() {
        let mut obs = healthy_obs();
        obs.service = Some(ServiceState {
            main_pid: 4242,
            active_state: "activating".into(),
            sub_state: "auto-restart".into(),
            restarts: 7,
        });
        let snap = evaluate(&obs, &SentinelThresholds::default(), now());
        assert!(snap.crash_loop);
        assert_eq!(snap.status, HealthStatus::Critical);
    }

    #[test]
    fn test_warnings() {
        let thresholds = SentinelThresholds::default();

        let mut obs = healthy_obs();
        obs.newest_poll = Some(now().timestamp() - 3 * 3600);
        let snap = evaluate(&obs, &thresholds, now());
        assert!(!snap.poll_fresh);
        assert_eq!(snap.status, HealthStatus::Warning);

        let mut obs = healthy_obs();
        obs.error_rates.insert("dark_pool".into(), EndpointErrorRate { total: 6, errors: 3 });
        obs.error_rates.insert("flow_alerts".into(), EndpointErrorRate { total: 4, errors: 4 });
        let snap = evaluate(&obs, &thresholds, now());
        assert!(snap.endpoint_error_spike);
        assert_eq!(snap.details["spiking_endpoints"], json!(["dark_pool"]), "below min calls is ignored");
        assert_eq!(snap.status, HealthStatus::Warning);

        let mut obs = healthy_obs();
        obs.recent_startups = Some(5);
        let snap = evaluate(&obs, &thresholds, now());
        assert!(snap.restart_storm_detected);
        assert_eq!(snap.status, HealthStatus::Warning);
    }

    #[test]
    fn test_status_order() {
        assert!(HealthStatus::Healthy < HealthStatus::Warning);
        assert!(HealthStatus::Warning < HealthStatus::Critical);
    }

    struct FakeService {
        state: ServiceState,
        restarts: AtomicU32,
        fail_restart: bool,
    }

    #[async_trait]
    impl ServiceManager for FakeService {
        async fn state(&self) -> Result<ServiceState> {
            Ok(self.state.clone())
        }

        async fn restart(&self) -> Result<()> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            if self.fail_restart {
                anyhow::bail!("permission denied");
            }
            Ok(())
        }

        fn restart_action(&self) -> String {
            "fake restart".into()
        }
    }

    fn fake_service(fail_restart: bool) -> Arc<FakeService> {
        Arc::new(FakeService {
            state: ServiceState {
                main_pid: std::process::id(),
                active_state: "active".into(),
                sub_state: "running".into(),
                restarts: 0,
            },
            restarts: AtomicU32::new(0),
            fail_restart,
        })
    }

    #[tokio::test]
    async fn test_check_heals_once_and_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path());
        let clock = ManualClock::at(NOW);
        let service = fake_service(true);

        // No daemon holds the lock here, so the verdict is critical.
        let sentinel = HealthSentinel::new(
            paths.clone(),
            SentinelThresholds::default(),
            service.clone(),
            Arc::new(clock.clone()),
            true,
        );
        let snap = sentinel.check().await.unwrap();
        assert_eq!(snap.status, HealthStatus::Critical);
        assert!(snap.pid_ok);
        assert!(!snap.lock_ok);
        assert_eq!(service.restarts.load(Ordering::SeqCst), 1);
        let heal = snap.self_heal.clone().unwrap();
        assert!(!heal.success);
        assert_eq!(heal.error.as_deref(), Some("permission denied"));

        let written: HealthSnapshot = state::read_json(&paths.health).unwrap().unwrap();
        assert_eq!(written, snap);
    }

    #[tokio::test]
    async fn test_check_without_heal_never_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path());
        let service = fake_service(false);
        let sentinel = HealthSentinel::new(
            paths,
            SentinelThresholds::default(),
            service.clone(),
            Arc::new(ManualClock::at(NOW)),
            false,
        );

        let snap = sentinel.check().await.unwrap();
        assert_eq!(snap.status, HealthStatus::Critical);
        assert!(snap.self_heal.is_none());
        assert_eq!(service.restarts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_check_reads_poll_state_and_quota_log() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path());
        let clock = ManualClock::at(NOW);

        let poll: PollState = BTreeMap::from([
            ("greeks".to_string(), now().timestamp() - 9000),
            ("flow_alerts".to_string(), now().timestamp() - 60),
        ]);
        state::atomic_write_json(&paths.poll_state, &poll).unwrap();

        let log = QuotaLog::open(&paths.quota_db).unwrap();
        for i in 0..6 {
            log.record_call(&CallRecord {
                request_id: "r",
                endpoint: "dark_pool",
                symbol: "SPY",
                requested_at: now() - chrono::Duration::minutes(1),
                status_code: Some(503),
                outcome: if i < 4 { "transient" } else { "success" },
                latency_ms: 10,
                daily_count: None,
                daily_limit: None,
            })
            .unwrap();
        }
        drop(log);

        let sentinel = HealthSentinel::new(
            paths,
            SentinelThresholds::default(),
            fake_service(false),
            Arc::new(clock),
            false,
        );
        let snap = sentinel.check().await.unwrap();
        assert!(snap.poll_fresh, "newest entry decides freshness");
        assert_eq!(snap.details["newest_poll_age_secs"], 60);
        assert!(snap.endpoint_error_spike);
        assert!(!snap.restart_storm_detected);
    }
}
