//! Append-only quota log, backed by SQLite.
//!
//! Two tables:
//! - `quota_log`: one row per attempted provider call (success or not);
//! - `startup_log`: one row per daemon start attempt, including the ones
//!   that lost the instance lock.
//!
//! The daemon appends; the sentinel opens the same file read-only and
//! aggregates over trailing windows (error spikes, restart storms).
//! Rows older than `RETENTION_DAYS` are deleted on open and then at most once
//! a day while appending.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OpenFlags};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use tracing::{info, warn};

/// How long call and startup rows are kept. Far longer than any window
/// the sentinel aggregates over.
pub const RETENTION_DAYS: i64 = 7;
const PRUNE_EVERY_SECS: i64 = 24 * 3600;

/// One attempted provider call.
#[derive(Debug, Clone)]
pub struct CallRecord<'a> {
    pub request_id: &'a str,
    pub endpoint: &'a str,
    pub symbol: &'a str,
    pub requested_at: DateTime<Utc>,
    pub status_code: Option<u16>,
    pub outcome: &'a str,
    pub latency_ms: u64,
    pub daily_count: Option<u64>,
    pub daily_limit: Option<u64>,
}

/// Trailing-window call counts for one endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointErrorRate {
    pub total: u64,
    pub errors: u64,
}

impl EndpointErrorRate {
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.errors as f64 / self.total as f64
        }
    }
}

pub struct QuotaLog {
    db: Mutex<Connection>,
    /// Epoch seconds of the last retention prune.
    pruned_at: AtomicI64,
}

impl QuotaLog {
    /// Open (or create) the log for appending.
    pub fn open(db_path: &Path) -> Result<Self> {
        let db = Connection::open(db_path).context("Failed to open quota log database")?;

        // WAL mode so the sentinel can read while the daemon appends
        db.pragma_update(None, "journal_mode", "WAL")?;
        db.busy_timeout(std::time::Duration::from_secs(2))?;

        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS quota_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                symbol TEXT NOT NULL,
                requested_at INTEGER NOT NULL,
                status_code INTEGER,
                outcome TEXT NOT NULL,
                latency_ms INTEGER,
                daily_count INTEGER,
                daily_limit INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_quota_log_time ON quota_log(requested_at);

            CREATE TABLE IF NOT EXISTS startup_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pid INTEGER NOT NULL,
                started_at INTEGER NOT NULL,
                outcome TEXT NOT NULL
            );",
        )?;

        let log = Self {
            db: Mutex::new(db),
            pruned_at: AtomicI64::new(0),
        };
        log.prune_if_due(Utc::now());
        Ok(log)
    }

    /// Open an existing log without write access (sentinel side).
    pub fn open_read_only(db_path: &Path) -> Result<Self> {
        let db = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("Failed to open quota log read-only")?;
        db.busy_timeout(std::time::Duration::from_secs(2))?;
        Ok(Self {
            db: Mutex::new(db),
            pruned_at: AtomicI64::new(i64::MAX),
        })
    }

    pub fn record_call(&self, rec: &CallRecord<'_>) -> Result<()> {
        self.prune_if_due(rec.requested_at);
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO quota_log
                (request_id, endpoint, symbol, requested_at, status_code, outcome,
                 latency_ms, daily_count, daily_limit)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                rec.request_id,
                rec.endpoint,
                rec.symbol,
                rec.requested_at.timestamp(),
                rec.status_code.map(i64::from),
                rec.outcome,
                rec.latency_ms as i64,
                rec.daily_count.map(|c| c as i64),
                rec.daily_limit.map(|l| l as i64),
            ],
        )?;
        Ok(())
    }

    pub fn record_startup(&self, pid: u32, at: DateTime<Utc>, outcome: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO startup_log (pid, started_at, outcome) VALUES (?1, ?2, ?3)",
            params![pid as i64, at.timestamp(), outcome],
        )?;
        Ok(())
    }

    /// Delete call and startup rows older than `cutoff`; returns the
    /// number of rows removed.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let calls = db.execute("DELETE FROM quota_log WHERE requested_at < ?1", params![cutoff.timestamp()])?;
        let startups = db.execute("DELETE FROM startup_log WHERE started_at < ?1", params![cutoff.timestamp()])?;
        Ok(calls + startups)
    }

    fn prune_if_due(&self, now: DateTime<Utc>) {
        let last = self.pruned_at.load(Ordering::Relaxed);
        if now.timestamp().saturating_sub(last) < PRUNE_EVERY_SECS {
            return;
        }
        self.pruned_at.store(now.timestamp(), Ordering::Relaxed);
        match self.prune_before(now - Duration::days(RETENTION_DAYS)) {
            Ok(0) => {}
            Ok(removed) => info!(removed, retention_days = RETENTION_DAYS, "Quota log pruned"),
            Err(e) => warn!(error = %e, "Quota log prune failed"),
        }
    }

    /// Per-endpoint totals and failures since `cutoff`.
    ///
    /// Budget denials never reach the network and are not logged here.
    pub fn error_rates_since(&self, cutoff: DateTime<Utc>) -> Result<HashMap<String, EndpointErrorRate>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT endpoint,
                    COUNT(*) AS total,
                    SUM(CASE WHEN outcome != 'success' THEN 1 ELSE 0 END) AS errors
             FROM quota_log
             WHERE requested_at >= ?1
             GROUP BY endpoint",
        )?;

        let rows = stmt.query_map(params![cutoff.timestamp()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                EndpointErrorRate {
                    total: row.get::<_, i64>(1)? as u64,
                    errors: row.get::<_, i64>(2)? as u64,
                },
            ))
        })?;

        let mut results = HashMap::new();
        for row in rows {
            let (endpoint, rate) = row?;
            results.insert(endpoint, rate);
        }
        Ok(results)
    }

    /// Number of start attempts since `cutoff`.
    pub fn startups_since(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let db = self.db.lock().unwrap();
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM startup_log WHERE started_at >= ?1",
            params![cutoff.timestamp()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}
