//! flowd — market telemetry ingestion daemon.
//!
//! Runs as a supervised service. Startup order matters:
//!
//! 1. signal handlers (disarmed: early signals are logged and ignored)
//! 2. configuration and state directory
//! 3. quota log, then the single-instance lock
//! 4. ingestion loop, which arms the shutdown token on entry
//!
//! Exit codes: 0 clean shutdown, 75 another instance holds the lock,
//! 1 any other startup failure.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

use flowd::clock::{Clock, SystemClock};
use flowd::config::Config;
use flowd::fetcher::quota_log::QuotaLog;
use flowd::fetcher::HttpFetcher;
use flowd::ingest::IngestionLoop;
use flowd::lock::{InstanceLock, LockError, EXIT_LOCK_CONTENTION};
use flowd::retry::TokioSleeper;
use flowd::shutdown::{self, ShutdownToken};

#[derive(Debug, Parser)]
#[command(name = "flowd", version, about = "Rate-budgeted market telemetry ingestion daemon")]
struct Cli {
    /// State directory (default ~/.flowd)
    #[arg(long, env = "FLOWD_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Retry every deferred request once before entering the loop
    #[arg(long)]
    drain_deferred: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let shutdown = ShutdownToken::new();
    let signals = shutdown::install_signal_handlers(shutdown.clone());

    let config = Config::from_env(cli.state_dir.clone());
    flowd::init_tracing(config.as_ref().map(|c| c.log_json).unwrap_or(false));

    if let Err(e) = signals {
        error!(error = %e, "Failed to install signal handlers");
        return ExitCode::FAILURE;
    }
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    info!("📈 flowd v{}", env!("CARGO_PKG_VERSION"));
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let paths = config.paths();
    if let Err(e) = paths.ensure_dir() {
        error!(error = %e, "Cannot prepare state directory");
        return ExitCode::FAILURE;
    }

    // ── Quota Log ───────────────────────────────────────────────────
    let quota_log = match QuotaLog::open(&paths.quota_db) {
        Ok(log) => Some(Arc::new(log)),
        Err(e) => {
            warn!(error = %e, path = %paths.quota_db.display(), "Quota log unavailable — continuing without it");
            None
        }
    };

    // ── Instance Lock ───────────────────────────────────────────────
    let pid = std::process::id();
    let lock = match InstanceLock::acquire(&paths.lock) {
        Ok(lock) => lock,
        Err(LockError::Contended { path, holder }) => {
            error!(
                event = "LOCK_CONTENTION",
                path = %path.display(),
                holder_pid = ?holder,
                "LOCK_CONTENTION: another flowd instance owns the state directory — exiting"
            );
            record_startup(quota_log.as_deref(), pid, "lock_contention");
            return ExitCode::from(EXIT_LOCK_CONTENTION);
        }
        Err(e) => {
            error!(error = %e, "Failed to take instance lock");
            record_startup(quota_log.as_deref(), pid, "lock_error");
            return ExitCode::from(e.exit_code());
        }
    };
    record_startup(quota_log.as_deref(), pid, "started");
    info!(pid = lock.pid(), lock = %lock.path().display(), "🔒 Instance lock held");

    // ── Provider Client ─────────────────────────────────────────────
    if config.api_token.is_none() {
        warn!("FLOWD_API_TOKEN is not set — provider calls will be rejected");
    }
    let fetcher = match HttpFetcher::new(&config, quota_log.clone()) {
        Ok(fetcher) => Arc::new(fetcher),
        Err(e) => {
            error!(error = %e, "Failed to build HTTP client");
            return ExitCode::FAILURE;
        }
    };

    // ── Ingestion Loop ──────────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut ingest = match IngestionLoop::new(&config, fetcher, Arc::new(TokioSleeper), clock, shutdown) {
        Ok(ingest) => ingest,
        Err(e) => {
            error!(error = %e, "Cannot load owned state — refusing to start over it");
            return ExitCode::FAILURE;
        }
    };

    info!(
        symbols = ?config.symbols,
        endpoints = config.policies.len(),
        state_dir = %config.state_dir.display(),
        base_url = %config.base_url,
        "Configuration loaded"
    );

    if cli.drain_deferred {
        ingest.drain_deferred().await;
    }

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("flowd ready — entering ingestion loop");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    ingest.run().await;

    drop(lock);
    ExitCode::SUCCESS
}

fn record_startup(log: Option<&QuotaLog>, pid: u32, outcome: &str) {
    let Some(log) = log else {
        return;
    };
    if let Err(e) = log.record_startup(pid, chrono::Utc::now(), outcome) {
        warn!(error = %e, outcome, "Failed to record startup");
    }
}
