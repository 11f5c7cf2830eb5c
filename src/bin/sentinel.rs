//! flowd-sentinel — out-of-process health watchdog for flowd.
//!
//! Reads the daemon's state directory without ever writing to it (apart
//! from `daemon_health_state.json`) and asks systemd about the unit.
//! With `--once` the exit code reflects the verdict: 0 healthy,
//! 1 warning, 2 critical, 3 the check itself failed.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use flowd::clock::SystemClock;
use flowd::config::DEFAULT_SERVICE;
use flowd::sentinel::{HealthSentinel, HealthStatus, SentinelThresholds, ServiceManager, Systemd};
use flowd::shutdown::{self, ShutdownToken};
use flowd::state::StatePaths;

#[derive(Debug, Parser)]
#[command(name = "flowd-sentinel", version, about = "Health watchdog for the flowd daemon")]
struct Cli {
    /// Run a single check and exit with a status-derived code
    #[arg(long)]
    once: bool,

    /// Restart the service (at most once per check) when critical
    #[arg(long)]
    heal: bool,

    /// Seconds between checks
    #[arg(long, default_value_t = 60)]
    interval_secs: u64,

    /// Daemon state directory (default ~/.flowd)
    #[arg(long, env = "FLOWD_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// systemd unit running the daemon
    #[arg(long, env = "FLOWD_SERVICE", default_value = DEFAULT_SERVICE)]
    service: String,

    /// Use the per-user systemd manager
    #[arg(long)]
    user: bool,

    /// Maximum age of the newest poll before warning
    #[arg(long, default_value_t = 7200)]
    poll_freshness_secs: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let json = std::env::var("FLOWD_LOG_JSON")
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(false);
    flowd::init_tracing(json);

    let Some(state_dir) = cli.state_dir.clone().or_else(|| dirs::home_dir().map(|h| h.join(".flowd"))) else {
        error!("Cannot determine state directory (set FLOWD_STATE_DIR)");
        return ExitCode::from(3);
    };

    let service: Arc<dyn ServiceManager> = if cli.user {
        Arc::new(Systemd::user(cli.service.clone()))
    } else {
        Arc::new(Systemd::new(cli.service.clone()))
    };
    let thresholds = SentinelThresholds {
        poll_freshness: Duration::from_secs(cli.poll_freshness_secs),
        ..SentinelThresholds::default()
    };
    let sentinel = HealthSentinel::new(
        StatePaths::new(&state_dir),
        thresholds,
        service,
        Arc::new(SystemClock),
        cli.heal,
    );

    if cli.once {
        return match sentinel.check().await {
            Ok(snapshot) => match snapshot.status {
                HealthStatus::Healthy => ExitCode::SUCCESS,
                HealthStatus::Warning => ExitCode::from(1),
                HealthStatus::Critical => ExitCode::from(2),
            },
            Err(e) => {
                error!(error = %e, "Health check failed");
                ExitCode::from(3)
            }
        };
    }

    let token = ShutdownToken::new();
    if let Err(e) = shutdown::install_signal_handlers(token.clone()) {
        error!(error = %e, "Failed to install signal handlers");
        return ExitCode::from(3);
    }
    token.arm();

    info!(
        state_dir = %state_dir.display(),
        service = %cli.service,
        interval_secs = cli.interval_secs,
        heal = cli.heal,
        "🩺 flowd-sentinel watching"
    );

    let interval = Duration::from_secs(cli.interval_secs.max(1));
    loop {
        if let Err(e) = sentinel.check().await {
            error!(error = %e, "Health check failed");
        }
        if token.sleep(interval).await {
            break;
        }
    }
    info!("Sentinel stopped");
    ExitCode::SUCCESS
}
