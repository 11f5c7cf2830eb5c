//! flowd — rate-budgeted market telemetry ingestion.
//!
//! The `flowd` binary polls a third-party market-data provider for a set
//! of symbols and keeps a per-symbol cache file fresh for a downstream
//! scoring engine. `flowd-sentinel` watches it from the outside.
//!
//! Data path, leaves first:
//!
//!   scheduler → budget → retry(fetcher) → normalize → cache
//!
//! Every state file lives in one directory (default `~/.flowd`) and has
//! exactly one writer, enforced by an advisory lock.

pub mod budget;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod ingest;
pub mod lock;
pub mod normalize;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod sentinel;
pub mod shutdown;
pub mod state;

use tracing_subscriber::EnvFilter;

/// Structured logs for both binaries. `RUST_LOG` overrides the default
/// `flowd=info` filter.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "flowd=info".into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
