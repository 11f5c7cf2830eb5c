//! Cooperative shutdown.
//!
//! Signals never do work themselves: a small async task turns SIGTERM /
//! SIGINT into a flag flip on a `ShutdownToken`, and the ingestion loop
//! polls that flag at the top of every cycle and every symbol.
//!
//! The token starts disarmed. A stop request that arrives before the loop
//! has entered its first iteration is logged and dropped, so a supervisor
//! racing the startup path cannot leave the daemon half-initialised.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Clone)]
pub struct ShutdownToken {
    inner: Arc<Inner>,
}

struct Inner {
    armed: AtomicBool,
    stop: watch::Sender<bool>,
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownToken {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                armed: AtomicBool::new(false),
                stop,
            }),
        }
    }

    /// Start honouring stop requests. Called once the loop is entered.
    pub fn arm(&self) {
        self.inner.armed.store(true, Ordering::SeqCst);
    }

    pub fn is_armed(&self) -> bool {
        self.inner.armed.load(Ordering::SeqCst)
    }

    /// Returns `false` (and changes nothing) while disarmed.
    pub fn request_stop(&self) -> bool {
        if !self.is_armed() {
            return false;
        }
        self.inner.stop.send_replace(true);
        true
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.stop.borrow()
    }

    /// Sleep for `delay` unless a stop arrives first.
    /// Returns `true` if the sleep ended because of a stop.
    pub async fn sleep(&self, delay: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        let mut rx = self.inner.stop.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => self.is_stopped(),
            _ = rx.wait_for(|stopped| *stopped) => true,
        }
    }
}

/// Route SIGTERM and SIGINT into `token`.
///
/// Install this as early as possible: a signal that arrives before
/// installation would take the default action and kill the process.
pub fn install_signal_handlers(token: ShutdownToken) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                Some(()) = term.recv() => "SIGTERM",
                Some(()) = int.recv() => "SIGINT",
                else => break,
            };
            if token.request_stop() {
                info!(signal = name, "Stop requested — finishing in-flight work");
            } else {
                warn!(signal = name, "Signal received before loop entry — ignored");
            }
        }
    });
    Ok(())
}
