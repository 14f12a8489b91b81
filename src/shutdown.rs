use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// Cooperative cancellation shared by every consume loop in the process.
///
/// Loops poll `is_shutting_down()` between messages and race `wait()` against their
/// blocking pull, so a request is observed within one block duration at worst.
#[derive(Clone, Debug, Default)]
pub struct ShutdownCoordinator {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
    reason: Arc<Mutex<Option<String>>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the flag and wake every waiter. Only the first request is recorded.
    pub fn request_shutdown(&self, reason: &str) {
        let already = self.requested.swap(true, Ordering::SeqCst);
        if !already {
            *self.reason.lock() = Some(reason.to_string());
            warn!("🛑 SHUTDOWN REQUESTED: {}", reason);
        }
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_shutting_down() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep for `duration` unless shutdown interrupts. Returns `true` if the full
    /// duration elapsed without a request.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_shutting_down(),
            _ = self.wait() => false,
        }
    }

    /// Translate SIGTERM / Ctrl-C into a shutdown request.
    pub fn listen_for_signals(&self) -> tokio::task::JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let signal = wait_for_signal().await;
            info!("📡 Received {}", signal);
            coordinator.request_shutdown(signal);
        })
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = term.recv() => "SIGTERM",
                _ = ctrl_c() => "SIGINT",
            }
        }
        Err(e) => {
            warn!("Cannot install SIGTERM handler: {}", e);
            ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    ctrl_c().await;
    "Ctrl-C"
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
