//! Graceful drain coordinator.
//!
//! Request-driven shutdown with in-flight draining:
//! - `trigger_stop` → accept loops stop, idle connections close
//! - `drain` → wait for every in-flight guard to drop (optionally bounded)
//!
//! Uses `CancellationToken` for coordination and `InFlightGuard` for drain tracking.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Result of a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every in-flight unit of work finished.
    Clean,
    /// The drain deadline expired with work still in flight.
    TimedOut { remaining: usize },
}

impl DrainOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, DrainOutcome::Clean)
    }
}

/// Tracks one unit of in-flight work for drain coordination.
///
/// The coordinator waits for all `InFlightGuard`s to drop before
/// considering drain complete.
#[derive(Clone)]
pub struct InFlightGuard {
    _drop_notifier: Arc<DropNotifier>,
}

struct DropNotifier {
    counter: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl Drop for DropNotifier {
    fn drop(&mut self) {
        let prev = self.counter.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }
}

/// Coordinator for graceful shutdown with in-flight draining.
pub struct GracefulShutdown {
    /// Token cancelled when the server should stop accepting new work.
    stop_accepting: CancellationToken,

    /// Token cancelled when the drain deadline expires and remaining work
    /// should be abandoned.
    force_close: CancellationToken,

    /// Active in-flight counter.
    in_flight: Arc<AtomicUsize>,

    /// Notified when the last guard drops.
    drain_notify: Arc<Notify>,

    /// Drain deadline. `None` waits for in-flight work indefinitely.
    drain_timeout: Option<Duration>,
}

impl GracefulShutdown {
    /// Create a new shutdown coordinator.
    pub fn new(drain_timeout: Option<Duration>) -> Self {
        Self {
            stop_accepting: CancellationToken::new(),
            force_close: CancellationToken::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            drain_notify: Arc::new(Notify::new()),
            drain_timeout,
        }
    }

    /// Get a `CancellationToken` that fires when the accept loop should stop.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop_accepting.clone()
    }

    /// Get a `CancellationToken` that fires when a bounded drain gives up.
    pub fn force_token(&self) -> CancellationToken {
        self.force_close.clone()
    }

    /// Create an `InFlightGuard` for new work.
    ///
    /// Increments the counter on creation, decrements on drop.
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            _drop_notifier: Arc::new(DropNotifier {
                counter: Arc::clone(&self.in_flight),
                notify: Arc::clone(&self.drain_notify),
            }),
        }
    }

    /// Get the current amount of in-flight work.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Whether the stop-accepting phase has started.
    pub fn is_stopping(&self) -> bool {
        self.stop_accepting.is_cancelled()
    }

    /// Start the stop-accepting phase. Never blocks; calling it again is a no-op.
    pub fn trigger_stop(&self) {
        self.stop_accepting.cancel();
    }

    /// Run the drain phase: wait for all in-flight work to complete, or for
    /// the deadline if one is configured.
    pub async fn drain(&self) -> DrainOutcome {
        let active = self.in_flight();
        if active == 0 {
            info!("No in-flight requests, drain complete");
            return DrainOutcome::Clean;
        }

        let Some(timeout) = self.drain_timeout else {
            info!(in_flight = active, "Draining in-flight requests");
            self.wait_for_drain().await;
            info!("All in-flight requests drained cleanly");
            return DrainOutcome::Clean;
        };

        info!(
            in_flight = active,
            timeout_secs = timeout.as_secs(),
            "Draining in-flight requests"
        );

        tokio::select! {
            _ = self.wait_for_drain() => {
                info!("All in-flight requests drained cleanly");
                DrainOutcome::Clean
            }
            _ = tokio::time::sleep(timeout) => {
                let remaining = self.in_flight();
                warn!(
                    remaining,
                    timeout_secs = timeout.as_secs(),
                    "Drain timeout expired, force-closing"
                );
                self.force_close.cancel();
                DrainOutcome::TimedOut { remaining }
            }
        }
    }

    async fn wait_for_drain(&self) {
        loop {
            let notified = self.drain_notify.notified();
            tokio::pin!(notified);
            // Register before checking so a drop in between is not missed.
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}
