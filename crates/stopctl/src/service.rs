//! Control service: the `Stop` and `Wait` operations and the process
//! lifecycle they drive.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::proto::{Empty, Method, Request, Response};
use crate::server::RpcServer;

/// Lifecycle of a server process as seen by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    /// Serving requests and accepting control connections.
    #[default]
    Running,
    /// A `Stop` was accepted; the drain has not been scheduled yet.
    DrainRequested,
    /// No new connections are accepted; in-flight requests are finishing.
    Draining,
    /// Drain complete. The process may exit.
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::DrainRequested => write!(f, "drain-requested"),
            LifecycleState::Draining => write!(f, "draining"),
            LifecycleState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Turns an accepted `Stop` into a background drain of the serving server.
struct DrainOrchestrator {
    server: Arc<RpcServer>,
    state: Arc<watch::Sender<LifecycleState>>,
}

impl DrainOrchestrator {
    /// Stop accepting now, then finish the drain on a separate task so the
    /// caller can still answer the request that asked for it.
    fn start(&self) {
        info!("Graceful stop requested");
        self.server.begin_graceful_stop();
        self.state.send_replace(LifecycleState::Draining);

        let server = Arc::clone(&self.server);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let outcome = server.wait_drained().await;
            if !outcome.is_clean() {
                warn!(?outcome, "Drain did not complete cleanly");
            }
            state.send_replace(LifecycleState::Stopped);
            info!("Graceful stop done");
        });
    }
}

/// The control service of one server process.
pub struct ControlService {
    drain: DrainOrchestrator,
    state: Arc<watch::Sender<LifecycleState>>,
    wait_interval: Duration,
}

impl ControlService {
    /// Build the service around the server it controls.
    ///
    /// `wait_interval` is how long a `Wait` call blocks.
    pub fn new(server: Arc<RpcServer>, wait_interval: Duration) -> Self {
        let (state, _) = watch::channel(LifecycleState::Running);
        let state = Arc::new(state);
        Self {
            drain: DrainOrchestrator {
                server,
                state: Arc::clone(&state),
            },
            state,
            wait_interval,
        }
    }

    /// `Stop`: begin a graceful drain and return without waiting for it.
    ///
    /// Calls after the first accepted one are no-ops that still succeed.
    pub fn stop(&self) -> Empty {
        self.try_stop();
        Empty {}
    }

    /// Like [`stop`](Self::stop), reporting whether this call started the drain.
    pub fn try_stop(&self) -> bool {
        let accepted = self.state.send_if_modified(|state| {
            if *state == LifecycleState::Running {
                *state = LifecycleState::DrainRequested;
                true
            } else {
                false
            }
        });

        if accepted {
            self.drain.start();
        } else {
            debug!(state = %self.state(), "Stop ignored, drain already underway");
        }
        accepted
    }

    /// `Wait`: block this request for the configured interval.
    pub async fn wait(&self) -> Empty {
        debug!(interval_ms = self.wait_interval.as_millis() as u64, "Wait started");
        tokio::time::sleep(self.wait_interval).await;
        debug!("Wait finished");
        Empty {}
    }

    /// Route one decoded request to its operation.
    pub async fn dispatch(&self, request: Request) -> Response {
        match request.method {
            Method::Stop => {
                self.stop();
            }
            Method::Wait => {
                self.wait().await;
            }
        }
        Response::ok(request.id)
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions as they are published.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Resolve once the lifecycle reaches [`LifecycleState::Stopped`].
    pub async fn wait_stopped(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|state| *state == LifecycleState::Stopped).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stopctl_drain::GracefulShutdown;
    use tokio::time::Instant;

    fn service(wait: Duration) -> (Arc<RpcServer>, ControlService) {
        let server = RpcServer::new(GracefulShutdown::new(None));
        let service = ControlService::new(Arc::clone(&server), wait);
        (server, service)
    }

    #[tokio::test]
    async fn test_stop_transitions_to_stopped() {
        let (server, service) = service(Duration::from_secs(30));
        assert_eq!(service.state(), LifecycleState::Running);

        service.stop();
        assert_eq!(service.state(), LifecycleState::Draining);
        assert!(server.is_stopping());

        service.wait_stopped().await;
        assert_eq!(service.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_repeated_stop_is_idempotent() {
        let (_server, service) = service(Duration::from_secs(30));
        let mut rx = service.subscribe();

        assert!(service.try_stop());
        for _ in 0..5 {
            assert!(!service.try_stop());
            assert_eq!(service.stop(), Empty {});
        }

        rx.wait_for(|state| *state == LifecycleState::Stopped)
            .await
            .unwrap();
        rx.borrow_and_update();

        // Later stops publish nothing once the lifecycle is over.
        for _ in 0..5 {
            assert!(!service.try_stop());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!rx.has_changed().unwrap());
        assert_eq!(service.state(), LifecycleState::Stopped);
    }

    /// Every transition is published once, in order, and `Stopped` last.
    #[tokio::test]
    async fn test_stopped_is_published_once() {
        let (_server, service) = service(Duration::from_secs(30));
        let mut rx = service.subscribe();

        let observer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while rx.changed().await.is_ok() {
                seen.push(*rx.borrow_and_update());
            }
            seen
        });

        service.stop();
        service.wait_stopped().await;
        service.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(service);

        let seen = observer.await.unwrap();
        let stopped = seen
            .iter()
            .filter(|state| **state == LifecycleState::Stopped)
            .count();
        assert_eq!(stopped, 1, "transitions: {seen:?}");
        assert_eq!(seen.last(), Some(&LifecycleState::Stopped));
    }

    #[tokio::test]
    async fn test_stop_does_not_wait_for_in_flight_work() {
        let (server, service) = service(Duration::from_secs(30));
        let guard = server.in_flight_guard();

        let started = Instant::now();
        service.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(service.state(), LifecycleState::Draining);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(service.state(), LifecycleState::Draining);

        drop(guard);
        service.wait_stopped().await;
        assert_eq!(service.state(), LifecycleState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_blocks_for_interval() {
        let (_server, service) = service(Duration::from_secs(30));

        let started = Instant::now();
        assert_eq!(service.wait().await, Empty {});
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_echoes_request_id() {
        let (_server, service) = service(Duration::from_millis(5));
        let response = service
            .dispatch(Request {
                id: 42,
                method: Method::Wait,
                body: Empty {},
            })
            .await;
        assert_eq!(response, Response::ok(42));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(LifecycleState::DrainRequested.to_string(), "drain-requested");
        assert_eq!(LifecycleState::default(), LifecycleState::Running);
    }
}
