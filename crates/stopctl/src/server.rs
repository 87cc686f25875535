//! Serving server for the control protocol.
//!
//! One accept loop, one task per connection. Every connection and the accept
//! loop itself hold an in-flight guard, so a drain only completes once the
//! loop has exited and every request already read has been answered.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, SinkExt, StreamExt};
use stopctl_drain::{ControlListener, DrainOutcome, GracefulShutdown, InFlightGuard};
use tokio::net::UnixStream;
use tokio_util::codec::LinesCodecError;
use tracing::{debug, error, info, warn};

use crate::proto::{self, Response};
use crate::service::ControlService;

/// Pause before accepting again after the process ran out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Handle to the serving server.
///
/// Shared between the accept loop that operates it and the control service
/// that commands it to drain.
pub struct RpcServer {
    shutdown: GracefulShutdown,
}

impl RpcServer {
    pub fn new(shutdown: GracefulShutdown) -> Arc<Self> {
        Arc::new(Self { shutdown })
    }

    /// Stop accepting connections and close idle ones. Returns immediately.
    pub fn begin_graceful_stop(&self) {
        self.shutdown.trigger_stop();
    }

    /// Wait until every in-flight request has been answered and the accept
    /// loop has exited.
    pub async fn wait_drained(&self) -> DrainOutcome {
        self.shutdown.drain().await
    }

    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_stopping()
    }

    pub fn in_flight(&self) -> usize {
        self.shutdown.in_flight()
    }

    /// Register work that the next drain must wait for.
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.shutdown.in_flight_guard()
    }

    /// Run the accept loop until a graceful stop begins.
    ///
    /// Transient accept failures are logged and retried. Any other accept
    /// failure starts a graceful stop and is returned; the listener is closed
    /// (and a self-bound socket unlinked) before this returns.
    pub async fn serve(
        self: Arc<Self>,
        listener: ControlListener,
        service: Arc<ControlService>,
    ) -> io::Result<()> {
        let loop_guard = self.shutdown.in_flight_guard();
        let stop = self.shutdown.stop_token();

        info!(path = ?listener.local_path(), "Control server accepting connections");

        let result = loop {
            let stream = tokio::select! {
                biased;
                _ = stop.cancelled() => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(stream) => stream,
                    Err(e) if is_out_of_descriptors(&e) => {
                        warn!(error = %e, "Out of descriptors, backing off");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                    Err(e) if is_transient_accept_error(&e) => {
                        debug!(error = %e, "Transient accept failure");
                        continue;
                    }
                    Err(e) => {
                        error!(error = %e, "Control listener accept failed");
                        self.shutdown.trigger_stop();
                        break Err(e);
                    }
                },
            };

            debug!("New control connection");
            let guard = self.shutdown.in_flight_guard();
            let server = Arc::clone(&self);
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                server.handle_connection(stream, service, guard).await;
            });
        };

        drop(listener);
        info!("Control server stopped accepting connections");
        drop(loop_guard);
        result
    }

    async fn handle_connection(
        &self,
        stream: UnixStream,
        service: Arc<ControlService>,
        _guard: InFlightGuard,
    ) {
        let mut framed = proto::framed(stream);
        let stop = self.shutdown.stop_token();
        let force = self.shutdown.force_token();
        let mut draining = false;

        loop {
            let frame = if draining {
                // Serve frames that were delivered before the stop, then hang up.
                match framed.next().now_or_never() {
                    Some(frame) => frame,
                    None => {
                        debug!("Closing idle control connection for drain");
                        break;
                    }
                }
            } else {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => {
                        draining = true;
                        // Let the reactor report bytes that already arrived.
                        tokio::task::yield_now().await;
                        continue;
                    }
                    frame = framed.next() => frame,
                }
            };

            let response = match frame {
                None => {
                    debug!("Control client disconnected");
                    break;
                }
                Some(Ok(line)) => match proto::decode_request(&line) {
                    Ok(request) => {
                        let (id, method) = (request.id, request.method);
                        // An accepted request runs to completion unless a
                        // bounded drain gives up on it.
                        tokio::select! {
                            response = service.dispatch(request) => response,
                            _ = force.cancelled() => {
                                warn!(id, ?method, "Abandoning in-flight request");
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "Rejecting malformed control request");
                        Response::error(e.request_id(), e.to_string())
                    }
                },
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    Response::error(0, "request frame too long")
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    debug!(error = %e, "Control connection read failed");
                    break;
                }
            };

            let line = match proto::encode(&response) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Failed to encode control response");
                    break;
                }
            };
            if let Err(e) = framed.send(line).await {
                debug!(error = %e, "Control connection write failed");
                break;
            }
        }
    }
}

/// Accept failures caused by a single misbehaving peer.
fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Accept failures that clear up once other descriptors are released.
fn is_out_of_descriptors(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}
