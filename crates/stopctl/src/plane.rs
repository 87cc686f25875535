//! Wiring of listener, serving server and control service for one process.

use std::io;
use std::path::Path;
use std::sync::Arc;

use stopctl_drain::{ControlListener, GracefulShutdown};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::client::ControlClient;
use crate::config::Config;
use crate::server::RpcServer;
use crate::service::ControlService;

/// A running control plane.
pub struct ControlPlane {
    service: Arc<ControlService>,
    serve: JoinHandle<io::Result<()>>,
}

impl ControlPlane {
    /// Start serving the control protocol on `listener`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(listener: ControlListener, config: &Config) -> Self {
        let server = RpcServer::new(GracefulShutdown::new(config.drain_timeout));
        let service = Arc::new(ControlService::new(
            Arc::clone(&server),
            config.wait_interval,
        ));
        let serve = tokio::spawn(server.serve(listener, Arc::clone(&service)));

        info!("Server ready");
        Self { service, serve }
    }

    pub fn service(&self) -> &Arc<ControlService> {
        &self.service
    }

    /// Block until a `Stop` has been received and the drain it started has
    /// finished.
    ///
    /// If the accept loop fails, in-flight requests are still drained before
    /// the error is returned.
    pub async fn wait_stopped(self) -> io::Result<()> {
        let served = self.serve.await.map_err(io::Error::other)?;
        if let Err(e) = &served {
            warn!(error = %e, "Control server failed, draining before exit");
            self.service.stop();
        }
        self.service.wait_stopped().await;
        info!("Server stopped");
        served
    }
}

/// Run a server and a client in the same process: bind, dial, `Stop`, and
/// wait for the server to finish draining.
pub async fn selftest(socket_path: &Path, config: &Config) -> anyhow::Result<()> {
    let listener = ControlListener::bind(socket_path)?;
    let plane = ControlPlane::start(listener, config);

    let mut client = ControlClient::connect(socket_path).await?;
    let stopped = client.stop().await;
    client.close().await?;
    stopped?;
    info!("Client stopped");

    plane.wait_stopped().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::LifecycleState;
    use std::os::fd::{AsRawFd, OwnedFd};
    use std::time::Duration;

    #[tokio::test]
    async fn test_selftest_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");

        selftest(&path, &Config::default()).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_wait_stopped_after_client_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let config = Config {
            wait_interval: Duration::from_millis(10),
            ..Config::default()
        };

        let plane = ControlPlane::start(ControlListener::bind(&path).unwrap(), &config);
        let service = Arc::clone(plane.service());

        crate::client::stop(&path).await.unwrap();
        plane.wait_stopped().await.unwrap();
        assert_eq!(service.state(), LifecycleState::Stopped);
    }

    /// A listener that dies under the accept loop still lets accepted
    /// requests finish before the failure is reported.
    #[tokio::test]
    async fn test_accept_failure_drains_before_returning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let config = Config {
            wait_interval: Duration::from_millis(300),
            ..Config::default()
        };

        let std_listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        let owned = OwnedFd::from(std_listener.try_clone().unwrap());
        let plane = ControlPlane::start(ControlListener::adopt(owned).unwrap(), &config);
        let service = Arc::clone(plane.service());

        let waiter = {
            let path = path.clone();
            tokio::spawn(async move { crate::client::wait(&path).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Shutting down a listening socket makes accept fail with EINVAL.
        let rc = unsafe { libc::shutdown(std_listener.as_raw_fd(), libc::SHUT_RDWR) };
        assert_eq!(rc, 0);

        assert!(plane.wait_stopped().await.is_err());
        assert_eq!(service.state(), LifecycleState::Stopped);
        waiter.await.unwrap().unwrap();
    }
}
