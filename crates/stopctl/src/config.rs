//! Configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! - `STOPCTL_SOCKET`: Rendezvous socket path. Default: `/tmp/stopctl.socket`
//! - `STOPCTL_WAIT_SECS`: How long a `Wait` call blocks. Default: `30`
//! - `STOPCTL_DRAIN_TIMEOUT_SECS`: Give up on in-flight requests after this
//!   many seconds of draining. Default: unset (wait indefinitely)
//!
//! Command line flags override these values.

use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/stopctl.socket";
pub const DEFAULT_WAIT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Rendezvous socket path shared by server and clients
    pub socket_path: PathBuf,
    /// Duration of a `Wait` call
    pub wait_interval: Duration,
    /// Optional drain deadline
    pub drain_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            wait_interval: Duration::from_secs(DEFAULT_WAIT_SECS),
            drain_timeout: None,
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let socket_path = lookup("STOPCTL_SOCKET")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH));

        let wait_secs: u64 = lookup("STOPCTL_WAIT_SECS")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_WAIT_SECS);

        let drain_timeout = lookup("STOPCTL_DRAIN_TIMEOUT_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        Self {
            socket_path,
            wait_interval: Duration::from_secs(wait_secs),
            drain_timeout,
        }
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        info!("Control socket: {}", self.socket_path.display());
        info!("Wait interval: {}s", self.wait_interval.as_secs());
        match self.drain_timeout {
            Some(timeout) => info!("Drain timeout: {}s", timeout.as_secs()),
            None => info!("Drain timeout: none (wait for in-flight requests)"),
        }
    }
}
