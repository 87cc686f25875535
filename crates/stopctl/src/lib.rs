//! # stopctl
//!
//! An out-of-band control plane that lets an operator tell a long-running
//! server to drain in-flight work and stop, without sending it a signal.
//!
//! The server listens on a unix socket (bound by itself, or inherited from a
//! supervisor via socket activation) and exposes two operations:
//!
//! - `Stop` — stop accepting, drain in-flight requests, then let the process exit.
//!   Acknowledged immediately; idempotent.
//! - `Wait` — block for a configured interval. Gives tests a long-lived
//!   in-flight request to check that draining does not cut it short.

pub mod client;
pub mod config;
pub mod error;
pub mod plane;
pub mod proto;
pub mod server;
pub mod service;
pub mod telemetry;

pub use client::ControlClient;
pub use config::Config;
pub use error::{ClientError, ProtocolError};
pub use plane::{selftest, ControlPlane};
pub use server::RpcServer;
pub use service::{ControlService, LifecycleState};
pub use stopctl_drain::{ControlListener, ListenMode, ListenerError};
