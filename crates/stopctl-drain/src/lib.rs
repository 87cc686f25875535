//! # stopctl-drain
//!
//! Lifecycle plumbing for the stopctl control plane.
//!
//! ## Overview
//!
//! A stopctl server needs two things before it can serve control requests:
//! 1. A listening unix socket at the rendezvous path, either bound by the
//!    process itself or handed over by a supervisor (socket activation)
//! 2. A coordinator that stops the accept loop on request and then waits for
//!    every in-flight request to finish
//!
//! ## Environment Variables
//!
//! - `LISTEN_FDS` — Number of inherited file descriptors (starting at fd 3)
//! - `LISTEN_PID` — Pid the descriptors are addressed to (optional)
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("stopctl-drain requires a Unix platform (Linux or macOS)");

mod listener;
mod shutdown;

pub use listener::{ControlListener, ListenMode, ListenerError, LISTEN_FDS_START};
pub use shutdown::{DrainOutcome, GracefulShutdown, InFlightGuard};
