//! Control listener acquisition.
//!
//! Two explicit paths, selected by the caller and never auto-detected:
//! - [`ListenMode::SelfBind`]: unlink any stale entry at the rendezvous path, then bind
//! - [`ListenMode::Inherited`]: adopt the descriptor a supervisor passed via
//!   `LISTEN_FDS` (compatible with systemd socket activation)

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// First inherited descriptor under the socket activation convention.
pub const LISTEN_FDS_START: RawFd = 3;

/// How the control listener is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenMode {
    /// Create the socket at the rendezvous path ourselves.
    #[default]
    SelfBind,
    /// Take over a listening socket opened by a supervisor.
    Inherited,
}

/// Startup failures while acquiring the control listener. All of them are fatal.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind control socket {}: {source}", .path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no socket provided by the supervisor (LISTEN_FDS absent or zero)")]
    NoSocketProvided,

    #[error("inherited fd {fd} is not a usable listener: {reason}")]
    InvalidDescriptor { fd: RawFd, reason: String },
}

/// A listening unix socket serving the control protocol.
#[derive(Debug)]
pub struct ControlListener {
    listener: UnixListener,
    path: Option<PathBuf>,
    mode: ListenMode,
}

impl ControlListener {
    /// Acquire a listener using the given mode.
    ///
    /// `path` is only used by [`ListenMode::SelfBind`]; an inherited socket
    /// is already bound wherever the supervisor put it.
    pub fn acquire(mode: ListenMode, path: &Path) -> Result<Self, ListenerError> {
        match mode {
            ListenMode::SelfBind => Self::bind(path),
            ListenMode::Inherited => Self::from_env(),
        }
    }

    /// Bind a fresh listener at `path`, removing a stale socket file left by a
    /// previous run first.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(path: &Path) -> Result<Self, ListenerError> {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "Removed stale control socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(ListenerError::Bind {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }

        let listener = UnixListener::bind(path).map_err(|source| ListenerError::Bind {
            path: path.to_path_buf(),
            source,
        })?;

        info!(path = %path.display(), "Bound control listener");
        Ok(Self {
            listener,
            path: Some(path.to_path_buf()),
            mode: ListenMode::SelfBind,
        })
    }

    /// Adopt the listener handed over by a supervisor.
    ///
    /// Reads `LISTEN_FDS` and `LISTEN_PID`, then removes the activation
    /// variables so child processes don't re-inherit stale values.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_env() -> Result<Self, ListenerError> {
        let count = inherited_fd_count(
            std::env::var("LISTEN_FDS").ok().as_deref(),
            std::env::var("LISTEN_PID").ok().as_deref(),
            std::process::id(),
        );

        std::env::remove_var("LISTEN_FDS");
        std::env::remove_var("LISTEN_PID");
        std::env::remove_var("LISTEN_FDNAMES");

        let count = count.ok_or(ListenerError::NoSocketProvided)?;
        if count > 1 {
            warn!(
                count,
                "Supervisor passed more than one descriptor, only fd {} is used", LISTEN_FDS_START
            );
        }

        let fd = LISTEN_FDS_START;
        if !is_socket(fd) {
            return Err(invalid(fd, "not an open socket"));
        }

        // SAFETY: fd 3 is an open socket handed to this process by the
        // supervisor and nothing else in the process has claimed it.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        Self::adopt(owned)
    }

    /// Turn an already bound and listening descriptor into a control listener.
    ///
    /// The descriptor is marked close-on-exec and its ownership moves into the
    /// returned listener.
    ///
    /// Must be called from within a tokio runtime.
    pub fn adopt(fd: OwnedFd) -> Result<Self, ListenerError> {
        let raw = fd.as_raw_fd();

        if !is_socket(raw) {
            return Err(invalid(raw, "not a socket"));
        }
        set_cloexec(raw).map_err(|e| invalid(raw, format!("fcntl FD_CLOEXEC: {e}")))?;
        if !is_listening(raw) {
            return Err(invalid(raw, "socket is not listening"));
        }

        let std_listener = std::os::unix::net::UnixListener::from(fd);
        let addr = std_listener
            .local_addr()
            .map_err(|e| invalid(raw, format!("not a unix socket: {e}")))?;
        std_listener
            .set_nonblocking(true)
            .map_err(|e| invalid(raw, format!("set_nonblocking: {e}")))?;

        let listener = UnixListener::from_std(std_listener)
            .map_err(|e| invalid(raw, format!("register with runtime: {e}")))?;

        let path = addr.as_pathname().map(Path::to_path_buf);
        info!(fd = raw, path = ?path, "Inherited control listener from supervisor");

        Ok(Self {
            listener,
            path,
            mode: ListenMode::Inherited,
        })
    }

    /// Accept the next control connection.
    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(stream)
    }

    /// The filesystem path of the socket, when it has one.
    pub fn local_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The mode this listener was acquired with.
    pub fn mode(&self) -> ListenMode {
        self.mode
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        // The supervisor owns the path of an inherited socket.
        if self.mode != ListenMode::SelfBind {
            return;
        }
        if let Some(path) = &self.path {
            debug!(path = %path.display(), "Unlinking control socket");
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Number of descriptors addressed to `pid`, or `None` when the handoff is
/// absent, malformed, zero, or meant for another process.
fn inherited_fd_count(listen_fds: Option<&str>, listen_pid: Option<&str>, pid: u32) -> Option<usize> {
    if let Some(target) = listen_pid {
        match target.trim().parse::<u32>() {
            Ok(target) if target == pid => {}
            _ => return None,
        }
    }

    match listen_fds?.trim().parse::<usize>() {
        Ok(0) | Err(_) => None,
        Ok(n) => Some(n),
    }
}

fn invalid(fd: RawFd, reason: impl Into<String>) -> ListenerError {
    ListenerError::InvalidDescriptor {
        fd,
        reason: reason.into(),
    }
}

/// Validate that a file descriptor is a valid socket using fstat.
fn is_socket(fd: RawFd) -> bool {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::fstat(fd, &mut stat) };
    if result != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

fn is_listening(fd: RawFd) -> bool {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ACCEPTCONN,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    result == 0 && value != 0
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let result = unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fd_count_parsing() {
        assert_eq!(inherited_fd_count(None, None, 42), None);
        assert_eq!(inherited_fd_count(Some("0"), None, 42), None);
        assert_eq!(inherited_fd_count(Some("bogus"), None, 42), None);
        assert_eq!(inherited_fd_count(Some("1"), None, 42), Some(1));
        assert_eq!(inherited_fd_count(Some(" 2 "), None, 42), Some(2));
    }

    #[test]
    fn test_fd_count_respects_listen_pid() {
        assert_eq!(inherited_fd_count(Some("1"), Some("42"), 42), Some(1));
        assert_eq!(inherited_fd_count(Some("1"), Some("7"), 42), None);
        assert_eq!(inherited_fd_count(Some("1"), Some("nope"), 42), None);
    }

    /// Cold start: no env vars → NoSocketProvided.
    #[tokio::test]
    async fn test_from_env_without_handoff() {
        std::env::remove_var("LISTEN_FDS");
        std::env::remove_var("LISTEN_PID");
        let err = ControlListener::from_env().unwrap_err();
        assert!(matches!(err, ListenerError::NoSocketProvided));
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");

        // A leftover from a crashed run.
        let stale = std::os::unix::net::UnixListener::bind(&path).unwrap();
        drop(stale);
        assert!(path.exists());

        let listener = ControlListener::bind(&path).unwrap();
        assert_eq!(listener.local_path(), Some(path.as_path()));
        assert_eq!(listener.mode(), ListenMode::SelfBind);

        let stream = UnixStream::connect(&path).await;
        assert!(stream.is_ok());
    }

    #[tokio::test]
    async fn test_bind_missing_parent_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("ctl.sock");

        let err = ControlListener::bind(&path).unwrap_err();
        match err {
            ListenerError::Bind { path: p, .. } => assert_eq!(p, path),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_drop_unlinks_self_bound_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");

        let listener = ControlListener::bind(&path).unwrap();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }

    /// Adopting a listening unix socket: accept works and the fd is CLOEXEC.
    #[tokio::test]
    async fn test_adopt_listening_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let std_listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        let fd = OwnedFd::from(std_listener);
        let raw = fd.as_raw_fd();

        let listener = ControlListener::adopt(fd).unwrap();
        assert_eq!(listener.mode(), ListenMode::Inherited);
        assert_eq!(listener.local_path(), Some(path.as_path()));

        let flags = unsafe { libc::fcntl(raw, libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);

        let (client, accepted) = tokio::join!(UnixStream::connect(&path), listener.accept());
        assert!(client.is_ok());
        assert!(accepted.is_ok());

        // Inherited sockets keep their path.
        drop(listener);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_adopt_rejects_connected_socket() {
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        let err = ControlListener::adopt(OwnedFd::from(a)).unwrap_err();
        assert!(matches!(err, ListenerError::InvalidDescriptor { .. }));
    }

    #[tokio::test]
    async fn test_adopt_rejects_tcp_listener() {
        let tcp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let err = ControlListener::adopt(OwnedFd::from(tcp)).unwrap_err();
        match err {
            ListenerError::InvalidDescriptor { reason, .. } => {
                assert!(reason.contains("not a unix socket"), "{reason}")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_adopt_rejects_regular_file() {
        let file = tempfile::tempfile().unwrap();
        let err = ControlListener::adopt(OwnedFd::from(file)).unwrap_err();
        match err {
            ListenerError::InvalidDescriptor { reason, .. } => assert_eq!(reason, "not a socket"),
            other => panic!("unexpected error: {other}"),
        }
    }

    /// Invalid fd is detected.
    #[test]
    fn test_invalid_fd_detection() {
        assert!(!is_socket(9999));
        assert!(!is_socket(-1));
    }
}
