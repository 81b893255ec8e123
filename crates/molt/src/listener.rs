//! Listener capability and descriptor extraction.
//!
//! Instead of digging through a listener's internals, every listener type
//! states how its descriptor is reached: a concrete OS-backed listener
//! answers [`Listener::raw_fd`], a wrapper (TLS, rate limiting, ...) answers
//! [`Listener::inner`] and the extractor follows the chain.

use std::any::Any;
use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use crate::error::{HandoffError, Result};

/// Deepest wrapper chain [`extract`] will follow.
const MAX_WRAPPER_DEPTH: usize = 16;

/// Concrete listener kinds that can be rebuilt from an inherited descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    /// Connection-oriented network listener (TCP over IPv4/IPv6).
    Tcp,
    /// Local-domain stream socket listener.
    Unix,
}

impl ListenerKind {
    /// Prefix used in handle-labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerKind::Tcp => "tcp",
            ListenerKind::Unix => "unix",
        }
    }

    /// Build a handle-label such as `tcp:127.0.0.1:8080`.
    pub fn label(&self, addr: impl fmt::Display) -> String {
        format!("{}:{}", self.as_str(), addr)
    }

    /// Recover the kind from a handle-label.
    pub fn from_label(label: &str) -> Option<Self> {
        let (kind, _) = label.split_once(':')?;
        match kind {
            "tcp" | "tcp4" | "tcp6" => Some(ListenerKind::Tcp),
            "unix" => Some(ListenerKind::Unix),
            _ => None,
        }
    }
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upcast helper so registered listeners can be recovered by concrete type.
pub trait AsAny {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A listening socket that can take part in a handoff.
pub trait Listener: AsAny + Send + Sync + 'static {
    /// The OS descriptor, for listeners that own one directly.
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    /// The wrapped listener, for wrappers.
    fn inner(&self) -> Option<&dyn Listener> {
        None
    }

    /// Human-readable network/address, e.g. `tcp:0.0.0.0:443`.
    fn label(&self) -> io::Result<String> {
        match self.inner() {
            Some(inner) => inner.label(),
            None => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "listener has no address",
            )),
        }
    }

    /// Stop listening in this process.
    ///
    /// A successor that inherited the socket keeps accepting on it. Accepts
    /// already blocked on the listener are not woken.
    fn close(&self) -> io::Result<()> {
        if let Some(inner) = self.inner() {
            return inner.close();
        }
        match self.raw_fd() {
            Some(fd) => retire_descriptor(fd),
            None => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "listener has no descriptor",
            )),
        }
    }
}

/// Find the raw descriptor behind `listener`, following wrapper layers.
///
/// Never closes or duplicates the descriptor.
pub fn extract(listener: &dyn Listener) -> Result<RawFd> {
    let mut current = listener;
    for _ in 0..=MAX_WRAPPER_DEPTH {
        if let Some(inner) = current.inner() {
            current = inner;
            continue;
        }
        return current.raw_fd().ok_or_else(|| {
            HandoffError::UnsupportedListenerLayout(
                "innermost listener does not expose a descriptor".to_string(),
            )
        });
    }
    Err(HandoffError::UnsupportedListenerLayout(format!(
        "wrapper chain deeper than {MAX_WRAPPER_DEPTH} layers"
    )))
}

impl Listener for std::net::TcpListener {
    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }

    fn label(&self) -> io::Result<String> {
        Ok(ListenerKind::Tcp.label(self.local_addr()?))
    }
}

impl Listener for std::os::unix::net::UnixListener {
    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }

    fn label(&self) -> io::Result<String> {
        let addr = self.local_addr()?;
        Ok(ListenerKind::Unix.label(unix_path(addr.as_pathname())))
    }
}

impl Listener for tokio::net::TcpListener {
    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }

    fn label(&self) -> io::Result<String> {
        Ok(ListenerKind::Tcp.label(self.local_addr()?))
    }
}

impl Listener for tokio::net::UnixListener {
    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }

    fn label(&self) -> io::Result<String> {
        let addr = self.local_addr()?;
        Ok(ListenerKind::Unix.label(unix_path(addr.as_pathname())))
    }
}

fn unix_path(path: Option<&std::path::Path>) -> String {
    path.map(|p| p.display().to_string()).unwrap_or_default()
}

/// Release this process's reference to the socket behind `fd`.
///
/// `/dev/null` is duplicated over the descriptor number so the owning object
/// can still close it on drop. `shutdown(2)` is not an option: it acts on the
/// socket and would stop a successor sharing it.
fn retire_descriptor(fd: RawFd) -> io::Result<()> {
    if !validate_fd(fd) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("fd {fd} is not an open socket"),
        ));
    }
    let null = std::fs::File::open("/dev/null")?;
    if unsafe { libc::dup2(null.as_raw_fd(), fd) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // dup2 leaves the target inheritable
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Validate that a file descriptor is an open socket using fstat.
pub(crate) fn validate_fd(fd: RawFd) -> bool {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::fstat(fd, &mut stat) };
    if result != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

/// Address family of a bound socket, mapped to the kind that can wrap it.
pub(crate) fn socket_kind(fd: RawFd) -> io::Result<Option<ListenerKind>> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let result = unsafe {
        libc::getsockname(
            fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(match libc::c_int::from(storage.ss_family) {
        libc::AF_INET | libc::AF_INET6 => Some(ListenerKind::Tcp),
        libc::AF_UNIX => Some(ListenerKind::Unix),
        _ => None,
    })
}
