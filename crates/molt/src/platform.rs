//! OS-dependent primitives behind one interface.
//!
//! Two implementations exist and are picked at startup from [`Profile`]:
//! [`PosixPlatform`] (fork-exec, image replace, full signal set) and
//! [`ReducedPlatform`] (no fork primitive, descriptors inheritable by default,
//! termination is the only signal that can be delivered).

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use tracing::debug;

use crate::signals::Signal;

/// Which platform behaviour to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    /// Fork-exec handoff, re-exec, reload/reopen/handoff signals.
    #[default]
    Posix,
    /// No fork primitive: re-exec only, reduced signal set.
    Reduced,
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Profile::Posix => write!(f, "posix"),
            Profile::Reduced => write!(f, "reduced"),
        }
    }
}

impl Profile {
    /// Parse a profile name. Unknown names yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "posix" | "unix" | "full" => Some(Profile::Posix),
            "reduced" | "nofork" | "no-fork" => Some(Profile::Reduced),
            _ => None,
        }
    }

    /// Signals the controller listens for under this profile.
    pub fn signals(&self) -> &'static [Signal] {
        match self {
            Profile::Posix => &[
                Signal::Reload,
                Signal::Interrupt,
                Signal::Quit,
                Signal::Terminate,
                Signal::Reopen,
                Signal::Handoff,
            ],
            Profile::Reduced => &[
                Signal::Reload,
                Signal::Interrupt,
                Signal::Quit,
                Signal::Terminate,
            ],
        }
    }

    /// Build the platform adapter for this profile.
    pub fn platform(&self) -> Arc<dyn Platform> {
        match self {
            Profile::Posix => Arc::new(PosixPlatform),
            Profile::Reduced => Arc::new(ReducedPlatform),
        }
    }
}

/// The OS primitives the launcher and codec depend on.
pub trait Platform: fmt::Debug + Send + Sync {
    /// Profile this adapter implements.
    fn profile(&self) -> Profile;

    /// Whether a successor can be spawned while this process keeps running.
    fn supports_fork(&self) -> bool;

    /// Whether the process image can be replaced in place.
    fn supports_image_replace(&self) -> bool;

    /// Set whether `fd` survives exec. Returns the previous state.
    fn set_inheritable(&self, fd: RawFd, inheritable: bool) -> io::Result<bool>;

    /// Deliver `signal` to process `pid`.
    fn deliver(&self, pid: u32, signal: Signal) -> io::Result<()>;
}

/// Full POSIX behaviour: `fcntl(FD_CLOEXEC)` and `kill(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PosixPlatform;

impl Platform for PosixPlatform {
    fn profile(&self) -> Profile {
        Profile::Posix
    }

    fn supports_fork(&self) -> bool {
        true
    }

    fn supports_image_replace(&self) -> bool {
        true
    }

    fn set_inheritable(&self, fd: RawFd, inheritable: bool) -> io::Result<bool> {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let was_inheritable = flags & libc::FD_CLOEXEC == 0;
        let wanted = if inheritable {
            flags & !libc::FD_CLOEXEC
        } else {
            flags | libc::FD_CLOEXEC
        };
        if wanted != flags && unsafe { libc::fcntl(fd, libc::F_SETFD, wanted) } < 0 {
            return Err(io::Error::last_os_error());
        }
        debug!(fd, inheritable, "Updated close-on-exec flag");
        Ok(was_inheritable)
    }

    fn deliver(&self, pid: u32, signal: Signal) -> io::Result<()> {
        send_raw(pid, signal.as_raw())
    }
}

/// Platform without a fork primitive.
///
/// Handles are inherited by default there, so making one inheritable is a
/// no-op, and the only notification another process can receive is a hard
/// termination.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReducedPlatform;

impl Platform for ReducedPlatform {
    fn profile(&self) -> Profile {
        Profile::Reduced
    }

    fn supports_fork(&self) -> bool {
        false
    }

    fn supports_image_replace(&self) -> bool {
        true
    }

    fn set_inheritable(&self, _fd: RawFd, _inheritable: bool) -> io::Result<bool> {
        Ok(true)
    }

    fn deliver(&self, pid: u32, signal: Signal) -> io::Result<()> {
        match signal {
            Signal::Interrupt | Signal::Quit | Signal::Terminate => send_raw(pid, libc::SIGKILL),
            other => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{other} cannot be delivered under the reduced profile"),
            )),
        }
    }
}

fn send_raw(pid: u32, signo: libc::c_int) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    if unsafe { libc::kill(pid, signo) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
