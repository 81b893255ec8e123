//! Error taxonomy for listener handoff.

use std::fmt;
use std::io;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = HandoffError> = std::result::Result<T, E>;

/// Errors returned by extraction, encoding, launching and closing.
///
/// Hook failures are not represented here: the controller logs them and
/// keeps running.
#[derive(Debug, Error)]
pub enum HandoffError {
    /// The listener (or the innermost listener of a wrapper chain) does not
    /// expose a raw descriptor. Permanent.
    #[error("unsupported listener layout: {0}")]
    UnsupportedListenerLayout(String),

    /// The handoff environment is malformed. Permanent.
    #[error("corrupt handoff environment: {0}")]
    CorruptEnvironment(String),

    /// Spawning a successor or replacing the process image failed. The
    /// caller may retry.
    #[error("launch failed: {0}")]
    LaunchFailure(#[source] io::Error),

    /// Re-exec refused because our parent is the successor we spawned.
    #[error("re-exec refused: parent pid {0} is a successor spawned by this process")]
    ManagedChildGuardTripped(u32),

    /// One or more listeners failed to close. Every listener still got a
    /// close attempt.
    #[error("failed to close {} listener(s): {}", .0.len(), join_failures(.0))]
    AggregatedCloseFailure(Vec<CloseFailure>),

    /// Delivering a signal to the peer process failed.
    #[error("failed to signal process {pid}: {source}")]
    SignalDelivery {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

impl HandoffError {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        HandoffError::CorruptEnvironment(msg.into())
    }

    pub(crate) fn unsupported_platform(what: &str) -> Self {
        HandoffError::LaunchFailure(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("{what} is not available on this platform profile"),
        ))
    }
}

/// A single listener that failed to close.
#[derive(Debug)]
pub struct CloseFailure {
    /// Service name the listener was registered under.
    pub name: String,
    /// The error from the close attempt.
    pub error: io::Error,
}

impl fmt::Display for CloseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.error)
    }
}

fn join_failures(failures: &[CloseFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregated_close_failure_lists_every_service() {
        let err = HandoffError::AggregatedCloseFailure(vec![
            CloseFailure {
                name: "web".to_string(),
                error: io::Error::new(io::ErrorKind::Other, "boom"),
            },
            CloseFailure {
                name: "admin".to_string(),
                error: io::Error::new(io::ErrorKind::Other, "bang"),
            },
        ]);
        assert_eq!(
            err.to_string(),
            "failed to close 2 listener(s): web: boom; admin: bang"
        );
    }

    #[test]
    fn test_unsupported_platform_is_launch_failure() {
        match HandoffError::unsupported_platform("fork-exec") {
            HandoffError::LaunchFailure(e) => assert_eq!(e.kind(), io::ErrorKind::Unsupported),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
