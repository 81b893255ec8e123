//! Handoff generation chain.
//!
//! A spawned successor finds its spawner's pid in `MOLT_PPID`; a process
//! that spawned a successor records the child's pid. The launcher uses this
//! to refuse a re-exec loop, and a successor uses it to tell its predecessor
//! to stop once it is serving.

use tracing::info;

use crate::error::{HandoffError, Result};
use crate::platform::Platform;
use crate::signals::Signal;

/// Pid of the process that spawned us.
pub const SPAWNER_PID_VAR: &str = "MOLT_PPID";
/// Pid of the successor we spawned.
pub const SUCCESSOR_PID_VAR: &str = "MOLT_PID";
/// Signal number that triggered the most recent handoff.
pub const SIGNAL_VAR: &str = "MOLT_SIGNAL";

/// Where this process sits in a predecessor/successor chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lineage {
    /// The process that spawned us, if we are a successor.
    pub spawner: Option<u32>,
    /// The successor we spawned, if any.
    pub successor: Option<u32>,
    /// The signal that triggered our launch.
    pub trigger: Option<Signal>,
}

impl Lineage {
    /// Read the chain from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the chain through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let pid = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u32>().ok());
        Self {
            spawner: pid(SPAWNER_PID_VAR),
            successor: pid(SUCCESSOR_PID_VAR),
            trigger: lookup(SIGNAL_VAR)
                .and_then(|v| v.trim().parse::<i32>().ok())
                .and_then(Signal::from_raw),
        }
    }

    /// True when this process belongs to a managed handoff chain.
    pub fn is_managed_child(&self) -> bool {
        self.spawner.is_some() || self.successor.is_some()
    }

    /// The process on the other side of the last handoff: the successor if
    /// we spawned one, otherwise our spawner.
    pub fn peer(&self) -> Option<u32> {
        self.successor.or(self.spawner)
    }

    /// Send the trigger signal (default `SIGQUIT`) to [`peer`](Self::peer).
    ///
    /// Returns the pid signalled, or `None` when there is no peer.
    pub fn signal_peer(&self, platform: &dyn Platform) -> Result<Option<u32>> {
        let Some(pid) = self.peer() else {
            return Ok(None);
        };
        let signal = self.trigger.unwrap_or(Signal::Quit);
        info!(pid, signal = %signal, "Sending signal to peer process");
        platform
            .deliver(pid, signal)
            .map_err(|source| HandoffError::SignalDelivery { pid, source })?;
        Ok(Some(pid))
    }
}
