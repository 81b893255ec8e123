//! OS signal intake.
//!
//! Signals are forwarded from tokio signal streams into a bounded queue that
//! the [`Controller`](crate::Controller) drains one notification at a time.
//! The OS coalesces repeated deliveries and a full queue drops the newest
//! notification, so an operator may have to resend.

use std::fmt;
use std::io;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::platform::Profile;

/// Signals the lifecycle reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// SIGHUP: reload configuration.
    Reload,
    /// SIGUSR1: reopen log files.
    Reopen,
    /// SIGINT: stop now.
    Interrupt,
    /// SIGQUIT: graceful stop.
    Quit,
    /// SIGTERM: stop.
    Terminate,
    /// SIGUSR2: spawn a successor; a second one stops.
    Handoff,
}

impl Signal {
    /// The raw signal number.
    pub fn as_raw(self) -> i32 {
        match self {
            Signal::Reload => libc::SIGHUP,
            Signal::Reopen => libc::SIGUSR1,
            Signal::Interrupt => libc::SIGINT,
            Signal::Quit => libc::SIGQUIT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Handoff => libc::SIGUSR2,
        }
    }

    /// Map a raw signal number back to a [`Signal`].
    pub fn from_raw(signo: i32) -> Option<Self> {
        match signo {
            libc::SIGHUP => Some(Signal::Reload),
            libc::SIGUSR1 => Some(Signal::Reopen),
            libc::SIGINT => Some(Signal::Interrupt),
            libc::SIGQUIT => Some(Signal::Quit),
            libc::SIGTERM => Some(Signal::Terminate),
            libc::SIGUSR2 => Some(Signal::Handoff),
            _ => None,
        }
    }

    fn kind(self) -> SignalKind {
        SignalKind::from_raw(self.as_raw())
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Signal::Reload => "SIGHUP",
            Signal::Reopen => "SIGUSR1",
            Signal::Interrupt => "SIGINT",
            Signal::Quit => "SIGQUIT",
            Signal::Terminate => "SIGTERM",
            Signal::Handoff => "SIGUSR2",
        };
        f.write_str(name)
    }
}

/// Bounded queue of received signals.
///
/// Dropping the queue stops the forwarding tasks.
pub struct SignalQueue {
    rx: mpsc::Receiver<Signal>,
    stop: CancellationToken,
}

impl SignalQueue {
    /// Register handlers for every signal of `profile` and forward them into
    /// a queue holding at most `capacity` pending notifications.
    ///
    /// Must be called from within a tokio runtime.
    pub fn install(profile: Profile, capacity: usize) -> io::Result<Self> {
        let (tx, queue) = Self::channel(capacity);

        for &sig in profile.signals() {
            let mut stream = signal(sig.kind())?;
            let tx = tx.clone();
            let stop = queue.stop.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        received = stream.recv() => {
                            if received.is_none() {
                                break;
                            }
                            match tx.try_send(sig) {
                                Ok(()) => debug!(signal = %sig, "Queued signal"),
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    warn!(signal = %sig, "Signal queue full, dropping notification");
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => break,
                            }
                        }
                    }
                }
            });
        }

        debug!(%profile, capacity, "Signal handlers installed");
        Ok(queue)
    }

    /// A queue fed by hand instead of by the OS.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Signal>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            tx,
            Self {
                rx,
                stop: CancellationToken::new(),
            },
        )
    }

    /// Wait for the next notification. `None` once every producer is gone.
    pub async fn recv(&mut self) -> Option<Signal> {
        self.rx.recv().await
    }
}

impl Drop for SignalQueue {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
