//! Signal-driven lifecycle controller.
//!
//! One task drains the [`SignalQueue`] and walks the state machine:
//! - `SIGHUP` / `SIGUSR1` run the reload / reopen hooks and keep running
//! - `SIGINT` exits without a hook
//! - `SIGQUIT` / `SIGTERM` run the quit / terminate hooks, then exit
//! - `SIGUSR2` spawns a successor the first time and exits the second time
//!
//! The controller never closes listeners on exit; the embedding application
//! decides (usually from its quit hook) when to stop accepting.

use std::error::Error;
use std::fmt;
use std::io;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::{HandoffConfig, DEFAULT_SIGNAL_QUEUE};
use crate::error::HandoffError;
use crate::platform::Profile;
use crate::registry::Registry;
use crate::restart::{Launch, ProcessLauncher, Successor};
use crate::signals::{Signal, SignalQueue};

/// Error type returned by hooks.
pub type HookError = Box<dyn Error + Send + Sync>;

/// Application callback run on a lifecycle signal.
pub type Hook = Box<dyn Fn(&Registry) -> Result<(), HookError> + Send + Sync>;

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Serving and waiting for signals.
    Running,
    /// Pre-fork callback and successor launch in progress.
    HandoffRequested,
    /// Wait loop finished because of this signal.
    Exiting(Signal),
}

/// Why [`Controller::wait`] returned.
#[derive(Debug)]
pub struct Exit {
    /// The signal that ended the loop.
    pub signal: Signal,
    /// Set when a handoff was attempted and failed.
    pub error: Option<HandoffError>,
}

impl Exit {
    /// True when the loop ended without a launch failure.
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
    }
}

/// Optional application callbacks.
#[derive(Default)]
pub struct Hooks {
    on_reload: Option<Hook>,
    on_reopen: Option<Hook>,
    on_quit: Option<Hook>,
    on_terminate: Option<Hook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run on `SIGHUP`.
    pub fn on_reload<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Registry) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.on_reload = Some(Box::new(hook));
        self
    }

    /// Run on `SIGUSR1`.
    pub fn on_reopen<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Registry) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.on_reopen = Some(Box::new(hook));
        self
    }

    /// Run on `SIGQUIT`, before the loop returns.
    pub fn on_quit<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Registry) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.on_quit = Some(Box::new(hook));
        self
    }

    /// Run on `SIGTERM`, before the loop returns.
    pub fn on_terminate<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Registry) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.on_terminate = Some(Box::new(hook));
        self
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_reload", &self.on_reload.is_some())
            .field("on_reopen", &self.on_reopen.is_some())
            .field("on_quit", &self.on_quit.is_some())
            .field("on_terminate", &self.on_terminate.is_some())
            .finish()
    }
}

/// The lifecycle state machine.
pub struct Controller<L: Launch = ProcessLauncher> {
    registry: Arc<Registry>,
    hooks: Hooks,
    launcher: L,
    before_fork: Option<Box<dyn Fn() + Send + Sync>>,
    profile: Profile,
    queue_capacity: usize,
    state: State,
    handed_off: bool,
    successor: Option<Successor>,
}

impl Controller<ProcessLauncher> {
    /// Controller for the current executable, configured from `config`.
    pub fn from_config(config: &HandoffConfig, registry: Arc<Registry>) -> Self {
        let launcher = ProcessLauncher::new(config.profile.platform());
        Self::with_launcher(config, registry, launcher)
    }
}

impl<L: Launch> Controller<L> {
    pub fn new(registry: Arc<Registry>, launcher: L, profile: Profile) -> Self {
        Self {
            registry,
            hooks: Hooks::default(),
            launcher,
            before_fork: None,
            profile,
            queue_capacity: DEFAULT_SIGNAL_QUEUE,
            state: State::Running,
            handed_off: false,
            successor: None,
        }
    }

    /// Like [`Controller::new`], with profile and queue size from `config`.
    ///
    /// Pass a clone of a [`ProcessLauncher`] here when hooks hold another
    /// clone, so both see the same successor.
    pub fn with_launcher(config: &HandoffConfig, registry: Arc<Registry>, launcher: L) -> Self {
        let mut controller = Self::new(registry, launcher, config.profile);
        controller.queue_capacity = config.queue_capacity;
        controller
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Callback run right before a successor is spawned, e.g. to flush
    /// buffered output.
    pub fn before_fork<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.before_fork = Some(Box::new(callback));
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// The successor spawned by the last handoff.
    pub fn successor(&self) -> Option<&Successor> {
        self.successor.as_ref()
    }

    pub fn take_successor(&mut self) -> Option<Successor> {
        self.successor.take()
    }

    /// Install OS signal handlers and wait for a terminal signal.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn run(&mut self) -> io::Result<Exit> {
        let mut queue = SignalQueue::install(self.profile, self.queue_capacity)?;
        Ok(self.wait(&mut queue).await)
    }

    /// Drain `queue` until a signal ends the loop.
    ///
    /// A queue with no producers left counts as an interrupt.
    pub async fn wait(&mut self, queue: &mut SignalQueue) -> Exit {
        info!(profile = %self.profile, pid = std::process::id(), "Waiting for signals");
        loop {
            match queue.recv().await {
                Some(signal) => {
                    if let Some(exit) = self.handle(signal) {
                        return exit;
                    }
                }
                None => {
                    warn!("Signal queue closed");
                    return self.exit(Signal::Interrupt, None);
                }
            }
        }
    }

    /// Apply one signal. Returns the exit when the loop should end.
    pub fn handle(&mut self, signal: Signal) -> Option<Exit> {
        if let State::Exiting(previous) = self.state {
            debug!(signal = %signal, previous = %previous, "Already exiting, ignoring signal");
            return Some(Exit {
                signal: previous,
                error: None,
            });
        }

        if self.profile == Profile::Reduced && matches!(signal, Signal::Reopen | Signal::Handoff) {
            info!(signal = %signal, "Signal not handled under reduced profile");
            return None;
        }

        debug!(signal = %signal, "Handling signal");
        match signal {
            Signal::Reload => {
                self.run_hook("reload", self.hooks.on_reload.as_ref());
                None
            }
            Signal::Reopen => {
                self.run_hook("reopen", self.hooks.on_reopen.as_ref());
                None
            }
            Signal::Interrupt => Some(self.exit(Signal::Interrupt, None)),
            Signal::Quit => {
                self.run_hook("quit", self.hooks.on_quit.as_ref());
                Some(self.exit(Signal::Quit, None))
            }
            Signal::Terminate => {
                self.run_hook("terminate", self.hooks.on_terminate.as_ref());
                Some(self.exit(Signal::Terminate, None))
            }
            Signal::Handoff => self.handoff(),
        }
    }

    fn handoff(&mut self) -> Option<Exit> {
        if self.handed_off {
            info!("Second handoff signal, exiting");
            return Some(self.exit(Signal::Handoff, None));
        }

        self.state = State::HandoffRequested;
        if let Some(callback) = &self.before_fork {
            callback();
        }

        match self.launcher.spawn_successor(&self.registry) {
            Ok(successor) => {
                info!(pid = successor.pid(), "Handoff complete, still serving");
                self.handed_off = true;
                self.successor = Some(successor);
                self.state = State::Running;
                None
            }
            Err(e) => {
                error!(error = %e, "Handoff failed");
                Some(self.exit(Signal::Handoff, Some(e)))
            }
        }
    }

    fn run_hook(&self, name: &str, hook: Option<&Hook>) {
        let Some(hook) = hook else {
            debug!(hook = name, "No hook registered");
            return;
        };
        if let Err(e) = hook(&self.registry) {
            error!(hook = name, error = %e, "Hook failed");
        }
    }

    fn exit(&mut self, signal: Signal, error: Option<HandoffError>) -> Exit {
        self.state = State::Exiting(signal);
        info!(signal = %signal, "Leaving wait loop");
        Exit { signal, error }
    }
}

impl<L: Launch> fmt::Debug for Controller<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("profile", &self.profile)
            .field("state", &self.state)
            .field("handed_off", &self.handed_off)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::error::Result;

    #[derive(Default)]
    struct CountingLauncher {
        spawns: AtomicUsize,
        fail: bool,
    }

    impl Launch for CountingLauncher {
        fn spawn_successor(&self, _registry: &Registry) -> Result<Successor> {
            let n = self.spawns.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(HandoffError::LaunchFailure(io::Error::new(
                    io::ErrorKind::NotFound,
                    "no such binary",
                )));
            }
            Ok(Successor::detached(1000 + n as u32))
        }
    }

    fn recorder(
        log: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
    ) -> impl Fn(&Registry) -> Result<(), HookError> {
        let log = Arc::clone(log);
        move |_: &Registry| {
            log.lock().unwrap().push(name);
            Ok(())
        }
    }

    fn controller(profile: Profile) -> Controller<CountingLauncher> {
        Controller::new(Arc::new(Registry::new()), CountingLauncher::default(), profile)
    }

    #[test]
    fn test_terminate_runs_terminate_hook() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut controller = controller(Profile::Posix).with_hooks(
            Hooks::new()
                .on_reload(recorder(&log, "reload"))
                .on_terminate(recorder(&log, "terminate")),
        );

        let exit = controller.handle(Signal::Terminate).unwrap();
        assert_eq!(exit.signal, Signal::Terminate);
        assert_eq!(*log.lock().unwrap(), vec!["terminate"]);
        assert_eq!(controller.state(), State::Exiting(Signal::Terminate));
    }

    #[test]
    fn test_reload_and_reopen_keep_running() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut controller = controller(Profile::Posix).with_hooks(
            Hooks::new()
                .on_reload(recorder(&log, "reload"))
                .on_reopen(recorder(&log, "reopen")),
        );

        assert!(controller.handle(Signal::Reload).is_none());
        assert!(controller.handle(Signal::Reopen).is_none());
        assert_eq!(controller.state(), State::Running);
        assert_eq!(*log.lock().unwrap(), vec!["reload", "reopen"]);
    }

    #[test]
    fn test_hook_error_is_isolated() {
        let mut controller = controller(Profile::Posix)
            .with_hooks(Hooks::new().on_reload(|_| Err("config file unreadable".into())));
        assert!(controller.handle(Signal::Reload).is_none());
        assert_eq!(controller.state(), State::Running);
    }

    #[test]
    fn test_interrupt_skips_hooks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut controller = controller(Profile::Posix)
            .with_hooks(Hooks::new().on_quit(recorder(&log, "quit")));

        let exit = controller.handle(Signal::Interrupt).unwrap();
        assert_eq!(exit.signal, Signal::Interrupt);
        assert!(exit.is_clean());
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_first_handoff_spawns_second_exits() {
        let forks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&forks);
        let mut controller = controller(Profile::Posix).before_fork(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(controller.handle(Signal::Handoff).is_none());
        assert_eq!(controller.state(), State::Running);
        assert_eq!(controller.successor().map(Successor::pid), Some(1000));

        let exit = controller.handle(Signal::Handoff).unwrap();
        assert_eq!(exit.signal, Signal::Handoff);
        assert!(exit.is_clean());
        assert_eq!(controller.launcher().spawns.load(Ordering::SeqCst), 1);
        assert_eq!(forks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_handoff_exits_with_error() {
        let mut controller = Controller::new(
            Arc::new(Registry::new()),
            CountingLauncher {
                fail: true,
                ..CountingLauncher::default()
            },
            Profile::Posix,
        );

        let exit = controller.handle(Signal::Handoff).unwrap();
        assert_eq!(exit.signal, Signal::Handoff);
        assert!(matches!(exit.error, Some(HandoffError::LaunchFailure(_))));
        assert!(controller.successor().is_none());
    }

    #[test]
    fn test_reduced_profile_ignores_handoff_and_reopen() {
        let mut controller = controller(Profile::Reduced);
        assert!(controller.handle(Signal::Handoff).is_none());
        assert!(controller.handle(Signal::Reopen).is_none());
        assert_eq!(controller.launcher().spawns.load(Ordering::SeqCst), 0);
        assert_eq!(controller.state(), State::Running);
    }

    #[tokio::test]
    async fn test_wait_returns_on_quit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut controller = controller(Profile::Posix).with_hooks(
            Hooks::new()
                .on_reload(recorder(&log, "reload"))
                .on_quit(recorder(&log, "quit")),
        );
        let (tx, mut queue) = SignalQueue::channel(4);
        tx.send(Signal::Reload).await.unwrap();
        tx.send(Signal::Quit).await.unwrap();

        let exit = controller.wait(&mut queue).await;
        assert_eq!(exit.signal, Signal::Quit);
        assert_eq!(*log.lock().unwrap(), vec!["reload", "quit"]);
    }

    #[tokio::test]
    async fn test_closed_queue_is_interrupt() {
        let mut controller = controller(Profile::Posix);
        let (tx, mut queue) = SignalQueue::channel(2);
        drop(tx);

        let exit = controller.wait(&mut queue).await;
        assert_eq!(exit.signal, Signal::Interrupt);
        assert_eq!(controller.state(), State::Exiting(Signal::Interrupt));
    }

    /// A reload hook holding a clone of the controller's launcher sees the
    /// successor the controller spawned.
    #[test]
    fn test_shared_launcher_sees_handoff_successor() {
        use crate::lineage::Lineage;
        use crate::platform::PosixPlatform;

        let registry = Arc::new(Registry::new());
        registry
            .put("web", Arc::new(std::net::TcpListener::bind("127.0.0.1:0").unwrap()))
            .unwrap();
        let launcher = ProcessLauncher::with_lineage(Arc::new(PosixPlatform), Lineage::default())
            .with_program("/bin/true", Vec::<std::ffi::OsString>::new());
        let hook_copy = launcher.clone();
        let config = HandoffConfig {
            queue_capacity: 3,
            ..HandoffConfig::default()
        };
        let mut controller = Controller::with_launcher(&config, registry, launcher);

        assert!(controller.handle(Signal::Handoff).is_none());
        let successor = controller.take_successor().unwrap();
        assert_eq!(hook_copy.lineage().successor, Some(successor.pid()));
        successor.into_child().unwrap().wait().unwrap();
    }
}
