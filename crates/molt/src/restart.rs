//! Process re-execution and successor spawning with file descriptor passing.
//!
//! Two ways to hand listeners on:
//! - [`ProcessLauncher::reexec`]: clear CLOEXEC on every registered
//!   listener, describe them in the environment, then `execve` the current
//!   binary. Same pid, same descriptor numbers.
//! - [`ProcessLauncher::spawn_successor`]: fork a child that finds the
//!   listeners at fds 3..N and exec the current binary there while this
//!   process keeps serving.

use std::collections::HashMap;
use std::convert::Infallible;
use std::ffi::{CString, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::env::HandoffEnv;
use crate::error::{HandoffError, Result};
use crate::lineage::{Lineage, SIGNAL_VAR, SPAWNER_PID_VAR, SUCCESSOR_PID_VAR};
use crate::platform::Platform;
use crate::registry::Registry;
use crate::signals::Signal;

/// First descriptor number a spawned successor finds listeners at.
pub const FIRST_INHERITED_FD: RawFd = 3;

/// Anything able to start a successor for the controller.
pub trait Launch: Send + Sync {
    /// Start a successor carrying `registry`; this process keeps running.
    fn spawn_successor(&self, registry: &Registry) -> Result<Successor>;
}

/// Handle to a spawned successor.
#[derive(Debug)]
pub struct Successor {
    pid: u32,
    child: Option<Child>,
}

impl Successor {
    /// A successor known only by pid.
    pub fn detached(pid: u32) -> Self {
        Self { pid, child: None }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The child process handle, when this process spawned it directly.
    pub fn into_child(self) -> Option<Child> {
        self.child
    }
}

/// Launches successors of the running program.
///
/// Clones share the recorded successor pid, so a clone held by a reload hook
/// sees a successor spawned through the controller's launcher.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    platform: Arc<dyn Platform>,
    program: Option<(PathBuf, Vec<OsString>)>,
    spawner: Option<u32>,
    successor: Arc<AtomicU32>,
}

impl ProcessLauncher {
    /// Launcher for the current executable, with the chain read from the
    /// environment.
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self::with_lineage(platform, Lineage::from_env())
    }

    pub fn with_lineage(platform: Arc<dyn Platform>, lineage: Lineage) -> Self {
        Self {
            platform,
            program: None,
            spawner: lineage.spawner,
            successor: Arc::new(AtomicU32::new(lineage.successor.unwrap_or(0))),
        }
    }

    /// Launch `program` with `args` instead of the current executable and
    /// its arguments.
    pub fn with_program<I, S>(mut self, program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.program = Some((program.into(), args.into_iter().map(Into::into).collect()));
        self
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// The chain as currently known, including a successor spawned by us.
    pub fn lineage(&self) -> Lineage {
        Lineage {
            spawner: self.spawner,
            successor: self.successor(),
            trigger: None,
        }
    }

    fn successor(&self) -> Option<u32> {
        match self.successor.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    fn program(&self) -> Result<(PathBuf, Vec<OsString>)> {
        if let Some((program, args)) = &self.program {
            return Ok((program.clone(), args.clone()));
        }
        let exe = std::env::current_exe().map_err(HandoffError::LaunchFailure)?;
        Ok((exe, std::env::args_os().skip(1).collect()))
    }

    /// Replace this process image with a fresh copy of the program, keeping
    /// pid and listening descriptors.
    ///
    /// Does not return on success. On failure every descriptor gets its
    /// previous close-on-exec state back and the error is returned.
    pub fn reexec(&self, registry: &Registry, trigger: Signal) -> Result<Infallible> {
        if !self.platform.supports_image_replace() {
            return Err(HandoffError::unsupported_platform("re-exec"));
        }
        if let Some(successor) = self.successor() {
            if std::os::unix::process::parent_id() == successor {
                return Err(HandoffError::ManagedChildGuardTripped(successor));
            }
        }

        let (exe, args) = self.program()?;
        let snapshot = registry.snapshot();
        let handoff = HandoffEnv::encode_with(&snapshot, |_, service| service.descriptor())?;

        let mut prepared: Vec<(RawFd, bool)> = Vec::with_capacity(snapshot.len());
        for service in &snapshot {
            match self.platform.set_inheritable(service.descriptor(), true) {
                Ok(previous) => prepared.push((service.descriptor(), previous)),
                Err(e) => {
                    self.restore(&prepared);
                    return Err(HandoffError::LaunchFailure(e));
                }
            }
        }

        let extra = self.reexec_vars(&handoff, trigger);

        info!(
            exe = %exe.display(),
            listener_count = snapshot.len(),
            signal = %trigger,
            "Re-executing in place"
        );

        let err = exec_with_env(&exe, &args, &extra, &[SPAWNER_PID_VAR]);
        error!(error = %err, exe = %exe.display(), "execve failed");
        self.restore(&prepared);
        Err(HandoffError::LaunchFailure(err))
    }

    /// Variables the re-executed image gets on top of the inherited
    /// environment. The chain carries over, minus our spawner.
    fn reexec_vars(&self, handoff: &HandoffEnv, trigger: Signal) -> Vec<(&'static str, String)> {
        let mut vars = handoff.vars();
        vars.push((SIGNAL_VAR, trigger.as_raw().to_string()));
        if let Some(successor) = self.successor() {
            vars.push((SUCCESSOR_PID_VAR, successor.to_string()));
        }
        vars
    }

    fn restore(&self, prepared: &[(RawFd, bool)]) {
        for &(fd, inheritable) in prepared {
            if let Err(e) = self.platform.set_inheritable(fd, inheritable) {
                warn!(fd, error = %e, "Failed to restore close-on-exec flag");
            }
        }
    }
}

impl Launch for ProcessLauncher {
    /// Spawn a successor that inherits every registered listener.
    ///
    /// 1. Encodes the registry with target positions 3..N
    /// 2. Stamps `MOLT_PPID` with our pid and clears `MOLT_PID`
    /// 3. Forks; in the child, dups each listener to a high scratch fd, then
    ///    `dup2`s it to its target (safe against clobber), then execs
    ///
    /// Nothing is closed or duplicated in this process.
    fn spawn_successor(&self, registry: &Registry) -> Result<Successor> {
        if !self.platform.supports_fork() {
            return Err(HandoffError::unsupported_platform("fork-exec"));
        }

        let (exe, args) = self.program()?;
        let cwd = std::env::current_dir().map_err(HandoffError::LaunchFailure)?;
        let snapshot = registry.snapshot();
        let handoff = HandoffEnv::encode_with(&snapshot, |i, _| FIRST_INHERITED_FD + i as RawFd)?;

        let sources: Vec<RawFd> = snapshot.iter().map(|service| service.descriptor()).collect();
        let scratch_floor = scratch_floor(&sources);
        let mut scratch = vec![-1; sources.len()];

        let mut command = Command::new(&exe);
        command
            .args(&args)
            .current_dir(&cwd)
            .envs(handoff.vars())
            .env(SPAWNER_PID_VAR, std::process::id().to_string())
            .env_remove(SUCCESSOR_PID_VAR)
            .env(SIGNAL_VAR, Signal::Quit.as_raw().to_string());

        // SAFETY: the closure only calls fcntl/dup2 and reads errno, all
        // async-signal-safe, and writes into storage allocated before fork.
        unsafe {
            command.pre_exec(move || remap_descriptors(&sources, &mut scratch, scratch_floor));
        }

        let child = command.spawn().map_err(|e| {
            error!(error = %e, exe = %exe.display(), "Failed to spawn successor");
            HandoffError::LaunchFailure(e)
        })?;

        let pid = child.id();
        self.successor.store(pid, Ordering::SeqCst);
        info!(
            pid,
            exe = %exe.display(),
            listener_count = snapshot.len(),
            names = ?handoff.names,
            "Spawned successor"
        );

        Ok(Successor {
            pid,
            child: Some(child),
        })
    }
}

/// Lowest scratch descriptor: above every source and every target.
fn scratch_floor(sources: &[RawFd]) -> RawFd {
    sources
        .iter()
        .copied()
        .chain(std::iter::once(FIRST_INHERITED_FD + sources.len() as RawFd))
        .max()
        .unwrap_or(FIRST_INHERITED_FD)
        + 1
}

/// Runs in the forked child: move `sources[i]` to `FIRST_INHERITED_FD + i`.
///
/// Phase 1 dups every source above `floor` (CLOEXEC set, so the scratch
/// copies vanish at exec); phase 2 `dup2`s them onto the targets, which
/// leaves the targets without CLOEXEC.
fn remap_descriptors(sources: &[RawFd], scratch: &mut [RawFd], floor: RawFd) -> io::Result<()> {
    for (slot, &source) in scratch.iter_mut().zip(sources) {
        let temp = unsafe { libc::fcntl(source, libc::F_DUPFD_CLOEXEC, floor) };
        if temp < 0 {
            return Err(io::Error::last_os_error());
        }
        *slot = temp;
    }
    for (i, &temp) in scratch.iter().enumerate() {
        let target = FIRST_INHERITED_FD + i as RawFd;
        if unsafe { libc::dup2(temp, target) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Execute a new process image with additional environment variables,
/// minus `removed`. Only returns on failure.
fn exec_with_env(
    exe: &Path,
    args: &[OsString],
    extra_env: &[(&str, String)],
    removed: &[&str],
) -> io::Error {
    let invalid = |what: &str| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("{what} contains a null byte"))
    };

    let Ok(c_exe) = CString::new(exe.as_os_str().as_bytes()) else {
        return invalid("executable path");
    };

    let mut c_args = Vec::with_capacity(args.len() + 1);
    for arg in std::iter::once(exe.as_os_str()).chain(args.iter().map(|a| a.as_os_str())) {
        match CString::new(arg.as_bytes()) {
            Ok(arg) => c_args.push(arg),
            Err(_) => return invalid("argument"),
        }
    }

    // Build environment: inherit current env + add our extras
    let mut env_map: HashMap<OsString, OsString> = std::env::vars_os().collect();
    for key in removed {
        env_map.remove(&OsString::from(key));
    }
    for (k, v) in extra_env {
        env_map.insert(OsString::from(k), OsString::from(v));
    }

    let mut c_env = Vec::with_capacity(env_map.len());
    for (k, v) in &env_map {
        let mut entry = k.as_bytes().to_vec();
        entry.push(b'=');
        entry.extend_from_slice(v.as_bytes());
        match CString::new(entry) {
            Ok(entry) => c_env.push(entry),
            Err(_) => return invalid("environment"),
        }
    }

    let c_arg_ptrs: Vec<*const libc::c_char> = c_args
        .iter()
        .map(|a| a.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    let c_env_ptrs: Vec<*const libc::c_char> = c_env
        .iter()
        .map(|e| e.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    unsafe {
        libc::execve(c_exe.as_ptr(), c_arg_ptrs.as_ptr(), c_env_ptrs.as_ptr());
    }

    // execve only returns on error
    io::Error::last_os_error()
}
