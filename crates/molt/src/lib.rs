//! # molt
//!
//! Zero-downtime listener handoff for long-running network services.
//!
//! ## Overview
//!
//! A process that wants to upgrade its binary or reload without closing a
//! listening port:
//! 1. Registers every listening socket in a [`Registry`] under a service name
//! 2. Runs a [`Controller`] that reacts to OS signals
//! 3. On the handoff signal, spawns a successor that inherits the sockets at
//!    fds 3..N, described by the `MOLT_FDS` / `MOLT_FD_SERVICES` /
//!    `MOLT_FD_LABELS` environment variables
//! 4. The successor rebuilds its registry with [`HandoffEnv::decode`] and starts
//!    accepting while the predecessor keeps serving until told to stop
//!
//! ## Signal Conventions
//!
//! - `SIGHUP`: reload hook
//! - `SIGUSR1`: reopen hook (posix profile)
//! - `SIGINT`: exit immediately, no hook
//! - `SIGQUIT`: quit hook, then exit
//! - `SIGTERM`: terminate hook, then exit
//! - `SIGUSR2`: spawn a successor; a second `SIGUSR2` exits (posix profile)
//!
//! ## Environment Variables
//!
//! - `MOLT_FDS`, `MOLT_FD_SERVICES`, `MOLT_FD_LABELS`: inherited services
//! - `MOLT_PPID`: pid of the process that spawned us
//! - `MOLT_PID`: pid of a successor we spawned
//! - `MOLT_SIGNAL`: signal number that triggered the last handoff
//! - `MOLT_PROFILE`: `posix` (default) or `reduced`
//! - `MOLT_SIGNAL_QUEUE`: signal queue capacity (default: 2)
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("molt requires a Unix platform (Linux or macOS)");

mod config;
mod controller;
mod env;
mod error;
mod lineage;
mod listener;
mod platform;
mod registry;
mod restart;
mod signals;
mod tls;

pub use config::{HandoffConfig, PROFILE_VAR, SIGNAL_QUEUE_VAR};
pub use controller::{Controller, Exit, Hook, HookError, Hooks, State};
pub use env::{HandoffEnv, FDS_VAR, LABELS_VAR, SERVICES_VAR};
pub use error::{CloseFailure, HandoffError, Result};
pub use lineage::{Lineage, SIGNAL_VAR, SPAWNER_PID_VAR, SUCCESSOR_PID_VAR};
pub use listener::{extract, Listener, ListenerKind};
pub use platform::{Platform, PosixPlatform, Profile, ReducedPlatform};
pub use registry::{Registry, Service};
pub use restart::{Launch, ProcessLauncher, Successor, FIRST_INHERITED_FD};
pub use signals::{Signal, SignalQueue};
pub use tls::TlsListener;
