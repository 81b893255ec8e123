//! Registry ⇄ environment codec.
//!
//! Three parallel comma-separated lists describe the handed-off services:
//! `MOLT_FDS` (descriptor numbers), `MOLT_FD_SERVICES` (service names) and
//! `MOLT_FD_LABELS` (handle-labels). Index *i* of each list describes the
//! same service.

use std::collections::{HashMap, HashSet};
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::Arc;

use tracing::info;

use crate::error::{HandoffError, Result};
use crate::listener::{socket_kind, validate_fd, Listener, ListenerKind};
use crate::platform::Platform;
use crate::registry::{Registry, Service};

/// Descriptor numbers of inherited listeners.
pub const FDS_VAR: &str = "MOLT_FDS";
/// Service names of inherited listeners.
pub const SERVICES_VAR: &str = "MOLT_FD_SERVICES";
/// Handle-labels of inherited listeners.
pub const LABELS_VAR: &str = "MOLT_FD_LABELS";

const SEPARATOR: char = ',';

/// The three handoff variables. `None` means the variable was absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandoffEnv {
    pub fds: Option<String>,
    pub names: Option<String>,
    pub labels: Option<String>,
}

/// A validated entry, not yet owned by any listener.
struct Inherited {
    fd: RawFd,
    name: String,
    label: String,
    kind: ListenerKind,
}

impl HandoffEnv {
    /// Read the variables from the process environment.
    pub fn from_env() -> Self {
        Self {
            fds: std::env::var(FDS_VAR).ok(),
            names: std::env::var(SERVICES_VAR).ok(),
            labels: std::env::var(LABELS_VAR).ok(),
        }
    }

    /// True when no variable is present (cold start).
    pub fn is_absent(&self) -> bool {
        self.fds.is_none() && self.names.is_none() && self.labels.is_none()
    }

    /// `(name, value)` pairs ready for `Command::envs` or an exec environment.
    pub fn vars(&self) -> Vec<(&'static str, String)> {
        [
            (FDS_VAR, &self.fds),
            (SERVICES_VAR, &self.names),
            (LABELS_VAR, &self.labels),
        ]
        .into_iter()
        .map(|(key, value)| (key, value.clone().unwrap_or_default()))
        .collect()
    }

    /// Encode `registry` with each service's own descriptor number.
    pub fn encode(registry: &Registry) -> Result<Self> {
        Self::encode_with(&registry.snapshot(), |_, service| service.descriptor())
    }

    /// Encode `services` in order, asking `descriptor` which number the
    /// receiving process will see for entry `i`.
    pub fn encode_with<F>(services: &[Arc<Service>], mut descriptor: F) -> Result<Self>
    where
        F: FnMut(usize, &Service) -> RawFd,
    {
        let mut fds = Vec::with_capacity(services.len());
        let mut names = Vec::with_capacity(services.len());
        let mut labels = Vec::with_capacity(services.len());
        let mut owners: HashMap<RawFd, &str> = HashMap::with_capacity(services.len());

        for (i, service) in services.iter().enumerate() {
            for (what, value) in [("name", service.name()), ("label", service.label())] {
                if value.contains(SEPARATOR) {
                    return Err(HandoffError::corrupt(format!(
                        "service {what} {value:?} contains '{SEPARATOR}'"
                    )));
                }
            }
            let fd = descriptor(i, service);
            if let Some(owner) = owners.insert(fd, service.name()) {
                return Err(HandoffError::corrupt(format!(
                    "fd {fd} is registered as both {owner:?} and {:?}",
                    service.name()
                )));
            }
            fds.push(fd.to_string());
            names.push(service.name());
            labels.push(service.label());
        }

        if fds.len() != names.len() || fds.len() != labels.len() {
            return Err(HandoffError::corrupt("encoded lists differ in length"));
        }

        Ok(Self {
            fds: Some(fds.join(",")),
            names: Some(names.join(",")),
            labels: Some(labels.join(",")),
        })
    }

    /// Rebuild the registry handed to us by a predecessor.
    ///
    /// Every entry is validated and made inheritable before any descriptor
    /// is wrapped, so a failure leaves every descriptor untouched and
    /// unowned. On success each listener is the sole owner of its
    /// descriptor.
    pub fn decode(&self, platform: &dyn Platform) -> Result<Registry> {
        let registry = Registry::new();
        if self.is_absent() {
            return Ok(registry);
        }

        let fds = split(&self.fds);
        let names = split(&self.names);
        let labels = split(&self.labels);
        if fds.len() != names.len() || fds.len() != labels.len() {
            return Err(HandoffError::corrupt(format!(
                "names/fds/labels mismatch: {} fds, {} names, {} labels",
                fds.len(),
                names.len(),
                labels.len()
            )));
        }

        let mut inherited = Vec::with_capacity(fds.len());
        let mut seen_fds = HashSet::with_capacity(fds.len());
        let mut seen_names = HashSet::with_capacity(fds.len());
        for ((fd, name), label) in fds.into_iter().zip(names).zip(labels) {
            if fd.is_empty() && name.is_empty() && label.is_empty() {
                continue;
            }
            let entry = validate_entry(fd, name, label)?;
            if !seen_fds.insert(entry.fd) {
                return Err(HandoffError::corrupt(format!(
                    "fd {} listed more than once ({})",
                    entry.fd, entry.name
                )));
            }
            if !seen_names.insert(name) {
                return Err(HandoffError::corrupt(format!(
                    "service name {name:?} listed more than once"
                )));
            }
            inherited.push(entry);
        }

        for entry in &inherited {
            platform.set_inheritable(entry.fd, true).map_err(|e| {
                HandoffError::corrupt(format!("cannot prepare fd {} ({}): {e}", entry.fd, entry.name))
            })?;
        }

        for entry in inherited {
            // SAFETY: validate_entry checked the fd is an open socket of the
            // labelled family, and the spawner handed ownership to us.
            let listener: Arc<dyn Listener> = match entry.kind {
                ListenerKind::Tcp => Arc::new(unsafe { std::net::TcpListener::from_raw_fd(entry.fd) }),
                ListenerKind::Unix => {
                    Arc::new(unsafe { std::os::unix::net::UnixListener::from_raw_fd(entry.fd) })
                }
            };
            info!(fd = entry.fd, name = %entry.name, label = %entry.label, "Inherited listener from parent process");
            registry.insert(Service::new(entry.name, entry.label, entry.fd, listener));
        }

        Ok(registry)
    }
}

fn split(value: &Option<String>) -> Vec<&str> {
    value.as_deref().unwrap_or("").split(SEPARATOR).collect()
}

fn validate_entry(fd: &str, name: &str, label: &str) -> Result<Inherited> {
    let fd: RawFd = fd
        .trim()
        .parse()
        .ok()
        .filter(|fd: &RawFd| *fd >= 0)
        .ok_or_else(|| HandoffError::corrupt(format!("invalid descriptor {fd:?} for {name:?}")))?;

    let kind = ListenerKind::from_label(label)
        .ok_or_else(|| HandoffError::corrupt(format!("unknown listener kind in label {label:?}")))?;

    if !validate_fd(fd) {
        return Err(HandoffError::corrupt(format!(
            "inherited fd {fd} ({name}) is not a valid socket"
        )));
    }

    let actual = socket_kind(fd)
        .map_err(|e| HandoffError::corrupt(format!("cannot inspect fd {fd} ({name}): {e}")))?;
    if actual != Some(kind) {
        return Err(HandoffError::corrupt(format!(
            "fd {fd} ({name}) is not a {kind} socket"
        )));
    }

    Ok(Inherited {
        fd,
        name: name.to_string(),
        label: label.to_string(),
        kind,
    })
}
