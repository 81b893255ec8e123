//! Registry of named listening services.
//!
//! # Architecture
//!
//! The registry uses a `DashMap` keyed by service name so registration,
//! lookup and deletion can run from any thread while the controller is
//! encoding or launching. Each entry carries the ordinal of its first
//! insertion; snapshots are sorted by it so one enumeration pass yields the
//! same order for descriptors, names and labels.

use std::any::Any;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::error::{CloseFailure, HandoffError, Result};
use crate::listener::{extract, Listener};

/// One registered listening endpoint.
pub struct Service {
    name: String,
    label: String,
    descriptor: RawFd,
    listener: Arc<dyn Listener>,
}

impl Service {
    pub(crate) fn new(
        name: String,
        label: String,
        descriptor: RawFd,
        listener: Arc<dyn Listener>,
    ) -> Self {
        Self {
            name,
            label,
            descriptor,
            listener,
        }
    }

    /// Unique key chosen by the application.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle-label, e.g. `tcp:127.0.0.1:8080`.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Raw OS descriptor; valid while the listener is open.
    pub fn descriptor(&self) -> RawFd {
        self.descriptor
    }

    /// The listener object owning the descriptor.
    pub fn listener(&self) -> &Arc<dyn Listener> {
        &self.listener
    }

    /// The listener as its concrete type, if it is a `T`.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.listener).into_any().downcast::<T>().ok()
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("label", &self.label)
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

struct Slot {
    ordinal: u64,
    service: Arc<Service>,
}

/// Concurrency-safe mapping from service name to [`Service`].
#[derive(Default)]
pub struct Registry {
    services: DashMap<String, Slot>,
    next_ordinal: AtomicU64,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` under `name`, replacing any service of that name.
    ///
    /// Fails only if the listener's descriptor cannot be extracted.
    pub fn put<L: Listener>(&self, name: impl Into<String>, listener: Arc<L>) -> Result<()> {
        let name = name.into();
        let descriptor = extract(listener.as_ref())?;
        let label = listener.label().map_err(|e| {
            HandoffError::UnsupportedListenerLayout(format!("cannot read address of '{name}': {e}"))
        })?;

        let service = Service::new(name.clone(), label, descriptor, listener);
        info!(name = %service.name, label = %service.label, fd = descriptor, "Registered listener");
        self.insert(service);
        Ok(())
    }

    pub(crate) fn insert(&self, service: Service) {
        let service = Arc::new(service);
        match self.services.entry(service.name.clone()) {
            Entry::Occupied(mut slot) => {
                debug!(name = %service.name, "Replacing registered listener");
                slot.get_mut().service = service;
            }
            Entry::Vacant(slot) => {
                let ordinal = self.next_ordinal.fetch_add(1, Ordering::Relaxed);
                slot.insert(Slot { ordinal, service });
            }
        }
    }

    /// Look up a service by name.
    pub fn get(&self, name: &str) -> Option<Arc<Service>> {
        self.services.get(name).map(|slot| Arc::clone(&slot.service))
    }

    /// Remove a service. The listener stays open for any other owner.
    pub fn delete(&self, name: &str) -> Option<Arc<Service>> {
        self.services.remove(name).map(|(_, slot)| slot.service)
    }

    /// The listener registered under `name`, if it is a `T`.
    pub fn listener<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.get(name)?.downcast::<T>()
    }

    /// Remove and return the listener registered under `name` if it is a `T`.
    ///
    /// A successor uses this to adopt an inherited listener. The entry is
    /// left alone when the type does not match.
    pub fn take<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        let service = self.get(name)?;
        let listener = service.downcast::<T>()?;
        self.remove_exact(&service).then_some(listener)
    }

    /// Remove `service` only if it is still the one registered under its
    /// name; a replacement put in the meantime stays.
    fn remove_exact(&self, service: &Arc<Service>) -> bool {
        self.services
            .remove_if(service.name(), |_, slot| Arc::ptr_eq(&slot.service, service))
            .is_some()
    }

    /// Services in registration order.
    ///
    /// Safe to call while other threads mutate the registry; concurrent
    /// changes may or may not be reflected.
    pub fn snapshot(&self) -> Vec<Arc<Service>> {
        let mut slots: Vec<(u64, Arc<Service>)> = self
            .services
            .iter()
            .map(|slot| (slot.ordinal, Arc::clone(&slot.service)))
            .collect();
        slots.sort_by_key(|(ordinal, _)| *ordinal);
        slots.into_iter().map(|(_, service)| service).collect()
    }

    /// Visit every service of a snapshot. The visitor may mutate the registry.
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&Service),
    {
        for service in self.snapshot() {
            visit(&service);
        }
    }

    /// Names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|service| service.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Remove and close every listener.
    ///
    /// Every listener gets a close attempt; all failures are reported
    /// together.
    pub fn close(&self) -> Result<()> {
        let mut failures = Vec::new();
        for service in self.snapshot() {
            self.services.remove(&service.name);
            match service.listener.close() {
                Ok(()) => debug!(name = %service.name, "Closed listener"),
                Err(error) => {
                    warn!(name = %service.name, error = %error, "Failed to close listener");
                    failures.push(CloseFailure {
                        name: service.name.clone(),
                        error,
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(HandoffError::AggregatedCloseFailure(failures))
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.snapshot()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::os::unix::io::AsRawFd;
    use std::sync::atomic::AtomicUsize;

    fn tcp() -> Arc<std::net::TcpListener> {
        Arc::new(std::net::TcpListener::bind("127.0.0.1:0").unwrap())
    }

    /// Listener with a made-up descriptor whose close result is scripted.
    struct Scripted {
        fd: RawFd,
        fail: bool,
        closes: Arc<AtomicUsize>,
    }

    impl Listener for Scripted {
        fn raw_fd(&self) -> Option<RawFd> {
            Some(self.fd)
        }

        fn label(&self) -> io::Result<String> {
            Ok(format!("tcp:scripted:{}", self.fd))
        }

        fn close(&self) -> io::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(io::Error::new(io::ErrorKind::Other, "close refused"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_put_get_delete() {
        let registry = Registry::new();
        let listener = tcp();
        let fd = listener.as_raw_fd();

        registry.put("web", Arc::clone(&listener)).unwrap();
        let service = registry.get("web").unwrap();
        assert_eq!(service.name(), "web");
        assert_eq!(service.descriptor(), fd);
        assert_eq!(service.label(), format!("tcp:{}", listener.local_addr().unwrap()));

        assert!(registry.delete("web").is_some());
        assert!(registry.get("web").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_put_replaces_existing_name() {
        let registry = Registry::new();
        let first = tcp();
        let second = tcp();

        registry.put("web", first).unwrap();
        registry.put("metrics", tcp()).unwrap();
        registry.put("web", Arc::clone(&second)).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("web").unwrap().descriptor(), second.as_raw_fd());
        // replacement keeps the original position
        assert_eq!(registry.names(), vec!["web", "metrics"]);
    }

    #[test]
    fn test_snapshot_in_registration_order() {
        let registry = Registry::new();
        for name in ["c", "a", "b"] {
            registry.put(name, tcp()).unwrap();
        }
        assert_eq!(registry.names(), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_for_each_may_mutate() {
        let registry = Registry::new();
        registry.put("a", tcp()).unwrap();
        registry.put("b", tcp()).unwrap();

        let mut seen = Vec::new();
        registry.for_each(|service| {
            seen.push(service.name().to_string());
            registry.delete(service.name());
        });

        assert_eq!(seen, vec!["a", "b"]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_typed_access_and_take() {
        let registry = Registry::new();
        let listener = tcp();
        registry.put("web", Arc::clone(&listener)).unwrap();

        assert!(registry.listener::<tokio::net::TcpListener>("web").is_none());
        assert!(registry.take::<tokio::net::TcpListener>("web").is_none());
        assert_eq!(registry.len(), 1);

        let taken = registry.take::<std::net::TcpListener>("web").unwrap();
        assert!(Arc::ptr_eq(&taken, &listener));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_take_leaves_replacement() {
        let registry = Registry::new();
        registry.put("web", tcp()).unwrap();
        let stale = registry.get("web").unwrap();
        let replacement = tcp();
        registry.put("web", Arc::clone(&replacement)).unwrap();

        assert!(!registry.remove_exact(&stale));
        assert_eq!(registry.get("web").unwrap().descriptor(), replacement.as_raw_fd());

        let taken = registry.take::<std::net::TcpListener>("web").unwrap();
        assert!(Arc::ptr_eq(&taken, &replacement));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_close_attempts_every_listener() {
        let registry = Registry::new();
        let closes = Arc::new(AtomicUsize::new(0));
        registry
            .put(
                "broken",
                Arc::new(Scripted {
                    fd: 10,
                    fail: true,
                    closes: Arc::clone(&closes),
                }),
            )
            .unwrap();
        registry
            .put(
                "healthy",
                Arc::new(Scripted {
                    fd: 11,
                    fail: false,
                    closes: Arc::clone(&closes),
                }),
            )
            .unwrap();

        match registry.close() {
            Err(HandoffError::AggregatedCloseFailure(failures)) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].name, "broken");
            }
            other => panic!("expected aggregated failure, got {other:?}"),
        }
        assert_eq!(closes.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_mutation_and_snapshot() {
        let registry = Arc::new(Registry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for j in 0..50 {
                        let name = format!("svc-{i}-{}", j % 5);
                        registry.put(name.clone(), tcp()).unwrap();
                        let _ = registry.snapshot();
                        if j % 3 == 0 {
                            registry.delete(&name);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), registry.len());
        assert!(snapshot.len() <= 40);
    }
}
