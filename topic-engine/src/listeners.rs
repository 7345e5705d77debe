/********************************************************************************
 * Copyright (c) 2024 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

//! Ordered listener collections with per-listener failure isolation.

use crate::observability::events;
use parking_lot::RwLock;
use std::fmt::{Debug, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

const COMPONENT: &str = "listener_registry";

/// Listener handles keyed by pointer identity, dispatched in registration order.
///
/// A panicking listener is logged and skipped so the remaining listeners still
/// observe the event. A strict registry re-raises the panic instead.
pub struct ListenerRegistry<L: ?Sized> {
    name: &'static str,
    listeners: RwLock<Vec<Arc<L>>>,
    strict: bool,
}

impl<L: ?Sized> ListenerRegistry<L> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            listeners: RwLock::new(Vec::new()),
            strict: false,
        }
    }

    pub fn strict(name: &'static str) -> Self {
        Self {
            strict: true,
            ..Self::new(name)
        }
    }

    /// Adds `listener` unless the same handle is already registered.
    pub fn add(&self, listener: Arc<L>) -> bool {
        let mut listeners = self.listeners.write();
        if listeners
            .iter()
            .any(|existing| Arc::ptr_eq(existing, &listener))
        {
            return false;
        }
        listeners.push(listener);
        true
    }

    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|existing| !Arc::ptr_eq(existing, listener));
        listeners.len() != before
    }

    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Invokes `notify` for every listener registered at the time of the call.
    pub fn dispatch(&self, mut notify: impl FnMut(&L)) {
        let snapshot: Vec<Arc<L>> = self.listeners.read().clone();
        for listener in snapshot {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| notify(&listener)));
            if let Err(payload) = outcome {
                if self.strict {
                    panic::resume_unwind(payload);
                }
                warn!(
                    event = events::LISTENER_DISPATCH_FAILED,
                    component = COMPONENT,
                    registry = self.name,
                    reason = panic_message(payload.as_ref()),
                    "listener failed during dispatch"
                );
            }
        }
    }
}

impl<L: ?Sized> Debug for ListenerRegistry<L> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("name", &self.name)
            .field("listeners", &self.len())
            .field("strict", &self.strict)
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::ListenerRegistry;
    use parking_lot::Mutex;
    use std::sync::Arc;

    trait Recorder: Send + Sync {
        fn record(&self, value: u32);
    }

    struct Collecting(Mutex<Vec<u32>>);

    impl Recorder for Collecting {
        fn record(&self, value: u32) {
            self.0.lock().push(value);
        }
    }

    struct Exploding;

    impl Recorder for Exploding {
        fn record(&self, _value: u32) {
            panic!("listener exploded");
        }
    }

    #[test]
    fn failing_listener_does_not_stop_dispatch() {
        let registry: ListenerRegistry<dyn Recorder> = ListenerRegistry::new("test");
        let collecting = Arc::new(Collecting(Mutex::new(Vec::new())));
        registry.add(Arc::new(Exploding));
        registry.add(collecting.clone());

        registry.dispatch(|listener| listener.record(7));

        assert_eq!(*collecting.0.lock(), vec![7]);
    }

    #[test]
    fn strict_registry_propagates_listener_panic() {
        let registry: ListenerRegistry<dyn Recorder> = ListenerRegistry::strict("test");
        registry.add(Arc::new(Exploding));

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            registry.dispatch(|listener| listener.record(1))
        }));

        assert!(outcome.is_err());
    }

    #[test]
    fn duplicate_handles_are_registered_once_and_removable() {
        let registry: ListenerRegistry<dyn Recorder> = ListenerRegistry::new("test");
        let collecting: Arc<dyn Recorder> = Arc::new(Collecting(Mutex::new(Vec::new())));

        assert!(registry.add(collecting.clone()));
        assert!(!registry.add(collecting.clone()));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(&collecting));
        assert!(registry.is_empty());
    }
}
