//! Event stream (spec.md §6): `success`, `busy`, `circuit_open`,
//! `state_change(from, to)`, `registry_gc`. Dispatch is synchronous and must
//! never raise into the caller -- a misbehaving subscriber is logged and
//! skipped, not propagated, matching how `task_mgr.rs` swallows a panicking
//! task rather than bringing down the whole process.

use std::fmt;
use std::sync::{Arc, RwLock};

use crate::key::Name;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    Success {
        resource: Name,
        scope: &'static str,
        adapter_tag: Option<String>,
        wait_time_ms: Option<f64>,
    },
    Busy {
        resource: Name,
        scope: &'static str,
        adapter_tag: Option<String>,
    },
    CircuitOpen {
        resource: Name,
        scope: &'static str,
        adapter_tag: Option<String>,
    },
    StateChange {
        resource: Name,
        from: BreakerState,
        to: BreakerState,
    },
    RegistryGc {
        size: usize,
        examined: usize,
        cleared: usize,
        elapsed_ms: f64,
    },
}

impl Event {
    pub fn log(&self) {
        match self {
            Event::Success { resource, wait_time_ms, .. } => {
                tracing::debug!(resource = %resource, wait_time_ms = ?wait_time_ms, "semian_success");
            }
            Event::Busy { resource, .. } => {
                tracing::debug!(resource = %resource, "semian_busy");
            }
            Event::CircuitOpen { resource, .. } => {
                tracing::info!(resource = %resource, "semian_circuit_open");
            }
            Event::StateChange { resource, from, to } => {
                tracing::info!(resource = %resource, %from, %to, "semian_state_change");
            }
            Event::RegistryGc {
                size,
                examined,
                cleared,
                elapsed_ms,
            } => {
                tracing::debug!(size, examined, cleared, elapsed_ms, "semian_registry_gc");
            }
        }
    }
}

pub trait Subscriber: Send + Sync {
    fn notify(&self, event: &Event);
}

/// A process-wide dispatcher, explicitly constructed and injected rather than
/// reached for as a global (Design Note "global mutable singletons",
/// spec.md §9). `Kernel` owns one of these.
#[derive(Default, Clone)]
pub struct Dispatcher {
    subscribers: Arc<RwLock<Vec<Arc<dyn Subscriber>>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, subscriber: Arc<dyn Subscriber>) {
        self.subscribers.write().unwrap().push(subscriber);
    }

    pub fn unregister_all(&self) {
        self.subscribers.write().unwrap().clear();
    }

    pub fn dispatch(&self, event: Event) {
        event.log();
        let subscribers = self.subscribers.read().unwrap();
        for subscriber in subscribers.iter() {
            // Never let a subscriber's panic escape into the caller's acquire
            // path; a panicking subscriber is a bug in observability, not a
            // reason to fail the underlying call.
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                subscriber.notify(&event);
            }));
            if result.is_err() {
                tracing::error!("event subscriber panicked during dispatch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);
    impl Subscriber for Counter {
        fn notify(&self, _event: &Event) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicker;
    impl Subscriber for Panicker {
        fn notify(&self, _event: &Event) {
            panic!("boom");
        }
    }

    #[test]
    fn dispatch_reaches_all_subscribers() {
        let dispatcher = Dispatcher::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        dispatcher.register(counter.clone());
        dispatcher.register(counter.clone());
        dispatcher.dispatch(Event::RegistryGc {
            size: 1,
            examined: 1,
            cleared: 0,
            elapsed_ms: 0.1,
        });
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_subscriber_does_not_propagate() {
        let dispatcher = Dispatcher::new();
        dispatcher.register(Arc::new(Panicker));
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        dispatcher.register(counter.clone());
        dispatcher.dispatch(Event::RegistryGc {
            size: 1,
            examined: 1,
            cleared: 0,
            elapsed_ms: 0.1,
        });
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
