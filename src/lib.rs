//! `semian`: a host-local fault-isolation kernel.
//!
//! A fleet of worker processes on one host shares per-dependency state
//! (ticket pools, sliding windows, PID-controlled rejection rates) through
//! SysV shared memory and kernel semaphores, so the fleet -- not just one
//! process -- reacts as a unit to a failing downstream. Two mechanisms
//! compose per named resource: a [`bulkhead`] that caps concurrent in-flight
//! calls, and a [`breaker`] (classic error-window or adaptive PID) that trips
//! on excess errors. [`resource::ProtectedResource`] composes both behind a
//! single `acquire` call; [`registry::ResourceRegistry`] bounds how many live
//! in one process.
//!
//! Out of scope: adapter shims for specific client libraries, CLI/config-file
//! loading, and cross-host coordination -- this crate is host-local only.

pub mod backoff;
pub mod breaker;
pub mod bulkhead;
pub mod config;
pub mod error;
pub mod events;
pub mod key;
pub mod registry;
pub mod resource;
pub mod sys;
pub mod window;

pub use config::{BreakerConfig, Capacity, ClassicBreakerConfig, PidBreakerConfig, ResourceConfig};
pub use error::{Error, Result};
pub use events::{BreakerState, Dispatcher, Event, Subscriber};
pub use key::Name;
pub use registry::ResourceRegistry;
pub use resource::ProtectedResource;

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;

/// Process-wide controller owning the resource registry and event dispatcher
/// (Design Note "global mutable singletons", spec.md §9): constructed
/// explicitly and passed to call sites rather than reached for as a bare
/// global. [`Kernel::global`] is the one sanctioned process-wide convenience
/// accessor, mirroring the teacher's `once_cell::sync::Lazy` statics for
/// genuinely process-global runtimes.
pub struct Kernel {
    registry: ResourceRegistry,
    events: Dispatcher,
}

impl Kernel {
    pub fn new(registry_max_size: usize, registry_min_age: Duration) -> Self {
        let events = Dispatcher::new();
        Kernel {
            registry: ResourceRegistry::new(registry_max_size, registry_min_age, events.clone()),
            events,
        }
    }

    pub fn events(&self) -> &Dispatcher {
        &self.events
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    /// Registers (or returns the already-registered) resource named `name`.
    pub fn register(&self, name: Name, config: ResourceConfig) -> Result<Arc<ProtectedResource>> {
        self.registry.get_or_insert(name, config)
    }
}

static GLOBAL: OnceCell<Kernel> = OnceCell::new();

impl Kernel {
    /// The process-wide default kernel, lazily constructed on first use with
    /// `registry_max_size`/`registry_min_age` from [`ResourceConfig::default`].
    /// Most code should build and thread its own `Kernel`; this exists for
    /// call sites -- adapter shims, test helpers -- with no natural place to
    /// own one.
    pub fn global() -> &'static Kernel {
        GLOBAL.get_or_init(|| {
            let defaults = ResourceConfig::default();
            Kernel::new(defaults.registry_max_size, defaults.registry_min_age)
        })
    }
}

/// Common imports for crate consumers.
pub mod prelude {
    pub use crate::config::{BreakerConfig, Capacity, ClassicBreakerConfig, PidBreakerConfig, ResourceConfig};
    pub use crate::error::{Error, Result};
    pub use crate::events::{BreakerState, Event, Subscriber};
    pub use crate::key::Name;
    pub use crate::resource::ProtectedResource;
    pub use crate::Kernel;
}
