//! Protected-resource registry (C7, spec.md §4.7): a bounded LRU keyed by
//! resource name, with opportunistic GC on insert.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::ResourceConfig;
use crate::error::Result;
use crate::events::{Dispatcher, Event};
use crate::key::Name;
use crate::resource::ProtectedResource;

struct CacheEntry {
    resource: Arc<ProtectedResource>,
    inserted_at: Instant,
}

struct Inner {
    order: VecDeque<Name>,
    entries: HashMap<Name, CacheEntry>,
}

/// Bounded LRU mapping resource name to `ProtectedResource`, with `max_size`
/// and `min_age`. Eviction only drops the registry's own `Arc` handle -- the
/// underlying shared-memory/semaphore state is untouched and other workers
/// keep seeing it -- so an entry with tickets currently checked out through
/// this handle is never evicted (spec.md §4.7's "bulkhead-bearing entries are
/// not eligible for eviction", read here as "entries with in-flight tickets",
/// since every resource in this crate carries a bulkhead; see DESIGN.md).
pub struct ResourceRegistry {
    inner: Mutex<Inner>,
    max_size: usize,
    min_age: Duration,
    events: Dispatcher,
}

impl ResourceRegistry {
    pub fn new(max_size: usize, min_age: Duration, events: Dispatcher) -> Self {
        ResourceRegistry {
            inner: Mutex::new(Inner {
                order: VecDeque::new(),
                entries: HashMap::new(),
            }),
            max_size,
            min_age,
            events,
        }
    }

    pub fn get(&self, name: &Name) -> Option<Arc<ProtectedResource>> {
        self.inner.lock().entries.get(name).map(|e| e.resource.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the existing entry for `name` if present, otherwise registers
    /// a fresh `ProtectedResource` via `config`, inserts it, and runs
    /// opportunistic GC (spec.md §4.7).
    pub fn get_or_insert(&self, name: Name, config: ResourceConfig) -> Result<Arc<ProtectedResource>> {
        if let Some(existing) = self.get(&name) {
            return Ok(existing);
        }

        let resource = Arc::new(ProtectedResource::register(
            name.clone(),
            config,
            self.events.clone(),
        )?);

        let mut inner = self.inner.lock();
        // Another thread may have won the race to insert the same name while
        // we were off registering; keep its entry rather than shadow it.
        if let Some(existing) = inner.entries.get(&name) {
            return Ok(existing.resource.clone());
        }
        inner.entries.insert(
            name.clone(),
            CacheEntry {
                resource: resource.clone(),
                inserted_at: Instant::now(),
            },
        );
        inner.order.push_back(name);

        self.gc(&mut inner);

        Ok(resource)
    }

    /// A single insertion evicts at most one entry while the registry is
    /// still at or under `max_size`; once over `max_size` it evicts greedily,
    /// oldest-eligible-first, until back under the cap (spec.md §4.7).
    fn gc(&self, inner: &mut Inner) {
        let started = Instant::now();
        let mut examined = 0usize;
        let mut cleared = 0usize;

        if inner.entries.len() <= self.max_size {
            if let Some(name) = self.find_evictable(inner) {
                examined += 1;
                self.evict(inner, &name);
                cleared += 1;
            }
        } else {
            while inner.entries.len() > self.max_size {
                match self.find_evictable(inner) {
                    Some(name) => {
                        examined += 1;
                        self.evict(inner, &name);
                        cleared += 1;
                    }
                    None => break,
                }
            }
        }

        if examined > 0 {
            self.events.dispatch(Event::RegistryGc {
                size: inner.entries.len(),
                examined,
                cleared,
                elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
            });
        }
    }

    fn evict(&self, inner: &mut Inner, name: &Name) {
        inner.entries.remove(name);
        if let Some(pos) = inner.order.iter().position(|n| n == name) {
            inner.order.remove(pos);
        }
    }

    /// Oldest (insertion-order) entry past `min_age` with zero tickets
    /// currently in flight.
    fn find_evictable(&self, inner: &Inner) -> Option<Name> {
        let now = Instant::now();
        inner
            .order
            .iter()
            .find(|name| {
                inner.entries.get(*name).is_some_and(|entry| {
                    now.duration_since(entry.inserted_at) >= self.min_age
                        && entry.resource.count().map(|c| c == 0).unwrap_or(false)
                })
            })
            .cloned()
    }
}
