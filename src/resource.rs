//! Protected-resource facade (C7, spec.md §4.7): composes a bulkhead with an
//! optional circuit breaker, exposes `acquire(timeout?) { block }`, emits
//! events, and guarantees the ticket is released on every exit path.

use std::ptr::NonNull;
use std::time::Duration;

use parking_lot::Mutex;

use crate::breaker::classic::ClassicBreaker;
use crate::breaker::pid::{self, PidSharedState};
use crate::bulkhead::{Bulkhead, TicketGuard};
use crate::config::{BreakerConfig, ResourceConfig};
use crate::error::{AcquireOutcome, Error, RejectReason, Result};
use crate::events::{Dispatcher, Event};
use crate::key::{derive_key, Name};
use crate::sys::semset::CARDINALITY;
use crate::sys::shm;
use crate::window::SharedWindow;

enum BreakerSlot {
    None,
    Classic {
        breaker: Mutex<ClassicBreaker>,
        window_handle: shm::SegmentHandle,
        window: NonNull<SharedWindow>,
    },
    Pid {
        state_handle: shm::SegmentHandle,
        state: NonNull<PidSharedState>,
    },
}

// Safety: the pointers inside point into SysV shared memory that outlives
// this process; access is always mediated by the meta-lock (window) or the
// embedded robust mutex (pid state), never Rust borrow-checked across
// processes.
unsafe impl Send for BreakerSlot {}
unsafe impl Sync for BreakerSlot {}

/// Outcome of `breaker_pre_check`, distinguishing an ordinary admission from
/// a PID-breaker probe call let through despite a would-be rejection
/// (spec.md §4.6 step 5's ping sampling).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PreCheckDecision {
    Admit,
    Ping,
    Reject,
}

/// A named dependency with a bulkhead and, optionally, a circuit breaker.
/// Spec.md §4.7 allows "bulkhead-only" or "breaker-only" subsets; this crate
/// always carries a bulkhead (every `ResourceConfig` specifies a `Capacity`)
/// and treats `BreakerConfig::None` as the breaker-absent case -- the
/// `acquire()` composition is unaffected either way.
pub struct ProtectedResource {
    name: Name,
    bulkhead: Bulkhead,
    breaker: BreakerSlot,
    events: Dispatcher,
}

impl ProtectedResource {
    pub fn register(name: Name, config: ResourceConfig, events: Dispatcher) -> Result<Self> {
        config
            .validate()
            .map_err(|m| Error::internal(name.as_str(), m))?;

        let bulkhead = Bulkhead::register(
            name.clone(),
            config.capacity,
            config.timeout,
            config.permissions,
            config.quota_grace_period,
            config.quota_grace_timeout,
        )?;

        let breaker = match config.breaker {
            BreakerConfig::None => BreakerSlot::None,
            BreakerConfig::Classic(cfg) => {
                let key = derive_key(&name, Some("_sliding_window"), CARDINALITY);
                let (handle, payload, _created) = unsafe {
                    shm::get_or_create(name.as_str(), key, config.permissions, shm::SegmentKind::Window)?
                };
                BreakerSlot::Classic {
                    breaker: Mutex::new(ClassicBreaker::new(cfg)),
                    window_handle: handle,
                    window: NonNull::new(payload.as_ptr() as *mut SharedWindow)
                        .expect("shmat never returns null on success"),
                }
            }
            BreakerConfig::Pid(cfg) => {
                let key = derive_key(&name, Some("_pid"), CARDINALITY);
                let (handle, payload, _created) = unsafe {
                    shm::get_or_create(name.as_str(), key, config.permissions, shm::SegmentKind::Pid(&cfg))?
                };
                BreakerSlot::Pid {
                    state_handle: handle,
                    state: NonNull::new(payload.as_ptr() as *mut PidSharedState)
                        .expect("shmat never returns null on success"),
                }
            }
        };

        Ok(ProtectedResource {
            name,
            bulkhead,
            breaker,
            events,
        })
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    fn window(&self) -> Option<&SharedWindow> {
        match &self.breaker {
            BreakerSlot::Classic { window, .. } => Some(unsafe { window.as_ref() }),
            _ => None,
        }
    }

    fn pid_state(&self) -> Option<&PidSharedState> {
        match &self.breaker {
            BreakerSlot::Pid { state, .. } => Some(unsafe { state.as_ref() }),
            _ => None,
        }
    }

    /// Runs `f`, composing breaker pre-check, ticket wait, outcome recording,
    /// and event dispatch exactly as spec.md §4.7 describes. `is_connection_error`
    /// classifies `f`'s error as one that should feed the breaker -- only
    /// "connection-like" exceptions do (spec.md §4.5, §6's adapter contract);
    /// application-domain errors pass through unrecorded (scenario D).
    pub fn acquire<T, E>(
        &self,
        timeout: Option<Duration>,
        is_connection_error: impl Fn(&E) -> bool,
        f: impl FnOnce() -> std::result::Result<T, E>,
    ) -> std::result::Result<T, Error>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let (guard, wait, is_ping) = match self.admit(timeout)? {
            AcquireOutcome::Ran(v) => v,
            AcquireOutcome::Rejected(reason) => {
                self.events.dispatch(match reason {
                    RejectReason::CircuitOpen => Event::CircuitOpen {
                        resource: self.name.clone(),
                        scope: "acquire",
                        adapter_tag: None,
                    },
                    RejectReason::Busy | RejectReason::Timeout => Event::Busy {
                        resource: self.name.clone(),
                        scope: "acquire",
                        adapter_tag: None,
                    },
                });
                return Err(reason.into_error(self.name.to_string()));
            }
        };

        // Adapters query `half_open_timeout()` themselves before invoking `f`
        // to shrink the downstream timeout during a HALF_OPEN trial call
        // (spec.md §6's `with_resource_timeout` hook).
        let result = f();
        drop(guard);

        match &result {
            Ok(_) => self.record_success(is_ping),
            Err(e) if is_connection_error(e) => self.record_failure(is_ping),
            Err(_) => {
                // Application-domain error: breaker is not touched (scenario D).
            }
        }

        match result {
            Ok(v) => {
                self.events.dispatch(Event::Success {
                    resource: self.name.clone(),
                    scope: "acquire",
                    adapter_tag: None,
                    wait_time_ms: Some(wait.as_secs_f64() * 1000.0),
                });
                Ok(v)
            }
            Err(e) => Err(Error::adapter(e)),
        }
    }

    /// The effective downstream timeout a trial call in HALF_OPEN should use,
    /// for adapters implementing `with_resource_timeout` (spec.md §6).
    pub fn half_open_timeout(&self) -> Option<Duration> {
        match &self.breaker {
            BreakerSlot::Classic { breaker, .. } => breaker.lock().half_open_timeout(),
            _ => None,
        }
    }

    /// Breaker pre-check plus ticket wait, wrapped as an `AcquireOutcome` so
    /// rejection is data, not an early-return exception, until `acquire`
    /// converts it to the public `Error` at the boundary (Design Note
    /// "exceptions as control flow", spec.md §9). The `bool` in `Ran` marks a
    /// PID-breaker probe call let through despite a would-be rejection
    /// (spec.md §4.6 step 5's ping sampling).
    fn admit(&self, timeout: Option<Duration>) -> Result<AcquireOutcome<(TicketGuard<'_>, Duration, bool)>> {
        let decision = self.breaker_pre_check()?;
        if decision == PreCheckDecision::Reject {
            return Ok(AcquireOutcome::Rejected(RejectReason::CircuitOpen));
        }
        let is_ping = decision == PreCheckDecision::Ping;

        match self.bulkhead.acquire_ticket(timeout) {
            Ok((guard, wait)) => Ok(AcquireOutcome::Ran((guard, wait, is_ping))),
            Err(Error::ResourceBusy { .. }) => Ok(AcquireOutcome::Rejected(RejectReason::Busy)),
            Err(Error::Timeout { .. }) => Ok(AcquireOutcome::Rejected(RejectReason::Timeout)),
            Err(e) => Err(e),
        }
    }

    fn breaker_pre_check(&self) -> Result<PreCheckDecision> {
        match &self.breaker {
            BreakerSlot::None => Ok(PreCheckDecision::Admit),
            BreakerSlot::Classic { breaker, .. } => {
                let window = self.window().expect("classic breaker always has a window");
                let mut breaker = breaker.lock();
                let before = breaker.state();
                let result = breaker.pre_check(window);
                let after = breaker.state();
                if before != after {
                    self.events.dispatch(Event::StateChange {
                        resource: self.name.clone(),
                        from: before,
                        to: after,
                    });
                }
                Ok(if result.is_ok() {
                    PreCheckDecision::Admit
                } else {
                    PreCheckDecision::Reject
                })
            }
            BreakerSlot::Pid { .. } => {
                let state = self.pid_state().expect("pid breaker always has state");
                Ok(match state.decide()? {
                    pid::Decision::Admit => PreCheckDecision::Admit,
                    pid::Decision::Ping => PreCheckDecision::Ping,
                    pid::Decision::Reject => PreCheckDecision::Reject,
                })
            }
        }
    }

    fn record_success(&self, is_ping: bool) {
        match &self.breaker {
            BreakerSlot::None => {}
            BreakerSlot::Classic { breaker, .. } => {
                let window = self.window().expect("classic breaker always has a window");
                breaker.lock().record_success(window);
            }
            BreakerSlot::Pid { .. } => {
                if let Some(state) = self.pid_state() {
                    let outcome = if is_ping {
                        state.record_ping_success()
                    } else {
                        state.record_success()
                    };
                    if let Err(e) = outcome {
                        tracing::error!(resource = %self.name, error = %e, "pid record_success failed");
                    }
                }
            }
        }
    }

    fn record_failure(&self, is_ping: bool) {
        match &self.breaker {
            BreakerSlot::None => {}
            BreakerSlot::Classic { breaker, .. } => {
                let window = self.window().expect("classic breaker always has a window");
                let mut breaker = breaker.lock();
                let before = breaker.state();
                breaker.record_failure(window);
                let after = breaker.state();
                if before != after {
                    self.events.dispatch(Event::StateChange {
                        resource: self.name.clone(),
                        from: before,
                        to: after,
                    });
                }
            }
            BreakerSlot::Pid { .. } => {
                if let Some(state) = self.pid_state() {
                    let outcome = if is_ping {
                        state.record_ping_failure()
                    } else {
                        state.record_failure()
                    };
                    if let Err(e) = outcome {
                        tracing::error!(resource = %self.name, error = %e, "pid record_failure failed");
                    }
                }
            }
        }
    }

    pub fn count(&self) -> Result<i32> {
        self.bulkhead.count()
    }

    pub fn tickets(&self) -> Result<i32> {
        self.bulkhead.tickets()
    }

    pub fn registered_workers(&self) -> Result<i32> {
        self.bulkhead.registered_workers()
    }

    pub fn unregister_worker(&self) -> Result<()> {
        self.bulkhead.unregister_worker()
    }

    /// Tears down every shared segment this resource owns: the semaphore set
    /// (via the bulkhead) and, if present, the window or PID segment.
    pub fn destroy(&self) -> Result<()> {
        self.bulkhead.destroy()?;
        match &self.breaker {
            BreakerSlot::None => {}
            BreakerSlot::Classic { window_handle, .. } => {
                shm::mark_for_deletion(window_handle)?;
            }
            BreakerSlot::Pid { state_handle, .. } => {
                shm::mark_for_deletion(state_handle)?;
            }
        }
        Ok(())
    }
}
