//! Bulkhead / Resource (C4, spec.md §4.4): ticket acquisition with timeout,
//! quota<->worker reconciliation, worker registration lifecycle.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::Capacity;
use crate::error::{Error, Result};
use crate::key::{derive_key, Name};
use crate::sys::semset::{OpResult, SemIndex, CARDINALITY};
use crate::sys::SemaphoreSet;

pub struct Bulkhead {
    name: Name,
    semset: SemaphoreSet,
    capacity: Capacity,
    default_timeout: Duration,
    quota_grace_period: Option<Duration>,
    quota_grace_timeout: Option<Duration>,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Bulkhead {
    pub fn register(
        name: Name,
        capacity: Capacity,
        default_timeout: Duration,
        permissions: u32,
        quota_grace_period: Option<Duration>,
        quota_grace_timeout: Option<Duration>,
    ) -> Result<Self> {
        capacity
            .validate()
            .map_err(|m| Error::internal(name.as_str(), m))?;

        let key = derive_key(&name, None, CARDINALITY);
        let (semset, _created) = SemaphoreSet::get_or_create(name.as_str(), key, permissions)?;

        // Worker registration: +1 REGISTERED_WORKERS with UNDO. The kernel
        // auto-decrements this on process exit, satisfying invariant 3
        // (spec.md §8) without any crash-detection logic of our own.
        semset.op(name.as_str(), SemIndex::RegisteredWorkers, 1, true, None)?;

        if let Capacity::Tickets(n) = capacity {
            // Static tickets: reconcile once, idempotently, against
            // CONFIGURED_TICKETS so a second worker opening the same
            // resource with the same static count is a no-op.
            let _guard = semset.meta_lock(name.as_str())?;
            let configured = semset.value(name.as_str(), SemIndex::ConfiguredTickets)?;
            let delta = n as i32 - configured;
            if delta != 0 {
                semset.op(name.as_str(), SemIndex::Tickets, delta as i16, false, None)?;
                semset.op(
                    name.as_str(),
                    SemIndex::ConfiguredTickets,
                    delta as i16,
                    false,
                    None,
                )?;
            }
        }

        Ok(Bulkhead {
            name,
            semset,
            capacity,
            default_timeout,
            quota_grace_period,
            quota_grace_timeout,
        })
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    /// Reconciles `CONFIGURED_TICKETS`/`CONFIGURED_WORKERS` against the
    /// current `REGISTERED_WORKERS` count (spec.md §4.4 step 1). A no-op
    /// under the meta-lock when nothing changed since the last call.
    fn reconcile_quota(&self, quota: f64) -> Result<()> {
        let _guard = self.semset.meta_lock(self.name.as_str())?;

        let registered = self
            .semset
            .value(self.name.as_str(), SemIndex::RegisteredWorkers)?;
        let configured_workers = self
            .semset
            .value(self.name.as_str(), SemIndex::ConfiguredWorkers)?;
        let worker_delta = registered - configured_workers;
        if worker_delta == 0 {
            return Ok(());
        }

        self.semset.op(
            self.name.as_str(),
            SemIndex::ConfiguredWorkers,
            worker_delta as i16,
            false,
            None,
        )?;

        let new_configured_workers = configured_workers + worker_delta;
        let new_tickets = (new_configured_workers as f64 * quota).ceil() as i32;
        let configured_tickets = self
            .semset
            .value(self.name.as_str(), SemIndex::ConfiguredTickets)?;
        let ticket_delta = new_tickets - configured_tickets;
        if ticket_delta != 0 {
            self.semset.op(
                self.name.as_str(),
                SemIndex::Tickets,
                ticket_delta as i16,
                false,
                None,
            )?;
            self.semset.op(
                self.name.as_str(),
                SemIndex::ConfiguredTickets,
                ticket_delta as i16,
                false,
                None,
            )?;
        }

        Ok(())
    }

    fn effective_timeout(&self, override_timeout: Option<Duration>) -> Result<Duration> {
        if let Capacity::Quota(_) = self.capacity {
            if let (Some(grace_period), Some(grace_timeout)) =
                (self.quota_grace_period, self.quota_grace_timeout)
            {
                let ctime = self.semset.ctime()?;
                let age = (now_unix() - ctime as i64).max(0) as u64;
                if age < grace_period.as_secs() {
                    return Ok(grace_timeout);
                }
            }
        }
        Ok(override_timeout.unwrap_or(self.default_timeout))
    }

    /// Timed ticket wait (spec.md §4.4 steps 2-3). Returns a guard whose
    /// `Drop` releases the ticket unconditionally (Design Note "block-with-
    /// cleanup", spec.md §9) plus the wall-clock wait time.
    pub fn acquire_ticket(&self, override_timeout: Option<Duration>) -> Result<(TicketGuard<'_>, Duration)> {
        if let Capacity::Quota(q) = self.capacity {
            self.reconcile_quota(q)?;
        }

        let timeout = self.effective_timeout(override_timeout)?;
        let started = Instant::now();

        match self
            .semset
            .op(self.name.as_str(), SemIndex::Tickets, -1, true, Some(timeout))?
        {
            OpResult::Applied => {
                let wait = started.elapsed();
                Ok((
                    TicketGuard {
                        name: &self.name,
                        semset: &self.semset,
                    },
                    wait,
                ))
            }
            OpResult::TimedOut => {
                if timeout.is_zero() {
                    Err(Error::ResourceBusy {
                        name: self.name.to_string(),
                    })
                } else {
                    Err(Error::Timeout {
                        name: self.name.to_string(),
                    })
                }
            }
            OpResult::Interrupted => Err(Error::internal(
                self.name.as_str(),
                "ticket wait interrupted by signal",
            )),
        }
    }

    /// Best-effort decrement that never waits: `-1` with `NOWAIT|UNDO`, with
    /// `EAGAIN` treated as "already zero" (spec.md §4.4's `unregister_worker`).
    pub fn unregister_worker(&self) -> Result<()> {
        self.semset
            .try_decrement_nowait(self.name.as_str(), SemIndex::RegisteredWorkers)
    }

    /// Acquires the meta-lock with a timeout, then removes the semaphore set.
    /// Concurrent destroyers racing see EINVAL/EIDRM and succeed silently
    /// (spec.md §4.4).
    pub fn destroy(&self) -> Result<()> {
        let result = self.semset.meta_lock(self.name.as_str());
        match result {
            Ok(guard) => {
                drop(guard);
                self.semset.destroy(self.name.as_str())
            }
            Err(e) if e.is_benign_race() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn tickets(&self) -> Result<i32> {
        self.semset.value(self.name.as_str(), SemIndex::Tickets)
    }

    pub fn configured_tickets(&self) -> Result<i32> {
        self.semset
            .value(self.name.as_str(), SemIndex::ConfiguredTickets)
    }

    pub fn registered_workers(&self) -> Result<i32> {
        self.semset
            .value(self.name.as_str(), SemIndex::RegisteredWorkers)
    }

    /// In-flight count: `CONFIGURED_TICKETS - TICKETS` (invariant 1, spec.md §8).
    pub fn count(&self) -> Result<i32> {
        Ok(self.configured_tickets()? - self.tickets()?)
    }
}

/// RAII ticket. `Drop` performs the `+1` on `TICKETS` with `UNDO` on every
/// exit path -- normal return, early `?`, or unwind.
pub struct TicketGuard<'a> {
    name: &'a Name,
    semset: &'a SemaphoreSet,
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self
            .semset
            .op(self.name.as_str(), SemIndex::Tickets, 1, true, None)
        {
            // A release attempt after an acquired ticket failing records its
            // errno but never raises, to preserve cleanup semantics on all
            // paths (spec.md §7).
            tracing::error!(resource = %self.name, error = %e, "ticket release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Barrier;

    fn unique_name(salt: &str) -> Name {
        Name::new(format!("bulkhead_test_{}_{}", std::process::id(), salt)).unwrap()
    }

    #[test]
    fn static_tickets_saturate_and_second_caller_is_busy() {
        let name = unique_name("saturate");
        let bh = Bulkhead::register(
            name.clone(),
            Capacity::Tickets(1),
            Duration::from_secs(0),
            0o600,
            None,
            None,
        )
        .unwrap();

        let (guard, _wait) = bh.acquire_ticket(None).unwrap();
        let err = bh.acquire_ticket(Some(Duration::from_millis(0))).unwrap_err();
        assert!(matches!(err, Error::ResourceBusy { .. }));
        drop(guard);

        // after release, a subsequent acquire succeeds again
        let (_guard2, _wait2) = bh.acquire_ticket(None).unwrap();
        bh.destroy().unwrap();
    }

    #[test]
    fn ticket_released_on_panic_unwind() {
        let name = unique_name("panic");
        let bh = Arc::new(
            Bulkhead::register(
                name,
                Capacity::Tickets(1),
                Duration::from_secs(0),
                0o600,
                None,
                None,
            )
            .unwrap(),
        );

        let bh2 = bh.clone();
        let result = std::panic::catch_unwind(move || {
            let (_guard, _wait) = bh2.acquire_ticket(None).unwrap();
            panic!("boom inside acquired block");
        });
        assert!(result.is_err());

        // ticket must have been released by the guard's Drop during unwind
        assert_eq!(bh.tickets().unwrap(), bh.configured_tickets().unwrap());
        bh.destroy().unwrap();
    }

    #[test]
    fn quota_scale_up_on_new_worker_registration() {
        let name = unique_name("quota");
        let bh1 = Bulkhead::register(
            name.clone(),
            Capacity::Quota(0.5),
            Duration::from_secs(0),
            0o600,
            None,
            None,
        )
        .unwrap();
        let (guard, _) = bh1.acquire_ticket(None).unwrap();
        drop(guard);
        assert_eq!(bh1.configured_tickets().unwrap(), 1); // ceil(1 * 0.5)

        let bh2 = Bulkhead::register(
            name.clone(),
            Capacity::Quota(0.5),
            Duration::from_secs(0),
            0o600,
            None,
            None,
        )
        .unwrap();
        let (guard2, _) = bh2.acquire_ticket(None).unwrap();
        drop(guard2);
        assert_eq!(bh2.configured_tickets().unwrap(), 1); // ceil(2 * 0.5)

        let bh3 = Bulkhead::register(
            name,
            Capacity::Quota(0.5),
            Duration::from_secs(0),
            0o600,
            None,
            None,
        )
        .unwrap();
        let (guard3, _) = bh3.acquire_ticket(None).unwrap();
        drop(guard3);
        assert_eq!(bh3.configured_tickets().unwrap(), 2); // ceil(3 * 0.5)

        bh3.destroy().unwrap();
    }

    #[test]
    fn concurrent_threads_contend_for_a_single_ticket() {
        let name = unique_name("contend");
        let bh = Arc::new(
            Bulkhead::register(
                name,
                Capacity::Tickets(1),
                Duration::from_millis(200),
                0o600,
                None,
                None,
            )
            .unwrap(),
        );
        let barrier = Arc::new(Barrier::new(2));

        let bh1 = bh.clone();
        let barrier1 = barrier.clone();
        let t1 = std::thread::spawn(move || {
            barrier1.wait();
            let (_g, _w) = bh1.acquire_ticket(None).unwrap();
            std::thread::sleep(Duration::from_millis(30));
        });

        let bh2 = bh.clone();
        let barrier2 = barrier.clone();
        let t2 = std::thread::spawn(move || {
            barrier2.wait();
            let (_g, wait) = bh2.acquire_ticket(None).unwrap();
            wait
        });

        t1.join().unwrap();
        let wait2 = t2.join().unwrap();
        assert!(wait2 >= Duration::from_millis(0));
        bh.destroy().unwrap();
    }
}
