//! Semaphore set (C2, spec.md §4.2): a fixed-cardinality kernel semaphore set
//! per resource, with timed ops and a meta-lock built on top of one of its
//! counters.

use std::io;
use std::time::Duration;

use crate::error::{Error, Result};

/// Cardinality of every semaphore set this crate creates. Part of the IPC key
/// derivation (spec.md §3) -- changing this changes every key.
pub const CARDINALITY: usize = 5;

/// Index into the semaphore set. Never pass raw integers past this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SemIndex {
    Tickets = 0,
    ConfiguredTickets = 1,
    MetaLock = 2,
    RegisteredWorkers = 3,
    ConfiguredWorkers = 4,
}

const META_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const INIT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const INIT_POLL_CEILING: Duration = Duration::from_secs(5);

#[repr(C)]
union Semun {
    val: libc::c_int,
    buf: *mut libc::semid_ds,
    array: *mut libc::c_ushort,
    __pad: *mut libc::c_void,
}

/// Outcome of a single semaphore op, distinguishing "timed out" (the wait
/// elapsed with no effect) from "interrupted" (a signal unblocked the syscall
/// before it could take effect -- also no effect, but not the same failure
/// mode, per spec.md §5's cancellation story).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpResult {
    Applied,
    TimedOut,
    Interrupted,
}

pub struct SemaphoreSet {
    semid: libc::c_int,
}

fn last_os_error() -> io::Error {
    io::Error::last_os_error()
}

impl SemaphoreSet {
    /// Creates the set if absent (zeroing every counter except `MetaLock`,
    /// which starts at 1), or attaches to an existing one and waits for
    /// `sem_otime != 0` -- the side effect of the creator's first
    /// `meta_lock()` call, and thus the synchronization edge that tells
    /// followers "initialization complete" (spec.md §4.2).
    pub fn get_or_create(name: &str, key: i32, perms: u32) -> Result<(Self, bool)> {
        let create_flags = libc::IPC_CREAT | libc::IPC_EXCL | (perms as i32 & 0o777);
        let rc = unsafe { libc::semget(key, CARDINALITY as i32, create_flags) };
        if rc >= 0 {
            let set = SemaphoreSet { semid: rc };
            set.init_values()?;
            // First meta_lock/unlock round-trip stamps sem_otime, the signal
            // followers poll for below.
            {
                let _guard = set.meta_lock(name)?;
            }
            return Ok((set, true));
        }

        let err = last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(Error::syscall(name, "semget", err));
        }

        let open_flags = perms as i32 & 0o777;
        let rc = unsafe { libc::semget(key, CARDINALITY as i32, open_flags) };
        if rc < 0 {
            return Err(Error::syscall(name, "semget", last_os_error()));
        }
        let set = SemaphoreSet { semid: rc };
        set.wait_initialized(name)?;
        Ok((set, false))
    }

    fn init_values(&self) -> Result<()> {
        let mut values: [libc::c_ushort; CARDINALITY] = [0, 0, 1, 0, 0];
        let arg = Semun {
            array: values.as_mut_ptr(),
        };
        let rc = unsafe { libc::semctl(self.semid, 0, libc::SETALL, arg) };
        if rc != 0 {
            return Err(Error::syscall("<init>", "semctl(SETALL)", last_os_error()));
        }
        Ok(())
    }

    /// Last-change time of the semaphore set, used by the bulkhead to decide
    /// whether it is still within `quota_grace_period` of creation (spec.md
    /// §4.4 step 2). At creation this equals the creation time; later
    /// `semctl` admin calls would also bump it, but this crate never issues
    /// any after initialization.
    pub fn ctime(&self) -> Result<libc::time_t> {
        let mut ds: libc::semid_ds = unsafe { std::mem::zeroed() };
        let arg = Semun { buf: &mut ds };
        let rc = unsafe { libc::semctl(self.semid, 0, libc::IPC_STAT, arg) };
        if rc != 0 {
            return Err(Error::syscall("<ctime>", "semctl(IPC_STAT)", last_os_error()));
        }
        Ok(ds.sem_ctime)
    }

    fn otime(&self) -> Result<libc::time_t> {
        let mut ds: libc::semid_ds = unsafe { std::mem::zeroed() };
        let arg = Semun { buf: &mut ds };
        let rc = unsafe { libc::semctl(self.semid, 0, libc::IPC_STAT, arg) };
        if rc != 0 {
            return Err(Error::syscall("<otime>", "semctl(IPC_STAT)", last_os_error()));
        }
        Ok(ds.sem_otime)
    }

    fn wait_initialized(&self, name: &str) -> Result<()> {
        let deadline = std::time::Instant::now() + INIT_POLL_CEILING;
        loop {
            if self.otime()? != 0 {
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                return Err(Error::internal(
                    name,
                    "timed out waiting for semaphore set first-attacher initialization",
                ));
            }
            std::thread::sleep(INIT_POLL_INTERVAL);
        }
    }

    /// Timed `op(index, delta)` with `SEM_UNDO` optionally set so the kernel
    /// reverses the effect if this process dies before releasing.
    pub fn op(
        &self,
        name: &str,
        index: SemIndex,
        delta: i16,
        undo: bool,
        timeout: Option<Duration>,
    ) -> Result<OpResult> {
        let mut flags: libc::c_short = 0;
        if undo {
            flags |= libc::SEM_UNDO as libc::c_short;
        }
        let mut sb = libc::sembuf {
            sem_num: index as u16,
            sem_op: delta,
            sem_flg: flags,
        };

        let rc = match timeout {
            Some(d) => {
                let ts = libc::timespec {
                    tv_sec: d.as_secs() as libc::time_t,
                    tv_nsec: d.subsec_nanos() as libc::c_long,
                };
                unsafe { libc::semtimedop(self.semid, &mut sb, 1, &ts) }
            }
            None => unsafe { libc::semop(self.semid, &mut sb, 1) },
        };

        if rc == 0 {
            return Ok(OpResult::Applied);
        }

        let err = last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) => Ok(OpResult::TimedOut),
            Some(libc::EINTR) => Ok(OpResult::Interrupted),
            Some(libc::EIDRM) | Some(libc::EINVAL) => {
                Err(Error::syscall(name, "semop", err))
            }
            _ => Err(Error::syscall(name, "semop", err)),
        }
    }

    /// Best-effort decrement that never waits: `NOWAIT|UNDO`, with `EAGAIN`
    /// (already zero) treated as success (spec.md §4.4's `unregister_worker`).
    pub fn try_decrement_nowait(&self, name: &str, index: SemIndex) -> Result<()> {
        let mut sb = libc::sembuf {
            sem_num: index as u16,
            sem_op: -1,
            sem_flg: libc::IPC_NOWAIT as libc::c_short | libc::SEM_UNDO as libc::c_short,
        };
        let rc = unsafe { libc::semop(self.semid, &mut sb, 1) };
        if rc == 0 {
            return Ok(());
        }
        let err = last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) => Ok(()),
            Some(libc::EIDRM) | Some(libc::EINVAL) => Ok(()),
            _ => Err(Error::syscall(name, "semop(NOWAIT|UNDO)", err)),
        }
    }

    pub fn value(&self, name: &str, index: SemIndex) -> Result<i32> {
        let rc = unsafe { libc::semctl(self.semid, index as i32, libc::GETVAL, Semun { val: 0 }) };
        if rc < 0 {
            return Err(Error::syscall(name, "semctl(GETVAL)", last_os_error()));
        }
        Ok(rc)
    }

    pub fn meta_lock<'a>(&'a self, name: &'a str) -> Result<MetaLockGuard<'a>> {
        match self.op(name, SemIndex::MetaLock, -1, true, Some(META_LOCK_TIMEOUT))? {
            OpResult::Applied => Ok(MetaLockGuard { set: self, name }),
            OpResult::TimedOut => Err(Error::Timeout {
                name: name.to_string(),
            }),
            OpResult::Interrupted => Err(Error::internal(name, "meta_lock interrupted by signal")),
        }
    }

    pub fn destroy(&self, name: &str) -> Result<()> {
        let rc = unsafe { libc::semctl(self.semid, 0, libc::IPC_RMID, Semun { val: 0 }) };
        if rc != 0 {
            let err = last_os_error();
            match err.raw_os_error() {
                Some(libc::EINVAL) | Some(libc::EIDRM) => return Ok(()),
                _ => return Err(Error::syscall(name, "semctl(IPC_RMID)", err)),
            }
        }
        Ok(())
    }
}

/// `Drop` performs the unconditional `+1` release -- the scoped-acquisition
/// pattern from Design Note 1 (spec.md §9): cleanup runs on every exit path,
/// normal or panicking, without the caller having to remember it.
pub struct MetaLockGuard<'a> {
    set: &'a SemaphoreSet,
    name: &'a str,
}

impl Drop for MetaLockGuard<'_> {
    fn drop(&mut self) {
        // A release attempt after an acquired lock failing records but never
        // raises (spec.md §7): there is no caller left to propagate to here.
        if let Err(e) = self.set.op(self.name, SemIndex::MetaLock, 1, true, None) {
            tracing::error!(resource = self.name, error = %e, "meta_unlock failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_key(salt: u32) -> i32 {
        let pid = std::process::id();
        ((pid as i64) * 7_919 + salt as i64) as i32
    }

    #[test]
    fn create_then_reattach_shares_state() {
        let key = unique_key(10);
        let (set1, created1) = SemaphoreSet::get_or_create("test", key, 0o600).unwrap();
        assert!(created1);
        assert_eq!(set1.value("test", SemIndex::MetaLock).unwrap(), 1);
        assert_eq!(set1.value("test", SemIndex::Tickets).unwrap(), 0);

        set1.op("test", SemIndex::Tickets, 5, false, None).unwrap();

        let (set2, created2) = SemaphoreSet::get_or_create("test", key, 0o600).unwrap();
        assert!(!created2);
        assert_eq!(set2.value("test", SemIndex::Tickets).unwrap(), 5);

        set1.destroy("test").unwrap();
    }

    #[test]
    fn meta_lock_round_trips() {
        let key = unique_key(11);
        let (set, _) = SemaphoreSet::get_or_create("test", key, 0o600).unwrap();
        {
            let _g = set.meta_lock("test").unwrap();
            assert_eq!(set.value("test", SemIndex::MetaLock).unwrap(), 0);
        }
        assert_eq!(set.value("test", SemIndex::MetaLock).unwrap(), 1);
        set.destroy("test").unwrap();
    }

    #[test]
    fn nowait_undo_on_zero_is_ok() {
        let key = unique_key(12);
        let (set, _) = SemaphoreSet::get_or_create("test", key, 0o600).unwrap();
        set.try_decrement_nowait("test", SemIndex::RegisteredWorkers)
            .unwrap();
        assert_eq!(set.value("test", SemIndex::RegisteredWorkers).unwrap(), 0);
        set.destroy("test").unwrap();
    }

    #[test]
    fn timed_op_times_out_when_unavailable() {
        let key = unique_key(13);
        let (set, _) = SemaphoreSet::get_or_create("test", key, 0o600).unwrap();
        let result = set
            .op(
                "test",
                SemIndex::Tickets,
                -1,
                true,
                Some(Duration::from_millis(20)),
            )
            .unwrap();
        assert_eq!(result, OpResult::TimedOut);
        set.destroy("test").unwrap();
    }
}
