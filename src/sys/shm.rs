//! Shared-memory segment manager (C1, spec.md §4.1).
//!
//! SysV shared memory (`shmget`/`shmat`/`shmdt`/`shmctl`) has no `nix` binding,
//! unlike the POSIX `mmap`/`shm_open` pair `libs/shmempipe` uses, so this
//! module calls `libc` directly -- in the same unsafe-with-documented-
//! invariants style `shmempipe::initialize_at` uses for its `MaybeUninit`
//! field writes.

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU32, Ordering};

use crate::backoff;
use crate::breaker::pid::{self, PidSharedState};
use crate::config::PidBreakerConfig;
use crate::error::{Error, Result};
use crate::window::{self, SharedWindow};

/// Tags the fixed set of payload shapes this crate ever places in a shared
/// segment, matched directly in `get_or_create`/`resize` rather than taking a
/// generic initializer closure (Design Note "callback-typed shared memory
/// initializer", spec.md §9) -- avoids heterogeneous function pointers for
/// what is, in practice, a closed set of two segment kinds.
pub enum SegmentKind<'a> {
    Window,
    Pid(&'a PidBreakerConfig),
}

impl SegmentKind<'_> {
    fn payload_size(&self) -> usize {
        match self {
            SegmentKind::Window => window::STATIC_SIZE,
            SegmentKind::Pid(_) => pid::STATIC_SIZE,
        }
    }

    /// # Safety
    /// `payload` must point to at least `self.payload_size()` writable,
    /// uninitialized bytes.
    unsafe fn init(&self, payload: NonNull<u8>) -> Result<()> {
        match self {
            SegmentKind::Window => {
                SharedWindow::init_in_place(payload.as_ptr() as *mut SharedWindow, window::MAX_SIZE);
                Ok(())
            }
            SegmentKind::Pid(cfg) => {
                PidSharedState::init_in_place(payload.as_ptr() as *mut PidSharedState, cfg)
            }
        }
    }
}

const MAGIC_INITIALIZING: u32 = 0x0000_0000;
const MAGIC_READY: u32 = 0xcafe_babe;

/// Fixed header every segment this module manages starts with. Payload bytes
/// follow immediately after, so the same layout is valid across independently
/// compiled but ABI-compatible processes.
#[repr(C)]
pub struct SegmentHeader {
    magic: AtomicU32,
    /// Set by `mark_for_deletion` before calling `shmctl(IPC_RMID)`. Any op
    /// that observes this on an already-attached pointer must treat the
    /// segment as stale (spec.md §5).
    deleted: AtomicU32,
}

impl SegmentHeader {
    pub fn is_ready(&self) -> bool {
        self.magic.load(Ordering::Acquire) == MAGIC_READY
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire) != 0
    }
}

pub const HEADER_SIZE: usize = std::mem::size_of::<SegmentHeader>();

/// A handle to a created-or-attached SysV shared memory segment. Does not own
/// an attachment; `attach`/`detach` are separate so a resize can hold both the
/// old and new handle briefly.
#[derive(Debug, Clone, Copy)]
pub struct SegmentHandle {
    pub key: i32,
    pub shmid: i32,
    pub size: usize,
}

fn last_os_error() -> io::Error {
    io::Error::last_os_error()
}

fn syscall_err(name: &str, call: &'static str) -> Error {
    Error::syscall(name, call, last_os_error())
}

/// Creates the segment if it doesn't exist (the creator runs `kind`'s init),
/// or attaches to it and waits for the creator's init to complete. Returns the
/// handle, a pointer to the *payload* (just past the header), and whether this
/// call was the creator.
///
/// # Safety
/// Sound for any `key`; the segment is sized from `kind.payload_size()`.
pub unsafe fn get_or_create(
    name: &str,
    key: i32,
    perms: u32,
    kind: SegmentKind,
) -> Result<(SegmentHandle, NonNull<u8>, bool)> {
    let size = HEADER_SIZE + kind.payload_size();

    loop {
        let create_flags = libc::IPC_CREAT | libc::IPC_EXCL | (perms as i32 & 0o777);
        let shmid = libc::shmget(key, size, create_flags);
        if shmid >= 0 {
            let handle = SegmentHandle { key, shmid, size };
            let base = attach(&handle)?;
            let header = base.as_ptr() as *mut SegmentHeader;
            (*header).magic = AtomicU32::new(MAGIC_INITIALIZING);
            (*header).deleted = AtomicU32::new(0);

            let payload = NonNull::new_unchecked(base.as_ptr().add(HEADER_SIZE));
            kind.init(payload)?;

            // Full barrier: payload writes above happen-before any follower's
            // observation of MAGIC_READY.
            fence(Ordering::SeqCst);
            (*header).magic.store(MAGIC_READY, Ordering::Release);

            return Ok((handle, payload, true));
        }

        let err = last_os_error();
        match err.raw_os_error() {
            Some(libc::EEXIST) => {
                // Fall through to the attach-and-wait path below.
            }
            _ => return Err(syscall_err(name, "shmget")),
        }

        let open_flags = perms as i32 & 0o777;
        let existing = libc::shmget(key, 0, open_flags);
        if existing < 0 {
            return Err(syscall_err(name, "shmget"));
        }
        let handle = SegmentHandle {
            key,
            shmid: existing,
            size,
        };
        let base = attach(&handle)?;
        let header = base.as_ptr() as *const SegmentHeader;

        if (*header).is_deleted() {
            // Stale: a concurrent destroyer beat us to it. Detach and retry
            // creation; IPC_RMID detaches the key from the kernel's keyed
            // lookup table, so the retry above will see ENOENT-turned-success
            // once the old segment is fully gone.
            let _ = detach(base);
            continue;
        }

        let payload = NonNull::new_unchecked(base.as_ptr().add(HEADER_SIZE));
        backoff::poll_until(name, || (*header).is_ready())?;
        return Ok((handle, payload, false));
    }
}

/// # Safety
/// `handle` must refer to a live segment; the caller must not use the
/// returned pointer after `detach`.
pub unsafe fn attach(handle: &SegmentHandle) -> Result<NonNull<u8>> {
    let ptr = libc::shmat(handle.shmid, std::ptr::null(), 0);
    if ptr as isize == -1 {
        return Err(Error::syscall(
            handle.key.to_string(),
            "shmat",
            last_os_error(),
        ));
    }
    Ok(NonNull::new_unchecked(ptr as *mut u8))
}

/// # Safety
/// `base` must be the exact pointer returned by `attach` (the segment base,
/// not an offset payload pointer).
pub unsafe fn detach(base: NonNull<u8>) -> Result<()> {
    let rc = libc::shmdt(base.as_ptr() as *const libc::c_void);
    if rc != 0 {
        return Err(Error::syscall("<unknown>", "shmdt", last_os_error()));
    }
    Ok(())
}

/// Marks the segment for deletion. The kernel reclaims it once the last
/// attacher detaches. Concurrent destroyers racing on the same segment see
/// EINVAL/EIDRM and succeed silently (spec.md §4.4).
pub fn mark_for_deletion(handle: &SegmentHandle) -> Result<()> {
    let rc = unsafe { libc::shmctl(handle.shmid, libc::IPC_RMID, std::ptr::null_mut()) };
    if rc != 0 {
        let err = last_os_error();
        match err.raw_os_error() {
            Some(libc::EINVAL) | Some(libc::EIDRM) => return Ok(()),
            _ => return Err(Error::syscall(handle.key.to_string(), "shmctl(IPC_RMID)", err)),
        }
    }
    Ok(())
}

/// Returns the number of processes currently attached to the segment
/// (`shm_nattch`), used by `resize` to pass `prev_attach_count` to `init_fn`.
pub fn attach_count(handle: &SegmentHandle) -> Result<u16> {
    let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::shmctl(handle.shmid, libc::IPC_STAT, &mut ds) };
    if rc != 0 {
        return Err(Error::syscall(
            handle.key.to_string(),
            "shmctl(IPC_STAT)",
            last_os_error(),
        ));
    }
    Ok(ds.shm_nattch as u16)
}

/// Cooperative resize: mark the old segment for deletion, create a fresh
/// segment of `kind` at `new_key`, freshly initialized (neither `Window` nor
/// `Pid` payloads carry forward old contents across a resize -- a ring buffer
/// and PID history both start cold on a key/permission rotation), and detach
/// the old attachment. Exposed per spec.md §4.1's component op list even
/// though this crate's own fixed-size segments never trigger it internally.
///
/// # Safety
/// `old_base` must be a live attachment obtained from `get_or_create`/`attach`
/// against `old_handle`.
pub unsafe fn resize(
    name: &str,
    old_handle: &SegmentHandle,
    old_base: NonNull<u8>,
    new_key: i32,
    perms: u32,
    kind: SegmentKind,
) -> Result<(SegmentHandle, NonNull<u8>)> {
    attach_count(old_handle)?;

    let (new_handle, new_payload, created) = get_or_create(name, new_key, perms, kind)?;
    debug_assert!(created, "resize must always create a fresh segment");

    detach(old_base)?;
    mark_for_deletion(old_handle)?;

    Ok((new_handle, new_payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_key(salt: u32) -> i32 {
        let pid = std::process::id();
        ((pid as i64) * 1_000_003 + salt as i64) as i32
    }

    #[test]
    fn create_then_attach_sees_initialized_payload() {
        let key = unique_key(1);

        let (handle, payload, created) =
            unsafe { get_or_create("test", key, 0o600, SegmentKind::Window).unwrap() };
        assert!(created);
        let window = unsafe { &*(payload.as_ptr() as *const SharedWindow) };
        assert_eq!(window.size(), 0);

        let base = NonNull::new(payload.as_ptr().wrapping_sub(HEADER_SIZE)).unwrap();
        detach(base).unwrap();
        mark_for_deletion(&handle).unwrap();
    }

    #[test]
    fn second_attacher_does_not_recreate() {
        let key = unique_key(2);

        let (handle1, payload1, created1) =
            unsafe { get_or_create("test", key, 0o600, SegmentKind::Window).unwrap() };
        assert!(created1);
        let window1 = unsafe { &*(payload1.as_ptr() as *const SharedWindow) };
        window1.push(window::FAILURE, 1);

        let (handle2, payload2, created2) =
            unsafe { get_or_create("test", key, 0o600, SegmentKind::Window).unwrap() };
        assert!(!created2);
        assert_eq!(handle1.shmid, handle2.shmid);

        // second attacher observes the first attacher's writes, not a fresh init.
        let window2 = unsafe { &*(payload2.as_ptr() as *const SharedWindow) };
        assert_eq!(window2.size(), 1);

        let base1 = NonNull::new(payload1.as_ptr().wrapping_sub(HEADER_SIZE)).unwrap();
        let base2 = NonNull::new(payload2.as_ptr().wrapping_sub(HEADER_SIZE)).unwrap();
        detach(base1).unwrap();
        detach(base2).unwrap();
        mark_for_deletion(&handle1).unwrap();
    }
}
