//! Sliding window (C3, spec.md §4.3): a fixed-capacity ring of integer-coded
//! outcomes living in shared memory. All ops are taken under the owning
//! resource's meta-lock -- the window never locks itself (Design Note
//! "cyclic/back references", spec.md §9: the breaker owns both the window and
//! the locking discipline around it).

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

/// Cap chosen "ge any supported error_threshold" per spec.md §3.
pub const MAX_SIZE: usize = 1000;

/// One recorded outcome. `1 = success`, `-1 = failure`, `0 = rejected ping`
/// (used by the adaptive breaker's ping accounting, spec.md §4.6).
pub type Outcome = i8;

pub const SUCCESS: Outcome = 1;
pub const FAILURE: Outcome = -1;
pub const REJECTED_PING: Outcome = 0;

/// `#[repr(C)]` so independently-compiled-but-ABI-compatible processes agree
/// on field offsets, the same care `RawSharedMemPipe` takes in the teacher.
#[repr(C)]
pub struct SharedWindow {
    start: AtomicUsize,
    length: AtomicUsize,
    max_size: AtomicUsize,
    /// Timestamp (unix seconds) each slot was pushed at, for `error_threshold_timeout`.
    timestamps: [AtomicI64; MAX_SIZE],
    data: [std::sync::atomic::AtomicI8; MAX_SIZE],
}

/// Byte size of a `SharedWindow` payload, for sizing the shared segment that
/// backs it (`resource.rs`).
pub const STATIC_SIZE: usize = std::mem::size_of::<SharedWindow>();

impl SharedWindow {
    /// Initializes a freshly-mapped `SharedWindow` in place. Must run exactly
    /// once, by the segment's first attacher.
    ///
    /// # Safety
    /// `place` must point to valid, writable, uninitialized memory of at
    /// least `size_of::<SharedWindow>()` bytes.
    pub unsafe fn init_in_place(place: *mut SharedWindow, initial_max_size: usize) {
        std::ptr::addr_of_mut!((*place).start).write(AtomicUsize::new(0));
        std::ptr::addr_of_mut!((*place).length).write(AtomicUsize::new(0));
        std::ptr::addr_of_mut!((*place).max_size)
            .write(AtomicUsize::new(initial_max_size.min(MAX_SIZE)));
        for i in 0..MAX_SIZE {
            std::ptr::addr_of_mut!((*place).timestamps[i]).write(AtomicI64::new(0));
            std::ptr::addr_of_mut!((*place).data[i]).write(std::sync::atomic::AtomicI8::new(0));
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size.load(Ordering::Relaxed)
    }

    pub fn size(&self) -> usize {
        self.length.load(Ordering::Relaxed)
    }

    /// Pushes `value`, evicting the oldest entry if full.
    pub fn push(&self, value: Outcome, now_unix: i64) {
        let max = self.max_size();
        let start = self.start.load(Ordering::Relaxed);
        let length = self.length.load(Ordering::Relaxed);

        let write_index = if length < max {
            (start + length) % MAX_SIZE
        } else {
            // full: evict the front, advance start, write into the vacated slot.
            let idx = start;
            self.start.store((start + 1) % MAX_SIZE, Ordering::Relaxed);
            idx
        };

        self.data[write_index].store(value, Ordering::Relaxed);
        self.timestamps[write_index].store(now_unix, Ordering::Relaxed);

        if length < max {
            self.length.store(length + 1, Ordering::Relaxed);
        }
    }

    pub fn clear(&self) {
        self.start.store(0, Ordering::Relaxed);
        self.length.store(0, Ordering::Relaxed);
    }

    /// Front-to-back snapshot, oldest first.
    pub fn values(&self) -> Vec<Outcome> {
        let start = self.start.load(Ordering::Relaxed);
        let length = self.length.load(Ordering::Relaxed);
        (0..length)
            .map(|i| self.data[(start + i) % MAX_SIZE].load(Ordering::Relaxed))
            .collect()
    }

    /// Front-to-back (value, timestamp) snapshot.
    pub fn entries(&self) -> Vec<(Outcome, i64)> {
        let start = self.start.load(Ordering::Relaxed);
        let length = self.length.load(Ordering::Relaxed);
        (0..length)
            .map(|i| {
                let idx = (start + i) % MAX_SIZE;
                (
                    self.data[idx].load(Ordering::Relaxed),
                    self.timestamps[idx].load(Ordering::Relaxed),
                )
            })
            .collect()
    }

    pub fn last(&self) -> Option<Outcome> {
        let length = self.length.load(Ordering::Relaxed);
        if length == 0 {
            return None;
        }
        let start = self.start.load(Ordering::Relaxed);
        Some(self.data[(start + length - 1) % MAX_SIZE].load(Ordering::Relaxed))
    }

    /// Removes every entry for which `predicate(value)` holds, preserving
    /// order of the survivors. Rebuilds the ring compactly from `start = 0`.
    pub fn reject_if(&self, mut predicate: impl FnMut(Outcome) -> bool) {
        let survivors: Vec<(Outcome, i64)> = self
            .entries()
            .into_iter()
            .filter(|(v, _)| !predicate(*v))
            .collect();
        self.start.store(0, Ordering::Relaxed);
        self.length.store(survivors.len(), Ordering::Relaxed);
        for (i, (v, ts)) in survivors.into_iter().enumerate() {
            self.data[i].store(v, Ordering::Relaxed);
            self.timestamps[i].store(ts, Ordering::Relaxed);
        }
    }

    /// Resizes the logical window, preserving the most recent
    /// `min(new_max, length)` entries. `new_max` beyond `MAX_SIZE` fails.
    pub fn resize(&self, new_max: usize) -> Result<(), &'static str> {
        if new_max > MAX_SIZE {
            return Err("requested max_size exceeds the hard cap");
        }
        let entries = self.entries();
        let keep_from = entries.len().saturating_sub(new_max);
        let kept = &entries[keep_from..];

        self.start.store(0, Ordering::Relaxed);
        self.length.store(kept.len(), Ordering::Relaxed);
        for (i, (v, ts)) in kept.iter().enumerate() {
            self.data[i].store(*v, Ordering::Relaxed);
            self.timestamps[i].store(*ts, Ordering::Relaxed);
        }
        self.max_size.store(new_max, Ordering::Relaxed);
        Ok(())
    }

    /// Count of entries equal to `value` within the last `window_secs`
    /// seconds of `now_unix` (or over the whole window if `window_secs` is
    /// `None`), used by the classic breaker's `error_threshold_timeout`.
    pub fn count_recent(&self, value: Outcome, window_secs: Option<i64>, now_unix: i64) -> usize {
        self.entries()
            .into_iter()
            .filter(|(v, ts)| {
                *v == value && window_secs.map_or(true, |w| now_unix - *ts <= w)
            })
            .count()
    }
}
