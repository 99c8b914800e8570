//! Adaptive / PID circuit breaker (C6, spec.md §4.6). Lives entirely in
//! process-shared memory under a robust mutex; every field other than the
//! write-once gains is wrapped in `UnsafeCell` because mutation happens
//! through a shared reference shared across process boundaries -- the
//! `RobustMutex` guard is what actually serializes access, not the Rust type
//! system, the same trust boundary `shmempipe`'s raw pointer writes rely on.

use std::cell::UnsafeCell;
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::config::PidBreakerConfig;
use crate::error::{Error, Result};
use crate::sys::RobustMutex;

pub const HISTORY_LEN: usize = 360;
/// Dynamic `ideal` derived from history is always capped here (spec.md §4.6,
/// invariant 7 in spec.md §8).
const DYNAMIC_IDEAL_CAP: f64 = 0.10;

/// Fraction of would-be-rejected calls let through as a probe, so `pfr`
/// (ping failure rate) keeps tracking the true failure rate of rejected
/// traffic instead of freezing once rejection starts (spec.md §4.6 step 5's
/// `rejection_rate - pfr` term).
const PING_SAMPLE_RATE: f64 = 0.1;

/// What a caller should do with one `acquire` against the PID breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Run the call normally; its outcome feeds `window_success`/`window_error`.
    Admit,
    /// Run the call as a probe; its outcome feeds `window_ping_success`/
    /// `window_ping_failure` instead, without counting toward `er`.
    Ping,
    /// Fast-fail without running the call.
    Reject,
}

#[repr(C)]
pub struct PidSharedState {
    lock: RobustMutex,
    rejection_rate: UnsafeCell<f64>,
    integral: UnsafeCell<f64>,
    previous_error: UnsafeCell<f64>,
    last_update_time: UnsafeCell<i64>,
    window_start_time: UnsafeCell<i64>,
    window_success: UnsafeCell<u64>,
    window_error: UnsafeCell<u64>,
    window_rejected: UnsafeCell<u64>,
    window_ping_success: UnsafeCell<u64>,
    window_ping_failure: UnsafeCell<u64>,
    last_error_rate: UnsafeCell<f64>,
    last_ping_failure_rate: UnsafeCell<f64>,
    kp: f64,
    ki: f64,
    kd: f64,
    window_size_secs: f64,
    target_error_rate: f64,
    history: UnsafeCell<[f64; HISTORY_LEN]>,
    history_index: UnsafeCell<usize>,
    history_count: UnsafeCell<usize>,
    initialized_flag: UnsafeCell<u32>,
    creator_pid: u32,
}

// Safety: every mutable field is only ever touched while holding `lock`,
// which is itself `PTHREAD_PROCESS_SHARED` and safe to share across threads
// and processes.
unsafe impl Sync for PidSharedState {}
unsafe impl Send for PidSharedState {}

pub const STATIC_SIZE: usize = std::mem::size_of::<PidSharedState>();

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl PidSharedState {
    /// Initializes a freshly-mapped `PidSharedState` in place, including the
    /// robust mutex. Must run exactly once, by the segment's first attacher.
    ///
    /// # Safety
    /// `place` must point to valid, writable, uninitialized memory of at
    /// least `size_of::<PidSharedState>()` bytes.
    pub unsafe fn init_in_place(place: *mut PidSharedState, config: &PidBreakerConfig) -> Result<()> {
        RobustMutex::init_in_place(std::ptr::addr_of_mut!((*place).lock) as *mut RobustMutex)?;

        macro_rules! w {
            ($field:ident, $value:expr) => {
                std::ptr::addr_of_mut!((*place).$field).write(UnsafeCell::new($value))
            };
        }
        w!(rejection_rate, 0.0);
        w!(integral, 0.0);
        w!(previous_error, 0.0);
        w!(last_update_time, now_unix());
        w!(window_start_time, now_unix());
        w!(window_success, 0u64);
        w!(window_error, 0u64);
        w!(window_rejected, 0u64);
        w!(window_ping_success, 0u64);
        w!(window_ping_failure, 0u64);
        w!(last_error_rate, 0.0);
        w!(last_ping_failure_rate, 0.0);
        w!(history, [0.0; HISTORY_LEN]);
        w!(history_index, 0usize);
        w!(history_count, 0usize);
        w!(initialized_flag, 1u32);

        std::ptr::addr_of_mut!((*place).kp).write(config.kp);
        std::ptr::addr_of_mut!((*place).ki).write(config.ki);
        std::ptr::addr_of_mut!((*place).kd).write(config.kd);
        std::ptr::addr_of_mut!((*place).window_size_secs).write(config.window_size.as_secs_f64());
        std::ptr::addr_of_mut!((*place).target_error_rate).write(config.target_error_rate);
        std::ptr::addr_of_mut!((*place).creator_pid).write(std::process::id());

        Ok(())
    }

    fn cell<T>(ptr: &UnsafeCell<T>) -> *mut T {
        ptr.get()
    }

    /// Rotates the window if `Δt` has elapsed since `window_start_time`,
    /// running the full per-window-close update (spec.md §4.6 steps 1-7).
    /// Called opportunistically from every recording/`decide` entry
    /// point rather than from a background ticker -- consistent with how the
    /// classic breaker also derives its state lazily on access.
    fn maybe_rotate(&self) {
        let _guard = match self.lock.lock() {
            Ok(g) => g,
            Err(_) => return,
        };

        let now = now_unix();
        let window_start = unsafe { *Self::cell(&self.window_start_time) };
        let dt = self.window_size_secs;
        if dt <= 0.0 || (now - window_start) < dt.ceil() as i64 {
            return;
        }

        unsafe {
            let success = *Self::cell(&self.window_success);
            let error = *Self::cell(&self.window_error);
            let ping_success = *Self::cell(&self.window_ping_success);
            let ping_failure = *Self::cell(&self.window_ping_failure);

            let er = error as f64 / (success + error).max(1) as f64;
            let pfr = ping_failure as f64 / (ping_success + ping_failure).max(1) as f64;

            self.push_history(er);

            *Self::cell(&self.window_success) = 0;
            *Self::cell(&self.window_error) = 0;
            *Self::cell(&self.window_rejected) = 0;
            *Self::cell(&self.window_ping_success) = 0;
            *Self::cell(&self.window_ping_failure) = 0;
            *Self::cell(&self.window_start_time) = now;
            *Self::cell(&self.last_error_rate) = er;
            *Self::cell(&self.last_ping_failure_rate) = pfr;

            let ideal = if self.target_error_rate > 0.0 {
                self.target_error_rate
            } else {
                self.p90_capped()
            };

            let rejection_rate = *Self::cell(&self.rejection_rate);
            let health = (er - ideal) - (rejection_rate - pfr);

            let p = self.kp * health;
            let integral = *Self::cell(&self.integral) + health * dt;
            *Self::cell(&self.integral) = integral;
            let i_term = self.ki * integral;

            let previous_error = *Self::cell(&self.previous_error);
            let d = self.kd * (health - previous_error) / dt;

            let new_rate = (rejection_rate + p + i_term + d).clamp(0.0, 1.0);
            *Self::cell(&self.rejection_rate) = new_rate;
            *Self::cell(&self.previous_error) = health;
            *Self::cell(&self.last_update_time) = now;
        }
    }

    /// # Safety: caller must hold `lock`.
    unsafe fn push_history(&self, er: f64) {
        let idx = *Self::cell(&self.history_index);
        (*Self::cell(&self.history))[idx] = er;
        *Self::cell(&self.history_index) = (idx + 1) % HISTORY_LEN;
        let count = *Self::cell(&self.history_count);
        if count < HISTORY_LEN {
            *Self::cell(&self.history_count) = count + 1;
        }
    }

    /// # Safety: caller must hold `lock`.
    unsafe fn p90_capped(&self) -> f64 {
        let count = *Self::cell(&self.history_count);
        if count == 0 {
            return DYNAMIC_IDEAL_CAP;
        }
        let mut values: Vec<f64> = (*Self::cell(&self.history))[..count].to_vec();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((count as f64) * 0.9).ceil() as usize;
        let idx = rank.saturating_sub(1).min(count - 1);
        values[idx].min(DYNAMIC_IDEAL_CAP)
    }

    pub fn record_success(&self) -> Result<()> {
        self.maybe_rotate();
        let _guard = self.lock.lock()?;
        unsafe { *Self::cell(&self.window_success) += 1 };
        Ok(())
    }

    pub fn record_failure(&self) -> Result<()> {
        self.maybe_rotate();
        let _guard = self.lock.lock()?;
        unsafe { *Self::cell(&self.window_error) += 1 };
        Ok(())
    }

    pub fn record_ping_success(&self) -> Result<()> {
        self.maybe_rotate();
        let _guard = self.lock.lock()?;
        unsafe { *Self::cell(&self.window_ping_success) += 1 };
        Ok(())
    }

    pub fn record_ping_failure(&self) -> Result<()> {
        self.maybe_rotate();
        let _guard = self.lock.lock()?;
        unsafe { *Self::cell(&self.window_ping_failure) += 1 };
        Ok(())
    }

    pub fn rejection_rate(&self) -> Result<f64> {
        self.maybe_rotate();
        let _guard = self.lock.lock()?;
        Ok(unsafe { *Self::cell(&self.rejection_rate) })
    }

    /// Draws a uniform random number mutex-free and compares it against the
    /// mutex-guarded `rejection_rate` (spec.md §4.6's "Random draws are
    /// mutex-free"). A call that lands in the rejected region is further
    /// sampled at `PING_SAMPLE_RATE`: most are fast-failed, but some are let
    /// through as a probe so `record_ping_success`/`record_ping_failure` keep
    /// measuring `pfr` against live traffic rather than a frozen value.
    /// `window_rejected` is incremented for every rejected-region draw
    /// (probed or not), for introspection only -- it does not feed back into
    /// `health` (Open Question, spec.md §9, resolved in DESIGN.md).
    pub fn decide(&self) -> Result<Decision> {
        let rate = self.rejection_rate()?;
        let draw: f64 = rand::thread_rng().gen_range(0.0..1.0);
        if draw >= rate {
            return Ok(Decision::Admit);
        }

        let ping_draw: f64 = rand::thread_rng().gen_range(0.0..1.0);
        let _guard = self.lock.lock()?;
        unsafe { *Self::cell(&self.window_rejected) += 1 };
        drop(_guard);

        if ping_draw < PING_SAMPLE_RATE {
            Ok(Decision::Ping)
        } else {
            Ok(Decision::Reject)
        }
    }

    pub fn integral(&self) -> Result<f64> {
        let _guard = self.lock.lock()?;
        Ok(unsafe { *Self::cell(&self.integral) })
    }
}

impl std::fmt::Debug for PidSharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PidSharedState")
            .field("creator_pid", &self.creator_pid)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::time::Duration;

    struct Owned {
        ptr: *mut PidSharedState,
        layout: Layout,
    }

    impl Owned {
        fn new(config: PidBreakerConfig) -> Self {
            let layout = Layout::new::<PidSharedState>();
            let ptr = unsafe { alloc_zeroed(layout) } as *mut PidSharedState;
            unsafe { PidSharedState::init_in_place(ptr, &config).unwrap() };
            Owned { ptr, layout }
        }
        fn get(&self) -> &PidSharedState {
            unsafe { &*self.ptr }
        }
    }
    impl Drop for Owned {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr as *mut u8, self.layout) };
        }
    }

    #[test]
    fn ramp_scenario_e() {
        let owned = Owned::new(PidBreakerConfig {
            kp: 1.0,
            ki: 0.0,
            kd: 0.0,
            window_size: Duration::from_secs(1),
            target_error_rate: 0.01,
        });
        let state = owned.get();

        for _ in 0..50 {
            state.record_success().unwrap();
        }
        for _ in 0..50 {
            state.record_failure().unwrap();
        }

        // force the window to close without sleeping a full second in test
        unsafe {
            *PidSharedState::cell(&state.window_start_time) -= 2;
        }
        state.maybe_rotate();

        let rate = state.rejection_rate().unwrap();
        assert!((rate - 0.49).abs() < 1e-9, "rate={rate}");

        let mut rejected = 0;
        let mut pinged = 0;
        for _ in 0..2000 {
            match state.decide().unwrap() {
                Decision::Reject => rejected += 1,
                Decision::Ping => pinged += 1,
                Decision::Admit => {}
            }
        }
        // most of the `rate` mass fast-fails; a `PING_SAMPLE_RATE` slice of it
        // is let through as a probe instead.
        let expected_reject = rate * (1.0 - PING_SAMPLE_RATE);
        let frac = rejected as f64 / 2000.0;
        assert!((frac - expected_reject).abs() < 0.05, "frac={frac}");
        assert!(pinged > 0, "expected some calls to be let through as probes");
    }

    #[test]
    fn rejection_rate_stays_in_bounds() {
        let owned = Owned::new(PidBreakerConfig {
            kp: 5.0,
            ki: 5.0,
            kd: 5.0,
            window_size: Duration::from_secs(1),
            target_error_rate: 0.01,
        });
        let state = owned.get();
        for round in 0..20 {
            for _ in 0..100 {
                if round % 2 == 0 {
                    state.record_failure().unwrap();
                } else {
                    state.record_success().unwrap();
                }
            }
            unsafe {
                *PidSharedState::cell(&state.window_start_time) -= 2;
            }
            state.maybe_rotate();
            let rate = state.rejection_rate().unwrap();
            assert!((0.0..=1.0).contains(&rate));
        }
    }

    #[test]
    fn dynamic_ideal_capped_at_point_one() {
        let owned = Owned::new(PidBreakerConfig {
            kp: 1.0,
            ki: 0.0,
            kd: 0.0,
            window_size: Duration::from_secs(1),
            target_error_rate: -1.0, // dynamic p90
        });
        let state = owned.get();

        // Feed many windows with a high error rate so p90 of history would
        // exceed 0.10 absent the cap.
        for _ in 0..30 {
            for _ in 0..10 {
                state.record_failure().unwrap();
            }
            unsafe {
                *PidSharedState::cell(&state.window_start_time) -= 2;
            }
            state.maybe_rotate();
        }
        // ideal is internal, but we can assert indirectly: since er ~= 1.0
        // every window, health = er - ideal should never make rejection_rate
        // imply an ideal above the cap once saturated; bound the rate itself.
        let rate = state.rejection_rate().unwrap();
        assert!((0.0..=1.0).contains(&rate));
    }

    #[test]
    fn windup_scenario_f() {
        let owned = Owned::new(PidBreakerConfig {
            kp: 0.0,
            ki: 0.1,
            kd: 0.0,
            window_size: Duration::from_secs(1),
            target_error_rate: 0.01,
        });
        let state = owned.get();

        // 120 windows of error_rate=0.005, below target 0.01: integral goes
        // strongly negative.
        for _ in 0..120 {
            for _ in 0..995 {
                state.record_success().unwrap();
            }
            for _ in 0..5 {
                state.record_failure().unwrap();
            }
            unsafe {
                *PidSharedState::cell(&state.window_start_time) -= 2;
            }
            state.maybe_rotate();
        }
        let integral_before = state.integral().unwrap();
        assert!(integral_before < 0.0, "integral={integral_before}");

        // burst of 60% errors
        for _ in 0..60 {
            for _ in 0..40 {
                state.record_success().unwrap();
            }
            for _ in 0..60 {
                state.record_failure().unwrap();
            }
            unsafe {
                *PidSharedState::cell(&state.window_start_time) -= 2;
            }
            state.maybe_rotate();
        }
        let rate = state.rejection_rate().unwrap();
        assert!((0.0..=1.0).contains(&rate));
    }
}
