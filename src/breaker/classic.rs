//! Classic circuit breaker (C5, spec.md §4.5): state derived on each call
//! from `(window, last_error_time, success_count, current_time)` -- no state
//! variable is persisted across calls other than those three.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::ClassicBreakerConfig;
use crate::events::BreakerState;
use crate::window::{self, SharedWindow};

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Derived state plus the bookkeeping needed to derive the *next* state.
/// `opened_at`/`consecutive_successes` are process-local: spec.md §3 notes
/// `ClassicBreakerState` is "local per process", derived from shared window
/// contents plus these two numbers, which this type tracks across calls made
/// through the same `ClassicBreaker` instance.
pub struct ClassicBreaker {
    config: ClassicBreakerConfig,
    opened_at: Option<i64>,
    consecutive_successes: usize,
    state: BreakerState,
    /// Set while a HALF_OPEN trial call is outstanding, so a second
    /// concurrent `pre_check` doesn't admit a second trial (spec.md §4.5,
    /// testable property 4: "executes exactly one trial call in HALF_OPEN").
    /// Cleared by the next `record_success`/`record_failure`.
    trial_in_flight: bool,
}

impl ClassicBreaker {
    pub fn new(config: ClassicBreakerConfig) -> Self {
        ClassicBreaker {
            config,
            opened_at: None,
            consecutive_successes: 0,
            state: BreakerState::Closed,
            trial_in_flight: false,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Call before attempting the underlying operation. Returns `Err(wait)`
    /// with the remaining OPEN duration if the breaker should fast-fail;
    /// transitions OPEN -> HALF_OPEN automatically once `error_timeout` has
    /// elapsed.
    pub fn pre_check(&mut self, window: &SharedWindow) -> Result<(), ()> {
        match self.state {
            BreakerState::Closed => {
                if self.trips(window) {
                    self.transition_to(BreakerState::Open, Some(now_unix()));
                    Err(())
                } else {
                    Ok(())
                }
            }
            BreakerState::Open => {
                let opened_at = self.opened_at.unwrap_or_else(now_unix);
                if now_unix() - opened_at >= self.config.error_timeout.as_secs() as i64 {
                    self.transition_to(BreakerState::HalfOpen, None);
                    // this call is itself the trial -- claim the slot so a
                    // concurrent caller racing in right behind it is rejected.
                    self.trial_in_flight = true;
                    Ok(())
                } else {
                    Err(())
                }
            }
            BreakerState::HalfOpen => {
                if self.trial_in_flight {
                    Err(())
                } else {
                    self.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    fn trips(&self, window: &SharedWindow) -> bool {
        let window_secs = self.config.error_threshold_timeout.map(|d| d.as_secs() as i64);
        let failures = window.count_recent(window::FAILURE, window_secs, now_unix());
        failures >= self.config.error_threshold
    }

    fn transition_to(&mut self, to: BreakerState, opened_at: Option<i64>) {
        self.state = to;
        if to == BreakerState::Open {
            self.opened_at = opened_at.or(Some(now_unix()));
        }
        if to == BreakerState::HalfOpen {
            self.consecutive_successes = 0;
            self.trial_in_flight = false;
        }
    }

    /// Records the outcome of a call that was allowed to run. Only failures
    /// whose error belongs to the adapter's "connection-like" exception set
    /// should be pushed to the window by the caller before invoking this --
    /// `record_success`/`record_failure` just drive the state machine off
    /// what's already there.
    pub fn record_success(&mut self, window: &SharedWindow) {
        match self.state {
            BreakerState::Closed => {
                // Success in CLOSED clears the window (spec.md §4.5).
                window.clear();
            }
            BreakerState::HalfOpen => {
                self.trial_in_flight = false;
                self.consecutive_successes += 1;
                if self.consecutive_successes >= self.config.success_threshold {
                    window.clear();
                    self.transition_to(BreakerState::Closed, None);
                }
            }
            BreakerState::Open => {
                // A trial call should never run while OPEN; nothing to do.
            }
        }
    }

    pub fn record_failure(&mut self, window: &SharedWindow) {
        window.push(window::FAILURE, now_unix());
        match self.state {
            BreakerState::Closed => {
                if self.trips(window) {
                    self.transition_to(BreakerState::Open, Some(now_unix()));
                }
            }
            BreakerState::HalfOpen => {
                self.trial_in_flight = false;
                self.transition_to(BreakerState::Open, Some(now_unix()));
            }
            BreakerState::Open => {}
        }
    }

    /// Effective downstream timeout while a trial call is in flight in
    /// HALF_OPEN, if the adapter configured one (spec.md §4.5).
    pub fn half_open_timeout(&self) -> Option<Duration> {
        if self.state == BreakerState::HalfOpen {
            self.config.half_open_resource_timeout
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    struct OwnedWindow {
        ptr: *mut SharedWindow,
        layout: Layout,
    }

    impl OwnedWindow {
        fn new() -> Self {
            let layout = Layout::new::<SharedWindow>();
            let ptr = unsafe { alloc_zeroed(layout) } as *mut SharedWindow;
            unsafe { SharedWindow::init_in_place(ptr, window::MAX_SIZE) };
            OwnedWindow { ptr, layout }
        }
        fn get(&self) -> &SharedWindow {
            unsafe { &*self.ptr }
        }
    }
    impl Drop for OwnedWindow {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr as *mut u8, self.layout) };
        }
    }

    fn config() -> ClassicBreakerConfig {
        ClassicBreakerConfig {
            error_threshold: 3,
            error_threshold_timeout: None,
            error_timeout: Duration::from_millis(50),
            success_threshold: 2,
            half_open_resource_timeout: None,
        }
    }

    #[test]
    fn trip_and_recover_scenario_c() {
        let w = OwnedWindow::new();
        let window = w.get();
        let mut breaker = ClassicBreaker::new(config());

        for _ in 0..3 {
            assert!(breaker.pre_check(window).is_ok());
            breaker.record_failure(window);
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        // 4th call fast-fails
        assert!(breaker.pre_check(window).is_err());

        std::thread::sleep(Duration::from_millis(60));

        // transitions to half-open and allows exactly one trial
        assert!(breaker.pre_check(window).is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_success(window);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.pre_check(window).is_ok());
        breaker.record_success(window);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(window.size(), 0);
    }

    #[test]
    fn half_open_admits_only_one_concurrent_trial() {
        let w = OwnedWindow::new();
        let window = w.get();
        let mut breaker = ClassicBreaker::new(config());
        for _ in 0..3 {
            breaker.pre_check(window).ok();
            breaker.record_failure(window);
        }
        std::thread::sleep(Duration::from_millis(60));

        assert!(breaker.pre_check(window).is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // a second caller racing in while the first trial is still in flight
        // is rejected rather than admitted as a second trial.
        assert!(breaker.pre_check(window).is_err());
        assert!(breaker.pre_check(window).is_err());

        breaker.record_success(window);
        // the trial completed: a new one may now be admitted.
        assert!(breaker.pre_check(window).is_ok());
    }

    #[test]
    fn half_open_failure_reopens() {
        let w = OwnedWindow::new();
        let window = w.get();
        let mut breaker = ClassicBreaker::new(config());
        for _ in 0..3 {
            breaker.pre_check(window).ok();
            breaker.record_failure(window);
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(breaker.pre_check(window).is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_failure(window);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn non_connection_errors_dont_trip_scenario_d() {
        // Simulated by the caller simply never calling record_failure for
        // application-domain exceptions (spec.md §4.5/§6's adapter
        // contract: only "connection-like" exceptions feed the breaker).
        let w = OwnedWindow::new();
        let window = w.get();
        let mut breaker = ClassicBreaker::new(config());
        for _ in 0..10 {
            assert!(breaker.pre_check(window).is_ok());
            breaker.record_success(window); // non-connection error -> treated as a pass-through, not fed to breaker
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn error_threshold_timeout_windows_out_old_failures() {
        let w = OwnedWindow::new();
        let window = w.get();
        let mut cfg = config();
        cfg.error_threshold_timeout = Some(Duration::from_millis(20));
        let mut breaker = ClassicBreaker::new(cfg);

        breaker.pre_check(window).ok();
        breaker.record_failure(window);
        breaker.pre_check(window).ok();
        breaker.record_failure(window);

        std::thread::sleep(Duration::from_millis(30));

        breaker.pre_check(window).ok();
        breaker.record_failure(window);
        // only 1 failure is within the last 20ms now; threshold 3 not met
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
