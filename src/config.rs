//! `ResourceConfig` and friends (spec.md §3, §6). Plain `serde` structs, the
//! way the teacher's `proxy` and `utils` crates model configuration, with
//! `Duration` fields going through `humantime_serde` the same way the
//! teacher's crates do -- no file or CLI loader is implemented here (out of
//! scope per spec.md §1), but the types are serde-ready for an external
//! loader to feed directly.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Either a static ticket count or a fractional quota-per-worker. Exactly one
/// of the two, matching spec.md §3's `tickets XOR quota`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum Capacity {
    Tickets(u32),
    /// In (0, 1].
    Quota(f64),
}

impl Capacity {
    pub fn validate(&self) -> Result<(), &'static str> {
        match self {
            Capacity::Tickets(n) if *n == 0 => Err("tickets must be > 0"),
            Capacity::Tickets(_) => Ok(()),
            Capacity::Quota(q) if *q > 0.0 && *q <= 1.0 => Ok(()),
            Capacity::Quota(_) => Err("quota must be in (0, 1]"),
        }
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, Capacity::Quota(_))
    }
}

/// Classic error-window breaker parameters (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassicBreakerConfig {
    pub error_threshold: usize,
    #[serde(with = "humantime_serde")]
    pub error_threshold_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub error_timeout: Duration,
    pub success_threshold: usize,
    #[serde(with = "humantime_serde")]
    pub half_open_resource_timeout: Option<Duration>,
}

/// Adaptive PID breaker parameters (spec.md §4.6). `target_error_rate <= 0.0`
/// means "use the dynamic p90 of error-rate history, capped at 10%".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PidBreakerConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    #[serde(with = "humantime_serde")]
    pub window_size: Duration,
    pub target_error_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum BreakerConfig {
    Classic(ClassicBreakerConfig),
    Pid(PidBreakerConfig),
    None,
}

/// Immutable per-resource configuration (spec.md §3's `ResourceConfig`).
/// `#[serde(deny_unknown_fields)]` rejects unknown options at registration,
/// per Design Note "runtime-typed option bags" (spec.md §9).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    pub capacity: Capacity,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub permissions: u32,
    pub breaker: BreakerConfig,
    /// Grace period after a fresh semaphore set's creation time during which
    /// `quota_grace_timeout` substitutes for the configured timeout (spec.md
    /// §4.4 step 2). Source-ambiguous interaction with rolling deploys is an
    /// open question (spec.md §9, resolved in DESIGN.md).
    #[serde(with = "humantime_serde")]
    pub quota_grace_period: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub quota_grace_timeout: Option<Duration>,
    pub registry_max_size: usize,
    #[serde(with = "humantime_serde")]
    pub registry_min_age: Duration,
}

impl ResourceConfig {
    pub fn validate(&self) -> Result<(), &'static str> {
        self.capacity.validate()?;
        if let BreakerConfig::Classic(c) = &self.breaker {
            if c.error_threshold == 0 {
                return Err("error_threshold must be > 0");
            }
            if c.success_threshold == 0 {
                return Err("success_threshold must be > 0");
            }
        }
        if let BreakerConfig::Pid(p) = &self.breaker {
            if p.window_size.is_zero() {
                return Err("window_size must be > 0");
            }
        }
        Ok(())
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        ResourceConfig {
            capacity: Capacity::Tickets(1),
            timeout: Duration::from_secs(0),
            permissions: 0o660,
            breaker: BreakerConfig::None,
            quota_grace_period: None,
            quota_grace_timeout: None,
            registry_max_size: 256,
            registry_min_age: Duration::from_secs(60),
        }
    }
}
