//! Circuit breakers (C5/C6, spec.md §4.5-§4.6). `resource.rs` is what actually
//! composes one of these with a bulkhead; this module just groups the two
//! breaker implementations, which otherwise share no code -- the classic
//! breaker derives its state from a shared window plus two process-local
//! numbers, the PID breaker lives entirely in shared memory under its own
//! mutex.

pub mod classic;
pub mod pid;

pub use classic::ClassicBreaker;
pub use pid::PidSharedState;
