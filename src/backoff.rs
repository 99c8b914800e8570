//! Bounded-backoff polling, used by the first-attacher initialization
//! handshake (spec.md §3, §4.2): followers poll an `initialized` flag with
//! backoff starting at 1ms, capped at 100ms, giving up after a 5s ceiling.

use std::time::{Duration, Instant};

use crate::error::Error;

pub const POLL_START: Duration = Duration::from_millis(1);
pub const POLL_CAP: Duration = Duration::from_millis(100);
pub const POLL_CEILING: Duration = Duration::from_secs(5);

/// Polls `condition` until it returns `true`, doubling the sleep interval
/// from `POLL_START` up to `POLL_CAP` between attempts, failing with
/// `Error::Internal` once `POLL_CEILING` has elapsed without success.
pub fn poll_until<F>(name: &str, mut condition: F) -> Result<(), Error>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + POLL_CEILING;
    let mut interval = POLL_START;

    loop {
        if condition() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::internal(
                name,
                "timed out waiting for first-attacher initialization",
            ));
        }
        std::thread::sleep(interval.min(POLL_CAP));
        interval = (interval * 2).min(POLL_CAP);
    }
}
