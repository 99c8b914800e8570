//! Process-shared state substrate (spec.md §4.1-§4.2): the hard part this
//! crate exists to get right. Everything above this module touches shared
//! kernel IPC objects only through these wrappers.

pub mod robust_mutex;
pub mod semset;
pub mod shm;

pub use robust_mutex::RobustMutex;
pub use semset::{SemIndex, SemaphoreSet};
pub use shm::SegmentHandle;
