//! Task queue
//!
//! [`TaskQueueBackend`] owns every task state transition. The in-memory
//! implementation serves a single executor process; other backends plug in
//! behind the same trait.

mod backend;
mod memory;

pub use backend::{FailureOutcome, QueueError, QueueStats, TaskQueueBackend};
pub use memory::InMemoryTaskQueue;
