//! Task records
//!
//! - [`TaskRecord`] - unit of work and its lifecycle fields
//! - [`TaskClaim`] - current holder of a processing task
//! - [`TaskStatus`] - lifecycle state machine
//! - [`TaskPriority`] - dequeue ordering tiers

mod record;

pub use record::{NewTask, SubmitOptions, TaskClaim, TaskId, TaskPriority, TaskRecord, TaskStatus};
