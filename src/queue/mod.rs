//! Execution queue - schedules agent runs.
//!
//! # Key Concepts
//! - QueueItem: one scheduled run of an agent, persisted in the queue store
//! - One active item per agent: enqueue is rejected while a pending or
//!   running item exists
//! - Polling: a background worker wakes on an interval (and on enqueue),
//!   takes up to `batch_size` due items in priority order and runs them
//! - Retry: failed runs go back to `pending` with exponential backoff until
//!   `max_retries` is exhausted

mod execution;
pub mod retry;

pub use crate::store::{Priority, QueueItem, QueueStatus};
pub use execution::{
    EnqueueRequest, ExecutionQueue, ItemOutcome, QueueConfig, QueueError, QueueStats,
};
pub use retry::{backoff_delay, retry_decision, RetryDecision};
