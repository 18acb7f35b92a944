//! Persistence seams for the orchestration core.
//!
//! The hosted database is reached through PostgREST ([`SupabaseClient`]);
//! [`MemoryStore`] implements the same traits in-process for tests and
//! single-node runs. Neither enforces the queue's one-active-item-per-agent
//! rule on its own; the queue guards its check-then-insert with a lock.

mod memory;
mod supabase;
pub mod types;

pub use memory::MemoryStore;
pub use supabase::SupabaseClient;
pub use types::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Queue rows.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn insert_queue_item(&self, item: &QueueItem) -> anyhow::Result<()>;

    async fn get_queue_item(&self, id: Uuid) -> anyhow::Result<Option<QueueItem>>;

    /// Overwrite the row only if its stored status is still `expected`.
    ///
    /// Returns `false` when the status changed underneath the caller.
    async fn update_queue_item_if(
        &self,
        item: &QueueItem,
        expected: QueueStatus,
    ) -> anyhow::Result<bool>;

    /// Pending or running items for an agent, newest first.
    async fn active_for_agent(&self, agent_id: Uuid) -> anyhow::Result<Vec<QueueItem>>;

    /// Pending items with `scheduled_at <= now`, in dispatch order.
    async fn due_items(&self, now: DateTime<Utc>, limit: usize) -> anyhow::Result<Vec<QueueItem>>;

    /// Items created at or after `since`.
    async fn items_since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<QueueItem>>;

    /// Most recent items for an agent, newest first.
    async fn items_for_agent(&self, agent_id: Uuid, limit: usize) -> anyhow::Result<Vec<QueueItem>>;
}

/// Tasks and dependency edges.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: &Task) -> anyhow::Result<()>;

    async fn get_task(&self, id: Uuid) -> anyhow::Result<Option<Task>>;

    async fn update_task(&self, task: &Task) -> anyhow::Result<()>;

    async fn delete_task(&self, id: Uuid) -> anyhow::Result<()>;

    /// All tasks of an agent, highest priority first then oldest first.
    async fn tasks_for_agent(&self, agent_id: Uuid) -> anyhow::Result<Vec<Task>>;

    /// Tasks whose `depends_on_task_id` points at `task_id`.
    async fn tasks_depending_on(&self, task_id: Uuid) -> anyhow::Result<Vec<Task>>;

    /// The user's tasks that name a parent through `depends_on_task_id`.
    async fn child_tasks_for_user(&self, user_id: Uuid) -> anyhow::Result<Vec<Task>>;

    /// Every edge owned by the user.
    async fn edges_for_user(&self, user_id: Uuid) -> anyhow::Result<Vec<DependencyEdge>>;

    async fn edges_into(&self, target_task_id: Uuid) -> anyhow::Result<Vec<DependencyEdge>>;

    async fn edges_from(&self, source_task_id: Uuid) -> anyhow::Result<Vec<DependencyEdge>>;

    async fn insert_edge(&self, edge: &DependencyEdge) -> anyhow::Result<()>;

    /// Returns whether an edge was removed.
    async fn delete_edge(&self, source_task_id: Uuid, target_task_id: Uuid) -> anyhow::Result<bool>;
}

/// Append-only progress log shown to users.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn log_event(&self, event: &AgentEvent) -> anyhow::Result<()>;
}
