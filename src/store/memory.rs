//! In-process implementation of the store traits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::types::{AgentEvent, DependencyEdge, QueueItem, QueueStatus, Task};
use super::{EventSink, QueueStore, TaskStore};

#[derive(Debug, Default)]
struct Tables {
    queue: HashMap<Uuid, QueueItem>,
    tasks: HashMap<Uuid, Task>,
    edges: Vec<DependencyEdge>,
    events: Vec<AgentEvent>,
}

/// Hash-map backed store; cheap to create per test.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_edge_reads: AtomicBool,
    fail_events: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make edge reads fail, to simulate an unreachable database.
    pub fn set_fail_edge_reads(&self, fail: bool) {
        self.fail_edge_reads.store(fail, Ordering::SeqCst);
    }

    /// Make event writes fail.
    pub fn set_fail_events(&self, fail: bool) {
        self.fail_events.store(fail, Ordering::SeqCst);
    }

    /// Everything logged so far, oldest first.
    pub async fn events(&self) -> Vec<AgentEvent> {
        self.tables.read().await.events.clone()
    }

    pub async fn queue_items(&self) -> Vec<QueueItem> {
        self.tables.read().await.queue.values().cloned().collect()
    }

    fn check_edge_reads(&self) -> anyhow::Result<()> {
        if self.fail_edge_reads.load(Ordering::SeqCst) {
            anyhow::bail!("edge table unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn insert_queue_item(&self, item: &QueueItem) -> anyhow::Result<()> {
        let mut tables = self.tables.write().await;
        if tables.queue.contains_key(&item.id) {
            anyhow::bail!("Queue item {} already exists", item.id);
        }
        tables.queue.insert(item.id, item.clone());
        Ok(())
    }

    async fn get_queue_item(&self, id: Uuid) -> anyhow::Result<Option<QueueItem>> {
        Ok(self.tables.read().await.queue.get(&id).cloned())
    }

    async fn update_queue_item_if(
        &self,
        item: &QueueItem,
        expected: QueueStatus,
    ) -> anyhow::Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.queue.get_mut(&item.id) {
            Some(existing) if existing.status == expected => {
                *existing = item.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn active_for_agent(&self, agent_id: Uuid) -> anyhow::Result<Vec<QueueItem>> {
        let tables = self.tables.read().await;
        let mut items: Vec<QueueItem> = tables
            .queue
            .values()
            .filter(|i| i.agent_id == agent_id && i.status.is_active())
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(items)
    }

    async fn due_items(&self, now: DateTime<Utc>, limit: usize) -> anyhow::Result<Vec<QueueItem>> {
        let tables = self.tables.read().await;
        let mut items: Vec<QueueItem> = tables
            .queue
            .values()
            .filter(|i| i.status == QueueStatus::Pending && i.scheduled_at <= now)
            .cloned()
            .collect();
        items.sort_by(QueueItem::dispatch_cmp);
        items.truncate(limit);
        Ok(items)
    }

    async fn items_since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<QueueItem>> {
        let tables = self.tables.read().await;
        Ok(tables
            .queue
            .values()
            .filter(|i| i.created_at >= since)
            .cloned()
            .collect())
    }

    async fn items_for_agent(&self, agent_id: Uuid, limit: usize) -> anyhow::Result<Vec<QueueItem>> {
        let tables = self.tables.read().await;
        let mut items: Vec<QueueItem> = tables
            .queue
            .values()
            .filter(|i| i.agent_id == agent_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items.truncate(limit);
        Ok(items)
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: &Task) -> anyhow::Result<()> {
        let mut tables = self.tables.write().await;
        tables.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> anyhow::Result<Option<Task>> {
        Ok(self.tables.read().await.tasks.get(&id).cloned())
    }

    async fn update_task(&self, task: &Task) -> anyhow::Result<()> {
        let mut tables = self.tables.write().await;
        match tables.tasks.get_mut(&task.id) {
            Some(existing) => {
                *existing = task.clone();
                Ok(())
            }
            None => anyhow::bail!("Task not found: {}", task.id),
        }
    }

    async fn delete_task(&self, id: Uuid) -> anyhow::Result<()> {
        let mut tables = self.tables.write().await;
        tables.tasks.remove(&id);
        tables
            .edges
            .retain(|e| e.source_task_id != id && e.target_task_id != id);
        Ok(())
    }

    async fn tasks_for_agent(&self, agent_id: Uuid) -> anyhow::Result<Vec<Task>> {
        let tables = self.tables.read().await;
        let mut tasks: Vec<Task> = tables
            .tasks
            .values()
            .filter(|t| t.agent_id == agent_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(tasks)
    }

    async fn tasks_depending_on(&self, task_id: Uuid) -> anyhow::Result<Vec<Task>> {
        let tables = self.tables.read().await;
        Ok(tables
            .tasks
            .values()
            .filter(|t| t.depends_on_task_id == Some(task_id))
            .cloned()
            .collect())
    }

    async fn child_tasks_for_user(&self, user_id: Uuid) -> anyhow::Result<Vec<Task>> {
        self.check_edge_reads()?;
        let tables = self.tables.read().await;
        Ok(tables
            .tasks
            .values()
            .filter(|t| t.user_id == user_id && t.depends_on_task_id.is_some())
            .cloned()
            .collect())
    }

    async fn edges_for_user(&self, user_id: Uuid) -> anyhow::Result<Vec<DependencyEdge>> {
        self.check_edge_reads()?;
        let tables = self.tables.read().await;
        Ok(tables
            .edges
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn edges_into(&self, target_task_id: Uuid) -> anyhow::Result<Vec<DependencyEdge>> {
        self.check_edge_reads()?;
        let tables = self.tables.read().await;
        Ok(tables
            .edges
            .iter()
            .filter(|e| e.target_task_id == target_task_id)
            .cloned()
            .collect())
    }

    async fn edges_from(&self, source_task_id: Uuid) -> anyhow::Result<Vec<DependencyEdge>> {
        self.check_edge_reads()?;
        let tables = self.tables.read().await;
        Ok(tables
            .edges
            .iter()
            .filter(|e| e.source_task_id == source_task_id)
            .cloned()
            .collect())
    }

    async fn insert_edge(&self, edge: &DependencyEdge) -> anyhow::Result<()> {
        let mut tables = self.tables.write().await;
        tables.edges.push(edge.clone());
        Ok(())
    }

    async fn delete_edge(&self, source_task_id: Uuid, target_task_id: Uuid) -> anyhow::Result<bool> {
        let mut tables = self.tables.write().await;
        let before = tables.edges.len();
        tables
            .edges
            .retain(|e| !(e.source_task_id == source_task_id && e.target_task_id == target_task_id));
        Ok(tables.edges.len() != before)
    }
}

#[async_trait]
impl EventSink for MemoryStore {
    async fn log_event(&self, event: &AgentEvent) -> anyhow::Result<()> {
        if self.fail_events.load(Ordering::SeqCst) {
            anyhow::bail!("event log unavailable");
        }
        self.tables.write().await.events.push(event.clone());
        Ok(())
    }
}
