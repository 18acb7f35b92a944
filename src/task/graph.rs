//! Dependency graph accessor.
//!
//! Edges live in the task store; this type owns the rules around them. All
//! edge mutations go through one mutex so the cycle check and the insert
//! cannot interleave with another writer in this process.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::events::EventLogger;
use crate::store::{DependencyEdge, EventType, Task, TaskStatus, TaskStore};

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("A task cannot depend on itself")]
    SelfDependency,

    #[error("Dependency {from_task} -> {to_task} would create a cycle")]
    CycleDetected { from_task: Uuid, to_task: Uuid },

    #[error("Dependency {from_task} -> {to_task} already exists")]
    DuplicateEdge { from_task: Uuid, to_task: Uuid },

    #[error("Task {0} is not awaiting human input")]
    NotADependency(Uuid),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type GraphResult<T> = Result<T, GraphError>;

/// What happened to an agent's tasks on deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgentCleanup {
    pub deleted: usize,
    pub orphaned: usize,
}

/// Would adding `source -> target` close a cycle?
///
/// Walks the full edge set depth-first from `target`; reaching `source`
/// means `source` is already downstream of `target`.
pub fn would_create_cycle(edges: &[DependencyEdge], source: Uuid, target: Uuid) -> bool {
    if source == target {
        return true;
    }

    let mut adjacency: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for edge in edges {
        adjacency
            .entry(edge.source_task_id)
            .or_default()
            .push(edge.target_task_id);
    }

    let mut visited = HashSet::new();
    let mut stack = vec![target];
    while let Some(current) = stack.pop() {
        if current == source {
            return true;
        }
        if !visited.insert(current) {
            continue;
        }
        if let Some(next) = adjacency.get(&current) {
            stack.extend(next.iter().copied());
        }
    }
    false
}

/// Reads and writes the task graph.
pub struct DependencyGraph {
    store: Arc<dyn TaskStore>,
    events: EventLogger,
    write_lock: Mutex<()>,
}

impl DependencyGraph {
    pub fn new(store: Arc<dyn TaskStore>, events: EventLogger) -> Self {
        Self {
            store,
            events,
            write_lock: Mutex::new(()),
        }
    }

    async fn owned_task(&self, task_id: Uuid, user_id: Uuid) -> GraphResult<Task> {
        match self.store.get_task(task_id).await? {
            Some(task) if task.user_id == user_id => Ok(task),
            _ => Err(GraphError::TaskNotFound(task_id)),
        }
    }

    /// Stored edges, plus one synthetic edge per `depends_on_task_id` link.
    async fn full_edge_set(
        &self,
        user_id: Uuid,
    ) -> anyhow::Result<(Vec<DependencyEdge>, Vec<DependencyEdge>)> {
        let explicit = self.store.edges_for_user(user_id).await?;
        let implicit = self
            .store
            .child_tasks_for_user(user_id)
            .await?
            .into_iter()
            .filter_map(|t| {
                t.depends_on_task_id
                    .map(|parent| DependencyEdge::new(parent, t.id, user_id))
            })
            .collect();
        Ok((explicit, implicit))
    }

    /// Add `source -> target`: source must finish before target may start.
    pub async fn create_dependency(
        &self,
        source_task_id: Uuid,
        target_task_id: Uuid,
        user_id: Uuid,
    ) -> GraphResult<DependencyEdge> {
        if source_task_id == target_task_id {
            return Err(GraphError::SelfDependency);
        }

        let _guard = self.write_lock.lock().await;

        self.owned_task(source_task_id, user_id).await?;
        self.owned_task(target_task_id, user_id).await?;

        // Fail closed: if the edge set cannot be read, assume a cycle.
        let (explicit, implicit) = match self.full_edge_set(user_id).await {
            Ok(sets) => sets,
            Err(e) => {
                tracing::error!(
                    source = %source_task_id,
                    target = %target_task_id,
                    "Cycle check failed, rejecting dependency: {}",
                    e
                );
                return Err(GraphError::CycleDetected {
                    from_task: source_task_id,
                    to_task: target_task_id,
                });
            }
        };

        if explicit
            .iter()
            .any(|e| e.source_task_id == source_task_id && e.target_task_id == target_task_id)
        {
            return Err(GraphError::DuplicateEdge {
                from_task: source_task_id,
                to_task: target_task_id,
            });
        }

        let mut edges = explicit;
        edges.extend(implicit);
        if would_create_cycle(&edges, source_task_id, target_task_id) {
            tracing::info!(
                source = %source_task_id,
                target = %target_task_id,
                "Rejected cyclic dependency"
            );
            return Err(GraphError::CycleDetected {
                from_task: source_task_id,
                to_task: target_task_id,
            });
        }

        let edge = DependencyEdge::new(source_task_id, target_task_id, user_id);
        self.store.insert_edge(&edge).await?;
        drop(_guard);

        self.recompute_availability(target_task_id).await?;
        Ok(edge)
    }

    /// Remove an edge and re-evaluate its target.
    pub async fn remove_dependency(
        &self,
        source_task_id: Uuid,
        target_task_id: Uuid,
        user_id: Uuid,
    ) -> GraphResult<bool> {
        let removed = {
            let _guard = self.write_lock.lock().await;
            self.owned_task(target_task_id, user_id).await?;
            self.store.delete_edge(source_task_id, target_task_id).await?
        };
        if removed {
            self.recompute_availability(target_task_id).await?;
        }
        Ok(removed)
    }

    /// Ids of the tasks that must finish before `task`.
    async fn predecessor_ids(&self, task: &Task) -> GraphResult<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self
            .store
            .edges_into(task.id)
            .await?
            .into_iter()
            .map(|e| e.source_task_id)
            .collect();
        if let Some(parent) = task.depends_on_task_id {
            if !ids.contains(&parent) {
                ids.push(parent);
            }
        }
        Ok(ids)
    }

    /// Unblock a task whose predecessors are all done, or block it if one is not.
    ///
    /// Only moves tasks between `todo` and `blocked`; tasks in any other state
    /// and human-blocked tasks are returned unchanged. A predecessor that no
    /// longer exists counts as finished. Idempotent.
    pub async fn recompute_availability(&self, task_id: Uuid) -> GraphResult<TaskStatus> {
        let mut task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(GraphError::TaskNotFound(task_id))?;

        if task.is_dependency || !matches!(task.status, TaskStatus::Todo | TaskStatus::Blocked) {
            return Ok(task.status);
        }

        let mut unfinished = 0usize;
        for pred_id in self.predecessor_ids(&task).await? {
            if let Some(pred) = self.store.get_task(pred_id).await? {
                if pred.status != TaskStatus::Done {
                    unfinished += 1;
                }
            }
        }

        match (task.status, unfinished) {
            (TaskStatus::Blocked, 0) => {
                task.status = TaskStatus::Todo;
                task.blocked_reason = None;
                task.updated_at = Utc::now();
                self.store.update_task(&task).await?;
                tracing::info!(task_id = %task.id, "Task unblocked");
                self.events
                    .log(
                        task.agent_id,
                        task.user_id,
                        EventType::TaskUnblocked,
                        format!("Task \"{}\" is ready to start", task.title),
                        serde_json::json!({ "task_id": task.id }),
                    )
                    .await;
            }
            (TaskStatus::Todo, n) if n > 0 => {
                task.status = TaskStatus::Blocked;
                task.blocked_reason = Some(format!("Waiting on {} unfinished task(s)", n));
                task.updated_at = Utc::now();
                self.store.update_task(&task).await?;
                tracing::debug!(task_id = %task.id, unfinished = n, "Task blocked");
            }
            _ => {}
        }

        Ok(task.status)
    }

    /// Mark a task done and re-evaluate everything that waits on it.
    ///
    /// Returns the ids of tasks that became ready.
    pub async fn on_task_completed(
        &self,
        task_id: Uuid,
        output_summary: Option<String>,
    ) -> GraphResult<Vec<Uuid>> {
        let mut task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(GraphError::TaskNotFound(task_id))?;

        // Read dependents first so a failed read leaves the task unfinished.
        let mut dependents: Vec<Uuid> = self
            .store
            .edges_from(task_id)
            .await?
            .into_iter()
            .map(|e| e.target_task_id)
            .collect();
        for t in self.store.tasks_depending_on(task_id).await? {
            if !dependents.contains(&t.id) {
                dependents.push(t.id);
            }
        }

        task.status = TaskStatus::Done;
        task.output_summary = output_summary;
        task.blocked_reason = None;
        task.updated_at = Utc::now();
        self.store.update_task(&task).await?;

        let mut unblocked = Vec::new();
        for dependent in dependents {
            let was_blocked = matches!(
                self.store.get_task(dependent).await,
                Ok(Some(t)) if t.status == TaskStatus::Blocked
            );
            match self.recompute_availability(dependent).await {
                Ok(TaskStatus::Todo) if was_blocked => unblocked.push(dependent),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(task_id = %dependent, "Failed to recompute availability: {}", e)
                }
            }
        }
        Ok(unblocked)
    }

    /// Re-evaluate an agent's blocked tasks and unblock those whose
    /// predecessors have all finished.
    ///
    /// Catches dependents whose recompute was lost after a predecessor
    /// finished. Per-task failures are logged and skipped.
    pub async fn release_ready_tasks(&self, agent_id: Uuid) -> GraphResult<Vec<Uuid>> {
        let mut released = Vec::new();
        for task in self.store.tasks_for_agent(agent_id).await? {
            if task.is_dependency || task.status != TaskStatus::Blocked {
                continue;
            }
            match self.recompute_availability(task.id).await {
                Ok(TaskStatus::Todo) => released.push(task.id),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(task_id = %task.id, "Failed to recompute availability: {}", e)
                }
            }
        }
        Ok(released)
    }

    /// Record human approval of a dependency task.
    pub async fn approve_dependency(
        &self,
        task_id: Uuid,
        user_id: Uuid,
        note: Option<String>,
    ) -> GraphResult<Vec<Uuid>> {
        let task = self.owned_task(task_id, user_id).await?;
        if !task.is_dependency || task.status == TaskStatus::Done {
            return Err(GraphError::NotADependency(task_id));
        }
        let summary = note.or_else(|| Some("Approved".to_string()));
        self.on_task_completed(task_id, summary).await
    }

    /// Tasks that must finish before `task_id`.
    pub async fn predecessors_of(&self, task_id: Uuid) -> GraphResult<Vec<Task>> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(GraphError::TaskNotFound(task_id))?;
        let mut out = Vec::new();
        for id in self.predecessor_ids(&task).await? {
            if let Some(t) = self.store.get_task(id).await? {
                out.push(t);
            }
        }
        Ok(out)
    }

    /// Tasks waiting on `task_id`.
    pub async fn dependents_of(&self, task_id: Uuid) -> GraphResult<Vec<Task>> {
        let mut out = self.store.tasks_depending_on(task_id).await?;
        for edge in self.store.edges_from(task_id).await? {
            if out.iter().any(|t| t.id == edge.target_task_id) {
                continue;
            }
            if let Some(t) = self.store.get_task(edge.target_task_id).await? {
                out.push(t);
            }
        }
        Ok(out)
    }

    /// Delete an agent's ordinary tasks and orphan its dependency tasks.
    pub async fn cleanup_agent_tasks(&self, agent_id: Uuid) -> GraphResult<AgentCleanup> {
        let _guard = self.write_lock.lock().await;
        let tasks = self.store.tasks_for_agent(agent_id).await?;
        let mut summary = AgentCleanup::default();
        let mut outside_dependents = Vec::new();

        for mut task in tasks {
            if task.is_dependency {
                task.status = TaskStatus::Orphaned;
                task.updated_at = Utc::now();
                self.store.update_task(&task).await?;
                summary.orphaned += 1;
                continue;
            }

            for edge in self.store.edges_from(task.id).await? {
                outside_dependents.push(edge.target_task_id);
            }
            for t in self.store.tasks_depending_on(task.id).await? {
                if t.agent_id != agent_id {
                    outside_dependents.push(t.id);
                }
            }
            self.store.delete_task(task.id).await?;
            summary.deleted += 1;
        }
        drop(_guard);

        for id in outside_dependents {
            match self.recompute_availability(id).await {
                Ok(_) | Err(GraphError::TaskNotFound(_)) => {}
                Err(e) => tracing::warn!(task_id = %id, "Failed to recompute availability: {}", e),
            }
        }

        tracing::info!(
            agent_id = %agent_id,
            deleted = summary.deleted,
            orphaned = summary.orphaned,
            "Cleaned up agent tasks"
        );
        Ok(summary)
    }
}
