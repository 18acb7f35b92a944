//! Supabase client for the PostgREST API.
//!
//! Tables used:
//! - `agent_queue` - queue rows, plus a numeric `priority_rank` column so the
//!   database can order by priority
//! - `tasks` / `task_dependencies` - the task graph
//! - `agent_logs` - the human-visible event log

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::types::{AgentEvent, DependencyEdge, QueueItem, QueueStatus, Task};
use super::{EventSink, QueueStore, TaskStore};

/// Supabase client for database operations.
pub struct SupabaseClient {
    client: Client,
    url: String,
    service_role_key: String,
}

impl SupabaseClient {
    /// Create a new Supabase client.
    pub fn new(client: Client, url: &str, service_role_key: &str) -> Self {
        Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            service_role_key: service_role_key.to_string(),
        }
    }

    /// Get the PostgREST URL.
    fn rest_url(&self) -> String {
        format!("{}/rest/v1", self.url)
    }

    fn request(&self, method: Method, path_and_query: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.rest_url(), path_and_query))
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
    }

    async fn fetch<T: DeserializeOwned>(&self, path_and_query: &str) -> anyhow::Result<Vec<T>> {
        let resp = self.request(Method::GET, path_and_query).send().await?;

        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            anyhow::bail!("Failed to query {}: {} - {}", path_and_query, status, text);
        }

        Ok(serde_json::from_str(&text)?)
    }

    async fn insert(&self, table: &str, body: &serde_json::Value) -> anyhow::Result<()> {
        let resp = self
            .request(Method::POST, table)
            .header("Content-Type", "application/json")
            .header("Prefer", "return=minimal")
            .json(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            anyhow::bail!("Failed to insert into {}: {} - {}", table, status, text);
        }

        Ok(())
    }

    /// PATCH rows matching `filter`; returns the updated rows.
    async fn patch<T: DeserializeOwned>(
        &self,
        table: &str,
        filter: &str,
        body: &serde_json::Value,
    ) -> anyhow::Result<Vec<T>> {
        let resp = self
            .request(Method::PATCH, &format!("{}?{}", table, filter))
            .header("Content-Type", "application/json")
            .header("Prefer", "return=representation")
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            anyhow::bail!("Failed to update {}: {} - {}", table, status, text);
        }

        Ok(serde_json::from_str(&text)?)
    }

    /// DELETE rows matching `filter`; returns how many went away.
    async fn delete(&self, table: &str, filter: &str) -> anyhow::Result<usize> {
        let resp = self
            .request(Method::DELETE, &format!("{}?{}", table, filter))
            .header("Prefer", "return=representation")
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            anyhow::bail!("Failed to delete from {}: {} - {}", table, status, text);
        }

        let rows: Vec<serde_json::Value> = serde_json::from_str(&text)?;
        Ok(rows.len())
    }

    fn queue_row(item: &QueueItem) -> anyhow::Result<serde_json::Value> {
        let mut row = serde_json::to_value(item)?;
        row["priority_rank"] = serde_json::json!(item.priority.rank());
        Ok(row)
    }

    fn timestamp(ts: DateTime<Utc>) -> String {
        urlencoding::encode(&ts.to_rfc3339()).into_owned()
    }
}

// ==================== Queue ====================

#[async_trait]
impl QueueStore for SupabaseClient {
    async fn insert_queue_item(&self, item: &QueueItem) -> anyhow::Result<()> {
        self.insert("agent_queue", &Self::queue_row(item)?).await
    }

    async fn get_queue_item(&self, id: Uuid) -> anyhow::Result<Option<QueueItem>> {
        let rows: Vec<QueueItem> = self.fetch(&format!("agent_queue?id=eq.{}", id)).await?;
        Ok(rows.into_iter().next())
    }

    async fn update_queue_item_if(
        &self,
        item: &QueueItem,
        expected: QueueStatus,
    ) -> anyhow::Result<bool> {
        let updated: Vec<QueueItem> = self
            .patch(
                "agent_queue",
                &format!("id=eq.{}&status=eq.{}", item.id, expected),
                &Self::queue_row(item)?,
            )
            .await?;
        Ok(!updated.is_empty())
    }

    async fn active_for_agent(&self, agent_id: Uuid) -> anyhow::Result<Vec<QueueItem>> {
        self.fetch(&format!(
            "agent_queue?agent_id=eq.{}&status=in.(pending,running)&order=created_at.desc",
            agent_id
        ))
        .await
    }

    async fn due_items(&self, now: DateTime<Utc>, limit: usize) -> anyhow::Result<Vec<QueueItem>> {
        self.fetch(&format!(
            "agent_queue?status=eq.pending&scheduled_at=lte.{}&order=priority_rank.desc,scheduled_at.asc,created_at.asc&limit={}",
            Self::timestamp(now),
            limit
        ))
        .await
    }

    async fn items_since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<QueueItem>> {
        self.fetch(&format!(
            "agent_queue?created_at=gte.{}",
            Self::timestamp(since)
        ))
        .await
    }

    async fn items_for_agent(&self, agent_id: Uuid, limit: usize) -> anyhow::Result<Vec<QueueItem>> {
        self.fetch(&format!(
            "agent_queue?agent_id=eq.{}&order=created_at.desc&limit={}",
            agent_id, limit
        ))
        .await
    }
}

// ==================== Tasks ====================

#[async_trait]
impl TaskStore for SupabaseClient {
    async fn insert_task(&self, task: &Task) -> anyhow::Result<()> {
        let mut row = serde_json::to_value(task)?;
        row["priority_rank"] = serde_json::json!(task.priority.rank());
        self.insert("tasks", &row).await
    }

    async fn get_task(&self, id: Uuid) -> anyhow::Result<Option<Task>> {
        let rows: Vec<Task> = self.fetch(&format!("tasks?id=eq.{}", id)).await?;
        Ok(rows.into_iter().next())
    }

    async fn update_task(&self, task: &Task) -> anyhow::Result<()> {
        let mut row = serde_json::to_value(task)?;
        row["priority_rank"] = serde_json::json!(task.priority.rank());
        let updated: Vec<Task> = self
            .patch("tasks", &format!("id=eq.{}", task.id), &row)
            .await?;
        if updated.is_empty() {
            anyhow::bail!("Task not found: {}", task.id);
        }
        Ok(())
    }

    async fn delete_task(&self, id: Uuid) -> anyhow::Result<()> {
        self.delete(
            "task_dependencies",
            &format!("or=(source_task_id.eq.{id},target_task_id.eq.{id})"),
        )
        .await?;
        self.delete("tasks", &format!("id=eq.{}", id)).await?;
        Ok(())
    }

    async fn tasks_for_agent(&self, agent_id: Uuid) -> anyhow::Result<Vec<Task>> {
        self.fetch(&format!(
            "tasks?agent_id=eq.{}&order=priority_rank.desc,created_at.asc",
            agent_id
        ))
        .await
    }

    async fn tasks_depending_on(&self, task_id: Uuid) -> anyhow::Result<Vec<Task>> {
        self.fetch(&format!("tasks?depends_on_task_id=eq.{}", task_id))
            .await
    }

    async fn child_tasks_for_user(&self, user_id: Uuid) -> anyhow::Result<Vec<Task>> {
        self.fetch(&format!(
            "tasks?user_id=eq.{}&depends_on_task_id=not.is.null",
            user_id
        ))
        .await
    }

    async fn edges_for_user(&self, user_id: Uuid) -> anyhow::Result<Vec<DependencyEdge>> {
        self.fetch(&format!("task_dependencies?user_id=eq.{}", user_id))
            .await
    }

    async fn edges_into(&self, target_task_id: Uuid) -> anyhow::Result<Vec<DependencyEdge>> {
        self.fetch(&format!(
            "task_dependencies?target_task_id=eq.{}",
            target_task_id
        ))
        .await
    }

    async fn edges_from(&self, source_task_id: Uuid) -> anyhow::Result<Vec<DependencyEdge>> {
        self.fetch(&format!(
            "task_dependencies?source_task_id=eq.{}",
            source_task_id
        ))
        .await
    }

    async fn insert_edge(&self, edge: &DependencyEdge) -> anyhow::Result<()> {
        self.insert("task_dependencies", &serde_json::to_value(edge)?)
            .await
    }

    async fn delete_edge(&self, source_task_id: Uuid, target_task_id: Uuid) -> anyhow::Result<bool> {
        let removed = self
            .delete(
                "task_dependencies",
                &format!(
                    "source_task_id=eq.{}&target_task_id=eq.{}",
                    source_task_id, target_task_id
                ),
            )
            .await?;
        Ok(removed > 0)
    }
}

// ==================== Events ====================

#[async_trait]
impl EventSink for SupabaseClient {
    async fn log_event(&self, event: &AgentEvent) -> anyhow::Result<()> {
        self.insert("agent_logs", &serde_json::to_value(event)?).await
    }
}
