//! The unit of work the queue executes for an agent.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::events::EventLogger;
use crate::llm::{CompletionRequest, ProviderSelector};
use crate::store::{EventType, QueueItem, Task, TaskStatus, TaskStore};
use crate::task::DependencyGraph;

/// Longest `output_summary` stored on a finished task, in characters.
pub const OUTPUT_SUMMARY_LIMIT: usize = 500;

const SYSTEM_PROMPT: &str = "You are an autonomous agent working through a task list on behalf \
of a user. Complete the task you are given and reply with the result. Be concise.";

/// What one run achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub summary: String,
    pub completed_tasks: Vec<Uuid>,
    pub unblocked_tasks: Vec<Uuid>,
}

impl RunReport {
    pub fn summary(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Self::default()
        }
    }
}

/// Runs an agent once. An error fails the run and lets the queue retry it.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, item: &QueueItem) -> anyhow::Result<RunReport>;
}

/// Works the agent's next task through the provider selector.
pub struct LlmAgentRunner {
    tasks: Arc<dyn TaskStore>,
    graph: Arc<DependencyGraph>,
    selector: Arc<ProviderSelector>,
    events: EventLogger,
}

impl LlmAgentRunner {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        graph: Arc<DependencyGraph>,
        selector: Arc<ProviderSelector>,
        events: EventLogger,
    ) -> Self {
        Self {
            tasks,
            graph,
            selector,
            events,
        }
    }

    /// Highest-priority `todo` task; the store already returns them in order.
    async fn next_task(&self, agent_id: Uuid) -> anyhow::Result<Option<Task>> {
        Ok(self
            .tasks
            .tasks_for_agent(agent_id)
            .await?
            .into_iter()
            .find(|t| t.status == TaskStatus::Todo))
    }

    fn prompt_for(task: &Task, item: &QueueItem) -> String {
        let mut prompt = String::new();
        if let Some(goal) = item.metadata.get("goal").and_then(|v| v.as_str()) {
            prompt.push_str(&format!("Overall goal: {}\n\n", goal));
        }
        prompt.push_str(&format!("Task: {}\n", task.title));
        if !task.description.is_empty() {
            prompt.push_str(&format!("Details: {}\n", task.description));
        }
        prompt
    }

    async fn set_status(&self, task: &mut Task, status: TaskStatus) -> anyhow::Result<()> {
        task.status = status;
        task.updated_at = Utc::now();
        self.tasks.update_task(task).await
    }
}

#[async_trait]
impl AgentRunner for LlmAgentRunner {
    async fn run(&self, item: &QueueItem) -> anyhow::Result<RunReport> {
        match self.graph.release_ready_tasks(item.agent_id).await {
            Ok(released) if !released.is_empty() => {
                tracing::info!(agent_id = %item.agent_id, count = released.len(), "Released blocked tasks before run");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(agent_id = %item.agent_id, "Failed to re-check blocked tasks: {}", e),
        }

        let Some(mut task) = self.next_task(item.agent_id).await? else {
            tracing::info!(agent_id = %item.agent_id, "No actionable tasks, nothing to run");
            return Ok(RunReport::summary("No actionable tasks"));
        };

        self.set_status(&mut task, TaskStatus::InProgress).await?;
        tracing::info!(agent_id = %item.agent_id, task_id = %task.id, title = %task.title, "Working task");

        let request = CompletionRequest::new(item.user_id, Self::prompt_for(&task, item))
            .with_system(SYSTEM_PROMPT);

        let result = match self.selector.execute(&request).await {
            Ok(result) => result,
            Err(e) => {
                if let Err(revert) = self.set_status(&mut task, TaskStatus::Todo).await {
                    tracing::warn!(task_id = %task.id, "Failed to return task to todo: {}", revert);
                }
                return Err(anyhow::Error::new(e).context(format!("Task '{}' failed", task.title)));
            }
        };

        self.events
            .log(
                item.agent_id,
                item.user_id,
                EventType::LlmCall,
                format!("{} ({}) answered task '{}'", result.provider, result.model, task.title),
                serde_json::json!({
                    "task_id": task.id,
                    "provider": result.provider,
                    "model": result.model,
                    "usage": result.usage,
                }),
            )
            .await;

        let summary = truncate(&result.content, OUTPUT_SUMMARY_LIMIT);
        let unblocked = match self.graph.on_task_completed(task.id, Some(summary)).await {
            Ok(unblocked) => unblocked,
            Err(e) => {
                if let Err(revert) = self.set_status(&mut task, TaskStatus::Todo).await {
                    tracing::warn!(task_id = %task.id, "Failed to return task to todo: {}", revert);
                }
                return Err(anyhow::Error::new(e)
                    .context(format!("Task '{}' could not be completed", task.title)));
            }
        };

        self.events
            .log(
                item.agent_id,
                item.user_id,
                EventType::TaskCompleted,
                format!("Completed task '{}'", task.title),
                serde_json::json!({ "task_id": task.id, "unblocked": unblocked }),
            )
            .await;

        Ok(RunReport {
            summary: format!("Completed task '{}'", task.title),
            completed_tasks: vec![task.id],
            unblocked_tasks: unblocked,
        })
    }
}

/// Cut to at most `max` characters, marking the cut.
fn truncate(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::InMemoryCredentials;
    use crate::llm::failover::testing::*;
    use crate::llm::{LlmError, ProviderKind};
    use crate::store::{MemoryStore, Priority};

    struct Fixture {
        store: Arc<MemoryStore>,
        factory: Arc<ScriptedFactory>,
        graph: Arc<DependencyGraph>,
        runner: LlmAgentRunner,
        item: QueueItem,
    }

    async fn fixture(with_key: bool) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let events = EventLogger::new(store.clone());
        let item = QueueItem::new(Uuid::new_v4(), Uuid::new_v4(), Priority::Medium, 3);

        let credentials = Arc::new(InMemoryCredentials::new());
        if with_key {
            credentials
                .set(item.user_id, ProviderKind::OpenAi, OPENAI_KEY, None)
                .await;
        }
        let factory = Arc::new(ScriptedFactory::default());
        let selector = Arc::new(ProviderSelector::new(credentials, factory.clone(), fast_config()));
        let graph = Arc::new(DependencyGraph::new(store.clone(), events.clone()));
        let runner = LlmAgentRunner::new(store.clone(), graph.clone(), selector, events);
        Fixture {
            store,
            factory,
            graph,
            runner,
            item,
        }
    }

    impl Fixture {
        async fn add(&self, title: &str, priority: Priority) -> Task {
            let task = Task::actionable(self.item.agent_id, self.item.user_id, title, "", priority);
            self.store.insert_task(&task).await.unwrap();
            task
        }

        async fn status(&self, id: Uuid) -> TaskStatus {
            self.store.get_task(id).await.unwrap().unwrap().status
        }
    }

    #[tokio::test]
    async fn test_runs_highest_priority_task() {
        let f = fixture(true).await;
        let low = f.add("Tidy notes", Priority::Low).await;
        let high = f.add("Draft launch email", Priority::High).await;
        f.factory
            .push(ProviderKind::OpenAi, Scripted::Reply("Here is the draft".to_string()));

        let report = f.runner.run(&f.item).await.unwrap();
        assert_eq!(report.completed_tasks, vec![high.id]);

        let done = f.store.get_task(high.id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.output_summary.as_deref(), Some("Here is the draft"));
        assert_eq!(f.status(low.id).await, TaskStatus::Todo);
        assert!(f.factory.prompts()[0].contains("Draft launch email"));

        let types: Vec<EventType> = f.store.events().await.iter().map(|e| e.event_type).collect();
        assert!(types.contains(&EventType::LlmCall));
        assert!(types.contains(&EventType::TaskCompleted));
    }

    #[tokio::test]
    async fn test_completion_unblocks_dependent() {
        let f = fixture(true).await;
        let first = f.add("Research", Priority::Medium).await;
        let second = f.add("Write up", Priority::Urgent).await;
        f.graph.create_dependency(first.id, second.id, f.item.user_id).await.unwrap();
        assert_eq!(f.status(second.id).await, TaskStatus::Blocked);

        let report = f.runner.run(&f.item).await.unwrap();
        assert_eq!(report.completed_tasks, vec![first.id]);
        assert_eq!(report.unblocked_tasks, vec![second.id]);
        assert_eq!(f.status(second.id).await, TaskStatus::Todo);
    }

    #[tokio::test]
    async fn test_no_todo_task_skips_provider() {
        let f = fixture(true).await;
        let report = f.runner.run(&f.item).await.unwrap();
        assert!(report.completed_tasks.is_empty());
        assert!(f.factory.calls().is_empty());
    }

    #[tokio::test]
    async fn test_provider_failure_returns_task_to_todo() {
        let f = fixture(false).await;
        let task = f.add("Draft", Priority::Medium).await;

        let err = f.runner.run(&f.item).await.unwrap_err();
        assert!(format!("{:#}", err).contains("No available providers"));
        assert_eq!(f.status(task.id).await, TaskStatus::Todo);
    }

    #[tokio::test]
    async fn test_exhausted_provider_fails_run() {
        let f = fixture(true).await;
        let task = f.add("Draft", Priority::Medium).await;
        for _ in 0..3 {
            f.factory.push(
                ProviderKind::OpenAi,
                Scripted::Fail(LlmError::server_error(503, "unavailable".to_string())),
            );
        }

        assert!(f.runner.run(&f.item).await.is_err());
        assert_eq!(f.status(task.id).await, TaskStatus::Todo);
    }

    #[tokio::test]
    async fn test_failed_completion_keeps_dependents_recoverable() {
        let f = fixture(true).await;
        let first = f.add("Research", Priority::Medium).await;
        let second = f.add("Write up", Priority::Medium).await;
        f.graph.create_dependency(first.id, second.id, f.item.user_id).await.unwrap();
        for _ in 0..2 {
            f.factory
                .push(ProviderKind::OpenAi, Scripted::Reply("notes".to_string()));
        }

        f.store.set_fail_edge_reads(true);
        assert!(f.runner.run(&f.item).await.is_err());
        assert_eq!(f.status(first.id).await, TaskStatus::Todo);
        assert_eq!(f.status(second.id).await, TaskStatus::Blocked);
        f.store.set_fail_edge_reads(false);

        let report = f.runner.run(&f.item).await.unwrap();
        assert_eq!(report.completed_tasks, vec![first.id]);
        assert_eq!(report.unblocked_tasks, vec![second.id]);
        assert_eq!(f.status(second.id).await, TaskStatus::Todo);
    }

    #[tokio::test]
    async fn test_run_releases_stranded_blocked_task() {
        let f = fixture(true).await;
        let first = f.add("Research", Priority::Medium).await;
        let second = f.add("Write up", Priority::Medium).await;
        f.graph.create_dependency(first.id, second.id, f.item.user_id).await.unwrap();

        let mut done = f.store.get_task(first.id).await.unwrap().unwrap();
        done.status = TaskStatus::Done;
        f.store.update_task(&done).await.unwrap();
        f.factory
            .push(ProviderKind::OpenAi, Scripted::Reply("written".to_string()));

        let report = f.runner.run(&f.item).await.unwrap();
        assert_eq!(report.completed_tasks, vec![second.id]);
        assert_eq!(f.status(second.id).await, TaskStatus::Done);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("  short  ", 10), "short");
        let long = "é".repeat(20);
        let cut = truncate(&long, 10);
        assert_eq!(cut.chars().count(), 10);
        assert!(cut.ends_with("..."));
    }
}
