//! Provider-backed planning.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use super::{
    format_inputs, UserInputs, Workflow, WorkflowError, WorkflowGenerator, WorkflowSource,
    MAX_DEPENDENCY_TASKS, MAX_IMMEDIATE_TASKS,
};
use crate::llm::{CompletionRequest, ProviderSelector};
use crate::store::{Priority, Task};

const PLANNER_PROMPT: &str = r#"You plan work for an autonomous agent.
Reply with a single JSON object and nothing else, shaped like:
{"immediate_tasks":[{"title":"...","description":"...","priority":"high"}],
 "dependency_tasks":[{"title":"...","description":"...","blocked_reason":"..."}]}
immediate_tasks are steps the agent can do on its own (at most 5).
dependency_tasks need the user: an approval, an account, or missing information (at most 3).
priority is one of low, medium, high, urgent."#;

#[derive(Debug, Deserialize)]
struct PlannedTask {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    priority: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlannedDependency {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    blocked_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Plan {
    #[serde(default)]
    immediate_tasks: Vec<PlannedTask>,
    #[serde(default)]
    dependency_tasks: Vec<PlannedDependency>,
}

/// Pull a JSON object out of model output: a fenced ```json block, or the
/// outermost `{...}` span.
pub fn extract_json_block(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let content_start = start + 7;
        if let Some(end) = trimmed[content_start..].find("```") {
            let block = trimmed[content_start..content_start + end].trim();
            if !block.is_empty() {
                return Some(block);
            }
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// Asks the provider selector for a plan.
pub struct LlmWorkflowGenerator {
    selector: Arc<ProviderSelector>,
}

impl LlmWorkflowGenerator {
    pub fn new(selector: Arc<ProviderSelector>) -> Self {
        Self { selector }
    }

    fn parse(
        agent_id: Uuid,
        user_id: Uuid,
        content: &str,
    ) -> Result<Workflow, WorkflowError> {
        let json = extract_json_block(content)
            .ok_or_else(|| WorkflowError::InvalidResponse("no JSON object found".to_string()))?;
        let plan: Plan = serde_json::from_str(json)
            .map_err(|e| WorkflowError::InvalidResponse(e.to_string()))?;

        let immediate: Vec<Task> = plan
            .immediate_tasks
            .into_iter()
            .filter(|t| !t.title.trim().is_empty())
            .take(MAX_IMMEDIATE_TASKS)
            .map(|t| {
                let priority = t
                    .priority
                    .and_then(|p| p.parse::<Priority>().ok())
                    .unwrap_or_default();
                Task::actionable(agent_id, user_id, t.title.trim(), t.description, priority)
            })
            .collect();

        let dependencies: Vec<Task> = plan
            .dependency_tasks
            .into_iter()
            .filter(|t| !t.title.trim().is_empty())
            .take(MAX_DEPENDENCY_TASKS)
            .map(|t| {
                let reason = t
                    .blocked_reason
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or_else(|| "Waiting on your input".to_string());
                Task::human_blocked(agent_id, user_id, t.title.trim(), t.description, reason)
            })
            .collect();

        if immediate.is_empty() && dependencies.is_empty() {
            return Err(WorkflowError::InvalidResponse("plan has no tasks".to_string()));
        }
        Ok(Workflow::new(immediate, dependencies, WorkflowSource::Llm))
    }
}

#[async_trait]
impl WorkflowGenerator for LlmWorkflowGenerator {
    async fn generate(
        &self,
        agent_id: Uuid,
        user_id: Uuid,
        goal: &str,
        user_inputs: &UserInputs,
    ) -> Result<Workflow, WorkflowError> {
        let goal = goal.trim();
        if goal.is_empty() {
            return Err(WorkflowError::EmptyGoal);
        }

        let mut prompt = format!("Goal: {}", goal);
        let inputs = format_inputs(user_inputs);
        if !inputs.is_empty() {
            prompt.push_str("\n\nUser inputs:\n");
            prompt.push_str(&inputs);
        }

        let request = CompletionRequest::new(user_id, prompt).with_system(PLANNER_PROMPT);
        let result = self.selector.execute(&request).await?;

        let workflow = Self::parse(agent_id, user_id, &result.content)?;
        tracing::info!(
            agent_id = %agent_id,
            provider = %result.provider,
            immediate = workflow.immediate_tasks.len(),
            dependencies = workflow.dependency_tasks.len(),
            "Generated workflow"
        );
        Ok(workflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::InMemoryCredentials;
    use crate::llm::failover::testing::*;
    use crate::llm::ProviderKind;
    use crate::store::TaskStatus;
    use crate::workflow::{FallbackGenerator, RuleBasedGenerator, WorkflowStatus};

    async fn generator(reply: Option<&str>) -> (LlmWorkflowGenerator, Uuid) {
        let user = Uuid::new_v4();
        let credentials = Arc::new(InMemoryCredentials::new());
        let factory = Arc::new(ScriptedFactory::default());
        if let Some(reply) = reply {
            credentials
                .set(user, ProviderKind::OpenAi, OPENAI_KEY, None)
                .await;
            factory.push(ProviderKind::OpenAi, Scripted::Reply(reply.to_string()));
        }
        let selector = Arc::new(ProviderSelector::new(credentials, factory, fast_config()));
        (LlmWorkflowGenerator::new(selector), user)
    }

    #[test]
    fn test_extract_json_block() {
        assert_eq!(
            extract_json_block("Sure!\n```json\n{\"a\": 1}\n```\nDone"),
            Some("{\"a\": 1}")
        );
        assert_eq!(extract_json_block("Plan: {\"a\": {\"b\": 2}} ok"), Some("{\"a\": {\"b\": 2}}"));
        assert_eq!(extract_json_block("no json here"), None);
    }

    #[tokio::test]
    async fn test_parses_model_plan() {
        let reply = r#"```json
{"immediate_tasks":[{"title":"Draft outline","description":"Sections","priority":"urgent"},
                    {"title":"  ","description":"skipped"}],
 "dependency_tasks":[{"title":"Grant CMS access","description":"","blocked_reason":"Needs login"},
                     {"title":"Pick a date"}]}
```"#;
        let (generator, user) = generator(Some(reply)).await;
        let w = generator
            .generate(Uuid::new_v4(), user, "Launch a blog", &UserInputs::new())
            .await
            .unwrap();

        assert_eq!(w.source, WorkflowSource::Llm);
        assert_eq!(w.status, WorkflowStatus::Ready);
        assert_eq!(w.immediate_tasks.len(), 1);
        assert_eq!(w.immediate_tasks[0].priority, Priority::Urgent);
        assert_eq!(w.immediate_tasks[0].status, TaskStatus::Todo);
        assert_eq!(w.dependency_tasks.len(), 2);
        assert_eq!(w.dependency_tasks[0].blocked_reason.as_deref(), Some("Needs login"));
        assert_eq!(
            w.dependency_tasks[1].blocked_reason.as_deref(),
            Some("Waiting on your input")
        );
    }

    #[tokio::test]
    async fn test_garbage_reply_is_invalid() {
        let (generator, user) = generator(Some("I would rather not.")).await;
        let err = generator
            .generate(Uuid::new_v4(), user, "Launch a blog", &UserInputs::new())
            .await;
        assert!(matches!(err, Err(WorkflowError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn test_no_provider_falls_back_to_rules() {
        let (generator, user) = generator(None).await;
        let direct = generator
            .generate(Uuid::new_v4(), user, "Launch a blog", &UserInputs::new())
            .await;
        assert!(matches!(direct, Err(WorkflowError::Provider(_))));

        let fallback = FallbackGenerator::new(Arc::new(generator), Arc::new(RuleBasedGenerator));
        let w = fallback
            .generate(Uuid::new_v4(), user, "Launch a blog", &UserInputs::new())
            .await
            .unwrap();
        assert_eq!(w.source, WorkflowSource::Rules);
        assert!(!w.immediate_tasks.is_empty());
    }
}
