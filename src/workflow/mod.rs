//! Workflow generation - turns an agent's goal into its starting tasks.
//!
//! Two generators share one output shape: [`LlmWorkflowGenerator`] asks a
//! provider to plan, [`RuleBasedGenerator`] matches keywords in the goal.
//! [`FallbackGenerator`] tries one and falls back to the other, so callers
//! persist the result the same way whichever path ran.

mod planner;
mod rules;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::llm::FailoverError;
use crate::store::Task;

pub use planner::{extract_json_block, LlmWorkflowGenerator};
pub use rules::RuleBasedGenerator;

/// Most immediate tasks a workflow starts with.
pub const MAX_IMMEDIATE_TASKS: usize = 5;
/// Most human-blocked tasks a workflow starts with.
pub const MAX_DEPENDENCY_TASKS: usize = 3;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Goal is empty")]
    EmptyGoal,

    #[error(transparent)]
    Provider(#[from] FailoverError),

    #[error("Could not read workflow from model output: {0}")]
    InvalidResponse(String),
}

/// Whether the agent can start working right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// At least one task is actionable.
    Ready,
    /// Everything waits on the user.
    AwaitingInput,
}

/// Which generator produced a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowSource {
    Llm,
    Rules,
}

/// Tasks ready to persist: `todo` actionable ones and `blocked` dependency ones.
#[derive(Debug, Clone, Serialize)]
pub struct Workflow {
    pub immediate_tasks: Vec<Task>,
    pub dependency_tasks: Vec<Task>,
    pub status: WorkflowStatus,
    pub source: WorkflowSource,
}

impl Workflow {
    pub(crate) fn new(
        immediate_tasks: Vec<Task>,
        dependency_tasks: Vec<Task>,
        source: WorkflowSource,
    ) -> Self {
        let status = if immediate_tasks.is_empty() {
            WorkflowStatus::AwaitingInput
        } else {
            WorkflowStatus::Ready
        };
        Self {
            immediate_tasks,
            dependency_tasks,
            status,
            source,
        }
    }

    /// Every task, immediate ones first.
    pub fn all_tasks(&self) -> impl Iterator<Item = &Task> {
        self.immediate_tasks.iter().chain(self.dependency_tasks.iter())
    }
}

/// Free-form answers the user gave when creating the agent.
pub type UserInputs = HashMap<String, String>;

#[async_trait]
pub trait WorkflowGenerator: Send + Sync {
    async fn generate(
        &self,
        agent_id: Uuid,
        user_id: Uuid,
        goal: &str,
        user_inputs: &UserInputs,
    ) -> Result<Workflow, WorkflowError>;
}

/// Tries `primary`, then `fallback` on any failure other than an empty goal.
pub struct FallbackGenerator {
    primary: Arc<dyn WorkflowGenerator>,
    fallback: Arc<dyn WorkflowGenerator>,
}

impl FallbackGenerator {
    pub fn new(primary: Arc<dyn WorkflowGenerator>, fallback: Arc<dyn WorkflowGenerator>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl WorkflowGenerator for FallbackGenerator {
    async fn generate(
        &self,
        agent_id: Uuid,
        user_id: Uuid,
        goal: &str,
        user_inputs: &UserInputs,
    ) -> Result<Workflow, WorkflowError> {
        match self.primary.generate(agent_id, user_id, goal, user_inputs).await {
            Ok(workflow) => Ok(workflow),
            Err(WorkflowError::EmptyGoal) => Err(WorkflowError::EmptyGoal),
            Err(e) => {
                tracing::warn!(agent_id = %agent_id, "Workflow generation failed, using rules: {}", e);
                self.fallback.generate(agent_id, user_id, goal, user_inputs).await
            }
        }
    }
}

/// Render user inputs as `key: value` lines in a stable order.
pub(crate) fn format_inputs(user_inputs: &UserInputs) -> String {
    let mut pairs: Vec<_> = user_inputs
        .iter()
        .filter(|(_, v)| !v.trim().is_empty())
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}: {}", k, v.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}
