//! Row types shared by the queue, the task graph and the event log.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scheduling priority of a queue item or task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    /// Numeric rank for stores that cannot order by enum.
    pub fn rank(&self) -> i16 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Urgent => 3,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" | "normal" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "urgent" | "critical" => Ok(Self::Urgent),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

/// Status of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Pending and running items count against the one-per-agent limit.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scheduled run of an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub user_id: Uuid,
    pub priority: Priority,
    pub status: QueueStatus,
    /// Not eligible to run before this instant.
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Latest failure only; overwritten on each attempt.
    #[serde(default)]
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl QueueItem {
    pub fn new(agent_id: Uuid, user_id: Uuid, priority: Priority, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent_id,
            user_id,
            priority,
            status: QueueStatus::Pending,
            scheduled_at: now,
            created_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            retry_count: 0,
            max_retries,
            metadata: HashMap::new(),
        }
    }

    /// Dispatch order: higher priority first, then oldest `scheduled_at`.
    pub fn dispatch_cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.scheduled_at.cmp(&other.scheduled_at))
            .then_with(|| self.created_at.cmp(&other.created_at))
    }
}

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Ready to be worked
    Todo,
    InProgress,
    /// Waiting on a predecessor or on a human
    Blocked,
    Done,
    /// Owning agent was deleted
    Orphaned,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Done => "done",
            Self::Orphaned => "orphaned",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of agent work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,
    /// Needs human input or approval.
    pub is_dependency: bool,
    #[serde(default)]
    pub blocked_reason: Option<String>,
    #[serde(default)]
    pub depends_on_task_id: Option<Uuid>,
    #[serde(default)]
    pub depends_on_agent_id: Option<Uuid>,
    /// Set only when the task reaches `done`.
    #[serde(default)]
    pub output_summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// A task the agent can start on.
    pub fn actionable(
        agent_id: Uuid,
        user_id: Uuid,
        title: impl Into<String>,
        description: impl Into<String>,
        priority: Priority,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent_id,
            user_id,
            title: title.into(),
            description: description.into(),
            status: TaskStatus::Todo,
            priority,
            is_dependency: false,
            blocked_reason: None,
            depends_on_task_id: None,
            depends_on_agent_id: None,
            output_summary: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A task waiting on a human.
    pub fn human_blocked(
        agent_id: Uuid,
        user_id: Uuid,
        title: impl Into<String>,
        description: impl Into<String>,
        blocked_reason: impl Into<String>,
    ) -> Self {
        Self {
            status: TaskStatus::Blocked,
            is_dependency: true,
            blocked_reason: Some(blocked_reason.into()),
            ..Self::actionable(agent_id, user_id, title, description, Priority::High)
        }
    }
}

/// `source` must be done before `target` may leave `blocked`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub id: Uuid,
    pub source_task_id: Uuid,
    pub target_task_id: Uuid,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl DependencyEdge {
    pub fn new(source_task_id: Uuid, target_task_id: Uuid, user_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_task_id,
            target_task_id,
            user_id,
            created_at: Utc::now(),
        }
    }
}

/// Kinds of human-visible progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    QueueEnqueued,
    RunStarted,
    RunCompleted,
    RunRetryScheduled,
    RunFailed,
    RunCancelled,
    LlmCall,
    TaskCompleted,
    TaskUnblocked,
    WorkflowGenerated,
    AgentDeleted,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::QueueEnqueued => "queue_enqueued",
            Self::RunStarted => "run_started",
            Self::RunCompleted => "run_completed",
            Self::RunRetryScheduled => "run_retry_scheduled",
            Self::RunFailed => "run_failed",
            Self::RunCancelled => "run_cancelled",
            Self::LlmCall => "llm_call",
            Self::TaskCompleted => "task_completed",
            Self::TaskUnblocked => "task_unblocked",
            Self::WorkflowGenerated => "workflow_generated",
            Self::AgentDeleted => "agent_deleted",
        };
        write!(f, "{}", s)
    }
}

/// An entry in the append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub agent_id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
