//! Service object that wires the queue, graph, selector and generator.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::credentials::CredentialResolver;
use crate::events::EventLogger;
use crate::llm::{ClientFactory, FailoverConfig, ProviderSelector};
use crate::queue::{EnqueueRequest, ExecutionQueue, QueueConfig, QueueError, QueueItem};
use crate::runner::{AgentRunner, LlmAgentRunner};
use crate::store::{EventSink, EventType, Priority, QueueStore, TaskStore};
use crate::task::{AgentCleanup, DependencyGraph, GraphError};
use crate::workflow::{
    FallbackGenerator, LlmWorkflowGenerator, RuleBasedGenerator, UserInputs, Workflow,
    WorkflowError, WorkflowGenerator,
};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("Agent {0} is already being activated")]
    ActivationInProgress(Uuid),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// External collaborators.
pub struct Backends {
    pub queue_store: Arc<dyn QueueStore>,
    pub task_store: Arc<dyn TaskStore>,
    pub event_sink: Arc<dyn EventSink>,
    pub credentials: Arc<dyn CredentialResolver>,
    pub client_factory: Arc<dyn ClientFactory>,
}

/// Result of [`Orchestrator::activate_agent`].
#[derive(Debug, Clone, Serialize)]
pub struct Activation {
    pub workflow: Workflow,
    pub queue_item: QueueItem,
}

/// Result of [`Orchestrator::delete_agent`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct Deletion {
    pub cancelled_queue_item: Option<Uuid>,
    pub tasks: AgentCleanup,
}

pub struct Orchestrator {
    queue: Arc<ExecutionQueue>,
    graph: Arc<DependencyGraph>,
    selector: Arc<ProviderSelector>,
    generator: Arc<dyn WorkflowGenerator>,
    tasks: Arc<dyn TaskStore>,
    events: EventLogger,
    activating: StdMutex<HashSet<Uuid>>,
}

/// Holds an agent's activation slot until dropped.
struct ActivationSlot<'a> {
    activating: &'a StdMutex<HashSet<Uuid>>,
    agent_id: Uuid,
}

impl<'a> ActivationSlot<'a> {
    fn acquire(activating: &'a StdMutex<HashSet<Uuid>>, agent_id: Uuid) -> Option<Self> {
        let mut active = activating.lock().unwrap_or_else(|e| e.into_inner());
        active.insert(agent_id).then_some(Self { activating, agent_id })
    }
}

impl Drop for ActivationSlot<'_> {
    fn drop(&mut self) {
        self.activating
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.agent_id);
    }
}

impl Orchestrator {
    /// Build the default stack: LLM runner, LLM planning with rule fallback.
    pub fn new(backends: Backends, queue_config: QueueConfig, failover_config: FailoverConfig) -> Self {
        let events = EventLogger::new(backends.event_sink);
        let selector = Arc::new(ProviderSelector::new(
            backends.credentials,
            backends.client_factory,
            failover_config,
        ));
        let graph = Arc::new(DependencyGraph::new(backends.task_store.clone(), events.clone()));
        let runner: Arc<dyn AgentRunner> = Arc::new(LlmAgentRunner::new(
            backends.task_store.clone(),
            graph.clone(),
            selector.clone(),
            events.clone(),
        ));
        let queue = Arc::new(ExecutionQueue::new(
            backends.queue_store,
            runner,
            events.clone(),
            queue_config,
        ));
        let generator: Arc<dyn WorkflowGenerator> = Arc::new(FallbackGenerator::new(
            Arc::new(LlmWorkflowGenerator::new(selector.clone())),
            Arc::new(RuleBasedGenerator),
        ));

        Self {
            queue,
            graph,
            selector,
            generator,
            tasks: backends.task_store,
            events,
            activating: StdMutex::new(HashSet::new()),
        }
    }

    /// Replace the workflow generator.
    pub fn with_generator(mut self, generator: Arc<dyn WorkflowGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn queue(&self) -> &Arc<ExecutionQueue> {
        &self.queue
    }

    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    pub fn selector(&self) -> &Arc<ProviderSelector> {
        &self.selector
    }

    /// Start the queue worker.
    pub fn start(&self) {
        self.queue.start();
    }

    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }

    /// Plan an agent's work, persist the tasks, and queue its first run.
    ///
    /// Activations of one agent are serialized within this process; a
    /// concurrent call fails with [`OrchestratorError::ActivationInProgress`].
    pub async fn activate_agent(
        &self,
        agent_id: Uuid,
        user_id: Uuid,
        goal: &str,
        user_inputs: &UserInputs,
        priority: Priority,
    ) -> Result<Activation, OrchestratorError> {
        let _slot = ActivationSlot::acquire(&self.activating, agent_id)
            .ok_or(OrchestratorError::ActivationInProgress(agent_id))?;

        // Fail before planning so a rejected activation leaves no tasks behind.
        if let Some(active) = self.queue.get_agent_queue_status(agent_id).await? {
            return Err(QueueError::AlreadyActive {
                agent_id,
                queue_id: active.id,
                status: active.status,
            }
            .into());
        }

        let workflow = self
            .generator
            .generate(agent_id, user_id, goal, user_inputs)
            .await?;
        for task in workflow.all_tasks() {
            self.tasks.insert_task(task).await?;
        }

        self.events
            .log(
                agent_id,
                user_id,
                EventType::WorkflowGenerated,
                format!(
                    "Planned {} tasks and {} items that need you",
                    workflow.immediate_tasks.len(),
                    workflow.dependency_tasks.len()
                ),
                serde_json::json!({
                    "source": workflow.source,
                    "status": workflow.status,
                }),
            )
            .await;

        let mut request = EnqueueRequest::new(agent_id, user_id).with_priority(priority);
        request
            .metadata
            .insert("goal".to_string(), serde_json::Value::String(goal.trim().to_string()));
        let queue_item = self.queue.enqueue(request).await?;

        tracing::info!(
            agent_id = %agent_id,
            queue_id = %queue_item.id,
            tasks = workflow.immediate_tasks.len() + workflow.dependency_tasks.len(),
            "Activated agent"
        );
        Ok(Activation {
            workflow,
            queue_item,
        })
    }

    /// Cancel the agent's pending run and remove its tasks.
    ///
    /// A run already in progress is left to finish.
    pub async fn delete_agent(&self, agent_id: Uuid, user_id: Uuid) -> Result<Deletion, OrchestratorError> {
        let cancelled_queue_item = match self.queue.cancel_agent(agent_id).await {
            Ok(id) => id,
            // The worker claimed it in between.
            Err(QueueError::NotCancellable { .. }) => None,
            Err(e) => return Err(e.into()),
        };
        let tasks = self.graph.cleanup_agent_tasks(agent_id).await?;

        self.events
            .log(
                agent_id,
                user_id,
                EventType::AgentDeleted,
                "Agent deleted",
                serde_json::json!({
                    "cancelled_queue_item": cancelled_queue_item,
                    "deleted_tasks": tasks.deleted,
                    "orphaned_tasks": tasks.orphaned,
                }),
            )
            .await;

        Ok(Deletion {
            cancelled_queue_item,
            tasks,
        })
    }
}
