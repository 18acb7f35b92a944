//! The queue service and its polling worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::retry::{retry_decision, RetryDecision};
use crate::events::EventLogger;
use crate::runner::AgentRunner;
use crate::store::{EventType, Priority, QueueItem, QueueStatus, QueueStore};

#[derive(Debug, Error)]
pub enum QueueError {
    /// The agent already has a pending or running item.
    #[error("Agent {agent_id} is already {status} in the queue (item {queue_id})")]
    AlreadyActive {
        agent_id: Uuid,
        queue_id: Uuid,
        status: QueueStatus,
    },

    #[error("Queue item {id} cannot be cancelled: it is already {status}")]
    NotCancellable { id: Uuid, status: QueueStatus },

    #[error("Queue item not found: {0}")]
    NotFound(Uuid),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Tunables for [`ExecutionQueue`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub poll_interval: Duration,
    /// Items taken per poll.
    pub batch_size: usize,
    pub default_max_retries: u32,
    /// Backoff unit; retry `n` waits `2^n` units.
    pub retry_unit: Duration,
    /// Run the items of one batch concurrently. Items in a batch always
    /// belong to distinct agents.
    pub parallel: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 5,
            default_max_retries: 3,
            retry_unit: Duration::from_secs(60),
            parallel: false,
        }
    }
}

/// Parameters for [`ExecutionQueue::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub agent_id: Uuid,
    pub user_id: Uuid,
    pub priority: Priority,
    /// Falls back to the queue's default.
    pub max_retries: Option<u32>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl EnqueueRequest {
    pub fn new(agent_id: Uuid, user_id: Uuid) -> Self {
        Self {
            agent_id,
            user_id,
            priority: Priority::default(),
            max_retries: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Counts by status over a time window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
}

/// What the worker did with one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed,
    RetryScheduled { retry_count: u32, run_at: DateTime<Utc> },
    Failed,
    /// Another writer changed the item before we claimed it.
    Skipped,
}

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Durable priority queue of agent runs.
pub struct ExecutionQueue {
    store: Arc<dyn QueueStore>,
    runner: Arc<dyn AgentRunner>,
    events: EventLogger,
    config: QueueConfig,
    /// Serializes the active-item check with the insert.
    enqueue_lock: Mutex<()>,
    wake: Notify,
    worker: StdMutex<Option<Worker>>,
}

impl ExecutionQueue {
    pub fn new(
        store: Arc<dyn QueueStore>,
        runner: Arc<dyn AgentRunner>,
        events: EventLogger,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            runner,
            events,
            config,
            enqueue_lock: Mutex::new(()),
            wake: Notify::new(),
            worker: StdMutex::new(None),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Schedule a run for an agent.
    ///
    /// Rejected with [`QueueError::AlreadyActive`] when the agent already has
    /// a pending or running item.
    pub async fn enqueue(&self, request: EnqueueRequest) -> QueueResult<QueueItem> {
        let item = {
            let _guard = self.enqueue_lock.lock().await;

            if let Some(active) = self
                .store
                .active_for_agent(request.agent_id)
                .await?
                .into_iter()
                .next()
            {
                tracing::info!(
                    agent_id = %request.agent_id,
                    queue_id = %active.id,
                    status = %active.status,
                    "Rejected enqueue: agent already has an active run"
                );
                return Err(QueueError::AlreadyActive {
                    agent_id: request.agent_id,
                    queue_id: active.id,
                    status: active.status,
                });
            }

            let mut item = QueueItem::new(
                request.agent_id,
                request.user_id,
                request.priority,
                request
                    .max_retries
                    .unwrap_or(self.config.default_max_retries),
            );
            item.metadata = request.metadata;
            self.store.insert_queue_item(&item).await?;
            item
        };

        tracing::info!(
            agent_id = %item.agent_id,
            queue_id = %item.id,
            priority = %item.priority,
            "Enqueued agent run"
        );
        self.events
            .log(
                item.agent_id,
                item.user_id,
                EventType::QueueEnqueued,
                format!("Run queued with {} priority", item.priority),
                serde_json::json!({ "queue_id": item.id }),
            )
            .await;

        self.wake.notify_one();
        Ok(item)
    }

    /// Cancel a pending item. Anything else is rejected untouched.
    pub async fn cancel(&self, queue_id: Uuid) -> QueueResult<QueueItem> {
        let mut item = self
            .store
            .get_queue_item(queue_id)
            .await?
            .ok_or(QueueError::NotFound(queue_id))?;

        if item.status != QueueStatus::Pending {
            return Err(QueueError::NotCancellable {
                id: queue_id,
                status: item.status,
            });
        }

        item.status = QueueStatus::Cancelled;
        item.completed_at = Some(Utc::now());

        if !self
            .store
            .update_queue_item_if(&item, QueueStatus::Pending)
            .await?
        {
            // Lost the race with the worker.
            let current = self
                .store
                .get_queue_item(queue_id)
                .await?
                .map(|i| i.status)
                .unwrap_or(QueueStatus::Running);
            return Err(QueueError::NotCancellable {
                id: queue_id,
                status: current,
            });
        }

        tracing::info!(queue_id = %queue_id, agent_id = %item.agent_id, "Cancelled queue item");
        self.events
            .log(
                item.agent_id,
                item.user_id,
                EventType::RunCancelled,
                "Queued run cancelled",
                serde_json::json!({ "queue_id": item.id }),
            )
            .await;
        Ok(item)
    }

    /// Cancel the agent's pending item, if it has one.
    pub async fn cancel_agent(&self, agent_id: Uuid) -> QueueResult<Option<Uuid>> {
        match self.get_agent_queue_status(agent_id).await? {
            Some(item) if item.status == QueueStatus::Pending => {
                self.cancel(item.id).await.map(|i| Some(i.id))
            }
            _ => Ok(None),
        }
    }

    /// The agent's current pending or running item.
    pub async fn get_agent_queue_status(&self, agent_id: Uuid) -> QueueResult<Option<QueueItem>> {
        Ok(self.store.active_for_agent(agent_id).await?.into_iter().next())
    }

    /// Most recent items for an agent, newest first.
    pub async fn list_agent_history(&self, agent_id: Uuid, limit: usize) -> QueueResult<Vec<QueueItem>> {
        Ok(self.store.items_for_agent(agent_id, limit).await?)
    }

    /// Counts by status for items created in the last `window_hours`.
    pub async fn get_stats(&self, window_hours: u32) -> QueueResult<QueueStats> {
        let since = Utc::now() - chrono::Duration::hours(i64::from(window_hours));
        let items = self.store.items_since(since).await?;

        let mut stats = QueueStats::default();
        for item in &items {
            match item.status {
                QueueStatus::Pending => stats.pending += 1,
                QueueStatus::Running => stats.running += 1,
                QueueStatus::Completed => stats.completed += 1,
                QueueStatus::Failed => stats.failed += 1,
                QueueStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats.total = items.len();
        Ok(stats)
    }

    /// Run one poll: take due items and process them.
    ///
    /// Returns how many items were claimed and run.
    pub async fn process_due(&self) -> QueueResult<usize> {
        let items = self
            .store
            .due_items(Utc::now(), self.config.batch_size)
            .await?;

        if items.is_empty() {
            return Ok(0);
        }
        tracing::debug!(count = items.len(), "Processing due queue items");

        let outcomes: Vec<QueueResult<ItemOutcome>> = if self.config.parallel {
            futures::future::join_all(items.into_iter().map(|item| self.process_item(item))).await
        } else {
            let mut outcomes = Vec::with_capacity(items.len());
            for item in items {
                outcomes.push(self.process_item(item).await);
            }
            outcomes
        };

        let mut processed = 0;
        for outcome in outcomes {
            match outcome {
                Ok(ItemOutcome::Skipped) => {}
                Ok(_) => processed += 1,
                Err(e) => tracing::error!("Failed to process queue item: {}", e),
            }
        }
        Ok(processed)
    }

    /// Claim one item, run it, and record the result.
    pub async fn process_item(&self, item: QueueItem) -> QueueResult<ItemOutcome> {
        let mut running = item;
        running.status = QueueStatus::Running;
        running.started_at = Some(Utc::now());

        if !self
            .store
            .update_queue_item_if(&running, QueueStatus::Pending)
            .await?
        {
            tracing::debug!(queue_id = %running.id, "Queue item changed before claim, skipping");
            return Ok(ItemOutcome::Skipped);
        }

        tracing::info!(
            queue_id = %running.id,
            agent_id = %running.agent_id,
            attempt = running.retry_count + 1,
            "Starting agent run"
        );
        self.events
            .log(
                running.agent_id,
                running.user_id,
                EventType::RunStarted,
                "Agent run started",
                serde_json::json!({ "queue_id": running.id, "attempt": running.retry_count + 1 }),
            )
            .await;

        match self.runner.run(&running).await {
            Ok(report) => {
                let mut done = running;
                done.status = QueueStatus::Completed;
                done.completed_at = Some(Utc::now());
                if !self
                    .store
                    .update_queue_item_if(&done, QueueStatus::Running)
                    .await?
                {
                    tracing::warn!(queue_id = %done.id, "Queue item changed during run, result not recorded");
                    return Ok(ItemOutcome::Skipped);
                }

                tracing::info!(queue_id = %done.id, agent_id = %done.agent_id, "Agent run completed");
                self.events
                    .log(
                        done.agent_id,
                        done.user_id,
                        EventType::RunCompleted,
                        report.summary.clone(),
                        serde_json::json!({
                            "queue_id": done.id,
                            "completed_tasks": report.completed_tasks,
                            "unblocked_tasks": report.unblocked_tasks,
                        }),
                    )
                    .await;
                Ok(ItemOutcome::Completed)
            }
            Err(error) => self.handle_failure(running, format!("{:#}", error)).await,
        }
    }

    async fn handle_failure(&self, mut item: QueueItem, message: String) -> QueueResult<ItemOutcome> {
        item.error_message = Some(message.clone());

        match retry_decision(item.retry_count, item.max_retries, self.config.retry_unit) {
            RetryDecision::Retry { retry_count, delay } => {
                let now = Utc::now();
                let run_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);

                item.retry_count = retry_count;
                item.status = QueueStatus::Pending;
                item.scheduled_at = run_at;
                item.started_at = None;
                if !self
                    .store
                    .update_queue_item_if(&item, QueueStatus::Running)
                    .await?
                {
                    tracing::warn!(queue_id = %item.id, "Queue item changed during run, failure not recorded: {}", message);
                    return Ok(ItemOutcome::Skipped);
                }

                tracing::warn!(
                    queue_id = %item.id,
                    agent_id = %item.agent_id,
                    retry_count,
                    max_retries = item.max_retries,
                    delay = ?delay,
                    "Agent run failed, retry scheduled: {}",
                    message
                );
                self.events
                    .log(
                        item.agent_id,
                        item.user_id,
                        EventType::RunRetryScheduled,
                        format!(
                            "Run failed (attempt {} of {}), retrying at {}: {}",
                            retry_count,
                            item.max_retries + 1,
                            run_at.to_rfc3339(),
                            message
                        ),
                        serde_json::json!({ "queue_id": item.id, "retry_count": retry_count }),
                    )
                    .await;
                Ok(ItemOutcome::RetryScheduled { retry_count, run_at })
            }
            RetryDecision::Fail { retry_count } => {
                item.retry_count = retry_count;
                item.status = QueueStatus::Failed;
                item.completed_at = Some(Utc::now());
                if !self
                    .store
                    .update_queue_item_if(&item, QueueStatus::Running)
                    .await?
                {
                    tracing::warn!(queue_id = %item.id, "Queue item changed during run, failure not recorded: {}", message);
                    return Ok(ItemOutcome::Skipped);
                }

                tracing::error!(
                    queue_id = %item.id,
                    agent_id = %item.agent_id,
                    retry_count,
                    "Agent run failed permanently: {}",
                    message
                );
                self.events
                    .log(
                        item.agent_id,
                        item.user_id,
                        EventType::RunFailed,
                        format!("Run failed after {} attempts: {}", retry_count, message),
                        serde_json::json!({ "queue_id": item.id, "retry_count": retry_count }),
                    )
                    .await;
                Ok(ItemOutcome::Failed)
            }
        }
    }

    /// Start the polling worker. A second call while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let queue = Arc::clone(self);
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(queue.config.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(
                interval = ?queue.config.poll_interval,
                batch_size = queue.config.batch_size,
                "Queue worker started"
            );

            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = interval.tick() => {}
                    _ = queue.wake.notified() => {}
                }

                if let Err(e) = queue.process_due().await {
                    tracing::warn!("Queue poll failed: {}", e);
                }
            }

            tracing::info!("Queue worker stopped");
        });

        *worker = Some(Worker { token, handle });
    }

    /// Whether the polling worker is running.
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Stop the worker, letting the item in flight finish.
    pub async fn shutdown(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            worker.token.cancel();
            if let Err(e) = worker.handle.await {
                tracing::error!("Queue worker task panicked: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{AgentRunner, RunReport};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Fails while its script says so, then succeeds; records agent order.
    #[derive(Default)]
    struct ScriptedRunner {
        failures: StdMutex<VecDeque<String>>,
        seen: StdMutex<Vec<Uuid>>,
    }

    impl ScriptedRunner {
        fn failing(times: usize) -> Self {
            let runner = Self::default();
            for i in 0..times {
                runner
                    .failures
                    .lock()
                    .unwrap()
                    .push_back(format!("boom {}", i + 1));
            }
            runner
        }

        fn seen(&self) -> Vec<Uuid> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentRunner for ScriptedRunner {
        async fn run(&self, item: &QueueItem) -> anyhow::Result<RunReport> {
            self.seen.lock().unwrap().push(item.agent_id);
            let failure = self.failures.lock().unwrap().pop_front();
            match failure {
                Some(message) => Err(anyhow::anyhow!(message)),
                None => Ok(RunReport::summary("done")),
            }
        }
    }

    fn queue_with(
        runner: ScriptedRunner,
        config: QueueConfig,
    ) -> (Arc<ExecutionQueue>, Arc<MemoryStore>, Arc<ScriptedRunner>) {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(runner);
        let queue = Arc::new(ExecutionQueue::new(
            store.clone(),
            runner.clone(),
            EventLogger::new(store.clone()),
            config,
        ));
        (queue, store, runner)
    }

    fn instant_retries() -> QueueConfig {
        QueueConfig {
            retry_unit: Duration::ZERO,
            ..QueueConfig::default()
        }
    }

    #[tokio::test]
    async fn test_enqueue_then_status_is_pending() {
        let (queue, _, _) = queue_with(ScriptedRunner::default(), QueueConfig::default());
        let agent = Uuid::new_v4();
        let item = queue
            .enqueue(EnqueueRequest::new(agent, Uuid::new_v4()).with_priority(Priority::High))
            .await
            .unwrap();

        let status = queue.get_agent_queue_status(agent).await.unwrap().unwrap();
        assert_eq!(status.id, item.id);
        assert_eq!(status.status, QueueStatus::Pending);
        assert_eq!(status.priority, Priority::High);
        assert_eq!(status.max_retries, 3);
    }

    #[tokio::test]
    async fn test_second_enqueue_rejected_while_pending() {
        let (queue, store, _) = queue_with(ScriptedRunner::default(), QueueConfig::default());
        let agent = Uuid::new_v4();
        let user = Uuid::new_v4();
        queue.enqueue(EnqueueRequest::new(agent, user)).await.unwrap();

        let err = queue.enqueue(EnqueueRequest::new(agent, user)).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::AlreadyActive { status: QueueStatus::Pending, .. }
        ));
        assert!(err.to_string().contains("already pending"));
        assert_eq!(store.queue_items().await.len(), 1);

        // A different agent is unaffected.
        queue
            .enqueue(EnqueueRequest::new(Uuid::new_v4(), user))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_enqueues_admit_one() {
        let (queue, store, _) = queue_with(ScriptedRunner::default(), QueueConfig::default());
        let agent = Uuid::new_v4();
        let user = Uuid::new_v4();

        let attempts = (0..8).map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(EnqueueRequest::new(agent, user)).await })
        });
        let results = futures::future::join_all(attempts).await;
        let admitted = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(store.queue_items().await.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_only_pending() {
        let (queue, _, _) = queue_with(ScriptedRunner::default(), QueueConfig::default());
        let agent = Uuid::new_v4();
        let item = queue
            .enqueue(EnqueueRequest::new(agent, Uuid::new_v4()))
            .await
            .unwrap();

        let cancelled = queue.cancel(item.id).await.unwrap();
        assert_eq!(cancelled.status, QueueStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());
        assert!(queue.get_agent_queue_status(agent).await.unwrap().is_none());

        let err = queue.cancel(item.id).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::NotCancellable { status: QueueStatus::Cancelled, .. }
        ));
        assert!(matches!(
            queue.cancel(Uuid::new_v4()).await,
            Err(QueueError::NotFound(_))
        ));

        // Completed items are not cancellable either.
        let second = queue
            .enqueue(EnqueueRequest::new(agent, Uuid::new_v4()))
            .await
            .unwrap();
        queue.process_due().await.unwrap();
        assert!(matches!(
            queue.cancel(second.id).await,
            Err(QueueError::NotCancellable { status: QueueStatus::Completed, .. })
        ));
    }

    #[tokio::test]
    async fn test_successful_run_completes_item() {
        let (queue, store, runner) = queue_with(ScriptedRunner::default(), QueueConfig::default());
        let agent = Uuid::new_v4();
        let item = queue
            .enqueue(EnqueueRequest::new(agent, Uuid::new_v4()))
            .await
            .unwrap();

        assert_eq!(queue.process_due().await.unwrap(), 1);
        let stored = store.get_queue_item(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Completed);
        assert!(stored.started_at.is_some());
        assert!(stored.completed_at.is_some());
        assert_eq!(runner.seen(), vec![agent]);

        let types: Vec<EventType> = store.events().await.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![EventType::QueueEnqueued, EventType::RunStarted, EventType::RunCompleted]
        );
    }

    #[tokio::test]
    async fn test_failure_schedules_backoff() {
        let (queue, store, _) = queue_with(ScriptedRunner::failing(1), QueueConfig::default());
        let item = queue
            .enqueue(EnqueueRequest::new(Uuid::new_v4(), Uuid::new_v4()))
            .await
            .unwrap();

        let before = Utc::now();
        queue.process_due().await.unwrap();
        let stored = store.get_queue_item(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Pending);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.error_message.as_deref(), Some("boom 1"));
        let delay = stored.scheduled_at - before;
        assert!(delay >= chrono::Duration::seconds(119) && delay <= chrono::Duration::seconds(121));

        // Not due yet.
        assert_eq!(queue.process_due().await.unwrap(), 0);
    }

    /// Marks its own item failed mid-run, as another worker reclaiming it would.
    struct ReclaimedRunner {
        store: Arc<MemoryStore>,
        fail: bool,
    }

    #[async_trait]
    impl AgentRunner for ReclaimedRunner {
        async fn run(&self, item: &QueueItem) -> anyhow::Result<RunReport> {
            let mut reclaimed = item.clone();
            reclaimed.status = QueueStatus::Failed;
            reclaimed.error_message = Some("reclaimed".to_string());
            assert!(self
                .store
                .update_queue_item_if(&reclaimed, QueueStatus::Running)
                .await
                .unwrap());
            if self.fail {
                anyhow::bail!("late failure");
            }
            Ok(RunReport::summary("late success"))
        }
    }

    #[tokio::test]
    async fn test_result_of_reclaimed_item_is_not_recorded() {
        for fail in [false, true] {
            let store = Arc::new(MemoryStore::new());
            let runner = Arc::new(ReclaimedRunner {
                store: store.clone(),
                fail,
            });
            let queue = ExecutionQueue::new(
                store.clone(),
                runner,
                EventLogger::new(store.clone()),
                QueueConfig::default(),
            );
            let item = queue
                .enqueue(EnqueueRequest::new(Uuid::new_v4(), Uuid::new_v4()))
                .await
                .unwrap();

            let outcome = queue.process_item(item.clone()).await.unwrap();
            assert!(matches!(outcome, ItemOutcome::Skipped));

            let stored = store.get_queue_item(item.id).await.unwrap().unwrap();
            assert_eq!(stored.status, QueueStatus::Failed);
            assert_eq!(stored.error_message.as_deref(), Some("reclaimed"));
            assert_eq!(stored.retry_count, 0);

            let types: Vec<EventType> = store.events().await.iter().map(|e| e.event_type).collect();
            assert!(types.contains(&EventType::RunStarted));
            assert!(!types.contains(&EventType::RunCompleted));
            assert!(!types.contains(&EventType::RunRetryScheduled));
            assert!(!types.contains(&EventType::RunFailed));
        }
    }

    #[tokio::test]
    async fn test_fourth_failure_is_terminal() {
        let (queue, store, runner) = queue_with(ScriptedRunner::failing(10), instant_retries());
        let agent = Uuid::new_v4();
        let item = queue
            .enqueue(EnqueueRequest::new(agent, Uuid::new_v4()).with_max_retries(3))
            .await
            .unwrap();

        for expected in 1..=3u32 {
            queue.process_due().await.unwrap();
            let stored = store.get_queue_item(item.id).await.unwrap().unwrap();
            assert_eq!(stored.status, QueueStatus::Pending);
            assert_eq!(stored.retry_count, expected);
        }

        queue.process_due().await.unwrap();
        let stored = store.get_queue_item(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Failed);
        assert_eq!(stored.retry_count, 4);
        assert_eq!(stored.error_message.as_deref(), Some("boom 4"));
        assert!(stored.completed_at.is_some());
        assert_eq!(runner.seen().len(), 4);

        let failed_events: Vec<_> = store
            .events()
            .await
            .into_iter()
            .filter(|e| e.event_type == EventType::RunFailed)
            .collect();
        assert_eq!(failed_events.len(), 1);
        assert!(failed_events[0].message.contains("boom 4"));

        // Terminal: the agent can be queued again.
        assert_eq!(queue.process_due().await.unwrap(), 0);
        assert!(queue.get_agent_queue_status(agent).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_batch_order_and_limit() {
        let (queue, _, runner) = queue_with(ScriptedRunner::default(), QueueConfig::default());
        let user = Uuid::new_v4();
        let priorities = [
            Priority::Low,
            Priority::High,
            Priority::Medium,
            Priority::Urgent,
            Priority::High,
            Priority::Low,
            Priority::Medium,
        ];
        let mut agents = Vec::new();
        for priority in priorities {
            let agent = Uuid::new_v4();
            queue
                .enqueue(EnqueueRequest::new(agent, user).with_priority(priority))
                .await
                .unwrap();
            agents.push(agent);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert_eq!(queue.process_due().await.unwrap(), 5);
        assert_eq!(
            runner.seen(),
            vec![agents[3], agents[1], agents[4], agents[2], agents[6]]
        );
        assert_eq!(queue.process_due().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_parallel_batch_runs_every_agent() {
        let config = QueueConfig {
            parallel: true,
            ..QueueConfig::default()
        };
        let (queue, store, runner) = queue_with(ScriptedRunner::default(), config);
        for _ in 0..3 {
            queue
                .enqueue(EnqueueRequest::new(Uuid::new_v4(), Uuid::new_v4()))
                .await
                .unwrap();
        }
        assert_eq!(queue.process_due().await.unwrap(), 3);
        assert_eq!(runner.seen().len(), 3);
        assert!(store
            .queue_items()
            .await
            .iter()
            .all(|i| i.status == QueueStatus::Completed));
    }

    #[tokio::test]
    async fn test_stats_and_history() {
        let (queue, _, _) = queue_with(ScriptedRunner::default(), QueueConfig::default());
        let agent = Uuid::new_v4();
        let user = Uuid::new_v4();
        let first = queue.enqueue(EnqueueRequest::new(agent, user)).await.unwrap();
        queue.process_due().await.unwrap();
        let second = queue.enqueue(EnqueueRequest::new(agent, user)).await.unwrap();
        queue.cancel(second.id).await.unwrap();
        queue
            .enqueue(EnqueueRequest::new(Uuid::new_v4(), user))
            .await
            .unwrap();

        let stats = queue.get_stats(24).await.unwrap();
        assert_eq!(
            stats,
            QueueStats {
                pending: 1,
                running: 0,
                completed: 1,
                failed: 0,
                cancelled: 1,
                total: 3,
            }
        );

        let history = queue.list_agent_history(agent, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].id, first.id);
    }

    #[tokio::test]
    async fn test_worker_picks_up_enqueued_item() {
        let config = QueueConfig {
            poll_interval: Duration::from_secs(3600),
            ..QueueConfig::default()
        };
        let (queue, store, _) = queue_with(ScriptedRunner::default(), config);
        queue.start();
        queue.start();
        assert!(queue.is_running());

        let item = queue
            .enqueue(EnqueueRequest::new(Uuid::new_v4(), Uuid::new_v4()))
            .await
            .unwrap();

        let mut status = QueueStatus::Pending;
        for _ in 0..200 {
            status = store.get_queue_item(item.id).await.unwrap().unwrap().status;
            if status == QueueStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, QueueStatus::Completed);

        queue.shutdown().await;
        assert!(!queue.is_running());
    }
}
