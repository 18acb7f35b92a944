//! Human-visible progress log.
//!
//! Writes go through [`EventLogger`], which never lets a logging failure
//! reach the operation that produced the event.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::store::{AgentEvent, EventSink, EventType};

/// Wraps an [`EventSink`] and swallows its failures.
#[derive(Clone)]
pub struct EventLogger {
    sink: Arc<dyn EventSink>,
}

impl EventLogger {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    /// Record an event. Failures are logged at warn level and dropped.
    pub async fn log(
        &self,
        agent_id: Uuid,
        user_id: Uuid,
        event_type: EventType,
        message: impl Into<String>,
        metadata: serde_json::Value,
    ) {
        let event = AgentEvent {
            agent_id,
            user_id,
            event_type,
            message: message.into(),
            metadata,
            created_at: Utc::now(),
        };
        if let Err(e) = self.sink.log_event(&event).await {
            tracing::warn!(
                agent_id = %agent_id,
                event_type = %event_type,
                "Failed to record event: {}",
                e
            );
        }
    }
}

/// Sink that only writes to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn log_event(&self, event: &AgentEvent) -> anyhow::Result<()> {
        tracing::info!(
            agent_id = %event.agent_id,
            event_type = %event.event_type,
            "{}",
            event.message
        );
        Ok(())
    }
}
