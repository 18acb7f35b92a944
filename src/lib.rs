//! # agentflow
//!
//! Execution orchestration for goal-driven agents.
//!
//! This library provides:
//! - A durable priority queue of agent runs with per-job retry and backoff
//! - LLM provider failover across OpenAI, Anthropic, Google and OpenRouter
//! - A task dependency graph that rejects cycles and unblocks work as
//!   predecessors finish
//! - Workflow generation that turns a goal into starting tasks
//!
//! ## Architecture
//!
//! ```text
//!   activate_agent ──► WorkflowGenerator ──► tasks (TaskStore)
//!          │
//!          ▼
//!   ExecutionQueue ──poll──► AgentRunner ──► ProviderSelector ──► LlmClient
//!          │                     │
//!          ▼                     ▼
//!     QueueStore          DependencyGraph
//! ```
//!
//! ## Modules
//! - `queue`: queue items, enqueue/cancel, the polling worker
//! - `llm`: vendor adapters and the failover selector
//! - `task`: dependency edges and availability
//! - `workflow`: LLM and rule-based planning
//! - `store`: persistence traits, PostgREST and in-memory backends
//! - `orchestrator`: wires everything together

pub mod config;
pub mod credentials;
pub mod events;
pub mod llm;
pub mod orchestrator;
pub mod queue;
pub mod runner;
pub mod store;
pub mod task;
pub mod workflow;

pub use config::Config;
pub use orchestrator::{Backends, Orchestrator};
