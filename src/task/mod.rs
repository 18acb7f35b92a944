//! Task module - tasks, dependency edges and the graph accessor.
//!
//! Invariants kept here:
//! - The edge set of a user's tasks is acyclic.
//! - A task with an unfinished predecessor is `blocked`.
//! - Human-blocked (`is_dependency`) tasks only leave `blocked` through approval.

pub mod graph;

pub use crate::store::{DependencyEdge, Priority, Task, TaskStatus};
pub use graph::{would_create_cycle, AgentCleanup, DependencyGraph, GraphError};
