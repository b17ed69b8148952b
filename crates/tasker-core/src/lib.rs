//! Tasker Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - Storage engines
//! - Runtime specifics
//!
//! All types here represent the core business domain of Tasker: the task
//! record, its lifecycle state machine, and the queue message envelope.

pub mod error;
pub mod ids;
pub mod message;
pub mod model;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use error::CoreError;
pub use ids::{ClaimToken, TaskId};
pub use message::TaskMessage;
pub use model::{ResourceProfile, TaskType};
pub use status::TaskStatus;
pub use task::{ErrorKind, Parameters, Task, TaskError};
