//! Tasker Server Library
//!
//! Asynchronous task engine: submission and query over HTTP, a task store
//! with an atomic claim, queue-based dispatch, a worker pool running the
//! built-in task handlers, and a result cache for terminal records.

pub mod broker;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod http;
pub mod metrics;
pub mod registry;
pub mod state;
pub mod store;
pub mod tasks;
pub mod worker;

pub use config::Config;
pub use dispatch::DispatchRouter;
pub use engine::{EngineError, TaskEngine};
pub use state::AppState;
pub use worker::WorkerPool;
