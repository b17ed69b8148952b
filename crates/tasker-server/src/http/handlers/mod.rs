//! HTTP request handlers.

mod health;
mod tasks;

pub use health::{health_check, metrics_handler};
pub use tasks::{get_task_output, get_task_status, run_task};
