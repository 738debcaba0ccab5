//! Timer abstraction driving the reconnect loop
//!
//! Scheduled tasks cannot be cancelled. The retry loop checks its own
//! `retrying` flag when a task fires instead.

use std::fmt;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::warn;

/// A task to run once its delay has elapsed
pub type ScheduledTask = Box<dyn FnOnce() + Send>;

/// Runs a task after a delay
pub trait Scheduler: Send + Sync + fmt::Debug {
    fn schedule(&self, delay: Duration, task: ScheduledTask);
}

/// Scheduler backed by `tokio::time::sleep` on the current runtime
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) {
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    task();
                });
            }
            Err(_) => warn!(?delay, "No Tokio runtime, dropping scheduled task"),
        }
    }
}
