//! Cooperative driver that fires maintenance tasks on independent intervals.

use crate::tasks::MaintenanceTask;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info};

pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("maintenance task {task} panicked: {message}")]
    TaskPanicked { task: String, message: String },
}

struct ScheduledTask {
    interval: Duration,
    task: Arc<dyn MaintenanceTask>,
    last_run: Instant,
}

/// Tasks run inline, one at a time, so a slow task delays every other
/// task's due check. Work that must not block goes elsewhere.
pub struct TaskScheduler {
    tasks: Vec<ScheduledTask>,
    tick: Duration,
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Registers `task` to run every `interval`, first one interval after start.
    pub fn every(mut self, interval: Duration, task: Arc<dyn MaintenanceTask>) -> Self {
        self.tasks.push(ScheduledTask {
            interval,
            task,
            last_run: Instant::now(),
        });
        self
    }

    /// Runs until `shutdown` flips to true or its sender is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SchedulerError> {
        let started = Instant::now();
        for entry in &mut self.tasks {
            entry.last_run = started;
            info!(task = entry.task.name(), interval_secs = entry.interval.as_secs(), "Scheduled");
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            let now = Instant::now();
            for entry in &mut self.tasks {
                if now.duration_since(entry.last_run) < entry.interval {
                    continue;
                }
                entry.last_run = now;
                let name = entry.task.name().to_string();
                debug!(task = %name, "Running scheduled task");

                if let Err(panic) = AssertUnwindSafe(entry.task.run()).catch_unwind().await {
                    let message = panic_message(panic.as_ref());
                    error!(task = %name, %message, "Scheduled task panicked, stopping scheduler");
                    return Err(SchedulerError::TaskPanicked {
                        task: name,
                        message,
                    });
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.tick) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Scheduler stopped");
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
