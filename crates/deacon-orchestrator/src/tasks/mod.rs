//! Fleet-wide maintenance sweeps. Each discovers managed containers through
//! their labels, never through the state store.

use crate::manager::LABEL_MANAGED;
use crate::metrics::Metrics;
use async_trait::async_trait;
use deacon_common::{ContainerFilter, ContainerHandle, ContainerRuntime, DeaconError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{error, info};

mod backup;
mod health;
mod upgrade;

pub use backup::{prune_backups, BackupManager};
pub use health::{HealthChecker, InstanceHealth};
pub use upgrade::UpgradeRunner;

/// Default bound on one in-container command run by a sweep.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(600);

#[async_trait]
pub trait MaintenanceTask: Send + Sync {
    fn name(&self) -> &str;

    /// One full pass. Per-container failures are counted, not returned.
    async fn run(&self) -> SweepReport;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepFailure {
    pub container: String,
    pub reason: String,
}

/// Outcome of one sweep. `failed` always equals `failures.len()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub task: String,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<SweepFailure>,
    /// Set when the sweep could not enumerate the fleet at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SweepReport {
    pub fn new(task: &str) -> Self {
        Self {
            task: task.to_string(),
            ..Default::default()
        }
    }

    pub(crate) fn success(&mut self) {
        self.attempted += 1;
        self.succeeded += 1;
    }

    pub(crate) fn failure(&mut self, container: &str, reason: impl Into<String>) {
        self.attempted += 1;
        self.failed += 1;
        self.failures.push(SweepFailure {
            container: container.to_string(),
            reason: reason.into(),
        });
    }
}

pub(crate) async fn managed_containers(
    runtime: &dyn ContainerRuntime,
) -> Result<Vec<ContainerHandle>> {
    runtime
        .list(&ContainerFilter::label(LABEL_MANAGED, "true"))
        .await
}

/// Bounds one in-container command. An expired deadline becomes a runtime
/// error so the sweep counts it against that container and moves on.
pub(crate) async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(DeaconError::Runtime(format!(
            "command timed out after {}s",
            limit.as_secs()
        ))),
    }
}

/// Logs the outcome and feeds the counters.
pub(crate) fn finish(report: SweepReport, metrics: &Metrics) -> SweepReport {
    if let Some(e) = &report.error {
        error!(task = %report.task, error = %e, "Sweep aborted");
    } else {
        info!(
            task = %report.task,
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            "Sweep complete"
        );
    }
    metrics.record_sweep(&report);
    report
}

/// Keeps log lines and alert bodies readable when commands are chatty.
pub(crate) fn truncate(raw: &str, max: usize) -> String {
    let trimmed = raw.trim();
    match trimmed.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts() {
        let mut report = SweepReport::new("upgrade");
        report.success();
        report.failure("openclaw-b", "exit 1");
        assert_eq!(report.attempted, 2);
        assert_eq!(report.failed, report.failures.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_turns_deadline_into_runtime_error() {
        let hung = bounded(Duration::from_secs(5), std::future::pending::<Result<()>>()).await;
        assert!(matches!(hung, Err(DeaconError::Runtime(msg)) if msg.contains("timed out after 5s")));

        let quick = bounded(Duration::from_secs(5), async { Ok(7) }).await;
        assert_eq!(quick.unwrap(), 7);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("  short \n", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }
}
