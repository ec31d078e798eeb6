use super::{
    bounded, finish, managed_containers, truncate, MaintenanceTask, SweepReport,
    DEFAULT_EXEC_TIMEOUT,
};
use crate::alerts::AlertDispatcher;
use crate::manager::INSTANCE_HOME;
use crate::metrics::Metrics;
use async_trait::async_trait;
use deacon_common::chrono::Utc;
use deacon_common::{
    ContainerHandle, ContainerRuntime, ExecCommand, ExecOutput, Result, Severity,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{info, instrument, warn};

/// Archives each running instance's config and data into a timestamped
/// directory, then prunes directories older than the retention window.
pub struct BackupManager {
    runtime: Arc<dyn ContainerRuntime>,
    alerts: Arc<AlertDispatcher>,
    metrics: Arc<Metrics>,
    backup_dir: PathBuf,
    retention: Duration,
    exec_timeout: Duration,
}

/// Attempts to find a free run directory before giving up.
const MAX_RUN_DIR_ATTEMPTS: usize = 100;

impl BackupManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        alerts: Arc<AlertDispatcher>,
        metrics: Arc<Metrics>,
        backup_dir: impl Into<PathBuf>,
        retention: Duration,
    ) -> Self {
        Self {
            runtime,
            alerts,
            metrics,
            backup_dir: backup_dir.into(),
            retention,
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
        }
    }

    pub fn with_exec_timeout(mut self, exec_timeout: Duration) -> Self {
        self.exec_timeout = exec_timeout;
        self
    }

    fn command() -> ExecCommand {
        ExecCommand::new(["tar", "czf", "-", "-C", INSTANCE_HOME, ".openclaw", "data"])
    }

    async fn sweep(&self, report: &mut SweepReport) {
        let containers = match managed_containers(self.runtime.as_ref()).await {
            Ok(containers) => containers,
            Err(e) => {
                report.error = Some(e.to_string());
                return;
            }
        };
        let running: Vec<_> = containers.iter().filter(|c| c.is_running()).collect();
        if running.is_empty() {
            return;
        }

        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let target = match create_run_dir(&self.backup_dir, &stamp).await {
            Ok(target) => target,
            Err(e) => {
                report.error = Some(format!("cannot create backup directory: {e}"));
                return;
            }
        };

        for container in running {
            let archive = target.join(format!("{}.tar.gz", container.name));
            match self.archive(container, &archive).await {
                Ok(bytes) => {
                    info!(container = %container.name, path = %archive.display(), bytes, "Backed up");
                    report.success();
                }
                Err(reason) => {
                    warn!(container = %container.name, %reason, "Backup failed");
                    report.failure(&container.name, reason);
                }
            }
        }

        if report.succeeded == 0 {
            // only succeeds when empty
            let _ = tokio::fs::remove_dir(&target).await;
        }
    }

    /// Streams one container's archive to a partial file and renames it into
    /// place on success. The partial file is removed on any failure.
    async fn archive(
        &self,
        container: &ContainerHandle,
        archive: &Path,
    ) -> std::result::Result<u64, String> {
        let partial = archive.with_extension("gz.partial");
        let outcome = self.stream_to(container, &partial).await;
        let result = match outcome {
            Ok(output) if output.success() => tokio::fs::rename(&partial, archive)
                .await
                .map_err(|e| format!("cannot finalize {}: {e}", archive.display())),
            Ok(output) => {
                let detail = truncate(&String::from_utf8_lossy(&output.stderr), 500);
                Err(format!("exit {}: {detail}", output.exit_code))
            }
            Err(e) => Err(e.to_string()),
        };
        match result {
            Ok(()) => Ok(tokio::fs::metadata(archive).await.map(|m| m.len()).unwrap_or(0)),
            Err(reason) => {
                if let Err(e) = tokio::fs::remove_file(&partial).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %partial.display(), error = %e, "Failed to remove partial backup");
                    }
                }
                Err(reason)
            }
        }
    }

    async fn stream_to(&self, container: &ContainerHandle, path: &Path) -> Result<ExecOutput> {
        let mut file = tokio::fs::File::create(path).await?;
        let command = Self::command();
        let output = bounded(
            self.exec_timeout,
            self.runtime.exec_streaming(&container.id, &command, &mut file),
        )
        .await?;
        file.sync_all().await?;
        Ok(output)
    }
}

/// Creates a fresh directory for one backup run under `root`. A run that
/// starts within the same second gets a numeric suffix instead of sharing.
pub(crate) async fn create_run_dir(root: &Path, stamp: &str) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(root).await?;
    for attempt in 0..MAX_RUN_DIR_ATTEMPTS {
        let candidate = match attempt {
            0 => root.join(stamp),
            n => root.join(format!("{stamp}-{n}")),
        };
        match tokio::fs::create_dir(&candidate).await {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free backup directory for {stamp} under {}", root.display()),
    ))
}

#[async_trait]
impl MaintenanceTask for BackupManager {
    fn name(&self) -> &str {
        "backup"
    }

    #[instrument(skip(self), fields(dir = %self.backup_dir.display()))]
    async fn run(&self) -> SweepReport {
        let mut report = SweepReport::new(self.name());
        self.sweep(&mut report).await;

        if report.failed > 0 {
            let message = format!(
                "{} of {} instance backups failed",
                report.failed, report.attempted
            );
            self.alerts
                .send("Backup failures", &message, Severity::Warning)
                .await;
        }

        // retention applies whatever happened above
        let pruned = prune_backups(&self.backup_dir, self.retention, SystemTime::now()).await;
        if !pruned.is_empty() {
            info!(count = pruned.len(), "Pruned old backups");
        }
        finish(report, &self.metrics)
    }
}

/// Removes directories directly under `root` whose mtime is more than
/// `retention` before `now`. Returns the removed paths.
pub async fn prune_backups(root: &Path, retention: Duration, now: SystemTime) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return removed,
        Err(e) => {
            warn!(dir = %root.display(), error = %e, "Cannot read backup directory");
            return removed;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!(dir = %root.display(), error = %e, "Failed to scan backup directory");
                break;
            }
        };
        let path = entry.path();
        let modified = match entry.metadata().await {
            Ok(meta) if meta.is_dir() => meta.modified(),
            Ok(_) => continue,
            Err(e) => Err(e),
        };
        let age = match modified {
            // mtime in the future counts as fresh
            Ok(mtime) => now.duration_since(mtime).unwrap_or_default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read backup mtime");
                continue;
            }
        };
        if age <= retention {
            continue;
        }
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                info!(path = %path.display(), age_secs = age.as_secs(), "Removed expired backup");
                removed.push(path);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove expired backup"),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_dirs_never_collide() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("backups");
        let first = create_run_dir(&nested, "20260101T000000Z").await.unwrap();
        let second = create_run_dir(&nested, "20260101T000000Z").await.unwrap();
        assert_eq!(first, nested.join("20260101T000000Z"));
        assert_eq!(second, nested.join("20260101T000000Z-1"));
        assert!(second.is_dir());
    }
}
