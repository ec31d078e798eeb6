use super::{
    bounded, finish, managed_containers, truncate, MaintenanceTask, SweepReport,
    DEFAULT_EXEC_TIMEOUT,
};
use crate::alerts::AlertDispatcher;
use crate::manager::INSTANCE_HOME;
use crate::metrics::Metrics;
use async_trait::async_trait;
use deacon_common::{ContainerRuntime, ExecCommand, Severity};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Updates the agent package inside every running managed container.
pub struct UpgradeRunner {
    runtime: Arc<dyn ContainerRuntime>,
    alerts: Arc<AlertDispatcher>,
    metrics: Arc<Metrics>,
    exec_timeout: Duration,
}

impl UpgradeRunner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        alerts: Arc<AlertDispatcher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            runtime,
            alerts,
            metrics,
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
        }
    }

    pub fn with_exec_timeout(mut self, exec_timeout: Duration) -> Self {
        self.exec_timeout = exec_timeout;
        self
    }

    fn command() -> ExecCommand {
        ExecCommand::new(["npm", "update", "-g", "openclaw@latest"]).env("HOME", INSTANCE_HOME)
    }
}

#[async_trait]
impl MaintenanceTask for UpgradeRunner {
    fn name(&self) -> &str {
        "upgrade"
    }

    #[instrument(skip(self))]
    async fn run(&self) -> SweepReport {
        let mut report = SweepReport::new(self.name());
        let containers = match managed_containers(self.runtime.as_ref()).await {
            Ok(containers) => containers,
            Err(e) => {
                report.error = Some(e.to_string());
                return finish(report, &self.metrics);
            }
        };

        for container in containers.iter().filter(|c| c.is_running()) {
            info!(container = %container.name, "Upgrading");
            let command = Self::command();
            match bounded(self.exec_timeout, self.runtime.exec(&container.id, &command)).await {
                Ok(output) if output.success() => {
                    debug!(container = %container.name, "Upgraded");
                    report.success();
                }
                Ok(output) => {
                    let detail = truncate(&output.output_lossy(), 500);
                    warn!(container = %container.name, exit_code = output.exit_code, %detail, "Upgrade failed");
                    report.failure(&container.name, format!("exit {}: {detail}", output.exit_code));
                }
                Err(e) => {
                    warn!(container = %container.name, error = %e, "Upgrade exec failed");
                    report.failure(&container.name, e.to_string());
                }
            }
        }

        if report.failed > 0 {
            let message = format!(
                "{} of {} instances failed to upgrade",
                report.failed, report.attempted
            );
            self.alerts
                .send("Upgrade failures", &message, Severity::Warning)
                .await;
        }
        finish(report, &self.metrics)
    }
}
