use super::{
    bounded, finish, managed_containers, truncate, MaintenanceTask, SweepReport,
    DEFAULT_EXEC_TIMEOUT,
};
use crate::alerts::AlertDispatcher;
use crate::metrics::Metrics;
use async_trait::async_trait;
use deacon_common::{ContainerRuntime, ContainerState, ExecCommand, Severity};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

const GATEWAY_PROCESS: &str = "openclaw-gateway";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceHealth {
    pub container: String,
    pub state: ContainerState,
    pub running: bool,
    /// `None` when the container is not running or the probe could not run.
    pub process_alive: Option<bool>,
}

/// Reports observed health. Never touches instance records.
pub struct HealthChecker {
    runtime: Arc<dyn ContainerRuntime>,
    alerts: Arc<AlertDispatcher>,
    metrics: Arc<Metrics>,
    exec_timeout: Duration,
}

impl HealthChecker {
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

    #[instrument(skip(self))]
    pub async fn check_all(&self) -> (SweepReport, Vec<InstanceHealth>) {
        let mut report = SweepReport::new(self.name());
        let mut results = Vec::new();

        let containers = match managed_containers(self.runtime.as_ref()).await {
            Ok(containers) => containers,
            Err(e) => {
                report.error = Some(e.to_string());
                return (finish(report, &self.metrics), results);
            }
        };

        for container in containers {
            let mut health = InstanceHealth {
                container: container.name.clone(),
                state: container.state,
                running: container.is_running(),
                process_alive: None,
            };

            if !health.running {
                let message = format!("{} is {}", container.name, container.state.as_str());
                self.alerts
                    .send("Instance not running", &message, Severity::Critical)
                    .await;
                report.failure(&container.name, message);
                results.push(health);
                continue;
            }

            let probe = ExecCommand::new(["pgrep", "-f", GATEWAY_PROCESS]);
            match bounded(self.exec_timeout, self.runtime.exec(&container.id, &probe)).await {
                Ok(output) if output.success() => {
                    health.process_alive = Some(true);
                    report.success();
                }
                Ok(output) => {
                    health.process_alive = Some(false);
                    let message = format!("gateway process not running in {}", container.name);
                    self.alerts
                        .send("Gateway down", &message, Severity::Warning)
                        .await;
                    report.failure(
                        &container.name,
                        format!("probe exited {}", output.exit_code),
                    );
                }
                Err(e) => {
                    warn!(container = %container.name, error = %e, "Health probe failed");
                    self.alerts
                        .send(
                            "Health probe failed",
                            &format!("{}: {}", container.name, truncate(&e.to_string(), 200)),
                            Severity::Warning,
                        )
                        .await;
                    report.failure(&container.name, e.to_string());
                }
            }
            info!(
                container = %health.container,
                running = health.running,
                process_alive = ?health.process_alive,
                "Health"
            );
            results.push(health);
        }

        (finish(report, &self.metrics), results)
    }
}

#[async_trait]
impl MaintenanceTask for HealthChecker {
    fn name(&self) -> &str {
        "health"
    }

    async fn run(&self) -> SweepReport {
        self.check_all().await.0
    }
}
