use crate::tasks::SweepReport;
use dashmap::DashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
struct SweepCounters {
    runs: AtomicU64,
    failures: AtomicU64,
}

// Daemon counters, rendered in Prometheus text exposition format
#[derive(Debug, Default)]
pub struct Metrics {
    pub launches: AtomicU64,
    pub launch_failures: AtomicU64,
    pub stops: AtomicU64,
    pub destroys: AtomicU64,
    pub alerts: AtomicU64,
    sweeps: DashMap<String, SweepCounters>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sweep(&self, report: &SweepReport) {
        let counters = self.sweeps.entry(report.task.clone()).or_default();
        counters.runs.fetch_add(1, Ordering::Relaxed);
        counters
            .failures
            .fetch_add(report.failed as u64, Ordering::Relaxed);
    }

    pub fn sweep_runs(&self, task: &str) -> u64 {
        self.sweeps
            .get(task)
            .map(|c| c.runs.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn render(&self, instances_known: usize) -> String {
        let mut out = String::new();
        counter(&mut out, "deacon_launches_total", "Successful instance launches.", &self.launches);
        counter(&mut out, "deacon_launch_failures_total", "Failed instance launches.", &self.launch_failures);
        counter(&mut out, "deacon_stops_total", "Instance stops.", &self.stops);
        counter(&mut out, "deacon_destroys_total", "Instance destroys.", &self.destroys);
        counter(&mut out, "deacon_alerts_total", "Alerts raised by maintenance sweeps.", &self.alerts);

        let mut tasks: Vec<(String, u64, u64)> = self
            .sweeps
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.runs.load(Ordering::Relaxed),
                    entry.failures.load(Ordering::Relaxed),
                )
            })
            .collect();
        tasks.sort();

        let _ = writeln!(out, "# HELP deacon_sweeps_total Completed maintenance sweeps.");
        let _ = writeln!(out, "# TYPE deacon_sweeps_total counter");
        for (task, runs, _) in &tasks {
            let _ = writeln!(out, "deacon_sweeps_total{{task=\"{task}\"}} {runs}");
        }
        let _ = writeln!(out, "# HELP deacon_sweep_failures_total Per-instance failures across sweeps.");
        let _ = writeln!(out, "# TYPE deacon_sweep_failures_total counter");
        for (task, _, failures) in &tasks {
            let _ = writeln!(out, "deacon_sweep_failures_total{{task=\"{task}\"}} {failures}");
        }

        let _ = writeln!(out, "# HELP deacon_instances_known Instance records in the registry.");
        let _ = writeln!(out, "# TYPE deacon_instances_known gauge");
        let _ = writeln!(out, "deacon_instances_known {instances_known}");
        out
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: &AtomicU64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {}", value.load(Ordering::Relaxed));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_sweeps_and_gauge() {
        let metrics = Metrics::new();
        metrics.launches.fetch_add(2, Ordering::Relaxed);
        let mut report = SweepReport::new("upgrade");
        report.success();
        report.success();
        report.failure("openclaw-c", "exit 1");
        metrics.record_sweep(&report);

        let text = metrics.render(4);
        assert!(text.contains("deacon_launches_total 2\n"));
        assert!(text.contains("deacon_sweeps_total{task=\"upgrade\"} 1\n"));
        assert!(text.contains("deacon_sweep_failures_total{task=\"upgrade\"} 1\n"));
        assert!(text.contains("deacon_instances_known 4\n"));
        assert_eq!(metrics.sweep_runs("upgrade"), 1);
        assert_eq!(metrics.sweep_runs("backup"), 0);
    }
}
