pub mod alerts;
pub mod config;
pub mod locks;
pub mod manager;
pub mod metrics;
pub mod scheduler;
pub mod store;
pub mod tasks;

pub use alerts::{Alert, AlertDispatcher};
pub use config::DeaconConfig;
pub use locks::KeyedLocks;
pub use manager::{InstanceManager, LaunchRequest, LifecycleOutcome, ManagerSettings, OutcomeStatus};
pub use metrics::Metrics;
pub use scheduler::{SchedulerError, TaskScheduler};
pub use store::StateStore;
pub use tasks::{
    BackupManager, HealthChecker, InstanceHealth, MaintenanceTask, SweepFailure, SweepReport,
    UpgradeRunner,
};

pub use deacon_common as common;
