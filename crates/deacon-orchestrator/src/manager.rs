//! Instance lifecycle: launch, stop, destroy and list, serialized per name.

use crate::config::DeaconConfig;
use crate::locks::KeyedLocks;
use crate::metrics::Metrics;
use crate::store::StateStore;
use deacon_common::chrono::Utc;
use deacon_common::{
    config_volume_for, container_name_for, data_volume_for, validate_instance_name,
    AnnotatedRecord, ContainerRuntime, ContainerSpec, ContainerState, DeaconError,
    InstanceRecord, InstanceStatus, ObservedStatus, ResourceLimits, Result, SeedFile,
    SeedOutcome, VolumeBinding, VolumeSeed, VolumeStore,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub const LABEL_MANAGED: &str = "openclaw.managed";
pub const LABEL_INSTANCE: &str = "openclaw.instance";
pub const LABEL_LAUNCHER: &str = "openclaw.launcher";
pub const LAUNCHER_NAME: &str = "deacon";

pub const INSTANCE_HOME: &str = "/home/openclaw";
pub const CONFIG_MOUNT: &str = "/home/openclaw/.openclaw";
pub const DATA_MOUNT: &str = "/home/openclaw/data";
pub const CONFIG_FILE: &str = "openclaw.json";
const INSTANCE_PATH: &str = "/home/openclaw/.local/bin:/usr/local/bin:/usr/bin:/bin";
const GATEWAY_PORT: u16 = 18790;
const DEFAULT_MODEL: &str = "kimi-coding/k2p5";

/// Container-level settings shared by every instance.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub image: String,
    pub network: Option<String>,
    pub dns: Vec<String>,
    pub stop_grace: Duration,
}

impl ManagerSettings {
    pub fn from_config(config: &DeaconConfig) -> Self {
        Self {
            image: config.image.clone(),
            network: Some(config.network.clone()),
            dns: vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()],
            stop_grace: config.stop_grace,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    pub name: String,
    pub secret_env: BTreeMap<String, String>,
    /// `None` reuses the recorded limits, or the defaults for a new instance.
    pub limits: Option<ResourceLimits>,
    pub telegram_bot_token: Option<String>,
}

impl LaunchRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    AlreadyRunning,
    Launched,
    Stopped,
    NotFound,
    Destroyed,
}

/// Result of a lifecycle operation as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleOutcome {
    pub status: OutcomeStatus,
    pub name: String,
    pub container_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<InstanceRecord>,
}

impl LifecycleOutcome {
    fn new(status: OutcomeStatus, name: &str, record: Option<InstanceRecord>) -> Self {
        Self {
            status,
            name: name.to_string(),
            container_name: container_name_for(name),
            record,
        }
    }
}

pub struct InstanceManager {
    store: Arc<StateStore>,
    runtime: Arc<dyn ContainerRuntime>,
    volumes: Arc<dyn VolumeStore>,
    settings: ManagerSettings,
    locks: KeyedLocks,
    metrics: Arc<Metrics>,
}

impl InstanceManager {
    pub fn new(
        store: Arc<StateStore>,
        runtime: Arc<dyn ContainerRuntime>,
        volumes: Arc<dyn VolumeStore>,
        settings: ManagerSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            runtime,
            volumes,
            settings,
            locks: KeyedLocks::new(),
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    #[instrument(skip(self, request), fields(instance = %request.name))]
    pub async fn launch(&self, request: LaunchRequest) -> Result<LifecycleOutcome> {
        validate_instance_name(&request.name)?;
        if let Some(limits) = &request.limits {
            limits.validate()?;
        }

        let _guard = self.locks.lock(&request.name).await;
        let result = self.launch_locked(&request).await;
        match &result {
            Ok(outcome) if outcome.status == OutcomeStatus::Launched => {
                self.metrics.launches.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {}
            Err(e) => {
                self.metrics.launch_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Launch failed");
            }
        }
        result
    }

    async fn launch_locked(&self, request: &LaunchRequest) -> Result<LifecycleOutcome> {
        let name = request.name.as_str();
        let container_name = container_name_for(name);
        let previous = self.store.get(name).await;
        let limits = resolve_limits(previous.as_ref(), request.limits.as_ref())?;

        if let Some(existing) = self.runtime.get(&container_name).await? {
            if existing.is_running() {
                info!(container_id = %existing.short_id(), "Instance already running");
                return Ok(LifecycleOutcome::new(
                    OutcomeStatus::AlreadyRunning,
                    name,
                    previous,
                ));
            }
            info!(
                container_id = %existing.short_id(),
                state = existing.state.as_str(),
                "Removing stale container before relaunch"
            );
            self.runtime.remove(&existing.id, true).await?;
        }

        let volume_labels = BTreeMap::from([
            (LABEL_INSTANCE.to_string(), name.to_string()),
            (LABEL_LAUNCHER.to_string(), LAUNCHER_NAME.to_string()),
        ]);
        let config_volume = config_volume_for(name);
        self.volumes.ensure(&config_volume, &volume_labels).await?;
        self.volumes.ensure(&data_volume_for(name), &volume_labels).await?;

        let seed = config_seed(name, request.telegram_bot_token.as_deref())?;
        match self.volumes.initialize_if_absent(&config_volume, &seed).await? {
            SeedOutcome::Seeded => info!(volume = %config_volume, "Initialized instance config"),
            SeedOutcome::AlreadyPresent => {
                debug!(volume = %config_volume, "Instance config already present")
            }
        }

        let spec = self.container_spec(name, &request.secret_env, limits.clone());
        let handle = self.runtime.create(&spec).await?;

        let now = Utc::now();
        let record = InstanceRecord {
            name: name.to_string(),
            container_name,
            container_id: handle.id.clone(),
            created_at: previous.map(|r| r.created_at).unwrap_or(now),
            updated_at: now,
            status: InstanceStatus::Running,
            resource_limits: limits,
            secret_env_keys: request.secret_env.keys().cloned().collect(),
        };
        self.store.upsert(record.clone()).await?;

        info!(container_id = %handle.short_id(), "Launched instance");
        Ok(LifecycleOutcome::new(OutcomeStatus::Launched, name, Some(record)))
    }

    fn container_spec(
        &self,
        name: &str,
        secret_env: &BTreeMap<String, String>,
        limits: ResourceLimits,
    ) -> ContainerSpec {
        let mut env = BTreeMap::from([
            ("HOME".to_string(), INSTANCE_HOME.to_string()),
            ("PATH".to_string(), INSTANCE_PATH.to_string()),
            ("OPENCLAW_AGENT".to_string(), name.to_string()),
            (
                "OPENCLAW_CONFIG".to_string(),
                format!("{CONFIG_MOUNT}/{CONFIG_FILE}"),
            ),
        ]);
        env.extend(secret_env.iter().map(|(k, v)| (k.clone(), v.clone())));

        ContainerSpec {
            name: container_name_for(name),
            image: self.settings.image.clone(),
            env,
            volumes: vec![
                VolumeBinding::rw(config_volume_for(name), CONFIG_MOUNT),
                VolumeBinding::rw(data_volume_for(name), DATA_MOUNT),
            ],
            network: self.settings.network.clone(),
            dns: self.settings.dns.clone(),
            limits,
            labels: BTreeMap::from([
                (LABEL_MANAGED.to_string(), "true".to_string()),
                (LABEL_INSTANCE.to_string(), name.to_string()),
                (LABEL_LAUNCHER.to_string(), LAUNCHER_NAME.to_string()),
            ]),
            restart_unless_stopped: true,
        }
    }

    #[instrument(skip(self), fields(instance = %name))]
    pub async fn stop(&self, name: &str) -> Result<LifecycleOutcome> {
        validate_instance_name(name)?;
        let _guard = self.locks.lock(name).await;

        let Some(handle) = self.runtime.get(&container_name_for(name)).await? else {
            info!("No container to stop");
            return Ok(LifecycleOutcome::new(OutcomeStatus::NotFound, name, None));
        };
        match self.runtime.stop(&handle.id, self.settings.stop_grace).await {
            Ok(()) => {}
            // removed between lookup and stop
            Err(e) if e.is_not_found() => {
                return Ok(LifecycleOutcome::new(OutcomeStatus::NotFound, name, None));
            }
            Err(e) => return Err(e),
        }
        self.metrics.stops.fetch_add(1, Ordering::Relaxed);

        let record = self.mark(name, InstanceStatus::Stopped).await?;
        info!(container_id = %handle.short_id(), "Stopped instance");
        Ok(LifecycleOutcome::new(OutcomeStatus::Stopped, name, record))
    }

    /// Removes the container. Volumes are kept.
    #[instrument(skip(self), fields(instance = %name))]
    pub async fn destroy(&self, name: &str) -> Result<LifecycleOutcome> {
        validate_instance_name(name)?;
        let _guard = self.locks.lock(name).await;

        if let Some(handle) = self.runtime.get(&container_name_for(name)).await? {
            self.runtime.remove(&handle.id, true).await?;
            info!(container_id = %handle.short_id(), "Removed container");
        }
        self.metrics.destroys.fetch_add(1, Ordering::Relaxed);

        let record = self.mark(name, InstanceStatus::Destroyed).await?;
        Ok(LifecycleOutcome::new(OutcomeStatus::Destroyed, name, record))
    }

    async fn mark(&self, name: &str, status: InstanceStatus) -> Result<Option<InstanceRecord>> {
        let Some(mut record) = self.store.get(name).await else {
            return Ok(None);
        };
        record.status = status;
        record.updated_at = Utc::now();
        self.store.upsert(record.clone()).await?;
        Ok(Some(record))
    }

    /// Every known record with the status observed in the runtime right now.
    /// Takes no per-name locks.
    pub async fn list(&self) -> Vec<AnnotatedRecord> {
        let records = self.store.snapshot().await;
        let lookups = records.into_iter().map(|record| async move {
            let live_status = match self.runtime.get(&record.container_name).await {
                Ok(Some(handle)) => ObservedStatus::Live(handle.state),
                Ok(None) => ObservedStatus::NotFound,
                Err(e) => {
                    warn!(instance = %record.name, error = %e, "Live status lookup failed");
                    ObservedStatus::Live(ContainerState::Unknown)
                }
            };
            AnnotatedRecord {
                record,
                live_status,
            }
        });
        futures::future::join_all(lookups).await
    }
}

/// Limits are fixed while a record is live. Destroyed records start over.
fn resolve_limits(
    previous: Option<&InstanceRecord>,
    requested: Option<&ResourceLimits>,
) -> Result<ResourceLimits> {
    let recorded = previous
        .filter(|r| r.status != InstanceStatus::Destroyed)
        .map(|r| &r.resource_limits);
    match (recorded, requested) {
        (Some(recorded), Some(requested)) if recorded != requested => {
            Err(DeaconError::Validation(format!(
                "resource limits are fixed at memLimit={} cpuLimit={}; destroy the instance to change them",
                recorded.mem_limit, recorded.cpu_limit
            )))
        }
        (Some(recorded), _) => Ok(recorded.clone()),
        (None, Some(requested)) => Ok(requested.clone()),
        (None, None) => Ok(ResourceLimits::default()),
    }
}

/// Default config volume content for a fresh instance.
pub fn config_seed(name: &str, telegram_bot_token: Option<&str>) -> Result<VolumeSeed> {
    let mut telegram = json!({
        "enabled": telegram_bot_token.is_some(),
        "dmPolicy": "allowlist",
        "allowFrom": [],
        "groupPolicy": "allowlist",
        "groupAllowFrom": [],
    });
    if let Some(token) = telegram_bot_token {
        telegram["botToken"] = json!(token);
    }

    let document = json!({
        "agents": {
            "defaults": {
                "model": { "primary": DEFAULT_MODEL },
                "compaction": { "mode": "safeguard" },
                "maxConcurrent": 4,
            }
        },
        "channels": { "telegram": telegram },
        "gateway": {
            "port": GATEWAY_PORT,
            "mode": "local",
            "bind": "lan",
            "controlUi": { "dangerouslyAllowHostHeaderOriginFallback": true },
        },
        "plugins": {
            "entries": {
                "telegram": { "enabled": true },
                "llm-task": { "enabled": true },
            }
        },
    });
    debug!(instance = %name, "Built config seed");

    Ok(VolumeSeed {
        probe: CONFIG_FILE.to_string(),
        directories: vec!["state".to_string(), "workspace/skills".to_string()],
        files: vec![SeedFile {
            path: CONFIG_FILE.to_string(),
            contents: serde_json::to_vec_pretty(&document)?,
        }],
    })
}
