use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerStateStatusEnum, HostConfig, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::volume::CreateVolumeOptions;
use bollard::Docker;
use deacon_common::{
    ContainerFilter, ContainerHandle, ContainerRuntime, ContainerSpec, ContainerState,
    DeaconError, ExecCommand, ExecOutput, Result as CommonResult, SeedOutcome, VolumeSeed,
    VolumeStore,
};
use futures::{StreamExt, TryStreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

// Re-export dependencies potentially needed by consumers
pub use bollard;
pub use deacon_common as common;

pub mod mock;
pub mod test_utils;

/// Exit code the seeding helper uses to report an already initialized volume.
const SEED_PRESENT_EXIT: i64 = 42;
const SEED_MOUNT: &str = "/seed";

// --- Custom Error Type ---
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Container creation failed: {0}")]
    CreationFailed(#[source] BollardError),
    #[error("Container start failed: {0}")]
    StartFailed(#[source] BollardError),
    #[error("Container exec failed: {0}")]
    ExecFailed(#[source] BollardError),
    #[error("Volume operation failed: {0}")]
    VolumeFailed(#[source] BollardError),
    #[error("Image pull failed for {image}: {source}")]
    PullFailed {
        image: String,
        #[source]
        source: BollardError,
    },
    #[error("Docker API error: {0}")]
    DockerApi(#[from] BollardError),
    #[error("Internal executor error: {0}")]
    Internal(String),
}

impl From<ExecutorError> for DeaconError {
    fn from(err: ExecutorError) -> Self {
        DeaconError::Runtime(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

fn is_status(err: &BollardError, code: u16) -> bool {
    matches!(err, BollardError::DockerResponseServerError { status_code, .. } if *status_code == code)
}

fn map_state(status: Option<ContainerStateStatusEnum>) -> ContainerState {
    match status {
        Some(ContainerStateStatusEnum::CREATED) => ContainerState::Created,
        Some(ContainerStateStatusEnum::RUNNING) => ContainerState::Running,
        Some(ContainerStateStatusEnum::PAUSED) => ContainerState::Paused,
        Some(ContainerStateStatusEnum::RESTARTING) => ContainerState::Restarting,
        Some(ContainerStateStatusEnum::REMOVING) => ContainerState::Removing,
        Some(ContainerStateStatusEnum::EXITED) => ContainerState::Exited,
        Some(ContainerStateStatusEnum::DEAD) => ContainerState::Dead,
        _ => ContainerState::Unknown,
    }
}

fn to_hash_map(map: &BTreeMap<String, String>) -> HashMap<String, String> {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn single_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// Shell script run by the seeding helper: exits early when the probe file exists.
fn seed_script(seed: &VolumeSeed) -> String {
    let mut script = format!(
        "if [ -e {} ]; then exit {SEED_PRESENT_EXIT}; fi",
        single_quote(&format!("{SEED_MOUNT}/{}", seed.probe))
    );
    for dir in &seed.directories {
        script.push_str(&format!(
            " && mkdir -p {}",
            single_quote(&format!("{SEED_MOUNT}/{dir}"))
        ));
    }
    for (idx, file) in seed.files.iter().enumerate() {
        script.push_str(&format!(
            " && printf '%s' \"$SEED_{idx}\" > {}",
            single_quote(&format!("{SEED_MOUNT}/{}", file.path))
        ));
    }
    script
}

// --- DockerRuntime Implementation ---

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Arc<Docker>,
    helper_image: String,
}

impl DockerRuntime {
    pub fn new(docker: Arc<Docker>, helper_image: impl Into<String>) -> Self {
        Self {
            docker,
            helper_image: helper_image.into(),
        }
    }

    pub fn connect_local(helper_image: impl Into<String>) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::new(Arc::new(docker), helper_image))
    }

    pub fn client(&self) -> Arc<Docker> {
        self.docker.clone()
    }

    pub async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }

    /// Pulls `image` unless it is already present locally.
    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(e) if is_status(&e, 404) => {}
            Err(e) => return Err(ExecutorError::DockerApi(e)),
        }
        info!(%image, "Pulling image");
        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: image.to_string(),
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|source| ExecutorError::PullFailed {
                image: image.to_string(),
                source,
            })?;
        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerHandle>> {
        let inspect = match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(e) if is_status(&e, 404) => return Ok(None),
            Err(e) => return Err(ExecutorError::DockerApi(e)),
        };

        let id = inspect
            .id
            .ok_or_else(|| ExecutorError::Internal(format!("container {name} has no id")))?;
        let labels = inspect
            .config
            .and_then(|c| c.labels)
            .unwrap_or_default()
            .into_iter()
            .collect();
        Ok(Some(ContainerHandle {
            id,
            name: inspect
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_else(|| name.to_string()),
            state: map_state(inspect.state.and_then(|s| s.status)),
            labels,
        }))
    }

    /// Runs `command` in container `id`. Stdout goes to `sink` when given,
    /// otherwise it is collected into the returned output.
    async fn run_exec(
        &self,
        id: &str,
        command: &ExecCommand,
        mut sink: Option<&mut (dyn AsyncWrite + Send + Unpin)>,
    ) -> CommonResult<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(command.cmd.clone()),
                    env: (!command.env.is_empty()).then(|| {
                        command
                            .env
                            .iter()
                            .map(|(k, v)| format!("{k}={v}"))
                            .collect()
                    }),
                    ..Default::default()
                },
            )
            .await
            .map_err(ExecutorError::ExecFailed)?;

        let mut result = ExecOutput::default();
        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(ExecutorError::ExecFailed)?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk.map_err(ExecutorError::ExecFailed)? {
                        LogOutput::StdOut { message } => match sink.as_mut() {
                            Some(sink) => sink.write_all(&message).await?,
                            None => result.stdout.extend_from_slice(&message),
                        },
                        LogOutput::StdErr { message } => result.stderr.extend_from_slice(&message),
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(ExecutorError::Internal("exec unexpectedly detached".to_string()).into());
            }
        }
        if let Some(sink) = sink {
            sink.flush().await?;
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(ExecutorError::ExecFailed)?;
        result.exit_code = inspect.exit_code.unwrap_or(-1);
        Ok(result)
    }

    /// Runs the throwaway seeding container to completion and returns its exit code.
    async fn run_helper(&self, volume: &str, seed: &VolumeSeed) -> Result<i64> {
        self.ensure_image(&self.helper_image).await?;

        let env = seed
            .files
            .iter()
            .enumerate()
            .map(|(idx, f)| format!("SEED_{idx}={}", String::from_utf8_lossy(&f.contents)))
            .collect();
        let config = Config {
            image: Some(self.helper_image.clone()),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), seed_script(seed)]),
            env: Some(env),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{volume}:{SEED_MOUNT}:rw")]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let helper = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(ExecutorError::CreationFailed)?;
        debug!(container_id = %helper.id, %volume, "Seeding helper created");

        let outcome = async {
            self.docker
                .start_container::<String>(&helper.id, None)
                .await
                .map_err(ExecutorError::StartFailed)?;
            let mut wait = self.docker.wait_container(
                &helper.id,
                Some(WaitContainerOptions {
                    condition: "not-running",
                }),
            );
            match wait.next().await {
                Some(Ok(body)) => Ok(body.status_code),
                // bollard reports non-zero exits as an error carrying the code
                Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
                Some(Err(e)) => Err(ExecutorError::DockerApi(e)),
                None => Err(ExecutorError::Internal(
                    "seeding helper wait stream ended unexpectedly".to_string(),
                )),
            }
        }
        .await;

        if let Err(e) = self
            .docker
            .remove_container(
                &helper.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            warn!(container_id = %helper.id, error = %e, "Failed to remove seeding helper");
        }

        outcome
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[instrument(skip(self, spec), fields(container = %spec.name, image = %spec.image))]
    async fn create(&self, spec: &ContainerSpec) -> CommonResult<ContainerHandle> {
        self.ensure_image(&spec.image).await?;

        let memory = spec.limits.memory_bytes()?;
        let host_config = HostConfig {
            binds: Some(
                spec.volumes
                    .iter()
                    .map(|b| {
                        let mode = if b.read_only { "ro" } else { "rw" };
                        format!("{}:{}:{mode}", b.volume, b.target)
                    })
                    .collect(),
            ),
            memory: Some(memory),
            nano_cpus: Some(spec.limits.nano_cpus()),
            dns: (!spec.dns.is_empty()).then(|| spec.dns.clone()),
            network_mode: spec.network.clone(),
            restart_policy: spec.restart_unless_stopped.then(|| RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
            labels: Some(to_hash_map(&spec.labels)),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .map_err(ExecutorError::CreationFailed)?;
        info!(container_id = %created.id, "Container created.");

        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .map_err(ExecutorError::StartFailed)?;

        let handle = self.inspect(&created.id).await?.ok_or_else(|| {
            ExecutorError::Internal(format!("container {} vanished after start", spec.name))
        })?;
        info!(container_id = %handle.short_id(), state = handle.state.as_str(), "Container started.");
        Ok(handle)
    }

    async fn get(&self, name: &str) -> CommonResult<Option<ContainerHandle>> {
        Ok(self.inspect(name).await?)
    }

    #[instrument(skip(self))]
    async fn stop(&self, id: &str, grace: Duration) -> CommonResult<()> {
        match self
            .docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(e) if is_status(&e, 304) => Ok(()),
            Err(e) if is_status(&e, 404) => {
                Err(DeaconError::NotFound(format!("container {id}")))
            }
            Err(e) => Err(ExecutorError::DockerApi(e).into()),
        }
    }

    #[instrument(skip(self))]
    async fn remove(&self, id: &str, force: bool) -> CommonResult<()> {
        match self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(ExecutorError::DockerApi(e).into()),
        }
    }

    #[instrument(skip(self, command), fields(cmd = ?command.cmd))]
    async fn exec(&self, id: &str, command: &ExecCommand) -> CommonResult<ExecOutput> {
        self.run_exec(id, command, None).await
    }

    #[instrument(skip(self, command, sink), fields(cmd = ?command.cmd))]
    async fn exec_streaming(
        &self,
        id: &str,
        command: &ExecCommand,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> CommonResult<ExecOutput> {
        self.run_exec(id, command, Some(sink)).await
    }

    async fn list(&self, filter: &ContainerFilter) -> CommonResult<Vec<ContainerHandle>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert(
            "label".to_string(),
            filter
                .labels
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect(),
        );

        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(ExecutorError::DockerApi)?;

        Ok(summaries
            .into_iter()
            .filter_map(|s| {
                let id = s.id?;
                let name = s
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| id.clone());
                Some(ContainerHandle {
                    id,
                    name,
                    state: s
                        .state
                        .as_deref()
                        .map(ContainerState::parse)
                        .unwrap_or(ContainerState::Unknown),
                    labels: s.labels.unwrap_or_default().into_iter().collect(),
                })
            })
            .collect())
    }
}

#[async_trait]
impl VolumeStore for DockerRuntime {
    #[instrument(skip(self, labels))]
    async fn ensure(&self, name: &str, labels: &BTreeMap<String, String>) -> CommonResult<()> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => {
                debug!(volume = %name, "Volume already exists");
                return Ok(());
            }
            Err(e) if is_status(&e, 404) => {}
            Err(e) => return Err(ExecutorError::VolumeFailed(e).into()),
        }

        self.docker
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                driver: "local".to_string(),
                labels: to_hash_map(labels),
                ..Default::default()
            })
            .await
            .map_err(ExecutorError::VolumeFailed)?;
        info!(volume = %name, "Created volume");
        Ok(())
    }

    #[instrument(skip(self, seed), fields(probe = %seed.probe))]
    async fn initialize_if_absent(&self, name: &str, seed: &VolumeSeed) -> CommonResult<SeedOutcome> {
        match self.run_helper(name, seed).await? {
            0 => {
                info!(volume = %name, "Seeded volume");
                Ok(SeedOutcome::Seeded)
            }
            SEED_PRESENT_EXIT => Ok(SeedOutcome::AlreadyPresent),
            code => Err(DeaconError::Runtime(format!(
                "seeding helper for volume {name} exited with code {code}"
            ))),
        }
    }
}
