//! In-memory container runtime that simulates the Docker behaviours the
//! lifecycle core relies on, with call recording and fault injection.

use async_trait::async_trait;
use deacon_common::{
    ContainerFilter, ContainerHandle, ContainerRuntime, ContainerSpec, ContainerState,
    DeaconError, ExecCommand, ExecOutput, Result, SeedOutcome, VolumeSeed, VolumeStore,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeCall {
    Create(String),
    Get(String),
    Stop { id: String, grace: Duration },
    Remove { id: String, force: bool },
    Exec { id: String, cmd: Vec<String> },
    List,
    EnsureVolume(String),
    InitializeVolume(String),
}

impl RuntimeCall {
    /// Calls that change runtime state.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, RuntimeCall::Get(_) | RuntimeCall::List)
    }
}

#[derive(Debug, Clone)]
pub enum ExecBehavior {
    Output(ExecOutput),
    ExitCode(i64),
    Error(String),
    /// Never completes, like a wedged process inside the container.
    Hang,
}

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub handle: ContainerHandle,
    pub spec: Option<ContainerSpec>,
}

#[derive(Default)]
struct MockState {
    /// Keyed by container name.
    containers: BTreeMap<String, MockContainer>,
    /// Volume name -> relative path -> contents. Directories end with '/'.
    volumes: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    calls: Vec<RuntimeCall>,
    exec_behavior: HashMap<String, ExecBehavior>,
    program_behavior: HashMap<(String, String), ExecBehavior>,
    create_failure: Option<String>,
    create_delay: Option<Duration>,
}

impl MockState {
    fn find_by_id_mut(&mut self, id: &str) -> Option<&mut MockContainer> {
        self.containers
            .values_mut()
            .find(|c| c.handle.id == id || c.handle.name == id)
    }
}

#[derive(Clone, Default)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the exec call and picks the configured behaviour, releasing the lock.
    async fn resolve_exec(
        &self,
        id: &str,
        command: &ExecCommand,
    ) -> Result<(String, Option<ExecBehavior>)> {
        let mut state = self.state.lock().await;
        state.calls.push(RuntimeCall::Exec {
            id: id.to_string(),
            cmd: command.cmd.clone(),
        });
        let Some(container) = state.find_by_id_mut(id) else {
            return Err(DeaconError::Runtime(format!("No such container: {id}")));
        };
        if !container.handle.is_running() {
            return Err(DeaconError::Runtime(format!(
                "Container {} is not running",
                container.handle.name
            )));
        }
        let name = container.handle.name.clone();
        let program = command.cmd.first().cloned().unwrap_or_default();
        let behavior = state
            .program_behavior
            .get(&(name.clone(), program))
            .or_else(|| state.exec_behavior.get(&name))
            .cloned();
        Ok((name, behavior))
    }

    /// Adds a container as if it had been created outside the daemon.
    pub async fn insert_container(
        &self,
        name: &str,
        state: ContainerState,
        labels: BTreeMap<String, String>,
    ) -> ContainerHandle {
        let handle = ContainerHandle {
            id: Uuid::new_v4().simple().to_string(),
            name: name.to_string(),
            state,
            labels,
        };
        self.state.lock().await.containers.insert(
            name.to_string(),
            MockContainer {
                handle: handle.clone(),
                spec: None,
            },
        );
        handle
    }

    /// Simulates a crash or out-of-band state change.
    pub async fn set_state(&self, name: &str, state: ContainerState) {
        if let Some(container) = self.state.lock().await.containers.get_mut(name) {
            container.handle.state = state;
        }
    }

    /// Simulates a manual `docker rm`.
    pub async fn remove_out_of_band(&self, name: &str) {
        self.state.lock().await.containers.remove(name);
    }

    pub async fn set_exec_behavior(&self, container_name: &str, behavior: ExecBehavior) {
        self.state
            .lock()
            .await
            .exec_behavior
            .insert(container_name.to_string(), behavior);
    }

    /// Overrides exec results for one program (first argv element) in one container.
    pub async fn set_program_behavior(
        &self,
        container_name: &str,
        program: &str,
        behavior: ExecBehavior,
    ) {
        self.state
            .lock()
            .await
            .program_behavior
            .insert((container_name.to_string(), program.to_string()), behavior);
    }

    pub async fn fail_next_create(&self, message: &str) {
        self.state.lock().await.create_failure = Some(message.to_string());
    }

    /// Makes every create call sleep first, widening race windows in tests.
    pub async fn set_create_delay(&self, delay: Duration) {
        self.state.lock().await.create_delay = Some(delay);
    }

    pub async fn seed_volume_file(&self, volume: &str, path: &str, contents: &[u8]) {
        self.state
            .lock()
            .await
            .volumes
            .entry(volume.to_string())
            .or_default()
            .insert(path.to_string(), contents.to_vec());
    }

    pub async fn calls(&self) -> Vec<RuntimeCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    pub async fn create_count(&self) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| matches!(c, RuntimeCall::Create(_)))
            .count()
    }

    pub async fn container(&self, name: &str) -> Option<MockContainer> {
        self.state.lock().await.containers.get(name).cloned()
    }

    pub async fn container_count(&self) -> usize {
        self.state.lock().await.containers.len()
    }

    pub async fn volume_exists(&self, volume: &str) -> bool {
        self.state.lock().await.volumes.contains_key(volume)
    }

    pub async fn volume_file(&self, volume: &str, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .await
            .volumes
            .get(volume)
            .and_then(|files| files.get(path).cloned())
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let delay = {
            let mut state = self.state.lock().await;
            state.calls.push(RuntimeCall::Create(spec.name.clone()));
            if let Some(message) = state.create_failure.take() {
                return Err(DeaconError::Runtime(message));
            }
            state.create_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if state.containers.contains_key(&spec.name) {
            return Err(DeaconError::Runtime(format!(
                "Conflict. The container name \"/{}\" is already in use",
                spec.name
            )));
        }
        for binding in &spec.volumes {
            state.volumes.entry(binding.volume.clone()).or_default();
        }
        let handle = ContainerHandle {
            id: Uuid::new_v4().simple().to_string(),
            name: spec.name.clone(),
            state: ContainerState::Running,
            labels: spec.labels.clone(),
        };
        state.containers.insert(
            spec.name.clone(),
            MockContainer {
                handle: handle.clone(),
                spec: Some(spec.clone()),
            },
        );
        Ok(handle)
    }

    async fn get(&self, name: &str) -> Result<Option<ContainerHandle>> {
        let mut state = self.state.lock().await;
        state.calls.push(RuntimeCall::Get(name.to_string()));
        Ok(state.find_by_id_mut(name).map(|c| c.handle.clone()))
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(RuntimeCall::Stop {
            id: id.to_string(),
            grace,
        });
        match state.find_by_id_mut(id) {
            Some(container) => {
                container.handle.state = ContainerState::Exited;
                Ok(())
            }
            None => Err(DeaconError::NotFound(format!("container {id}"))),
        }
    }

    async fn remove(&self, id: &str, force: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(RuntimeCall::Remove {
            id: id.to_string(),
            force,
        });
        let Some(name) = state.find_by_id_mut(id).map(|c| c.handle.name.clone()) else {
            return Ok(());
        };
        let running = state
            .containers
            .get(&name)
            .is_some_and(|c| c.handle.is_running());
        if running && !force {
            return Err(DeaconError::Runtime(format!(
                "cannot remove running container {name} without force"
            )));
        }
        state.containers.remove(&name);
        Ok(())
    }

    async fn exec(&self, id: &str, command: &ExecCommand) -> Result<ExecOutput> {
        let (name, behavior) = self.resolve_exec(id, command).await?;
        match behavior {
            None => Ok(ExecOutput {
                exit_code: 0,
                stdout: format!("{name}: ok").into_bytes(),
                stderr: Vec::new(),
            }),
            Some(ExecBehavior::Output(output)) => Ok(output),
            Some(ExecBehavior::ExitCode(code)) => Ok(ExecOutput {
                exit_code: code,
                stdout: Vec::new(),
                stderr: format!("exit {code}").into_bytes(),
            }),
            Some(ExecBehavior::Error(message)) => Err(DeaconError::Runtime(message)),
            Some(ExecBehavior::Hang) => std::future::pending().await,
        }
    }

    async fn exec_streaming(
        &self,
        id: &str,
        command: &ExecCommand,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<ExecOutput> {
        let mut output = self.exec(id, command).await?;
        sink.write_all(&output.stdout).await?;
        sink.flush().await?;
        output.stdout.clear();
        Ok(output)
    }

    async fn list(&self, filter: &ContainerFilter) -> Result<Vec<ContainerHandle>> {
        let mut state = self.state.lock().await;
        state.calls.push(RuntimeCall::List);
        Ok(state
            .containers
            .values()
            .filter(|c| filter.matches(&c.handle.labels))
            .map(|c| c.handle.clone())
            .collect())
    }
}

#[async_trait]
impl VolumeStore for MockRuntime {
    async fn ensure(&self, name: &str, _labels: &BTreeMap<String, String>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(RuntimeCall::EnsureVolume(name.to_string()));
        state.volumes.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn initialize_if_absent(&self, name: &str, seed: &VolumeSeed) -> Result<SeedOutcome> {
        let mut state = self.state.lock().await;
        state
            .calls
            .push(RuntimeCall::InitializeVolume(name.to_string()));
        let files = state
            .volumes
            .get_mut(name)
            .ok_or_else(|| DeaconError::NotFound(format!("volume {name}")))?;
        if files.contains_key(&seed.probe) {
            return Ok(SeedOutcome::AlreadyPresent);
        }
        for dir in &seed.directories {
            files.insert(format!("{dir}/"), Vec::new());
        }
        for file in &seed.files {
            files.insert(file.path.clone(), file.contents.clone());
        }
        Ok(SeedOutcome::Seeded)
    }
}
