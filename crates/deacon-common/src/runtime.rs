//! Capabilities the lifecycle core needs from a container engine.

use crate::{ContainerState, ResourceLimits, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::AsyncWrite;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeBinding {
    pub volume: String,
    pub target: String,
    pub read_only: bool,
}

impl VolumeBinding {
    pub fn rw(volume: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            volume: volume.into(),
            target: target.into(),
            read_only: false,
        }
    }
}

/// Everything needed to create and start one long-running container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<VolumeBinding>,
    pub network: Option<String>,
    pub dns: Vec<String>,
    pub limits: ResourceLimits,
    pub labels: BTreeMap<String, String>,
    pub restart_unless_stopped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub labels: BTreeMap<String, String>,
}

impl ContainerHandle {
    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }
}

/// Label equality filter used to discover the managed fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerFilter {
    pub labels: Vec<(String, String)>,
}

impl ContainerFilter {
    pub fn label(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            labels: vec![(key.into(), value.into())],
        }
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCommand {
    pub cmd: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ExecCommand {
    pub fn new<I, S>(cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cmd: cmd.into_iter().map(Into::into).collect(),
            env: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Combined output, lossily decoded, for log lines.
    pub fn output_lossy(&self) -> String {
        let mut out = String::from_utf8_lossy(&self.stdout).into_owned();
        out.push_str(&String::from_utf8_lossy(&self.stderr));
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedFile {
    /// Path relative to the volume root.
    pub path: String,
    pub contents: Vec<u8>,
}

/// Initial content for a volume, written only if `probe` is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSeed {
    pub probe: String,
    pub directories: Vec<String>,
    pub files: Vec<SeedFile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedOutcome {
    Seeded,
    AlreadyPresent,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates and starts a container.
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;

    /// Looks up a container by name. `Ok(None)` when it does not exist.
    async fn get(&self, name: &str) -> Result<Option<ContainerHandle>>;

    async fn stop(&self, id: &str, grace: Duration) -> Result<()>;

    async fn remove(&self, id: &str, force: bool) -> Result<()>;

    async fn exec(&self, id: &str, command: &ExecCommand) -> Result<ExecOutput>;

    /// Like `exec`, but stdout is written to `sink` as it arrives instead of
    /// being buffered. The returned output has an empty `stdout`.
    async fn exec_streaming(
        &self,
        id: &str,
        command: &ExecCommand,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<ExecOutput>;

    /// Lists containers in any state that match `filter`.
    async fn list(&self, filter: &ContainerFilter) -> Result<Vec<ContainerHandle>>;
}

/// Persistent named volumes. Nothing in the daemon deletes them.
#[async_trait]
pub trait VolumeStore: Send + Sync {
    /// Creates the volume unless it already exists.
    async fn ensure(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()>;

    /// Writes `seed` into the volume when its probe file is missing.
    ///
    /// Probe and write happen in one step, but nothing stops another process
    /// seeding the same volume between them. Callers serialize per instance.
    async fn initialize_if_absent(&self, name: &str, seed: &VolumeSeed) -> Result<SeedOutcome>;
}
