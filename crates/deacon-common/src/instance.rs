use crate::{DeaconError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix shared by every container and volume this daemon creates.
pub const NAME_PREFIX: &str = "openclaw";

pub const DEFAULT_MEM_LIMIT: &str = "4g";
pub const DEFAULT_CPU_LIMIT: f64 = 2.0;

const MAX_NAME_LEN: usize = 63;

/// Container handle for an instance. Pure and injective over valid instance names.
pub fn container_name_for(name: &str) -> String {
    format!("{NAME_PREFIX}-{name}")
}

pub fn config_volume_for(name: &str) -> String {
    format!("{NAME_PREFIX}-{name}-config")
}

pub fn data_volume_for(name: &str) -> String {
    format!("{NAME_PREFIX}-{name}-data")
}

/// Rejects names that would not produce a valid, unambiguous Docker object name.
pub fn validate_instance_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DeaconError::Validation("name must not be empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(DeaconError::Validation(format!(
            "name must be at most {MAX_NAME_LEN} characters"
        )));
    }
    let mut chars = name.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_alphanumeric()) {
        return Err(DeaconError::Validation(
            "name must start with a letter or digit".to_string(),
        ));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')) {
        return Err(DeaconError::Validation(format!(
            "name {name:?} may only contain letters, digits, '_', '.' and '-'"
        )));
    }
    Ok(())
}

/// Last *intended* state of an instance. Only lifecycle operations change it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Running,
    Stopped,
    Destroyed,
}

/// Memory ceiling and CPU share captured when the instance is launched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub mem_limit: String,
    pub cpu_limit: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            mem_limit: DEFAULT_MEM_LIMIT.to_string(),
            cpu_limit: DEFAULT_CPU_LIMIT,
        }
    }
}

impl ResourceLimits {
    pub fn new(mem_limit: impl Into<String>, cpu_limit: f64) -> Result<Self> {
        let limits = Self {
            mem_limit: mem_limit.into(),
            cpu_limit,
        };
        limits.validate()?;
        Ok(limits)
    }

    pub fn validate(&self) -> Result<()> {
        parse_memory_limit(&self.mem_limit)?;
        if !self.cpu_limit.is_finite() || self.cpu_limit <= 0.0 {
            return Err(DeaconError::Validation(format!(
                "cpuLimit must be a positive number, got {}",
                self.cpu_limit
            )));
        }
        Ok(())
    }

    pub fn memory_bytes(&self) -> Result<i64> {
        parse_memory_limit(&self.mem_limit)
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_limit * 1e9) as i64
    }
}

/// Parses docker-style memory sizes: `4g`, `512m`, `1024k`, `2048` (bytes).
pub fn parse_memory_limit(raw: &str) -> Result<i64> {
    let trimmed = raw.trim().to_ascii_lowercase();
    let invalid = || DeaconError::Validation(format!("invalid memory limit {raw:?}"));
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k') => (&trimmed[..trimmed.len() - 1], 1024_i64),
        Some('m') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        Some('b') => (&trimmed[..trimmed.len() - 1], 1),
        Some(c) if c.is_ascii_digit() => (trimmed.as_str(), 1),
        _ => return Err(invalid()),
    };
    let value: i64 = digits.parse().map_err(|_| invalid())?;
    if value <= 0 {
        return Err(invalid());
    }
    value.checked_mul(multiplier).ok_or_else(invalid)
}

/// One record per logical instance, keyed by `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub name: String,
    pub container_name: String,
    pub container_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: InstanceStatus,
    #[serde(flatten)]
    pub resource_limits: ResourceLimits,
    /// Names of the secret variables injected at launch. Values are never persisted.
    #[serde(default)]
    pub secret_env_keys: Vec<String>,
}

/// Live status of a container, as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerState {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Status observed at read time. Absence is distinct from any container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ObservedStatus {
    Live(ContainerState),
    NotFound,
}

impl fmt::Display for ObservedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObservedStatus::Live(state) => f.write_str(state.as_str()),
            ObservedStatus::NotFound => f.write_str("not_found"),
        }
    }
}

impl FromStr for ObservedStatus {
    type Err = DeaconError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "not_found" => Ok(ObservedStatus::NotFound),
            other => match ContainerState::parse(other) {
                ContainerState::Unknown if other != "unknown" => Err(DeaconError::Validation(
                    format!("unknown observed status {other:?}"),
                )),
                state => Ok(ObservedStatus::Live(state)),
            },
        }
    }
}

impl From<ObservedStatus> for String {
    fn from(status: ObservedStatus) -> Self {
        status.to_string()
    }
}

impl TryFrom<String> for ObservedStatus {
    type Error = DeaconError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// A stored record annotated with the status observed in the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotatedRecord {
    #[serde(flatten)]
    pub record: InstanceRecord,
    pub live_status: ObservedStatus,
}
