use deacon_common::{DeaconError, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Runtime configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct DeaconConfig {
    pub image: String,
    pub network: String,
    pub helper_image: String,
    pub state_file: PathBuf,
    pub api_addr: SocketAddr,
    pub health_check_interval: Duration,
    pub upgrade_interval: Duration,
    pub backup_interval: Duration,
    pub backup_dir: PathBuf,
    pub backup_retention: Duration,
    pub alert_webhook_url: Option<String>,
    pub alert_history_limit: usize,
    pub stop_grace: Duration,
    pub shutdown_grace: Duration,
    /// Upper bound on one in-container command during a maintenance sweep.
    pub exec_timeout: Duration,
}

impl Default for DeaconConfig {
    fn default() -> Self {
        Self {
            image: "openclaw-launcher/instance:latest".to_string(),
            network: "openclaw-launcher_openclaw-isolated".to_string(),
            helper_image: "ubuntu:24.04".to_string(),
            state_file: PathBuf::from("/var/lib/deacon/instances.json"),
            api_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            health_check_interval: Duration::from_secs(300),
            upgrade_interval: Duration::from_secs(SECS_PER_DAY),
            backup_interval: Duration::from_secs(SECS_PER_DAY),
            backup_dir: PathBuf::from("/var/lib/deacon/backups"),
            backup_retention: Duration::from_secs(7 * SECS_PER_DAY),
            alert_webhook_url: None,
            alert_history_limit: 256,
            stop_grace: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
            exec_timeout: Duration::from_secs(600),
        }
    }
}

impl DeaconConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable source; unset keys keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backup_retention = match get("BACKUP_RETENTION_DAYS") {
            Some(raw) => parse::<u64>("BACKUP_RETENTION_DAYS", &raw)?
                .checked_mul(SECS_PER_DAY)
                .map(Duration::from_secs)
                .ok_or_else(|| DeaconError::Config(format!("BACKUP_RETENTION_DAYS out of range: {raw}")))?,
            None => defaults.backup_retention,
        };

        Ok(Self {
            image: get("OPENCLAW_IMAGE").unwrap_or(defaults.image),
            network: get("OPENCLAW_NETWORK").unwrap_or(defaults.network),
            helper_image: get("DEACON_HELPER_IMAGE").unwrap_or(defaults.helper_image),
            state_file: get("DEACON_STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_file),
            api_addr: match get("DEACON_API_ADDR") {
                Some(raw) => parse("DEACON_API_ADDR", &raw)?,
                None => defaults.api_addr,
            },
            health_check_interval: secs(&get, "HEALTH_CHECK_INTERVAL", defaults.health_check_interval)?,
            upgrade_interval: secs(&get, "UPGRADE_INTERVAL", defaults.upgrade_interval)?,
            backup_interval: secs(&get, "BACKUP_INTERVAL", defaults.backup_interval)?,
            backup_dir: get("BACKUP_DIR").map(PathBuf::from).unwrap_or(defaults.backup_dir),
            backup_retention,
            alert_webhook_url: get("ALERT_WEBHOOK_URL"),
            alert_history_limit: match get("ALERT_HISTORY_LIMIT") {
                Some(raw) => parse("ALERT_HISTORY_LIMIT", &raw)?,
                None => defaults.alert_history_limit,
            },
            stop_grace: secs(&get, "DEACON_STOP_GRACE_SECS", defaults.stop_grace)?,
            shutdown_grace: secs(&get, "DEACON_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace)?,
            exec_timeout: secs(&get, "DEACON_EXEC_TIMEOUT_SECS", defaults.exec_timeout)?,
        })
    }
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| DeaconError::Config(format!("{key}: cannot parse {raw:?}")))
}

fn secs<G>(get: &G, key: &str, default: Duration) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => {
            let secs: u64 = parse(key, &raw)?;
            if secs == 0 {
                return Err(DeaconError::Config(format!("{key} must be greater than zero")));
            }
            Ok(Duration::from_secs(secs))
        }
        None => Ok(default),
    }
}
