use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::error::MonitorError;

/// Which counter source feeds the rate collector. Chosen once at startup.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    #[default]
    Kernel,
    Capture,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub mode: SourceMode,
    pub device: Option<String>,
    pub promiscuous: bool,
    pub snaplen: i32,
    pub local_nets: Vec<String>,
    pub vpn_status_files: HashMap<String, PathBuf>,
    pub poll_interval: Duration,
    pub bucket_interval: Duration,
    pub history_max_age: Duration,
    pub history_max_points: usize,
    pub talker_window: Duration,
    pub resolve_hostnames: bool,
    pub count_internal_traffic: bool,
    pub sysfs_root: PathBuf,
    pub proc_net_dev: PathBuf,
    pub log_dir: String,
    pub summary_interval: Duration,
    /// Settings that fell back to defaults while loading. Logging is not up
    /// yet at that point, so they are replayed by [`MonitorConfig::log_fallbacks`].
    pub fallbacks: Vec<String>,
}

// Partial config for layering
#[derive(Deserialize, Default, Debug)]
struct PartialMonitorConfig {
    mode: Option<SourceMode>,
    device: Option<String>,
    promiscuous: Option<bool>,
    snaplen: Option<i32>,
    local_nets: Option<Vec<String>>,
    vpn_status_files: Option<String>,
    poll_interval_secs: Option<u64>,
    bucket_interval_secs: Option<u64>,
    history_max_age_secs: Option<u64>,
    history_max_points: Option<usize>,
    talker_window_secs: Option<u64>,
    resolve_hostnames: Option<bool>,
    count_internal_traffic: Option<bool>,
    sysfs_root: Option<PathBuf>,
    proc_net_dev: Option<PathBuf>,
    log_dir: Option<String>,
    summary_interval_secs: Option<u64>,
}

const DEFAULT_POLL_INTERVAL_SECS: u64 = 1;
const DEFAULT_BUCKET_INTERVAL_SECS: u64 = 60;
const DEFAULT_RETENTION_SECS: u64 = 24 * 60 * 60;
const DEFAULT_HISTORY_MAX_POINTS: usize = 86_400;
const DEFAULT_SNAPLEN: i32 = 128;
const DEFAULT_SUMMARY_INTERVAL_SECS: u64 = 10;

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            mode: SourceMode::Kernel,
            device: None,
            promiscuous: true,
            snaplen: DEFAULT_SNAPLEN,
            local_nets: Vec::new(),
            vpn_status_files: HashMap::new(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            bucket_interval: Duration::from_secs(DEFAULT_BUCKET_INTERVAL_SECS),
            history_max_age: Duration::from_secs(DEFAULT_RETENTION_SECS),
            history_max_points: DEFAULT_HISTORY_MAX_POINTS,
            talker_window: Duration::from_secs(DEFAULT_RETENTION_SECS),
            resolve_hostnames: true,
            count_internal_traffic: false,
            sysfs_root: PathBuf::from("/sys/class/net"),
            proc_net_dev: PathBuf::from("/proc/net/dev"),
            log_dir: "logs".to_string(),
            summary_interval: Duration::from_secs(DEFAULT_SUMMARY_INTERVAL_SECS),
            fallbacks: Vec::new(),
        }
    }
}

impl MonitorConfig {
    /// Loads the configuration: optional TOML file first, then environment variables
    /// override whatever the file set.
    pub fn load(config_path: Option<&str>) -> Result<Self, MonitorError> {
        dotenv::dotenv().ok();

        let mut missing_file = None;
        // 1. Load from file (optional)
        let file_contents = match config_path {
            Some(path_str) if Path::new(path_str).exists() => {
                Some(fs::read_to_string(path_str).map_err(|e| {
                    MonitorError::Config(format!("Failed to read config file at {path_str}: {e}"))
                })?)
            }
            Some(path_str) => {
                missing_file = Some(format!(
                    "Config file {path_str} not found, using environment and defaults."
                ));
                None
            }
            None => None,
        };

        let mut config = Self::from_sources(file_contents.as_deref(), std::env::vars())?;
        if let Some(message) = missing_file {
            config.fallbacks.insert(0, message);
        }
        Ok(config)
    }

    /// Emits one warning per recorded fallback. Call after the subscriber is installed.
    pub fn log_fallbacks(&self) {
        for message in &self.fallbacks {
            warn!("{message}");
        }
    }

    /// Builds a config from TOML text and an environment iterator. Split out of
    /// [`MonitorConfig::load`] so layering can be exercised without touching the process env.
    pub fn from_sources<I>(file_contents: Option<&str>, env: I) -> Result<Self, MonitorError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let file_config: PartialMonitorConfig = match file_contents {
            Some(contents) => toml::from_str(contents)
                .map_err(|e| MonitorError::Config(format!("Failed to parse TOML config: {e}")))?,
            None => PartialMonitorConfig::default(),
        };

        // Only keys this config knows about; envy would otherwise choke on unrelated
        // variables whose names collide with ours but hold foreign formats.
        let env_config: PartialMonitorConfig = envy::from_iter(env.into_iter().filter(|(k, _)| {
            ENV_KEYS.contains(&k.as_str())
        }))
        .map_err(|e| MonitorError::Config(format!("Failed to load config from environment: {e}")))?;

        let defaults = MonitorConfig::default();
        let mut fallbacks = Vec::new();

        // Merge: environment overrides file
        let vpn_status_files = match env_config.vpn_status_files.or(file_config.vpn_status_files) {
            Some(raw) => parse_vpn_status_files(&raw)?,
            None => HashMap::new(),
        };

        Ok(MonitorConfig {
            mode: env_config.mode.or(file_config.mode).unwrap_or(defaults.mode),
            device: env_config
                .device
                .or(file_config.device)
                .filter(|d| !d.trim().is_empty()),
            promiscuous: env_config
                .promiscuous
                .or(file_config.promiscuous)
                .unwrap_or(defaults.promiscuous),
            snaplen: env_config
                .snaplen
                .or(file_config.snaplen)
                .filter(|s| *s > 0)
                .unwrap_or(defaults.snaplen),
            local_nets: env_config
                .local_nets
                .or(file_config.local_nets)
                .unwrap_or_default()
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            vpn_status_files,
            poll_interval: secs_or_default(
                "poll_interval_secs",
                env_config.poll_interval_secs.or(file_config.poll_interval_secs),
                DEFAULT_POLL_INTERVAL_SECS,
                &mut fallbacks,
            ),
            bucket_interval: secs_or_default(
                "bucket_interval_secs",
                env_config.bucket_interval_secs.or(file_config.bucket_interval_secs),
                DEFAULT_BUCKET_INTERVAL_SECS,
                &mut fallbacks,
            ),
            history_max_age: secs_or_default(
                "history_max_age_secs",
                env_config.history_max_age_secs.or(file_config.history_max_age_secs),
                DEFAULT_RETENTION_SECS,
                &mut fallbacks,
            ),
            history_max_points: match env_config
                .history_max_points
                .or(file_config.history_max_points)
            {
                Some(0) => {
                    fallbacks.push(format!(
                        "history_max_points is 0, falling back to {DEFAULT_HISTORY_MAX_POINTS}."
                    ));
                    DEFAULT_HISTORY_MAX_POINTS
                }
                Some(n) => n,
                None => DEFAULT_HISTORY_MAX_POINTS,
            },
            talker_window: secs_or_default(
                "talker_window_secs",
                env_config.talker_window_secs.or(file_config.talker_window_secs),
                DEFAULT_RETENTION_SECS,
                &mut fallbacks,
            ),
            resolve_hostnames: env_config
                .resolve_hostnames
                .or(file_config.resolve_hostnames)
                .unwrap_or(defaults.resolve_hostnames),
            count_internal_traffic: env_config
                .count_internal_traffic
                .or(file_config.count_internal_traffic)
                .unwrap_or(defaults.count_internal_traffic),
            sysfs_root: env_config
                .sysfs_root
                .or(file_config.sysfs_root)
                .unwrap_or(defaults.sysfs_root),
            proc_net_dev: env_config
                .proc_net_dev
                .or(file_config.proc_net_dev)
                .unwrap_or(defaults.proc_net_dev),
            log_dir: env_config
                .log_dir
                .or(file_config.log_dir)
                .unwrap_or(defaults.log_dir),
            summary_interval: secs_or_default(
                "summary_interval_secs",
                env_config.summary_interval_secs.or(file_config.summary_interval_secs),
                DEFAULT_SUMMARY_INTERVAL_SECS,
                &mut fallbacks,
            ),
            fallbacks,
        })
    }
}

const ENV_KEYS: &[&str] = &[
    "MODE",
    "DEVICE",
    "PROMISCUOUS",
    "SNAPLEN",
    "LOCAL_NETS",
    "VPN_STATUS_FILES",
    "POLL_INTERVAL_SECS",
    "BUCKET_INTERVAL_SECS",
    "HISTORY_MAX_AGE_SECS",
    "HISTORY_MAX_POINTS",
    "TALKER_WINDOW_SECS",
    "RESOLVE_HOSTNAMES",
    "COUNT_INTERNAL_TRAFFIC",
    "SYSFS_ROOT",
    "PROC_NET_DEV",
    "LOG_DIR",
    "SUMMARY_INTERVAL_SECS",
];

fn secs_or_default(
    key: &str,
    value: Option<u64>,
    default_secs: u64,
    fallbacks: &mut Vec<String>,
) -> Duration {
    match value {
        Some(0) => {
            fallbacks.push(format!("{key} is 0, falling back to {default_secs}s."));
            Duration::from_secs(default_secs)
        }
        Some(secs) => Duration::from_secs(secs),
        None => Duration::from_secs(default_secs),
    }
}

/// Parses `iface=path,iface2=path2`.
fn parse_vpn_status_files(raw: &str) -> Result<HashMap<String, PathBuf>, MonitorError> {
    let mut files = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (iface, path) = entry.split_once('=').ok_or_else(|| {
            MonitorError::Config(format!(
                "Invalid VPN_STATUS_FILES entry {entry:?}, expected iface=path"
            ))
        })?;
        let (iface, path) = (iface.trim(), path.trim());
        if iface.is_empty() || path.is_empty() {
            return Err(MonitorError::Config(format!(
                "Invalid VPN_STATUS_FILES entry {entry:?}, expected iface=path"
            )));
        }
        files.insert(iface.to_string(), PathBuf::from(path));
    }
    Ok(files)
}
