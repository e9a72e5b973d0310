use std::{path::PathBuf, time::Duration};

use crate::notify::NotifierKind;

const DEFAULT_REGISTRY_PATH: &str = "config/server.json";
const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_LAUNCH_GRACE_MS: u64 = 2000;
const DEFAULT_STOP_TIMEOUT_SEC: u64 = 10;
const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn registry_path() -> PathBuf {
    env_string("HEARTH_REGISTRY_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_REGISTRY_PATH))
}

pub fn log_dir() -> PathBuf {
    env_string("HEARTH_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR))
}

pub fn launch_grace() -> Duration {
    Duration::from_millis(
        env_u64("HEARTH_LAUNCH_GRACE_MS")
            .map(|v| v.clamp(100, 60_000))
            .unwrap_or(DEFAULT_LAUNCH_GRACE_MS),
    )
}

pub fn stop_timeout() -> Duration {
    Duration::from_secs(
        env_u64("HEARTH_STOP_TIMEOUT_SEC")
            .map(|v| v.clamp(1, 300))
            .unwrap_or(DEFAULT_STOP_TIMEOUT_SEC),
    )
}

pub fn poll_interval() -> Duration {
    Duration::from_millis(
        env_u64("HEARTH_POLL_INTERVAL_MS")
            .map(|v| v.clamp(50, 10 * 60 * 1000))
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
    )
}

pub fn notifier_kind() -> NotifierKind {
    match env_string("HEARTH_NOTIFIER") {
        None => NotifierKind::Log,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(value = %raw, "unknown HEARTH_NOTIFIER, falling back to log");
            NotifierKind::Log
        }),
    }
}

/// Tunables for [`crate::process_manager::ServerManager`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub registry_path: PathBuf,
    /// How long a freshly spawned start script must survive before it counts as launched.
    pub launch_grace: Duration,
    /// Graceful termination window before `stop` escalates to a forced kill.
    pub stop_timeout: Duration,
    pub poll_interval: Duration,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            registry_path: registry_path(),
            launch_grace: launch_grace(),
            stop_timeout: stop_timeout(),
            poll_interval: poll_interval(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            registry_path: PathBuf::from(DEFAULT_REGISTRY_PATH),
            launch_grace: Duration::from_millis(DEFAULT_LAUNCH_GRACE_MS),
            stop_timeout: Duration::from_secs(DEFAULT_STOP_TIMEOUT_SEC),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}
