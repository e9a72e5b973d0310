use std::{fmt, path::PathBuf, str::FromStr};

use chrono::{DateTime, Utc};

pub mod folder;
mod timestamp;

pub use folder::{
    CorePolicy, FolderInfo, FormatError, KNOWN_CORES, parse_folder_name, parse_folder_name_with,
};

/// Placeholder for metadata that could not be parsed from the folder name.
pub const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    #[default]
    Stopped,
    Running,
}

/// `(name, version)` pair used to address a registered server.
///
/// Textual form is `NAME_VERSION`. Names may contain underscores, so the
/// version is everything after the last one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerKey {
    pub name: String,
    pub version: String,
}

impl ServerKey {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.name, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid server key '{0}', expected NAME_VERSION (e.g. skywind_1.21.4)")]
pub struct KeyError(pub String);

impl FromStr for ServerKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.rsplit_once('_') {
            Some((name, version)) if !name.is_empty() && !version.is_empty() => {
                Ok(Self::new(name, version))
            }
            _ => Err(KeyError(s.to_string())),
        }
    }
}

/// Persisted metadata and status of one managed server.
///
/// Missing fields fall back to [`Default`] on read so older or hand-edited
/// registry files stay loadable.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ServerRecord {
    pub path: PathBuf,
    pub name: String,
    pub version: String,
    pub port: u32,
    pub core_type: String,
    pub description: Option<String>,
    pub status: ServerStatus,
    pub pid: Option<u32>,
    #[serde(with = "timestamp")]
    pub last_start: Option<DateTime<Utc>>,
    #[serde(with = "timestamp")]
    pub last_stop: Option<DateTime<Utc>>,
}

impl Default for ServerRecord {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            name: UNKNOWN.to_string(),
            version: UNKNOWN.to_string(),
            port: 0,
            core_type: UNKNOWN.to_string(),
            description: None,
            status: ServerStatus::Stopped,
            pid: None,
            last_start: None,
            last_stop: None,
        }
    }
}

impl ServerRecord {
    pub fn key(&self) -> ServerKey {
        ServerKey::new(self.name.clone(), self.version.clone())
    }

    pub fn matches(&self, key: &ServerKey) -> bool {
        self.name == key.name && self.version == key.version
    }

    pub fn is_running(&self) -> bool {
        self.status == ServerStatus::Running
    }

    pub fn mark_running(&mut self, pid: u32, at: DateTime<Utc>) {
        self.status = ServerStatus::Running;
        self.pid = Some(pid);
        self.last_start = Some(at);
    }

    pub fn mark_stopped(&mut self, at: DateTime<Utc>) {
        self.status = ServerStatus::Stopped;
        self.pid = None;
        self.last_stop = Some(at);
    }

    /// Restores the status/pid invariant on records read from disk.
    ///
    /// Returns true when the record had to be changed.
    pub fn repair(&mut self) -> bool {
        match (self.status, self.pid) {
            (ServerStatus::Running, None) => {
                self.status = ServerStatus::Stopped;
                true
            }
            (ServerStatus::Stopped, Some(_)) => {
                self.pid = None;
                true
            }
            _ => false,
        }
    }
}
