use std::path::{Path, PathBuf};

use anyhow::Context;
use hearth_process::{ServerKey, ServerRecord};
use serde_json::{Map, Value};
use tokio::{io::AsyncWriteExt, sync::Mutex};

use crate::error::ManagerError;

/// On-disk document: `{"servers": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub servers: Vec<ServerRecord>,
}

impl Registry {
    pub fn find(&self, key: &ServerKey) -> Option<&ServerRecord> {
        self.servers.iter().find(|s| s.matches(key))
    }

    pub fn find_mut(&mut self, key: &ServerKey) -> Option<&mut ServerRecord> {
        self.servers.iter_mut().find(|s| s.matches(key))
    }

    pub fn contains_path(&self, path: &Path) -> bool {
        self.servers.iter().any(|s| s.path == path)
    }

    pub fn remove(&mut self, key: &ServerKey) -> Option<ServerRecord> {
        let idx = self.servers.iter().position(|s| s.matches(key))?;
        Some(self.servers.remove(idx))
    }
}

/// JSON file holding the [`Registry`].
///
/// Writers go through [`RegistryStore::update`], which serializes whole
/// load-modify-save cycles so concurrent callers never drop each other's edits.
#[derive(Debug)]
pub struct RegistryStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the registry. A missing file is an empty registry. So is a file
    /// that is not JSON at all; its contents are lost on the next save.
    /// Inside a readable file, invalid fields are reset to their defaults and
    /// entries that are not objects are skipped, each with a warning.
    pub async fn load(&self) -> anyhow::Result<Registry> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Registry::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("read {}", self.path.display()));
            }
        };

        let mut registry = match serde_json::from_slice::<Value>(&data) {
            Ok(doc) => decode_document(&self.path, doc),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "registry file is malformed, treating it as empty"
                );
                return Ok(Registry::default());
            }
        };

        for record in &mut registry.servers {
            if record.repair() {
                tracing::warn!(
                    name = %record.name,
                    version = %record.version,
                    "repaired inconsistent status/pid in registry"
                );
            }
        }
        Ok(registry)
    }

    pub async fn save(&self, registry: &Registry) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write(registry).await
    }

    /// Load, apply `f`, and save if `f` succeeded and changed anything.
    pub async fn update<T, F>(&self, f: F) -> Result<T, ManagerError>
    where
        F: FnOnce(&mut Registry) -> Result<T, ManagerError>,
    {
        let _guard = self.write_lock.lock().await;
        let mut registry = self.load().await.map_err(ManagerError::Registry)?;
        let before = registry.clone();
        let out = f(&mut registry)?;
        if registry != before {
            self.write(&registry).await.map_err(ManagerError::Registry)?;
        }
        Ok(out)
    }

    async fn write(&self, registry: &Registry) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }

        let tmp = tmp_path(&self.path);
        let data = serde_json::to_vec_pretty(registry).context("serialize registry")?;
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(&data)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        f.sync_all().await.ok();
        drop(f);
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("persist {}", self.path.display()))?;
        Ok(())
    }
}

/// Decodes each entry of `servers` on its own so one bad record cannot take
/// the healthy ones down with it.
fn decode_document(path: &Path, doc: Value) -> Registry {
    let entries = match doc {
        Value::Object(mut map) => match map.remove("servers") {
            Some(Value::Array(entries)) => entries,
            None | Some(Value::Null) => Vec::new(),
            Some(_) => {
                tracing::warn!(path = %path.display(), "registry `servers` is not a list, treating it as empty");
                Vec::new()
            }
        },
        _ => {
            tracing::warn!(path = %path.display(), "registry file is not an object, treating it as empty");
            Vec::new()
        }
    };

    let servers = entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| decode_record(index, entry))
        .collect();
    Registry { servers }
}

fn decode_record(index: usize, entry: Value) -> Option<ServerRecord> {
    let fields = match entry {
        Value::Object(fields) => fields,
        other => {
            tracing::warn!(index, entry = %other, "skipping registry entry that is not an object");
            return None;
        }
    };
    match serde_json::from_value::<ServerRecord>(Value::Object(fields.clone())) {
        Ok(rec) => Some(rec),
        Err(e) => {
            tracing::warn!(index, error = %e, "registry entry has invalid fields, resetting them to defaults");
            Some(salvage_record(index, fields))
        }
    }
}

/// Keeps every field that decodes by itself and defaults the rest.
fn salvage_record(index: usize, fields: Map<String, Value>) -> ServerRecord {
    let mut kept = Map::new();
    for (field, value) in fields {
        let single = Map::from_iter([(field.clone(), value.clone())]);
        if serde_json::from_value::<ServerRecord>(Value::Object(single)).is_ok() {
            kept.insert(field, value);
        } else {
            tracing::warn!(index, field = %field, value = %value, "dropping invalid registry field");
        }
    }
    serde_json::from_value(Value::Object(kept)).unwrap_or_default()
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}
