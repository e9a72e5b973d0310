//! Mod jars in a server's `mods/` folder.
//!
//! A mod is enabled as `NAME.jar` and disabled as `NAME.disabled`; toggling
//! is a rename. Ids come from `fabric.mod.json` inside the archive.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use hearth_process::ServerRecord;

use crate::error::ModError;

pub const MODS_DIR: &str = "mods";
pub const MOD_LIST_FILE: &str = "mod_list.txt";
const METADATA_FILE: &str = "fabric.mod.json";
const ENABLED_EXT: &str = "jar";
const DISABLED_EXT: &str = "disabled";

/// What could be learned from a mod archive's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModMetadata {
    Id(String),
    /// `fabric.mod.json` is present but has no string `id`.
    NoId,
    MissingMetadata,
    InvalidMetadata,
    CorruptArchive,
}

impl fmt::Display for ModMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => f.write_str(id),
            Self::NoId => f.write_str("unknown"),
            Self::MissingMetadata => f.write_str("missing fabric.mod.json"),
            Self::InvalidMetadata => f.write_str("invalid fabric.mod.json"),
            Self::CorruptArchive => f.write_str("corrupt archive"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModEntry {
    pub path: PathBuf,
    pub file_name: String,
    pub enabled: bool,
    pub metadata: ModMetadata,
}

impl ModEntry {
    pub fn id(&self) -> Option<&str> {
        match &self.metadata {
            ModMetadata::Id(id) => Some(id),
            _ => None,
        }
    }

    fn list_line(&self) -> String {
        format!("{} | {}", self.metadata, self.file_name)
    }
}

/// `mods/` next to the record's start script.
pub fn mods_dir(record: &ServerRecord) -> PathBuf {
    record
        .path
        .parent()
        .unwrap_or(Path::new("."))
        .join(MODS_DIR)
}

fn mod_state(path: &Path) -> Option<bool> {
    let ext = path.extension()?.to_str()?;
    if ext.eq_ignore_ascii_case(ENABLED_EXT) {
        Some(true)
    } else if ext.eq_ignore_ascii_case(DISABLED_EXT) {
        Some(false)
    } else {
        None
    }
}

fn read_metadata(path: &Path) -> ModMetadata {
    let archive = fs::File::open(path)
        .map_err(zip::result::ZipError::Io)
        .and_then(zip::ZipArchive::new);
    let mut archive = match archive {
        Ok(a) => a,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "mod archive is corrupt");
            return ModMetadata::CorruptArchive;
        }
    };

    let mut buf = Vec::<u8>::new();
    let read = match archive.by_name(METADATA_FILE) {
        Ok(mut file) => std::io::Read::read_to_end(&mut file, &mut buf),
        Err(zip::result::ZipError::FileNotFound) => {
            tracing::debug!(path = %path.display(), "no fabric.mod.json in mod archive");
            return ModMetadata::MissingMetadata;
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "mod archive is corrupt");
            return ModMetadata::CorruptArchive;
        }
    };
    if let Err(e) = read {
        tracing::warn!(path = %path.display(), error = %e, "failed to read fabric.mod.json");
        return ModMetadata::CorruptArchive;
    }

    match serde_json::from_slice::<serde_json::Value>(&buf) {
        Ok(v) => match v.get("id").and_then(|id| id.as_str()) {
            Some(id) => ModMetadata::Id(id.to_string()),
            None => ModMetadata::NoId,
        },
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "fabric.mod.json is not valid JSON");
            ModMetadata::InvalidMetadata
        }
    }
}

fn scan_blocking(dir: &Path) -> anyhow::Result<Vec<ModEntry>> {
    let rd = match fs::read_dir(dir) {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("read {}", dir.display())),
    };

    let mut out = Vec::new();
    for entry in rd {
        let entry = entry.with_context(|| format!("read {}", dir.display()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(enabled) = mod_state(&path) else {
            continue;
        };
        out.push(ModEntry {
            file_name: entry.file_name().to_string_lossy().into_owned(),
            enabled,
            metadata: read_metadata(&path),
            path,
        });
    }
    out.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(out)
}

fn write_list_blocking(dir: &Path, entries: &[ModEntry]) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let path = dir.join(MOD_LIST_FILE);
    let tmp = path.with_extension("tmp");
    let body = entries
        .iter()
        .map(ModEntry::list_line)
        .collect::<Vec<_>>()
        .join("\n");
    fs::write(&tmp, body).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, &path).with_context(|| format!("persist {}", path.display()))?;
    Ok(path)
}

fn set_enabled_blocking(dir: &Path, pattern: &str, enabled: bool) -> Result<ModEntry, ModError> {
    let entries = scan_blocking(dir).map_err(ModError::Io)?;
    let mut matches: Vec<ModEntry> = entries
        .into_iter()
        .filter(|m| m.file_name.contains(pattern) || m.id() == Some(pattern))
        .collect();

    let entry = match matches.len() {
        0 => {
            return Err(ModError::NotFound {
                pattern: pattern.to_string(),
            });
        }
        1 => matches.remove(0),
        _ => {
            return Err(ModError::Ambiguous {
                pattern: pattern.to_string(),
                matches: matches.into_iter().map(|m| m.file_name).collect(),
            });
        }
    };
    if entry.enabled == enabled {
        return Ok(entry);
    }

    let target = entry
        .path
        .with_extension(if enabled { ENABLED_EXT } else { DISABLED_EXT });
    if target.exists() {
        return Err(ModError::Conflict(target));
    }
    fs::rename(&entry.path, &target)
        .with_context(|| format!("rename {} to {}", entry.path.display(), target.display()))
        .map_err(ModError::Io)?;

    tracing::info!(
        from = %entry.file_name,
        to = %target.display(),
        enabled,
        "mod toggled"
    );
    Ok(ModEntry {
        file_name: target
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default(),
        path: target,
        enabled,
        metadata: entry.metadata,
    })
}

/// Mods in `dir`, sorted by file name. A missing directory has no mods.
pub async fn scan(dir: PathBuf) -> Result<Vec<ModEntry>, ModError> {
    tokio::task::spawn_blocking(move || scan_blocking(&dir))
        .await
        .context("mod scan task failed")
        .and_then(|r| r)
        .map_err(ModError::Io)
}

/// Rescans `dir` and rewrites `mod_list.txt` with one `ID | FILE` line per mod.
pub async fn refresh_list(dir: PathBuf) -> Result<Vec<ModEntry>, ModError> {
    tokio::task::spawn_blocking(move || {
        let entries = scan_blocking(&dir)?;
        let path = write_list_blocking(&dir, &entries)?;
        tracing::info!(path = %path.display(), count = entries.len(), "mod list updated");
        Ok::<_, anyhow::Error>(entries)
    })
    .await
    .context("mod list task failed")
    .and_then(|r| r)
    .map_err(ModError::Io)
}

/// Enables or disables the single mod whose file name contains `pattern`
/// (or whose id equals it). Already in the requested state is a no-op.
pub async fn set_enabled(dir: PathBuf, pattern: String, enabled: bool) -> Result<ModEntry, ModError> {
    tokio::task::spawn_blocking(move || set_enabled_blocking(&dir, &pattern, enabled))
        .await
        .context("mod toggle task failed")
        .map_err(ModError::Io)?
}
