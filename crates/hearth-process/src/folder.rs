//! Server metadata encoded in folder names: `NAME_VERSION_PORT_CORE`.

/// Server runtimes recognised in strict mode.
pub const KNOWN_CORES: &[&str] = &["fabric", "forge", "vanilla", "paper", "spigot"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CorePolicy {
    /// CORE must be one of [`KNOWN_CORES`].
    #[default]
    Known,
    /// Any non-empty CORE tag is accepted.
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderInfo {
    pub name: String,
    pub version: String,
    pub port: u32,
    pub core_type: String,
}

impl FolderInfo {
    pub fn folder_name(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.name, self.version, self.port, self.core_type
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "folder name '{0}' does not match NAME_VERSION_PORT_CORE (e.g. skywind_empire2_1.21.4_25560_fabric)"
)]
pub struct FormatError(pub String);

pub fn parse_folder_name(folder: &str) -> Result<FolderInfo, FormatError> {
    parse_folder_name_with(folder, CorePolicy::Known)
}

pub fn parse_folder_name_with(folder: &str, policy: CorePolicy) -> Result<FolderInfo, FormatError> {
    let err = || FormatError(folder.to_string());

    // VERSION, PORT and CORE never contain '_', so they anchor from the right
    // and NAME keeps whatever underscores remain.
    let mut parts = folder.rsplitn(4, '_');
    let core = parts.next().ok_or_else(err)?;
    let port = parts.next().ok_or_else(err)?;
    let version = parts.next().ok_or_else(err)?;
    let name = parts.next().ok_or_else(err)?;

    if name.is_empty() || !is_dotted_triplet(version) {
        return Err(err());
    }

    if !(4..=5).contains(&port.len()) || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(err());
    }
    let port = port.parse::<u32>().map_err(|_| err())?;

    let core_ok = match policy {
        CorePolicy::Known => KNOWN_CORES.contains(&core),
        CorePolicy::Any => !core.is_empty(),
    };
    if !core_ok {
        return Err(err());
    }

    Ok(FolderInfo {
        name: name.to_string(),
        version: version.to_string(),
        port,
        core_type: core.to_string(),
    })
}

fn is_dotted_triplet(s: &str) -> bool {
    let mut n = 0;
    for part in s.split('.') {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        n += 1;
    }
    n == 3
}
