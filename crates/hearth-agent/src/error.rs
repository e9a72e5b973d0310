use std::path::PathBuf;

use hearth_process::{FormatError, KeyError, ServerKey};

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("start script not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("start script exited during the launch grace period (exit code {code:?})")]
    ImmediateExit { code: Option<i32> },
    #[error("no server process found under launcher pid {shim_pid}")]
    NoChildProcess { shim_pid: u32 },
    #[error("failed to spawn start script: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TerminationError {
    #[error("process {pid} is still alive after SIGKILL")]
    StillAlive { pid: u32 },
    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ModError {
    #[error("no mod matches '{pattern}'")]
    NotFound { pattern: String },
    #[error("'{pattern}' matches several mods: {}", .matches.join(", "))]
    Ambiguous {
        pattern: String,
        matches: Vec<String>,
    },
    #[error("refusing to overwrite {}", .0.display())]
    Conflict(PathBuf),
    #[error("{0:#}")]
    Io(anyhow::Error),
}

/// Every failure a lifecycle call can report. Adapters should render each
/// variant distinctly; [`ManagerError::code`] is stable for that purpose.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("path not found: {}", .0.display())]
    PathNotFound(PathBuf),
    #[error("server not found: {0}")]
    NotFound(ServerKey),
    #[error("not a start script (expected .bat or .sh): {}", .0.display())]
    InvalidExtension(PathBuf),
    #[error("server path already registered: {}", .0.display())]
    DuplicatePath(PathBuf),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    InvalidKey(#[from] KeyError),
    #[error("server {0} is already running")]
    AlreadyRunning(ServerKey),
    #[error("server {0} is not running")]
    NotRunning(ServerKey),
    #[error("server {0} is running; stop it first")]
    StillRunning(ServerKey),
    #[error("launch failed: {0}")]
    Launch(#[from] LaunchError),
    #[error("stop failed: {0}")]
    Termination(#[from] TerminationError),
    #[error("mod operation failed: {0}")]
    Mod(#[from] ModError),
    #[error("registry error: {0:#}")]
    Registry(anyhow::Error),
}

impl ManagerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::PathNotFound(_) | Self::NotFound(_) => "not_found",
            Self::InvalidExtension(_) => "invalid_extension",
            Self::DuplicatePath(_) => "duplicate_path",
            Self::Format(_) => "format_error",
            Self::InvalidKey(_) => "invalid_key",
            Self::AlreadyRunning(_) => "already_running",
            Self::NotRunning(_) => "not_running",
            Self::StillRunning(_) => "still_running",
            Self::Launch(LaunchError::NotFound(_)) => "launch_not_found",
            Self::Launch(LaunchError::ImmediateExit { .. }) => "launch_immediate_exit",
            Self::Launch(LaunchError::NoChildProcess { .. }) => "launch_no_child_process",
            Self::Launch(LaunchError::Spawn(_)) => "launch_spawn_failed",
            Self::Termination(_) => "termination_failed",
            Self::Mod(ModError::NotFound { .. }) => "mod_not_found",
            Self::Mod(ModError::Ambiguous { .. }) => "mod_ambiguous",
            Self::Mod(ModError::Conflict(_)) => "mod_conflict",
            Self::Mod(ModError::Io(_)) => "mod_io_error",
            Self::Registry(_) => "registry_error",
        }
    }

    /// Suggested next step for the operator, when there is an obvious one.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Format(_) => Some("Rename the folder to NAME_VERSION_PORT_CORE, or add with force."),
            Self::InvalidKey(_) => Some("Use NAME_VERSION, e.g. skywind_1.21.4."),
            Self::StillRunning(_) => Some("Stop the server first."),
            Self::Mod(ModError::Ambiguous { .. }) => {
                Some("Use more of the file name, or the mod id from `fabric.mod.json`.")
            }
            Self::Launch(LaunchError::ImmediateExit { .. }) => {
                Some("Run the start script by hand to see why it exits.")
            }
            Self::Launch(LaunchError::NoChildProcess { .. }) => Some(
                "The start script must launch the server as a child process (avoid `exec`), or write its pid to server.pid.",
            ),
            _ => None,
        }
    }
}

/// `a: b: c` rendering of an error chain, skipping empty and repeated links.
pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
