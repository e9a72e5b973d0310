use std::{
    path::Path,
    time::{Duration, SystemTime},
};

use hearth_process::ServerRecord;
use tokio::process::Command;

use crate::{error::LaunchError, os_process};

/// File a start script may write with the real server pid. Preferred over
/// process-tree guessing when present and fresh.
pub const PID_SENTINEL: &str = "server.pid";

// mtime resolution on some filesystems is a full second.
const SENTINEL_MTIME_SLACK: Duration = Duration::from_secs(1);

#[async_trait::async_trait]
pub trait Launcher: Send + Sync {
    /// Starts the server described by `record` and returns the pid of the
    /// long-running server process.
    async fn launch(&self, record: &ServerRecord) -> Result<u32, LaunchError>;
}

/// Runs a record's start script in its own session and hands back the pid
/// of the server the script started.
#[derive(Debug, Clone)]
pub struct ScriptLauncher {
    grace: Duration,
}

impl ScriptLauncher {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

fn shim_command(script: &Path) -> Command {
    let ext = script
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    #[cfg(windows)]
    if ext == "bat" {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(script);
        return cmd;
    }

    let interpreter = if ext == "sh" { "bash" } else { "sh" };
    let mut cmd = Command::new(interpreter);
    cmd.arg(script);
    cmd
}

#[cfg(unix)]
fn detach(cmd: &mut Command) {
    // New session: the server keeps running when the manager's terminal goes away.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(windows)]
fn detach(cmd: &mut Command) {
    const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;
    cmd.creation_flags(CREATE_NEW_CONSOLE);
}

#[cfg(not(any(unix, windows)))]
fn detach(_cmd: &mut Command) {}

async fn read_pid_sentinel(dir: &Path, launched_at: SystemTime) -> Option<u32> {
    let path = dir.join(PID_SENTINEL);
    let meta = tokio::fs::metadata(&path).await.ok()?;
    let modified = meta.modified().ok()?;
    if modified + SENTINEL_MTIME_SLACK < launched_at {
        return None;
    }
    let raw = tokio::fs::read_to_string(&path).await.ok()?;
    let pid = raw.trim().parse::<u32>().ok()?;
    os_process::is_alive(pid).then_some(pid)
}

#[async_trait::async_trait]
impl Launcher for ScriptLauncher {
    async fn launch(&self, record: &ServerRecord) -> Result<u32, LaunchError> {
        let script = record.path.as_path();
        if !script.is_file() {
            return Err(LaunchError::NotFound(record.path.clone()));
        }
        let dir = script
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));

        let launched_at = SystemTime::now();
        let mut cmd = shim_command(script);
        cmd.current_dir(dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        detach(&mut cmd);

        let mut child = cmd.spawn().map_err(LaunchError::Spawn)?;
        let Some(shim_pid) = child.id() else {
            return Err(LaunchError::ImmediateExit { code: None });
        };
        tracing::info!(
            name = %record.name,
            version = %record.version,
            shim_pid,
            script = %script.display(),
            "start script spawned"
        );

        tokio::time::sleep(self.grace).await;

        match child.try_wait() {
            Ok(Some(status)) => {
                return Err(LaunchError::ImmediateExit {
                    code: status.code(),
                });
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(shim_pid, error = %e, "failed to poll start script");
            }
        }

        // Without a sentinel, the real server is taken to be the last
        // descendant of the shim. This is a heuristic: wrappers that start
        // helpers after the server will be misidentified.
        let pid = match read_pid_sentinel(dir, launched_at).await {
            Some(pid) => Some(pid),
            None => os_process::descendants(shim_pid).await.last().copied(),
        };

        let Some(pid) = pid else {
            if let Err(e) = child.kill().await {
                tracing::warn!(shim_pid, error = %e, "failed to kill start script");
            }
            return Err(LaunchError::NoChildProcess { shim_pid });
        };

        // A script that `exec`s the server and reports its own pid is the server.
        if pid != shim_pid
            && let Err(e) = child.kill().await
        {
            tracing::warn!(shim_pid, error = %e, "failed to kill start script");
        }

        tracing::info!(
            name = %record.name,
            version = %record.version,
            pid,
            shim_pid,
            "server process discovered"
        );
        Ok(pid)
    }
}
