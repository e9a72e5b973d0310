//! Read-only queries against the OS process table, plus terminate/kill.

use std::time::Duration;

use crate::error::TerminationError;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_WAIT: Duration = Duration::from_secs(2);

/// How a [`terminate`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process was gone before any signal had effect.
    AlreadyExited,
    /// The process exited within the graceful window after SIGTERM.
    Graceful,
    /// The graceful window elapsed and SIGKILL was needed.
    Killed,
}

#[derive(Clone, Copy, Debug)]
enum Signal {
    Term,
    Kill,
}

#[cfg(target_os = "linux")]
#[derive(Debug)]
pub(crate) struct ProcStat {
    pub(crate) state: char,
    pub(crate) ppid: u32,
}

#[cfg(target_os = "linux")]
pub(crate) fn parse_proc_stat(s: &str) -> Option<ProcStat> {
    // comm may contain spaces and parens; fields resume after the last ')'.
    let end = s.rfind(')')?;
    let rest = s.get((end + 2)..)?;
    let mut it = rest.split_whitespace();
    let state = it.next()?.chars().next()?;
    let ppid = it.next()?.parse().ok()?;
    Some(ProcStat { state, ppid })
}

#[cfg(target_os = "linux")]
async fn read_proc_stat(pid: u32) -> Option<ProcStat> {
    let s = tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await.ok()?;
    parse_proc_stat(&s)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|s| parse_proc_stat(&s))
        .is_some_and(|st| st.state == 'Z')
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(raw, 0) };
    if rc != 0 && std::io::Error::last_os_error().raw_os_error() != Some(libc::EPERM) {
        return false;
    }
    !is_zombie(pid)
}

#[cfg(not(unix))]
pub fn is_alive(pid: u32) -> bool {
    let out = std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH", "/FO", "CSV"])
        .output();
    match out {
        Ok(out) => String::from_utf8_lossy(&out.stdout).contains(&format!("\"{pid}\"")),
        Err(_) => false,
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, sig: Signal) -> std::io::Result<()> {
    let raw = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::from_raw_os_error(libc::ESRCH))?;
    let signo = match sig {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let rc = unsafe { libc::kill(raw, signo) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_signal(pid: u32, sig: Signal) -> std::io::Result<()> {
    let mut cmd = std::process::Command::new("taskkill");
    cmd.args(["/PID", &pid.to_string()]);
    if matches!(sig, Signal::Kill) {
        cmd.arg("/F");
    }
    let status = cmd.status()?;
    if !status.success() {
        return Err(std::io::Error::other(format!("taskkill exited with {status}")));
    }
    Ok(())
}

#[cfg(unix)]
fn is_no_such_process(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn is_no_such_process(_err: &std::io::Error) -> bool {
    false
}

/// All live descendants of `root`, breadth-first, pids ascending per level.
#[cfg(target_os = "linux")]
pub async fn descendants(root: u32) -> Vec<u32> {
    use std::collections::{BTreeMap, VecDeque};

    let mut children: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    let Ok(mut rd) = tokio::fs::read_dir("/proc").await else {
        return Vec::new();
    };
    while let Ok(Some(entry)) = rd.next_entry().await {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Some(stat) = read_proc_stat(pid).await else {
            continue;
        };
        if stat.state == 'Z' {
            continue;
        }
        children.entry(stat.ppid).or_default().push(pid);
    }
    for kids in children.values_mut() {
        kids.sort_unstable();
    }

    let mut out = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                out.push(kid);
                queue.push_back(kid);
            }
        }
    }
    out
}

/// Process trees are only enumerable through `/proc`; elsewhere callers must
/// rely on a pid sentinel file.
#[cfg(not(target_os = "linux"))]
pub async fn descendants(_root: u32) -> Vec<u32> {
    Vec::new()
}

async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !is_alive(pid) {
            return true;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL.min(deadline - now)).await;
    }
}

/// SIGTERM, wait up to `timeout`, then SIGKILL.
pub async fn terminate(pid: u32, timeout: Duration) -> Result<Termination, TerminationError> {
    if !is_alive(pid) {
        return Ok(Termination::AlreadyExited);
    }

    match send_signal(pid, Signal::Term) {
        Ok(()) => {}
        Err(e) if is_no_such_process(&e) => return Ok(Termination::AlreadyExited),
        Err(source) => return Err(TerminationError::Signal { pid, source }),
    }

    if wait_for_exit(pid, timeout).await {
        return Ok(Termination::Graceful);
    }

    tracing::warn!(
        pid,
        timeout_ms = timeout.as_millis() as u64,
        "process did not exit after SIGTERM, sending SIGKILL"
    );
    match send_signal(pid, Signal::Kill) {
        Ok(()) => {}
        Err(e) if is_no_such_process(&e) => return Ok(Termination::Graceful),
        Err(source) => return Err(TerminationError::Signal { pid, source }),
    }

    if wait_for_exit(pid, KILL_WAIT).await {
        Ok(Termination::Killed)
    } else {
        Err(TerminationError::StillAlive { pid })
    }
}
