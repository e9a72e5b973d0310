use std::{str::FromStr, sync::Arc};

use crate::error::format_error_chain;

pub const TITLE_STARTED: &str = "Server started";
pub const TITLE_STOPPED: &str = "Server stopped";
pub const TITLE_EXITED: &str = "Server exited";

/// Out-of-band alert channel (desktop popup, chat message, ...).
///
/// Delivery is best effort: failures never fail the lifecycle call that
/// triggered them.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, message: &str) -> anyhow::Result<()>;
}

pub(crate) fn notify_best_effort(notifier: &dyn Notifier, title: &str, message: &str) {
    if let Err(err) = notifier.notify(title, message) {
        tracing::warn!(title, error = %format_error_chain(&err), "notification failed");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierKind {
    Log,
    Desktop,
    Off,
}

impl FromStr for NotifierKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(Self::Log),
            "desktop" => Ok(Self::Desktop),
            "off" | "none" => Ok(Self::Off),
            other => anyhow::bail!("unknown notifier: {other}"),
        }
    }
}

pub fn from_kind(kind: NotifierKind) -> Arc<dyn Notifier> {
    match kind {
        NotifierKind::Log => Arc::new(LogNotifier),
        NotifierKind::Desktop => Arc::new(DesktopNotifier),
        NotifierKind::Off => Arc::new(NoopNotifier),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, message: &str) -> anyhow::Result<()> {
        tracing::info!(target: "hearth::notify", title, "{message}");
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _title: &str, _message: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Desktop popups through the platform's notification helper.
///
/// The helper is spawned and not awaited; tokio reaps it in the background.
#[derive(Debug, Default, Clone, Copy)]
pub struct DesktopNotifier;

impl Notifier for DesktopNotifier {
    fn notify(&self, title: &str, message: &str) -> anyhow::Result<()> {
        let mut cmd = desktop_command(title, message)?;
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        cmd.spawn()
            .map_err(|e| anyhow::anyhow!("spawn desktop notifier: {e}"))?;
        Ok(())
    }
}

#[cfg(target_os = "macos")]
fn desktop_command(title: &str, message: &str) -> anyhow::Result<tokio::process::Command> {
    let quote = |s: &str| s.replace('\\', "\\\\").replace('"', "\\\"");
    let mut cmd = tokio::process::Command::new("osascript");
    cmd.arg("-e").arg(format!(
        "display notification \"{}\" with title \"{}\"",
        quote(message),
        quote(title)
    ));
    Ok(cmd)
}

#[cfg(all(unix, not(target_os = "macos")))]
fn desktop_command(title: &str, message: &str) -> anyhow::Result<tokio::process::Command> {
    let mut cmd = tokio::process::Command::new("notify-send");
    cmd.arg("--app-name=hearth").arg(title).arg(message);
    Ok(cmd)
}

#[cfg(not(unix))]
fn desktop_command(_title: &str, _message: &str) -> anyhow::Result<tokio::process::Command> {
    anyhow::bail!("desktop notifications are not supported on this platform")
}
