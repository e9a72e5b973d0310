use std::sync::Arc;

use hearth_agent::{ScriptLauncher, ServerManager, notify, settings};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn init_logging() -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let dir = settings::log_dir();
    std::fs::create_dir_all(&dir)
        .map_err(|e| anyhow::anyhow!("create log dir {}: {e}", dir.display()))?;

    let file = tracing_appender::rolling::daily(&dir, "hearth.log");
    let (file, guard) = tracing_appender::non_blocking(file);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file))
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_logging()?;

    let settings = settings::Settings::from_env();
    tracing::info!(
        registry = %settings.registry_path.display(),
        grace_ms = settings.launch_grace.as_millis() as u64,
        stop_timeout_s = settings.stop_timeout.as_secs(),
        poll_ms = settings.poll_interval.as_millis() as u64,
        "hearth-agent starting"
    );

    let manager = ServerManager::new(
        &settings,
        Arc::new(ScriptLauncher::new(settings.launch_grace)),
        notify::from_kind(settings::notifier_kind()),
    );

    let resumed = match manager.restore().await {
        Ok(n) => n,
        Err(err) => {
            tracing::error!(
                code = err.code(),
                hint = err.hint().unwrap_or_default(),
                error = %err,
                "failed to restore registry"
            );
            return Err(err.into());
        }
    };
    tracing::info!(resumed, "registry restored");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down; managed servers keep running");
    manager.shutdown().await;
    Ok(())
}
