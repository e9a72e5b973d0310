//! Per-server liveness tracking.
//!
//! A tracker polls one pid until it disappears, then reconciles the registry
//! (`Watching -> Reconciled`). `stop` cancels it first (`Watching -> Cancelled`).
//! Reconciliation runs under the same per-key lock as `start`/`stop` and only
//! touches a record that is still running with the tracked pid, so whichever
//! side runs second is a no-op.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use hearth_process::ServerKey;
use tokio::{sync::Mutex, task::JoinHandle};

use crate::{
    error::{ManagerError, format_error_chain},
    notify::{self, Notifier},
    os_process,
    process_manager::KeyLocks,
    registry::RegistryStore,
};

/// Everything a tracker task needs, shared with the manager.
#[derive(Clone)]
pub(crate) struct TrackerContext {
    pub(crate) store: Arc<RegistryStore>,
    pub(crate) locks: KeyLocks,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) poll_interval: Duration,
}

#[derive(Debug)]
struct TrackerHandle {
    generation: u64,
    pid: u32,
    task: JoinHandle<()>,
}

/// Running trackers, at most one per key.
#[derive(Debug, Clone, Default)]
pub struct Trackers {
    inner: Arc<Mutex<HashMap<ServerKey, TrackerHandle>>>,
    next_generation: Arc<AtomicU64>,
}

impl Trackers {
    /// Starts tracking `pid` for `key`, replacing any previous tracker.
    pub(crate) async fn watch(&self, ctx: TrackerContext, key: ServerKey, pid: u32) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        // Held across the spawn so the task cannot deregister before it is registered.
        let mut map = self.inner.lock().await;

        let trackers = self.clone();
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            run(&ctx, &task_key, pid).await;
            trackers.finished(&task_key, generation).await;
        });

        if let Some(old) = map.insert(
            key,
            TrackerHandle {
                generation,
                pid,
                task,
            },
        ) {
            old.task.abort();
        }
    }

    /// Aborts the tracker for `key`. Returns false if there was none, which
    /// includes a tracker that already finished on its own.
    pub async fn cancel(&self, key: &ServerKey) -> bool {
        let Some(handle) = self.inner.lock().await.remove(key) else {
            return false;
        };
        handle.task.abort();
        tracing::debug!(%key, pid = handle.pid, "tracker cancelled");
        true
    }

    pub async fn tracked_pid(&self, key: &ServerKey) -> Option<u32> {
        self.inner.lock().await.get(key).map(|h| h.pid)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn shutdown(&self) {
        let mut map = self.inner.lock().await;
        for (_, handle) in map.drain() {
            handle.task.abort();
        }
    }

    async fn finished(&self, key: &ServerKey, generation: u64) {
        let mut map = self.inner.lock().await;
        if map.get(key).is_some_and(|h| h.generation == generation) {
            map.remove(key);
        }
    }
}

async fn run(ctx: &TrackerContext, key: &ServerKey, pid: u32) {
    tracing::info!(name = %key.name, version = %key.version, pid, "tracking server process");

    while os_process::is_alive(pid) {
        tokio::time::sleep(ctx.poll_interval).await;
    }

    tracing::info!(name = %key.name, version = %key.version, pid, "server process exited");

    match reconcile(ctx, key, pid).await {
        Ok(true) => notify::notify_best_effort(
            ctx.notifier.as_ref(),
            notify::TITLE_EXITED,
            &format!(
                "Server {} ({}) is no longer running (pid {pid})",
                key.name, key.version
            ),
        ),
        Ok(false) => {
            tracing::debug!(%key, pid, "record already reconciled");
        }
        Err(ManagerError::Registry(err)) => {
            tracing::error!(%key, pid, error = %format_error_chain(&err), "failed to record server exit");
        }
        Err(err) => {
            tracing::error!(%key, pid, error = %err, "failed to record server exit");
        }
    }
}

/// Marks `key` stopped if it is still recorded as running with `pid`.
///
/// Returns whether the record changed.
pub(crate) async fn reconcile(
    ctx: &TrackerContext,
    key: &ServerKey,
    pid: u32,
) -> Result<bool, ManagerError> {
    let _guard = ctx.locks.lock(key).await;
    ctx.store
        .update(|reg| {
            let Some(rec) = reg.find_mut(key) else {
                return Ok(false);
            };
            if !rec.is_running() || rec.pid != Some(pid) {
                return Ok(false);
            }
            rec.mark_stopped(Utc::now());
            Ok(true)
        })
        .await
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::PathBuf;

    use hearth_process::{ServerRecord, ServerStatus};

    use super::*;
    use crate::{notify::testing::RecordingNotifier, registry::Registry};

    fn ctx(dir: &std::path::Path, notifier: RecordingNotifier) -> TrackerContext {
        TrackerContext {
            store: Arc::new(RegistryStore::new(dir.join("server.json"))),
            locks: KeyLocks::default(),
            notifier: Arc::new(notifier),
            poll_interval: Duration::from_millis(50),
        }
    }

    fn running(pid: u32) -> ServerRecord {
        let mut rec = ServerRecord {
            path: PathBuf::from("/srv/Alpha_1.20.1_25565_paper/start.sh"),
            name: "Alpha".to_string(),
            version: "1.20.1".to_string(),
            ..Default::default()
        };
        rec.mark_running(pid, Utc::now());
        rec
    }

    async fn spawn_sleep() -> u32 {
        let mut child = tokio::process::Command::new("sleep")
            .arg("60")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        pid
    }

    #[tokio::test]
    async fn external_exit_is_reconciled() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = RecordingNotifier::default();
        let ctx = ctx(dir.path(), notifier.clone());
        let key = ServerKey::new("Alpha", "1.20.1");

        let pid = spawn_sleep().await;
        ctx.store
            .save(&Registry {
                servers: vec![running(pid)],
            })
            .await
            .unwrap();

        let trackers = Trackers::default();
        trackers.watch(ctx.clone(), key.clone(), pid).await;
        assert_eq!(trackers.tracked_pid(&key).await, Some(pid));

        os_process::terminate(pid, Duration::from_secs(2)).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let reg = ctx.store.load().await.unwrap();
            if reg.servers[0].status == ServerStatus::Stopped {
                assert_eq!(reg.servers[0].pid, None);
                assert!(reg.servers[0].last_stop.is_some());
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "tracker never reconciled");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // deregistration and notification follow the registry write
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(trackers.is_empty().await);
        assert_eq!(notifier.titles(), vec![notify::TITLE_EXITED.to_string()]);
    }

    #[tokio::test]
    async fn reconcile_ignores_other_pid() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path(), RecordingNotifier::default());
        let key = ServerKey::new("Alpha", "1.20.1");
        ctx.store
            .save(&Registry {
                servers: vec![running(4242)],
            })
            .await
            .unwrap();

        assert!(!reconcile(&ctx, &key, 4343).await.unwrap());
        assert!(reconcile(&ctx, &key, 4242).await.unwrap());
        assert!(!reconcile(&ctx, &key, 4242).await.unwrap());

        let rec = &ctx.store.load().await.unwrap().servers[0];
        assert_eq!(rec.status, ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path(), RecordingNotifier::default());
        let key = ServerKey::new("Alpha", "1.20.1");
        let trackers = Trackers::default();

        assert!(!trackers.cancel(&key).await);

        let pid = spawn_sleep().await;
        trackers.watch(ctx, key.clone(), pid).await;
        assert!(trackers.cancel(&key).await);
        assert!(!trackers.cancel(&key).await);

        os_process::terminate(pid, Duration::from_secs(2)).await.unwrap();
    }
}
