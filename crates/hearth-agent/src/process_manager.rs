use std::{
    collections::HashMap,
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use hearth_process::{ServerKey, ServerRecord, ServerStatus, UNKNOWN, parse_folder_name};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    error::ManagerError,
    launcher::Launcher,
    mods::{self, ModEntry},
    notify::{self, Notifier},
    os_process::{self, Termination},
    registry::RegistryStore,
    settings::Settings,
    tracker::{self, TrackerContext, Trackers},
};

const SCRIPT_EXTENSIONS: &[&str] = &["bat", "sh"];

/// One mutex per server key. `start`, `stop`, `remove`, mod changes and
/// tracker reconciliation hold it for their whole duration.
#[derive(Debug, Clone, Default)]
pub(crate) struct KeyLocks {
    inner: Arc<Mutex<HashMap<ServerKey, Arc<Mutex<()>>>>>,
}

impl KeyLocks {
    pub(crate) async fn lock(&self, key: &ServerKey) -> KeyGuard {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(key.clone()).or_default().clone()
        };
        KeyGuard {
            key: key.clone(),
            map: self.inner.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// Held key lock. The map entry goes away with the last holder or waiter.
#[derive(Debug)]
pub(crate) struct KeyGuard {
    key: ServerKey,
    map: Arc<Mutex<HashMap<ServerKey, Arc<Mutex<()>>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // A busy map is skipped; the entry is pruned by a later holder.
        if let Ok(mut map) = self.map.try_lock()
            && map.get(&self.key).is_some_and(|l| Arc::strong_count(l) == 1)
        {
            map.remove(&self.key);
        }
    }
}

/// Result of [`ServerManager::stop_detailed`].
#[derive(Debug, Clone)]
pub struct StopReport {
    pub record: ServerRecord,
    pub termination: Termination,
}

/// Lifecycle façade: add, remove, list, start and stop registered servers.
#[derive(Clone)]
pub struct ServerManager {
    ctx: TrackerContext,
    launcher: Arc<dyn Launcher>,
    trackers: Trackers,
    stop_timeout: Duration,
}

impl ServerManager {
    pub fn new(settings: &Settings, launcher: Arc<dyn Launcher>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            ctx: TrackerContext {
                store: Arc::new(RegistryStore::new(settings.registry_path.clone())),
                locks: KeyLocks::default(),
                notifier,
                poll_interval: settings.poll_interval,
            },
            launcher,
            trackers: Trackers::default(),
            stop_timeout: settings.stop_timeout,
        }
    }

    pub fn store(&self) -> &RegistryStore {
        &self.ctx.store
    }

    pub fn trackers(&self) -> &Trackers {
        &self.trackers
    }

    /// Registers the start script at `path`.
    ///
    /// Metadata comes from the parent folder name (`NAME_VERSION_PORT_CORE`).
    /// With `force`, a folder that does not follow the convention is accepted
    /// and the folder name becomes the server name.
    pub async fn add(
        &self,
        path: &str,
        force: bool,
        description: Option<&str>,
    ) -> Result<ServerRecord, ManagerError> {
        let raw = path.trim().trim_matches(|c| c == '"' || c == '\'');
        if raw.is_empty() {
            return Err(ManagerError::PathNotFound(PathBuf::new()));
        }
        let path = normalize_path(Path::new(raw))
            .map_err(|_| ManagerError::PathNotFound(PathBuf::from(raw)))?;

        if !path.exists() {
            return Err(ManagerError::PathNotFound(path));
        }
        if !has_script_extension(&path) {
            return Err(ManagerError::InvalidExtension(path));
        }

        let folder = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let info = match parse_folder_name(&folder) {
            Ok(info) => Some(info),
            Err(err) if force => {
                tracing::debug!(folder = %folder, error = %err, "folder name not parsed, forced add");
                None
            }
            Err(err) => return Err(err.into()),
        };

        let record = match info {
            Some(info) => ServerRecord {
                path,
                name: info.name,
                version: info.version,
                port: info.port,
                core_type: info.core_type,
                ..Default::default()
            },
            None => ServerRecord {
                path,
                name: if folder.is_empty() { UNKNOWN.to_string() } else { folder },
                ..Default::default()
            },
        };
        let record = ServerRecord {
            description: description
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string),
            ..record
        };

        let record = self
            .ctx
            .store
            .update(|reg| {
                if reg.contains_path(&record.path) {
                    return Err(ManagerError::DuplicatePath(record.path.clone()));
                }
                if reg.find(&record.key()).is_some() {
                    tracing::warn!(
                        key = %record.key(),
                        "another server already uses this name and version; key lookups resolve to the first one"
                    );
                }
                reg.servers.push(record.clone());
                Ok(record)
            })
            .await?;

        tracing::info!(
            name = %record.name,
            version = %record.version,
            path = %record.path.display(),
            "server added"
        );
        Ok(record)
    }

    /// Unregisters a stopped server and returns its record.
    pub async fn remove(&self, key: &str) -> Result<ServerRecord, ManagerError> {
        let key: ServerKey = key.parse()?;
        let _guard = self.ctx.locks.lock(&key).await;

        let removed = self
            .ctx
            .store
            .update(|reg| {
                let rec = reg
                    .find(&key)
                    .ok_or_else(|| ManagerError::NotFound(key.clone()))?;
                if rec.is_running() {
                    return Err(ManagerError::StillRunning(key.clone()));
                }
                reg.remove(&key)
                    .ok_or_else(|| ManagerError::NotFound(key.clone()))
            })
            .await?;

        self.trackers.cancel(&key).await;
        tracing::info!(%key, "server removed");
        Ok(removed)
    }

    pub async fn list(&self) -> Result<Vec<ServerRecord>, ManagerError> {
        let reg = self.ctx.store.load().await.map_err(ManagerError::Registry)?;
        Ok(reg.servers)
    }

    pub async fn get(&self, key: &str) -> Result<ServerRecord, ManagerError> {
        let key: ServerKey = key.parse()?;
        self.lookup(&key).await
    }

    async fn lookup(&self, key: &ServerKey) -> Result<ServerRecord, ManagerError> {
        let reg = self.ctx.store.load().await.map_err(ManagerError::Registry)?;
        reg.find(key)
            .cloned()
            .ok_or_else(|| ManagerError::NotFound(key.clone()))
    }

    async fn lookup_stopped(&self, key: &ServerKey) -> Result<ServerRecord, ManagerError> {
        let record = self.lookup(key).await?;
        if record.is_running() {
            return Err(ManagerError::StillRunning(key.clone()));
        }
        Ok(record)
    }

    /// Launches a stopped server and starts tracking its process.
    pub async fn start(&self, key: &str) -> Result<ServerRecord, ManagerError> {
        let key: ServerKey = key.parse()?;
        let _guard = self.ctx.locks.lock(&key).await;

        let record = self.lookup(&key).await?;
        if record.is_running() {
            return Err(ManagerError::AlreadyRunning(key));
        }

        tracing::info!(%key, path = %record.path.display(), "starting server");
        let pid = self.launcher.launch(&record).await?;
        let started_at = next_start_time(record.last_start);

        let updated = self
            .ctx
            .store
            .update(|reg| {
                let rec = reg
                    .find_mut(&key)
                    .ok_or_else(|| ManagerError::NotFound(key.clone()))?;
                rec.mark_running(pid, started_at);
                Ok(rec.clone())
            })
            .await;
        let updated = match updated {
            Ok(v) => v,
            Err(err) => {
                // Not recorded anywhere: do not leave it running unmanaged.
                tracing::error!(%key, pid, error = %err, "failed to record start, stopping server");
                if let Err(e) = os_process::terminate(pid, self.stop_timeout).await {
                    tracing::error!(%key, pid, error = %e, "failed to stop unrecorded server");
                }
                return Err(err);
            }
        };

        self.trackers.watch(self.ctx.clone(), key.clone(), pid).await;
        tracing::info!(%key, pid, "server running");
        notify::notify_best_effort(
            self.ctx.notifier.as_ref(),
            notify::TITLE_STARTED,
            &format!("Server {} ({}) started", key.name, key.version),
        );
        Ok(updated)
    }

    pub async fn stop(&self, key: &str) -> Result<ServerRecord, ManagerError> {
        self.stop_detailed(key).await.map(|r| r.record)
    }

    /// Stops a running server: cancels its tracker, sends SIGTERM, and
    /// escalates to SIGKILL after the configured timeout.
    pub async fn stop_detailed(&self, key: &str) -> Result<StopReport, ManagerError> {
        let key: ServerKey = key.parse()?;
        let _guard = self.ctx.locks.lock(&key).await;

        let record = self.lookup(&key).await?;
        let pid = match (record.status, record.pid) {
            (ServerStatus::Running, Some(pid)) => pid,
            _ => return Err(ManagerError::NotRunning(key)),
        };

        self.trackers.cancel(&key).await;

        let termination = match os_process::terminate(pid, self.stop_timeout).await {
            Ok(t) => t,
            Err(err) => {
                // Still alive: keep watching it so the record stays truthful.
                self.trackers.watch(self.ctx.clone(), key.clone(), pid).await;
                return Err(err.into());
            }
        };
        match termination {
            Termination::Killed => {
                tracing::warn!(%key, pid, "server ignored SIGTERM and was killed");
            }
            Termination::AlreadyExited => {
                tracing::info!(%key, pid, "server process had already exited");
            }
            Termination::Graceful => {
                tracing::info!(%key, pid, "server stopped");
            }
        }

        let stopped_at = Utc::now();
        let record = self
            .ctx
            .store
            .update(|reg| {
                let rec = reg
                    .find_mut(&key)
                    .ok_or_else(|| ManagerError::NotFound(key.clone()))?;
                if rec.is_running() && rec.pid == Some(pid) {
                    rec.mark_stopped(stopped_at);
                }
                Ok(rec.clone())
            })
            .await?;

        notify::notify_best_effort(
            self.ctx.notifier.as_ref(),
            notify::TITLE_STOPPED,
            &format!("Server {} ({}) stopped", key.name, key.version),
        );
        Ok(StopReport {
            record,
            termination,
        })
    }

    /// Mods in the server's `mods/` folder. Only reads, so the server may be running.
    pub async fn list_mods(&self, key: &str) -> Result<Vec<ModEntry>, ManagerError> {
        let key: ServerKey = key.parse()?;
        let record = self.lookup(&key).await?;
        Ok(mods::scan(mods::mods_dir(&record)).await?)
    }

    /// Rewrites the server's `mod_list.txt`. The server must be stopped.
    pub async fn refresh_mod_list(&self, key: &str) -> Result<Vec<ModEntry>, ManagerError> {
        let key: ServerKey = key.parse()?;
        let _guard = self.ctx.locks.lock(&key).await;
        let record = self.lookup_stopped(&key).await?;
        Ok(mods::refresh_list(mods::mods_dir(&record)).await?)
    }

    /// Enables or disables one mod by renaming it. The server must be stopped.
    pub async fn set_mod_enabled(
        &self,
        key: &str,
        pattern: &str,
        enabled: bool,
    ) -> Result<ModEntry, ManagerError> {
        let key: ServerKey = key.parse()?;
        let _guard = self.ctx.locks.lock(&key).await;
        let record = self.lookup_stopped(&key).await?;
        let entry =
            mods::set_enabled(mods::mods_dir(&record), pattern.to_string(), enabled).await?;
        tracing::info!(%key, file = %entry.file_name, enabled, "mod state changed");
        Ok(entry)
    }

    /// Brings persisted state in line with the process table after the
    /// manager itself restarted. Running records with a live pid get a new
    /// tracker; the rest are marked stopped. Returns the number of trackers
    /// resumed.
    ///
    /// A pid reused by an unrelated process since the record was written is
    /// indistinguishable from the server and will be tracked.
    pub async fn restore(&self) -> Result<usize, ManagerError> {
        let reg = self.ctx.store.load().await.map_err(ManagerError::Registry)?;
        let mut resumed = 0;

        for rec in reg.servers.iter().filter(|r| r.is_running()) {
            let Some(pid) = rec.pid else {
                continue;
            };
            let key = rec.key();
            if os_process::is_alive(pid) {
                self.trackers.watch(self.ctx.clone(), key.clone(), pid).await;
                tracing::info!(%key, pid, "resumed tracking");
                resumed += 1;
            } else if tracker::reconcile(&self.ctx, &key, pid).await? {
                tracing::info!(%key, pid, "server exited while the manager was down");
            }
        }
        Ok(resumed)
    }

    /// Stops all trackers. Managed servers keep running.
    pub async fn shutdown(&self) {
        self.trackers.shutdown().await;
    }
}

fn has_script_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| SCRIPT_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
}

/// Absolute, lexically normalized form of `path` (no symlink resolution).
fn normalize_path(path: &Path) -> std::io::Result<PathBuf> {
    let abs = std::path::absolute(path)?;
    let mut out = PathBuf::new();
    for comp in abs.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    Ok(out)
}

/// `now`, nudged past `previous` so consecutive starts are strictly ordered.
fn next_start_time(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if prev >= now => prev + chrono::Duration::microseconds(1),
        _ => now,
    }
}


#[cfg(all(test, unix))]
mod tests {
    use std::sync::atomic::Ordering;

    use tempfile::TempDir;

    use super::*;
    use crate::{
        error::LaunchError,
        launcher::testing::{CommandLauncher, FailingLauncher},
        mods::{MOD_LIST_FILE, MODS_DIR, testing::write_jar},
        notify::testing::RecordingNotifier,
        registry::Registry,
    };

    struct Fixture {
        dir: TempDir,
        manager: ServerManager,
        notifier: RecordingNotifier,
    }

    fn fixture_with(launcher: Arc<dyn Launcher>, stop_timeout: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let notifier = RecordingNotifier::default();
        let settings = Settings {
            registry_path: dir.path().join("config").join("server.json"),
            launch_grace: Duration::from_millis(100),
            stop_timeout,
            poll_interval: Duration::from_millis(50),
        };
        let manager = ServerManager::new(&settings, launcher, Arc::new(notifier.clone()));
        Fixture {
            dir,
            manager,
            notifier,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(CommandLauncher::sleep()), Duration::from_secs(5))
    }

    fn make_script(root: &Path, folder: &str) -> PathBuf {
        let dir = root.join("servers").join(folder);
        std::fs::create_dir_all(&dir).unwrap();
        let script = dir.join("start.sh");
        std::fs::write(&script, "sleep 60\n").unwrap();
        script
    }

    async fn wait_until_stopped(manager: &ServerManager, key: &str) -> ServerRecord {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let rec = manager.get(key).await.unwrap();
            if rec.status == ServerStatus::Stopped {
                return rec;
            }
            assert!(tokio::time::Instant::now() < deadline, "{key} never stopped");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn add_parses_folder_and_lists_once() {
        let f = fixture();
        let script = make_script(f.dir.path(), "Alpha_1.20.1_25565_paper");

        let rec = f
            .manager
            .add(script.to_str().unwrap(), false, Some("survival"))
            .await
            .unwrap();
        assert_eq!(rec.name, "Alpha");
        assert_eq!(rec.version, "1.20.1");
        assert_eq!(rec.port, 25565);
        assert_eq!(rec.core_type, "paper");
        assert_eq!(rec.status, ServerStatus::Stopped);
        assert_eq!(rec.pid, None);
        assert_eq!(rec.description.as_deref(), Some("survival"));

        let list = f.manager.list().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].path, script);
    }

    #[tokio::test]
    async fn add_normalizes_quoted_paths_and_rejects_duplicates() {
        let f = fixture();
        let script = make_script(f.dir.path(), "Alpha_1.20.1_25565_paper");
        let dir = script.parent().unwrap();

        let spelled = format!("\"{}/./start.sh\"", dir.display());
        let rec = f.manager.add(&spelled, false, None).await.unwrap();
        assert_eq!(rec.path, script);

        let other = format!("{}/../Alpha_1.20.1_25565_paper/start.sh", dir.display());
        let err = f.manager.add(&other, false, None).await.unwrap_err();
        assert!(matches!(err, ManagerError::DuplicatePath(p) if p == script));
        assert_eq!(f.manager.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn add_validates_input() {
        let f = fixture();

        let missing = f.dir.path().join("nope").join("start.sh");
        let err = f.manager.add(missing.to_str().unwrap(), false, None).await.unwrap_err();
        assert!(matches!(err, ManagerError::PathNotFound(_)));

        let txt_dir = f.dir.path().join("Alpha_1.20.1_25565_paper");
        std::fs::create_dir_all(&txt_dir).unwrap();
        let txt = txt_dir.join("start.txt");
        std::fs::write(&txt, "").unwrap();
        let err = f.manager.add(txt.to_str().unwrap(), false, None).await.unwrap_err();
        assert!(matches!(err, ManagerError::InvalidExtension(_)));

        let bad = make_script(f.dir.path(), "my world");
        let err = f.manager.add(bad.to_str().unwrap(), false, None).await.unwrap_err();
        assert!(matches!(err, ManagerError::Format(e) if e.0 == "my world"));
        assert!(f.manager.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn forced_add_uses_folder_name() {
        let f = fixture();
        let script = make_script(f.dir.path(), "my_world");

        let rec = f.manager.add(script.to_str().unwrap(), true, None).await.unwrap();
        assert_eq!(rec.name, "my_world");
        assert_eq!(rec.version, UNKNOWN);
        assert_eq!(rec.core_type, UNKNOWN);
        assert_eq!(rec.port, 0);

        let removed = f.manager.remove("my_world_unknown").await.unwrap();
        assert_eq!(removed, rec);
    }

    #[tokio::test]
    async fn remove_returns_exact_record() {
        let f = fixture();
        let script = make_script(f.dir.path(), "Alpha_1.20.1_25565_paper");
        let added = f.manager.add(script.to_str().unwrap(), false, None).await.unwrap();

        let removed = f.manager.remove("Alpha_1.20.1").await.unwrap();
        assert_eq!(removed, added);
        assert!(f.manager.list().await.unwrap().is_empty());

        let err = f.manager.remove("Alpha_1.20.1").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotFound(_)));
        let err = f.manager.remove("Alpha").await.unwrap_err();
        assert!(matches!(err, ManagerError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn start_rules() {
        let f = fixture();
        let err = f.manager.start("Ghost_1.0.0").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotFound(_)));

        let script = make_script(f.dir.path(), "Alpha_1.20.1_25565_paper");
        f.manager.add(script.to_str().unwrap(), false, None).await.unwrap();

        let rec = f.manager.start("Alpha_1.20.1").await.unwrap();
        assert_eq!(rec.status, ServerStatus::Running);
        let pid = rec.pid.unwrap();
        assert!(os_process::is_alive(pid));
        assert!(rec.last_start.is_some());
        assert_eq!(
            f.manager.trackers().tracked_pid(&rec.key()).await,
            Some(pid)
        );

        let err = f.manager.start("Alpha_1.20.1").await.unwrap_err();
        assert!(matches!(err, ManagerError::AlreadyRunning(_)));

        let err = f.manager.remove("Alpha_1.20.1").await.unwrap_err();
        assert!(matches!(err, ManagerError::StillRunning(_)));

        f.manager.stop("Alpha_1.20.1").await.unwrap();
    }

    #[tokio::test]
    async fn stop_then_start_replaces_process() {
        let f = fixture();
        let script = make_script(f.dir.path(), "Alpha_1.20.1_25565_paper");
        f.manager.add(script.to_str().unwrap(), false, None).await.unwrap();

        let first = f.manager.start("Alpha_1.20.1").await.unwrap();
        let report = f.manager.stop_detailed("Alpha_1.20.1").await.unwrap();
        assert_eq!(report.termination, Termination::Graceful);
        assert_eq!(report.record.status, ServerStatus::Stopped);
        assert_eq!(report.record.pid, None);
        assert!(report.record.last_stop.is_some());
        assert!(!os_process::is_alive(first.pid.unwrap()));
        assert!(f.manager.trackers().is_empty().await);

        let second = f.manager.start("Alpha_1.20.1").await.unwrap();
        assert_ne!(second.pid, first.pid);
        assert!(second.last_start > first.last_start);

        f.manager.stop("Alpha_1.20.1").await.unwrap();
        assert_eq!(
            f.notifier.titles(),
            vec![
                notify::TITLE_STARTED,
                notify::TITLE_STOPPED,
                notify::TITLE_STARTED,
                notify::TITLE_STOPPED
            ]
        );
    }

    #[tokio::test]
    async fn stop_requires_running() {
        let f = fixture();
        let err = f.manager.stop("Ghost_1.0.0").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotFound(_)));

        let script = make_script(f.dir.path(), "Alpha_1.20.1_25565_paper");
        f.manager.add(script.to_str().unwrap(), false, None).await.unwrap();
        let err = f.manager.stop("Alpha_1.20.1").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotRunning(_)));
    }

    #[tokio::test]
    async fn stop_escalates_to_kill() {
        let f = fixture_with(
            Arc::new(CommandLauncher::stubborn()),
            Duration::from_millis(300),
        );
        let script = make_script(f.dir.path(), "Alpha_1.20.1_25565_paper");
        f.manager.add(script.to_str().unwrap(), false, None).await.unwrap();

        let rec = f.manager.start("Alpha_1.20.1").await.unwrap();
        let report = f.manager.stop_detailed("Alpha_1.20.1").await.unwrap();
        assert_eq!(report.termination, Termination::Killed);
        assert_eq!(report.record.status, ServerStatus::Stopped);
        assert!(!os_process::is_alive(rec.pid.unwrap()));
    }

    #[tokio::test]
    async fn external_exit_is_picked_up_by_tracker() {
        let f = fixture();
        let script = make_script(f.dir.path(), "Alpha_1.20.1_25565_paper");
        f.manager.add(script.to_str().unwrap(), false, None).await.unwrap();
        let rec = f.manager.start("Alpha_1.20.1").await.unwrap();

        os_process::terminate(rec.pid.unwrap(), Duration::from_secs(2))
            .await
            .unwrap();

        let stopped = wait_until_stopped(&f.manager, "Alpha_1.20.1").await;
        assert_eq!(stopped.pid, None);
        assert!(stopped.last_stop.is_some());

        // nothing left to stop
        let err = f.manager.stop("Alpha_1.20.1").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotRunning(_)));
    }

    #[tokio::test]
    async fn racing_stop_and_exit_converge() {
        let f = fixture();
        let script = make_script(f.dir.path(), "Alpha_1.20.1_25565_paper");
        f.manager.add(script.to_str().unwrap(), false, None).await.unwrap();

        for _ in 0..5 {
            let rec = f.manager.start("Alpha_1.20.1").await.unwrap();
            let pid = rec.pid.unwrap();

            let killer = tokio::spawn(async move {
                os_process::terminate(pid, Duration::from_secs(2)).await
            });
            let stop = f.manager.stop("Alpha_1.20.1").await;
            killer.await.unwrap().unwrap();

            match stop {
                Ok(rec) => assert_eq!(rec.status, ServerStatus::Stopped),
                Err(ManagerError::NotRunning(_)) => {}
                Err(e) => panic!("unexpected stop error: {e}"),
            }

            let rec = wait_until_stopped(&f.manager, "Alpha_1.20.1").await;
            assert_eq!(rec.pid, None);
        }
    }

    #[tokio::test]
    async fn launch_failure_leaves_record_stopped() {
        let f = fixture_with(Arc::new(FailingLauncher), Duration::from_secs(1));
        let script = make_script(f.dir.path(), "Alpha_1.20.1_25565_paper");
        f.manager.add(script.to_str().unwrap(), false, None).await.unwrap();

        let err = f.manager.start("Alpha_1.20.1").await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::Launch(LaunchError::ImmediateExit { code: Some(1) })
        ));
        let rec = f.manager.get("Alpha_1.20.1").await.unwrap();
        assert_eq!(rec.status, ServerStatus::Stopped);
        assert_eq!(rec.last_start, None);
        assert!(f.manager.trackers().is_empty().await);
        assert!(f.notifier.titles().is_empty());
    }

    #[tokio::test]
    async fn restore_resumes_live_and_clears_dead() {
        let launcher = CommandLauncher::sleep();
        let f = fixture_with(Arc::new(launcher.clone()), Duration::from_secs(5));

        let live_pid = launcher
            .launch(&ServerRecord::default())
            .await
            .unwrap();
        let mut dead = tokio::process::Command::new("true").spawn().unwrap();
        let dead_pid = dead.id().unwrap();
        dead.wait().await.unwrap();
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);

        let mut live = ServerRecord {
            path: PathBuf::from("/srv/Live_1.0.0_25565_paper/start.sh"),
            name: "Live".to_string(),
            version: "1.0.0".to_string(),
            ..Default::default()
        };
        live.mark_running(live_pid, Utc::now());
        let mut gone = ServerRecord {
            path: PathBuf::from("/srv/Gone_1.0.0_25566_paper/start.sh"),
            name: "Gone".to_string(),
            version: "1.0.0".to_string(),
            ..Default::default()
        };
        gone.mark_running(dead_pid, Utc::now());
        f.manager
            .store()
            .save(&Registry {
                servers: vec![live, gone],
            })
            .await
            .unwrap();

        assert_eq!(f.manager.restore().await.unwrap(), 1);

        let gone = f.manager.get("Gone_1.0.0").await.unwrap();
        assert_eq!(gone.status, ServerStatus::Stopped);
        assert_eq!(gone.pid, None);
        let live = f.manager.get("Live_1.0.0").await.unwrap();
        assert_eq!(live.pid, Some(live_pid));

        f.manager.stop("Live_1.0.0").await.unwrap();
        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn key_locks_do_not_accumulate() {
        let f = fixture();
        let err = f.manager.start("Ghost_1.0.0").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotFound(_)));
        let err = f.manager.remove("Ghost_1.0.0").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotFound(_)));

        let script = make_script(f.dir.path(), "Alpha_1.20.1_25565_paper");
        f.manager.add(script.to_str().unwrap(), false, None).await.unwrap();
        f.manager.start("Alpha_1.20.1").await.unwrap();
        f.manager.stop("Alpha_1.20.1").await.unwrap();
        f.manager.remove("Alpha_1.20.1").await.unwrap();

        assert_eq!(f.manager.ctx.locks.len().await, 0);
    }

    #[tokio::test]
    async fn key_lock_survives_while_contended() {
        let locks = KeyLocks::default();
        let key = ServerKey::new("Alpha", "1.20.1");

        let held = locks.lock(&key).await;
        let waiter = tokio::spawn({
            let locks = locks.clone();
            let key = key.clone();
            async move {
                let _guard = locks.lock(&key).await;
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(locks.len().await, 1);

        drop(held);
        waiter.await.unwrap();
        assert_eq!(locks.len().await, 0);
    }

    #[tokio::test]
    async fn mod_changes_require_a_stopped_server() {
        let f = fixture();
        let script = make_script(f.dir.path(), "Alpha_1.20.1_25565_fabric");
        let mods_dir = script.with_file_name(MODS_DIR);
        std::fs::create_dir_all(&mods_dir).unwrap();
        write_jar(&mods_dir.join("sodium-0.5.8.jar"), Some(r#"{"id":"sodium"}"#));
        f.manager.add(script.to_str().unwrap(), false, None).await.unwrap();

        f.manager.start("Alpha_1.20.1").await.unwrap();
        let err = f
            .manager
            .set_mod_enabled("Alpha_1.20.1", "sodium", false)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::StillRunning(_)));
        let err = f.manager.refresh_mod_list("Alpha_1.20.1").await.unwrap_err();
        assert!(matches!(err, ManagerError::StillRunning(_)));
        // listing only reads
        let mods = f.manager.list_mods("Alpha_1.20.1").await.unwrap();
        assert_eq!(mods.len(), 1);
        assert!(mods_dir.join("sodium-0.5.8.jar").is_file());

        f.manager.stop("Alpha_1.20.1").await.unwrap();
        let entry = f
            .manager
            .set_mod_enabled("Alpha_1.20.1", "sodium", false)
            .await
            .unwrap();
        assert!(!entry.enabled);
        assert!(mods_dir.join("sodium-0.5.8.disabled").is_file());

        let mods = f.manager.refresh_mod_list("Alpha_1.20.1").await.unwrap();
        assert_eq!(mods[0].id(), Some("sodium"));
        let list = std::fs::read_to_string(mods_dir.join(MOD_LIST_FILE)).unwrap();
        assert_eq!(list, "sodium | sodium-0.5.8.disabled");

        let err = f.manager.list_mods("Ghost_1.0.0").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotFound(_)));
    }
}
