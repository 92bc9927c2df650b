//! Hot reload: watch the scripts directory and reload a plugin's module when
//! its script file changes.

use anyhow::{Result, bail};
use async_trait::async_trait;
use notify::{
    Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher,
    event::{CreateKind, MetadataKind, ModifyKind},
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::{
    sync::mpsc::UnboundedReceiver,
    task::JoinHandle,
    time::{Duration, sleep},
};
use tracing::{debug, error, info, warn};

use crate::interpreter::runtime::SCRIPT_EXTENSION;
use crate::plugin::ScriptDeliveryPlugin;

pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Something that reacts to files appearing, changing or vanishing.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    fn is_relevant(&self, path: &Path) -> bool;

    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;

    async fn on_remove(&self, path: &Path) -> Result<()>;

    async fn reload(&self, path: &Path) -> Result<()> {
        self.on_create_or_modify(path).await
    }
}

/// Events that mean a file now has new contents. The poll watcher reports a
/// plain rewrite as a write-time change, and a same-second rewrite as a
/// content change.
fn is_write(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(CreateKind::Any | CreateKind::File)
            | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any)
            | EventKind::Modify(ModifyKind::Metadata(MetadataKind::WriteTime | MetadataKind::Any))
    )
}

/// The two tasks watching one directory. Dropping the watcher stops them.
#[derive(Debug)]
pub struct DirectoryWatcher {
    dir: PathBuf,
    handles: Vec<JoinHandle<()>>,
}

impl DirectoryWatcher {
    /// Watch `dir` and dispatch events for paths the watched type finds
    /// relevant. With `initial_scan`, existing relevant files are reloaded
    /// first, retried a few times when `enable_retry` is set.
    pub async fn new(
        dir: PathBuf,
        watched: Arc<dyn WatchedType>,
        initial_scan: bool,
        enable_retry: bool,
    ) -> Result<DirectoryWatcher> {
        Self::with_poll_interval(dir, watched, initial_scan, enable_retry, POLL_INTERVAL).await
    }

    pub async fn with_poll_interval(
        dir: PathBuf,
        watched: Arc<dyn WatchedType>,
        initial_scan: bool,
        enable_retry: bool,
        poll_interval: Duration,
    ) -> Result<DirectoryWatcher> {
        if !dir.is_dir() {
            let msg = format!("Directory {} does not exist", dir.display());
            warn!(%msg);
            bail!(msg);
        }

        if initial_scan {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if watched.is_relevant(&path) {
                    try_reload(&watched, &path, enable_retry).await;
                }
            }
        }

        let (tx, mut rx): (_, UnboundedReceiver<notify::Result<Event>>) = tokio::sync::mpsc::unbounded_channel();

        let mut watcher = PollWatcher::new(
            move |res| {
                // nobody listening once rx is gone
                let _ = tx.send(res);
            },
            Config::default()
                .with_poll_interval(poll_interval)
                .with_compare_contents(true),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let handle_watcher = tokio::spawn(async move {
            // owns the poll watcher for as long as the task lives
            let _watcher = watcher;
            futures::future::pending::<()>().await;
        });

        let handle_dispatch = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(Event { kind, paths, .. }) if is_write(&kind) => {
                        for path in paths.into_iter().filter(|p| watched.is_relevant(p)) {
                            let inner = Arc::clone(&watched);
                            tokio::spawn(async move {
                                if let Err(e) = inner.on_create_or_modify(&path).await {
                                    warn!(?path, ?e, "Failed to handle create/modify");
                                }
                            });
                        }
                    }
                    Ok(Event {
                        kind: EventKind::Remove(_),
                        paths,
                        ..
                    }) => {
                        for path in paths.into_iter().filter(|p| watched.is_relevant(p)) {
                            if let Err(e) = watched.on_remove(&path).await {
                                warn!(?path, ?e, "Failed to handle removal");
                            }
                        }
                    }
                    Ok(event) => debug!(kind = ?event.kind, "ignored watcher event"),
                    Err(e) => warn!(?e, "Watcher error"),
                }
            }
        });

        info!(dir = %dir.display(), "watching scripts directory");
        Ok(DirectoryWatcher {
            dir,
            handles: vec![handle_dispatch, handle_watcher],
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_running(&self) -> bool {
        self.handles.iter().all(|handle| !handle.is_finished())
    }

    /// Stop this watcher. No event is dispatched afterwards.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

async fn try_reload(watched: &Arc<dyn WatchedType>, path: &Path, retry: bool) {
    const MAX_RETRIES: usize = 10;

    for attempt in 0..MAX_RETRIES {
        match watched.reload(path).await {
            Ok(()) => return,
            Err(e) if !retry || attempt == MAX_RETRIES - 1 => {
                error!("Failed to reload {:?}: {e:?}", path);
                return;
            }
            Err(e) => {
                warn!("Retrying reload {:?} (attempt {}): {e:?}", path, attempt + 1);
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Reloads a plugin's script module when its file is written.
pub struct ScriptWatcher {
    plugin: Arc<ScriptDeliveryPlugin>,
}

impl ScriptWatcher {
    pub fn new(plugin: Arc<ScriptDeliveryPlugin>) -> Self {
        Self { plugin }
    }
}

#[async_trait]
impl WatchedType for ScriptWatcher {
    fn is_relevant(&self, path: &Path) -> bool {
        path.extension().and_then(|e| e.to_str()) == Some(SCRIPT_EXTENSION)
    }

    async fn on_create_or_modify(&self, path: &Path) -> Result<()> {
        let plugin = Arc::clone(&self.plugin);
        let owned = path.to_path_buf();
        // script execution takes the runtime lock, keep it off the async workers
        let reloaded = tokio::task::spawn_blocking(move || plugin.reload_script(&owned)).await?;
        match reloaded {
            Some(true) => info!(path = %path.display(), "script reloaded"),
            Some(false) => bail!("script {} changed but could not be reloaded", path.display()),
            None => debug!(path = %path.display(), "not this plugin's script"),
        }
        Ok(())
    }

    async fn on_remove(&self, path: &Path) -> Result<()> {
        if path.file_name().and_then(|n| n.to_str()) == Some(self.plugin.script_identifier().as_str()) {
            warn!(path = %path.display(), "script removed, the loaded version stays in use");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::InterpreterSession;
    use delivery_plugin::ConfigCategory;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingWatcher {
        created: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WatchedType for CountingWatcher {
        fn is_relevant(&self, path: &Path) -> bool {
            path.extension().and_then(|e| e.to_str()) == Some("rhai")
        }

        async fn on_create_or_modify(&self, _path: &Path) -> Result<()> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_remove(&self, _path: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn plugin_in(dir: &Path) -> Arc<ScriptDeliveryPlugin> {
        let json = json!({
            "enable": { "type": "boolean", "value": "true" },
            "script": { "type": "script", "file": "/s/watch_script_deliver.rhai" }
        });
        let category = ConfigCategory::from_json("watch", &json.to_string()).unwrap();
        Arc::new(
            ScriptDeliveryPlugin::with_session(&category, InterpreterSession::isolated("watch"), dir).unwrap(),
        )
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let watched: Arc<dyn WatchedType> = Arc::new(CountingWatcher {
            created: Arc::new(AtomicUsize::new(0)),
        });
        assert!(
            DirectoryWatcher::new(PathBuf::from("/definitely/not/here"), watched, false, false)
                .await
                .is_err()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn initial_scan_visits_relevant_files_only() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a_script_deliver.rhai"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();

        let created = Arc::new(AtomicUsize::new(0));
        let watched: Arc<dyn WatchedType> = Arc::new(CountingWatcher {
            created: Arc::clone(&created),
        });
        let watcher = DirectoryWatcher::new(dir.path().to_path_buf(), watched, true, false)
            .await
            .unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);
        watcher.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn script_watcher_reloads_the_configured_script() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("watch_script_deliver.rhai");
        std::fs::write(&script, r#"fn deliver(m) { throw "old"; }"#).unwrap();
        let plugin = plugin_in(dir.path());
        let watcher = ScriptWatcher::new(Arc::clone(&plugin));

        assert!(!plugin.gate().notify("before"));
        std::fs::write(&script, "fn deliver(m) { }").unwrap();
        watcher.on_create_or_modify(&script).await.unwrap();
        assert!(plugin.gate().notify("after"));

        // another script in the same directory is left alone
        watcher
            .on_create_or_modify(&dir.path().join("other_script_send.rhai"))
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn broken_edit_is_reported() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("watch_script_deliver.rhai");
        std::fs::write(&script, "fn deliver(m) { }").unwrap();
        let plugin = plugin_in(dir.path());
        let watcher = ScriptWatcher::new(Arc::clone(&plugin));

        std::fs::write(&script, "fn deliver(m) {").unwrap();
        // reload fails, the cached module still resolves
        let _ = watcher.on_create_or_modify(&script).await;
        assert!(plugin.gate().notify("still delivering"));

        std::fs::write(&script, "fn other(m) { }").unwrap();
        assert!(watcher.on_create_or_modify(&script).await.is_err());
    }

    #[test]
    fn write_time_change_counts_as_a_write() {
        assert!(is_write(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::WriteTime))));
        assert!(is_write(&EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Content))));
        assert!(!is_write(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rewritten_script_is_picked_up_by_the_poll_watcher() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("watch_script_deliver.rhai");
        std::fs::write(&script, r#"fn deliver(m) { throw "old"; }"#).unwrap();
        let plugin = plugin_in(dir.path());
        assert!(!plugin.gate().notify("before"));

        let watched: Arc<dyn WatchedType> = Arc::new(ScriptWatcher::new(Arc::clone(&plugin)));
        let interval = Duration::from_millis(100);
        let watcher = DirectoryWatcher::with_poll_interval(dir.path().to_path_buf(), watched, false, false, interval)
            .await
            .unwrap();

        // let the first poll record the old contents
        sleep(interval * 3).await;
        std::fs::write(&script, "fn deliver(m) { }").unwrap();

        let mut delivered = false;
        for _ in 0..50 {
            sleep(interval).await;
            let gate_plugin = Arc::clone(&plugin);
            if tokio::task::spawn_blocking(move || gate_plugin.gate().notify("after"))
                .await
                .unwrap()
            {
                delivered = true;
                break;
            }
        }
        watcher.shutdown();
        assert!(delivered, "the rewritten script was never reloaded");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_stops_only_its_own_watcher() {
        let first_dir = TempDir::new().unwrap();
        let second_dir = TempDir::new().unwrap();
        let counting = || -> Arc<dyn WatchedType> {
            Arc::new(CountingWatcher {
                created: Arc::new(AtomicUsize::new(0)),
            })
        };

        let first = DirectoryWatcher::new(first_dir.path().to_path_buf(), counting(), false, false)
            .await
            .unwrap();
        let second = DirectoryWatcher::new(second_dir.path().to_path_buf(), counting(), false, false)
            .await
            .unwrap();
        assert!(first.is_running() && second.is_running());

        first.shutdown();
        sleep(Duration::from_millis(50)).await;
        assert!(second.is_running());
        second.shutdown();
    }
}
