use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use notify::{
    Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher,
    event::{CreateKind, ModifyKind},
};
use once_cell::sync::Lazy;
use tokio::{
    sync::mpsc::UnboundedReceiver,
    task::JoinHandle,
    time::{Duration, sleep},
};
use tracing::{error, warn};

/// Every spawned watcher task, so `shutdown()` can abort them all at once.
static WATCHER_HANDLES: Lazy<Mutex<Vec<JoinHandle<()>>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Something that can be hot-reloaded from files on disk.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    fn is_relevant(&self, path: &Path) -> bool;
    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;
    async fn on_remove(&self, path: &Path) -> Result<()>;
}

/// Polls a directory and dispatches file events to a [`WatchedType`].
#[derive(Clone)]
pub struct DirectoryWatcher;

impl DirectoryWatcher {
    /// Starts watching `dir` for files matching `exts` or
    /// `WatchedType::is_relevant`. With `initial_scan`, existing files are
    /// loaded first; a file that fails is retried a few times before being
    /// skipped, so a half-written deploy does not get lost.
    pub async fn new(
        dir: PathBuf,
        watched: Arc<dyn WatchedType>,
        exts: &[&str],
        initial_scan: bool,
    ) -> Result<DirectoryWatcher> {
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
        }

        if initial_scan {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if watched.is_relevant(&path) || has_extension(&path, exts) {
                    load_with_retry(&watched, &path).await;
                }
            }
        }

        // The notify callback pushes events into a channel; a second task
        // drains it and calls back into the watched object. Send errors are
        // ignored, a dropped receiver means we are shutting down.
        let (tx, mut rx): (_, UnboundedReceiver<notify::Result<Event>>) =
            tokio::sync::mpsc::unbounded_channel();

        let dir_clone = dir.clone();
        let handle_watcher = tokio::spawn(async move {
            let poll_watcher = PollWatcher::new(
                move |res| {
                    let _ = tx.send(res);
                },
                // content comparison makes overwritten files surface as
                // data-change events, not just metadata touches
                Config::default()
                    .with_poll_interval(Duration::from_secs(2))
                    .with_compare_contents(true),
            );
            let mut poll_watcher = match poll_watcher {
                Ok(w) => w,
                Err(e) => {
                    error!("Failed to create watcher for {:?}: {e}", dir_clone);
                    return;
                }
            };
            if let Err(e) = poll_watcher.watch(&dir_clone, RecursiveMode::Recursive) {
                error!("Failed to watch {:?}: {e}", dir_clone);
                return;
            }
            // keep the poll watcher alive for as long as the task runs
            futures::future::pending::<()>().await;
        });

        let watched_clone = watched.clone();
        let exts_clone: Vec<String> = exts.iter().map(|s| s.to_string()).collect();
        let handle_dispatch = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(Event {
                        kind:
                            EventKind::Create(CreateKind::Any) | EventKind::Modify(ModifyKind::Data(_)),
                        paths,
                        ..
                    }) => {
                        for path in paths {
                            if !matches(&watched_clone, &path, &exts_clone) {
                                continue;
                            }
                            let watched_inner = watched_clone.clone();
                            tokio::spawn(async move {
                                if let Err(e) = watched_inner.on_create_or_modify(&path).await {
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
                        for path in paths {
                            if !matches(&watched_clone, &path, &exts_clone) {
                                continue;
                            }
                            if let Err(e) = watched_clone.on_remove(&path).await {
                                warn!(?path, ?e, "Failed to handle removal");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(?e, "Watcher error");
                    }
                    _ => {}
                }
            }
        });

        if let Ok(mut guard) = WATCHER_HANDLES.lock() {
            guard.push(handle_watcher);
            guard.push(handle_dispatch);
        }
        Ok(DirectoryWatcher {})
    }

    /// Aborts every spawned watcher task. No events are dispatched after
    /// this returns.
    pub fn shutdown(self) {
        if let Ok(mut guard) = WATCHER_HANDLES.lock() {
            for handle in guard.drain(..) {
                handle.abort();
            }
        }
    }
}

fn matches(watched: &Arc<dyn WatchedType>, path: &Path, exts: &[String]) -> bool {
    watched.is_relevant(path)
        || path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| exts.iter().any(|x| x == e))
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| extensions.iter().any(|&e| e == ext))
}

async fn load_with_retry(watched: &Arc<dyn WatchedType>, path: &Path) {
    const MAX_RETRIES: usize = 3;

    for attempt in 0..MAX_RETRIES {
        match watched.on_create_or_modify(path).await {
            Ok(_) => return,
            Err(e) if attempt + 1 == MAX_RETRIES => {
                error!("Failed to load {:?}: {e:?}", path);
            }
            Err(e) => {
                warn!("Retrying load of {:?} (attempt {}): {e:?}", path, attempt + 1);
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
