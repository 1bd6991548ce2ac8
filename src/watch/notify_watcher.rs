use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode, Watcher};
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use walkdir::WalkDir;

use super::{WatchEvent, WatchSource};
use crate::error::WatchError;

const DEBOUNCE_WINDOW: Duration = Duration::from_millis(200);

/// Watches a spool directory for new files via native OS events, backstopped
/// by a periodic directory walk that catches anything the native watcher
/// missed (spec.md §4.2): a crash between event delivery and file removal,
/// a network filesystem that drops inotify events, a file written before
/// the watcher started.
pub struct DirectoryWatcher {
    root: PathBuf,
    extensions: Vec<String>,
    tx: mpsc::UnboundedSender<WatchEvent>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<WatchEvent>>,
    notified: Arc<Mutex<HashSet<PathBuf>>>,
    // Kept alive for the lifetime of the watcher; dropping it stops delivery.
    _debouncer: Debouncer<notify::RecommendedWatcher, RecommendedCache>,
}

/// True iff `kind` is a file-closed-for-write or file-moved-into event
/// (spec.md §4.2): the only two kinds that mean "a new file finished
/// arriving", as opposed to a plain create (still being written), a bare
/// rename-from, or removal (e.g. this watcher's own post-upload delete).
fn is_arrival_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Access(AccessKind::Close(AccessMode::Write))
            | EventKind::Modify(ModifyKind::Name(RenameMode::To))
    )
}

/// True iff `path` is a regular file whose extension is one of `extensions`
/// (spec.md §4.2's watcher filter; case-sensitive, without the leading dot).
fn has_accepted_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|accepted| accepted == ext))
}

impl DirectoryWatcher {
    /// Starts watching `root` and spawns the periodic missed-file sweep.
    /// `cancellation` stops the sweep task; the native watcher stops when
    /// the returned `DirectoryWatcher` is dropped. Only regular files under
    /// `root` whose extension is in `extensions` are ever emitted.
    pub fn start(
        root: PathBuf,
        extensions: Vec<String>,
        missed_file_age: Duration,
        missed_sweep_interval: Duration,
        cancellation: CancellationToken,
    ) -> Result<Arc<Self>, WatchError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let notified = Arc::new(Mutex::new(HashSet::new()));

        let debounce_tx = tx.clone();
        let debounce_notified = Arc::clone(&notified);
        let debounce_extensions = extensions.clone();
        let mut debouncer = new_debouncer(
            DEBOUNCE_WINDOW,
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    for event in events {
                        if !is_arrival_event(&event.event.kind) {
                            continue;
                        }
                        for path in &event.event.paths {
                            if path.is_dir() {
                                continue;
                            }
                            if !has_accepted_extension(path, &debounce_extensions) {
                                continue;
                            }
                            let fresh = debounce_notified
                                .lock()
                                .expect("notified set poisoned")
                                .insert(path.clone());
                            if !fresh {
                                continue;
                            }
                            debug!(path = %path.display(), "native watch event");
                            if debounce_tx
                                .send(WatchEvent {
                                    path: path.clone(),
                                    missed: false,
                                })
                                .is_err()
                            {
                                warn!("watch event channel closed, dropping event");
                            }
                        }
                    }
                }
                Err(errors) => {
                    for err in errors {
                        error!(error = %err, "native watcher error");
                    }
                }
            },
        )
        .map_err(WatchError::Init)?;

        debouncer
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|source| WatchError::Watch {
                path: root.clone(),
                source,
            })?;

        let watcher = Arc::new(Self {
            root: root.clone(),
            extensions,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            notified,
            _debouncer: debouncer,
        });

        // The sweep task only needs to check-and-mark a path and send; it
        // never touches `_debouncer`, so it holds a weak-free clone of the
        // fields it needs rather than the whole watcher.
        let sweep_watcher = Arc::clone(&watcher);
        tokio::spawn(async move {
            sweep_watcher
                .run_sweep_loop(missed_file_age, missed_sweep_interval, cancellation)
                .await;
        });

        Ok(watcher)
    }

    async fn run_sweep_loop(
        &self,
        missed_file_age: Duration,
        missed_sweep_interval: Duration,
        cancellation: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(missed_sweep_interval);
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    debug!("missed-file sweep shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_once(missed_file_age) {
                        error!(error = %err, "missed-file sweep failed");
                    }
                }
            }
        }
    }

    fn sweep_once(&self, missed_file_age: Duration) -> Result<(), WatchError> {
        let now = std::time::SystemTime::now();
        for entry in WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path().to_path_buf();
            if !has_accepted_extension(&path, &self.extensions) {
                continue;
            }
            let age = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|modified| now.duration_since(modified).ok());

            let Some(age) = age else { continue };
            if age < missed_file_age {
                continue;
            }
            if !self.mark_notified(&path) {
                continue;
            }

            debug!(path = %path.display(), "missed-file sweep found unconsumed file");
            if self
                .tx
                .send(WatchEvent {
                    path,
                    missed: true,
                })
                .is_err()
            {
                warn!("watch event channel closed, dropping missed-file event");
            }
        }
        Ok(())
    }

    /// Returns true if `path` was not already tracked, inserting it.
    fn mark_notified(&self, path: &Path) -> bool {
        self.notified
            .lock()
            .expect("notified set poisoned")
            .insert(path.to_path_buf())
    }
}

#[async_trait]
impl WatchSource for DirectoryWatcher {
    async fn next_event(&self) -> Option<WatchEvent> {
        self.rx.lock().await.recv().await
    }

    fn ack(&self, path: &Path) {
        self.notified
            .lock()
            .expect("notified set poisoned")
            .remove(path);
    }
}
