//! Bundling Engine (spec.md §4.3): one instance per datatype, single-fiber
//! by design — the active-bundle map and in-flight identifier set are only
//! ever touched from this module's own `run` loop, never shared behind a
//! lock. Everything else (watching, uploading) is an external collaborator
//! reached through a trait.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bundle::{BundleParams, BundleRecord};
use crate::error::EngineError;
use crate::metrics::BundleMetrics;
use crate::store::{gzip, ObjectStore};
use crate::watch::{WatchEvent, WatchSource};

/// Static identity fields every bundle created by this engine shares.
pub struct EngineIdentity {
    pub datatype: String,
    pub experiment: String,
    pub machine: String,
    pub site: String,
    pub object_store_home: String,
    pub archiver_version: String,
    pub archiver_git_commit: String,
}

/// Tuning knobs the engine needs from the configuration surface.
pub struct EngineTuning {
    pub spool_root: PathBuf,
    pub bundle_size_max: u64,
    pub bundle_age_max: Duration,
    pub flush_timeout: Duration,
    pub keep_local_files: bool,
}

enum EngineMsg {
    File(WatchEvent),
    AgeFired {
        date: NaiveDate,
        bundle_id: DateTime<Utc>,
    },
    UploadDone {
        bundle_id: DateTime<Utc>,
    },
}

struct ActiveBundle {
    record: BundleRecord,
    age_timer: JoinHandle<()>,
}

pub struct Engine {
    identity: EngineIdentity,
    tuning: EngineTuning,
    watch: Arc<dyn WatchSource>,
    store: Arc<dyn ObjectStore>,
    metrics: Arc<dyn BundleMetrics>,
    cancellation: CancellationToken,

    active: HashMap<NaiveDate, ActiveBundle>,
    in_flight: HashSet<DateTime<Utc>>,
    upload_handles: Vec<JoinHandle<()>>,

    msg_tx: mpsc::UnboundedSender<EngineMsg>,
    msg_rx: mpsc::UnboundedReceiver<EngineMsg>,
}

impl Engine {
    pub fn new(
        identity: EngineIdentity,
        tuning: EngineTuning,
        watch: Arc<dyn WatchSource>,
        store: Arc<dyn ObjectStore>,
        metrics: Arc<dyn BundleMetrics>,
        cancellation: CancellationToken,
    ) -> Self {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        Self {
            identity,
            tuning,
            watch,
            store,
            metrics,
            cancellation,
            active: HashMap::new(),
            in_flight: HashSet::new(),
            upload_handles: Vec::new(),
            msg_tx,
            msg_rx,
        }
    }

    /// Drains watch events and age-timer firings until cancelled, then
    /// flushes every still-active bundle before returning.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.cancellation.cancelled() => {
                    info!(datatype = %self.identity.datatype, "engine shutting down, flushing active bundles");
                    self.flush().await;
                    return;
                }
                event = self.watch.next_event() => {
                    match event {
                        Some(event) => self.handle_message(EngineMsg::File(event)).await,
                        None => {
                            warn!(datatype = %self.identity.datatype, "watch source closed, flushing and exiting");
                            self.flush().await;
                            return;
                        }
                    }
                }
                Some(msg) = self.msg_rx.recv() => {
                    self.handle_message(msg).await;
                }
            }
        }
    }

    async fn handle_message(&mut self, msg: EngineMsg) {
        match msg {
            EngineMsg::File(event) => self.handle_file_event(event).await,
            EngineMsg::AgeFired { date, bundle_id } => self.handle_age_fired(date, bundle_id).await,
            EngineMsg::UploadDone { bundle_id } => {
                self.in_flight.remove(&bundle_id);
            }
        }
    }

    async fn handle_file_event(&mut self, event: WatchEvent) {
        let (date, file_size) = match validate_path(
            &self.tuning.spool_root,
            &self.identity.experiment,
            &self.identity.datatype,
            &event.path,
            self.tuning.bundle_size_max,
        ) {
            Ok(v) => v,
            Err(err) => {
                warn!(path = %event.path.display(), error = %err, missed = event.missed, "rejecting watch event");
                return;
            }
        };

        self.ensure_bundle(date);
        if self.active[&date].record.has_file(&event.path) {
            error!(path = %event.path.display(), "internal invariant violated: file already tracked in active bundle, ignoring duplicate event");
            return;
        }

        // Threshold is checked against the file about to be added, before
        // it is added (spec.md §4.3): a file that would overflow the
        // active bundle triggers and replaces it first, so the triggering
        // file starts the next bundle rather than joining the one it
        // overflowed.
        let current_size = self.active[&date].record.size();
        if current_size + file_size > self.tuning.bundle_size_max {
            let bundle_id = self.active[&date].record.created_at();
            info!(
                datatype = %self.identity.datatype,
                date = %date,
                current_size,
                file_size,
                "bundle would exceed size threshold, promoting before adding"
            );
            self.promote(date, bundle_id);
            self.ensure_bundle(date);
        }

        let bundle = &mut self.active.get_mut(&date).expect("just ensured").record;
        if let Err(err) = bundle.add_file(
            &event.path,
            &self.identity.archiver_version,
            &self.identity.archiver_git_commit,
        ) {
            warn!(path = %event.path.display(), error = %err, "file rejected as bad");
        }
    }

    async fn handle_age_fired(&mut self, date: NaiveDate, bundle_id: DateTime<Utc>) {
        if self.in_flight.contains(&bundle_id) {
            debug!(%bundle_id, "age timer fired for a bundle already in flight, ignoring");
            return;
        }
        let still_current = self
            .active
            .get(&date)
            .map(|active| active.record.created_at() == bundle_id)
            .unwrap_or(false);
        if !still_current {
            debug!(%bundle_id, "age timer fired for a bundle already promoted, ignoring");
            return;
        }
        info!(datatype = %self.identity.datatype, date = %date, "bundle reached age threshold, promoting");
        self.promote(date, bundle_id);
    }

    fn ensure_bundle(&mut self, date: NaiveDate) {
        if !self.active.contains_key(&date) {
            let created_at = Utc::now();
            let record = BundleRecord::new(BundleParams {
                datatype: &self.identity.datatype,
                experiment: &self.identity.experiment,
                machine: &self.identity.machine,
                site: &self.identity.site,
                object_store_home: &self.identity.object_store_home,
                date,
                created_at,
            });

            let tx = self.msg_tx.clone();
            let age_max = self.tuning.bundle_age_max;
            let age_timer = tokio::spawn(async move {
                tokio::time::sleep(age_max).await;
                let _ = tx.send(EngineMsg::AgeFired {
                    date,
                    bundle_id: created_at,
                });
            });

            self.active.insert(date, ActiveBundle { record, age_timer });
        }
    }

    /// Removes the active bundle for `date`, marks its identity as
    /// in-flight, and spawns an independent upload task that owns it from
    /// here on.
    ///
    /// The bundle's age timer is deliberately left running rather than
    /// aborted (spec.md §9): it is harmless dangling state, and
    /// `handle_age_fired`'s in-flight check absorbs its eventual firing.
    fn promote(&mut self, date: NaiveDate, bundle_id: DateTime<Utc>) {
        let Some(active) = self.active.remove(&date) else {
            return;
        };
        self.in_flight.insert(bundle_id);

        let store = Arc::clone(&self.store);
        let metrics = Arc::clone(&self.metrics);
        let watch = Arc::clone(&self.watch);
        let datatype = self.identity.datatype.clone();
        let keep_local_files = self.tuning.keep_local_files;
        let done_tx = self.msg_tx.clone();

        let handle = tokio::spawn(async move {
            upload_bundle(active.record, &datatype, &*store, &*metrics, &*watch, keep_local_files).await;
            let _ = done_tx.send(EngineMsg::UploadDone { bundle_id });
        });
        self.upload_handles.push(handle);
    }

    /// Promotes every remaining active bundle and waits up to
    /// `flush_timeout` for all outstanding uploads to finish.
    async fn flush(&mut self) {
        let dates: Vec<NaiveDate> = self.active.keys().copied().collect();
        for date in dates {
            let bundle_id = self.active[&date].record.created_at();
            self.promote(date, bundle_id);
        }

        let handles = std::mem::take(&mut self.upload_handles);
        let join_all = futures::future::join_all(handles);
        if tokio::time::timeout(self.tuning.flush_timeout, join_all)
            .await
            .is_err()
        {
            error!(
                datatype = %self.identity.datatype,
                timeout = ?self.tuning.flush_timeout,
                "flush timed out with uploads still outstanding"
            );
        }
    }
}

async fn upload_bundle(
    record: BundleRecord,
    datatype: &str,
    store: &dyn ObjectStore,
    metrics: &dyn BundleMetrics,
    watch: &dyn WatchSource,
    keep_local_files: bool,
) {
    let description = record.description();

    let data_bytes = match gzip(record.marshal_data().as_bytes()) {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(%description, error = %err, "failed to compress data bundle");
            return;
        }
    };
    let index_text = match record.marshal_index() {
        Ok(text) => text,
        Err(err) => {
            error!(%description, error = %err, "failed to marshal index");
            return;
        }
    };
    let index_bytes = match gzip(index_text.as_bytes()) {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(%description, error = %err, "failed to compress index bundle");
            return;
        }
    };

    let data_len = data_bytes.len() as u64;
    let index_len = index_bytes.len() as u64;

    // Data is uploaded before its index: a reader that sees the index must
    // be able to find the data it describes.
    if let Err(err) = store.upload(record.data_object_path(), data_bytes).await {
        error!(%description, error = %err, "failed to upload data bundle");
        return;
    }
    if let Err(err) = store.upload(record.index_object_path(), index_bytes).await {
        error!(%description, error = %err, "failed to upload index bundle");
        return;
    }

    // Histogram of compressed bundle size, labeled by datatype; the index
    // blob is labeled with the special datatype `index1` (spec.md §4.3).
    metrics.observe_bundle_size(datatype, data_len);
    metrics.observe_bundle_size("index1", index_len);
    record.remove_local_files(keep_local_files);

    for filename in record.index_filenames() {
        watch.ack(Path::new(&filename));
    }
    for path in record.bad_files() {
        watch.ack(path);
    }

    info!(%description, lines = record.line_count(), "uploaded bundle");
}

/// Checks that a watch event's path belongs under
/// `<spool_root>/<experiment>/<datatype>/<year>/<month>/<day>/<filename>`
/// (spec.md §6) and returns the date it belongs to plus its size in bytes
/// (spec.md §4.3, the six-point validation list).
fn validate_path(
    spool_root: &Path,
    experiment: &str,
    datatype: &str,
    path: &Path,
    size_max: u64,
) -> Result<(NaiveDate, u64), EngineError> {
    let reject = |reason: &str| EngineError::InvalidPath {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let path_str = path.to_string_lossy();
    if path_str.contains("..") {
        return Err(reject("path contains '..'"));
    }
    if !path_str
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | ':' | '.' | '_' | '-'))
    {
        return Err(reject("path contains characters outside [a-zA-Z0-9/:._-]"));
    }

    let datatype_root = spool_root.join(experiment).join(datatype);
    let remainder = path
        .strip_prefix(&datatype_root)
        .map_err(|_| reject("outside this datatype's spool root"))?;

    let components: Vec<&str> = remainder
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect();
    let [year, month, day, filename] = components.as_slice() else {
        return Err(reject("expected <year>/<month>/<day>/<filename>"));
    };

    if filename.starts_with('.') {
        return Err(reject("hidden or partial file"));
    }

    let (year, month, day): (i32, u32, u32) = (
        year.parse().map_err(|_| reject("non-numeric year"))?,
        month.parse().map_err(|_| reject("non-numeric month"))?,
        day.parse().map_err(|_| reject("non-numeric day"))?,
    );
    if !year.to_string().starts_with("20") || year.to_string().len() != 4 {
        return Err(reject("year must be a 4-digit year starting with 20"));
    }
    let date = NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| reject("not a valid calendar date"))?;

    let metadata = std::fs::symlink_metadata(path).map_err(|_| reject("file does not exist"))?;
    if !metadata.is_file() {
        return Err(reject("not a regular file"));
    }
    let len = metadata.len();
    if len == 0 {
        return Err(reject("file is empty"));
    }
    if len > size_max {
        return Err(reject("file exceeds configured bundle size max"));
    }

    Ok((date, len))
}
