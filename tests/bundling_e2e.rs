//! End-to-end scenarios from spec.md §8, exercised against a real
//! `DirectoryWatcher` (native events + missed-file sweep) and a real
//! `LocalObjectStore`, with an `InMemoryMetrics` double standing in for the
//! out-of-scope metrics backend.

use std::path::PathBuf;
use std::time::Duration;

use autoloader::engine::{Engine, EngineIdentity, EngineTuning};
use autoloader::metrics::{BundleMetrics, InMemoryMetrics};
use autoloader::store::{gzip, LocalObjectStore, ObjectStore};
use autoloader::watch::{DirectoryWatcher, WatchSource};
use flate2::read::GzDecoder;
use std::io::Read;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn decompress(bytes: &[u8]) -> String {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = String::new();
    decoder.read_to_string(&mut out).unwrap();
    out
}

struct Harness {
    spool_root: TempDir,
    store_root: TempDir,
    store: Arc<LocalObjectStore>,
    metrics: Arc<InMemoryMetrics>,
    cancellation: CancellationToken,
    engine_handle: Option<tokio::task::JoinHandle<()>>,
}

impl Harness {
    fn start(datatype: &str, bundle_size_max: u64, bundle_age_max: Duration) -> Self {
        let spool_root = TempDir::new().unwrap();
        let store_root = TempDir::new().unwrap();
        let store = Arc::new(LocalObjectStore::new(store_root.path().to_path_buf()));
        let metrics = Arc::new(InMemoryMetrics::new());
        let cancellation = CancellationToken::new();

        let datatype_root = spool_root.path().join("ndt").join(datatype);
        std::fs::create_dir_all(&datatype_root).unwrap();

        let watch: Arc<dyn WatchSource> = DirectoryWatcher::start(
            datatype_root,
            vec!["json".to_string()],
            Duration::from_millis(200),
            Duration::from_millis(100),
            cancellation.clone(),
        )
        .unwrap();

        let identity = EngineIdentity {
            datatype: datatype.to_string(),
            experiment: "ndt".to_string(),
            machine: "mlab1".to_string(),
            site: "lga03".to_string(),
            object_store_home: "autoload/v1".to_string(),
            archiver_version: "test-version".to_string(),
            archiver_git_commit: "abc123".to_string(),
        };
        let tuning = EngineTuning {
            spool_root: spool_root.path().to_path_buf(),
            bundle_size_max,
            bundle_age_max,
            flush_timeout: Duration::from_secs(5),
            keep_local_files: false,
        };

        let engine = Engine::new(
            identity,
            tuning,
            watch,
            store.clone() as Arc<dyn ObjectStore>,
            metrics.clone() as Arc<dyn BundleMetrics>,
            cancellation.clone(),
        );
        let engine_handle = tokio::spawn(engine.run());

        Self {
            spool_root,
            store_root,
            store,
            metrics,
            cancellation,
            engine_handle: Some(engine_handle),
        }
    }

    fn write_file(&self, datatype: &str, date: &str, name: &str, contents: &str) -> PathBuf {
        let (y, m, d) = {
            let mut it = date.split('-');
            (
                it.next().unwrap(),
                it.next().unwrap(),
                it.next().unwrap(),
            )
        };
        let dir = self
            .spool_root
            .path()
            .join("ndt")
            .join(datatype)
            .join(y)
            .join(m)
            .join(d);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    async fn wait_for_object(&self, predicate: impl Fn(&str) -> bool, timeout: Duration) -> String {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(found) = self.find_object(&predicate) {
                return found;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for matching object in store");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn find_object(&self, predicate: &impl Fn(&str) -> bool) -> Option<String> {
        for entry in walkdir::WalkDir::new(self.store_root.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let rel = entry
                .path()
                .strip_prefix(self.store_root.path())
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/");
            if predicate(&rel) {
                return Some(rel);
            }
        }
        None
    }

    async fn shutdown(mut self) {
        self.cancellation.cancel();
        if let Some(handle) = self.engine_handle.take() {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("engine did not shut down in time")
                .expect("engine task panicked");
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn single_file_happy_path() {
    let harness = Harness::start("foo1", 1024 * 1024, Duration::from_secs(3600));
    let path = harness.write_file("foo1", "2024-01-15", "a.json", r#"{"UUID":"u","V":1}"#);

    let data_rel = harness
        .wait_for_object(
            |p| p.contains("/foo1/date=2024-01-15/") && p.ends_with("-data.jsonl.gz"),
            Duration::from_secs(5),
        )
        .await;

    let data_bytes = harness.store.download(&data_rel).await.unwrap().unwrap();
    let data_text = decompress(&data_bytes);
    let lines: Vec<&str> = data_text.lines().collect();
    assert_eq!(lines.len(), 1);
    let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(parsed["raw"]["UUID"], "u");
    assert_eq!(parsed["raw"]["V"], 1);
    assert_eq!(
        parsed["archiver"]["Filename"],
        path.to_string_lossy().to_string()
    );

    let index_rel = harness
        .wait_for_object(
            |p| p.contains("/index1/date=2024-01-15/") && p.ends_with("-index1.jsonl.gz"),
            Duration::from_secs(5),
        )
        .await;
    let index_bytes = harness.store.download(&index_rel).await.unwrap().unwrap();
    let index_text = decompress(&index_bytes);
    let index_lines: Vec<&str> = index_text.lines().collect();
    assert_eq!(index_lines.len(), 1);
    let index_entry: serde_json::Value = serde_json::from_str(index_lines[0]).unwrap();
    assert_eq!(index_entry["Filename"], path.to_string_lossy().to_string());

    // Local files are removed once the upload completes.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while path.exists() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!path.exists(), "input file should be removed after upload");

    assert_eq!(harness.metrics.sizes_for("foo1").len(), 1);
    assert_eq!(harness.metrics.sizes_for("index1").len(), 1);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn size_trigger_splits_into_two_bundles() {
    // Each file's encoded line is well over 60 bytes once wrapped in the
    // envelope, so a size-max of 100 forces one file per bundle.
    let harness = Harness::start("foo1", 100, Duration::from_secs(3600));

    harness.write_file("foo1", "2024-01-15", "a.json", r#"{"UUID":"aaaaaaaaaaaaaaaaaaaa"}"#);
    // Give the engine a moment to pick up and bundle the first file before
    // the second arrives, matching the scenario's sequential writes.
    tokio::time::sleep(Duration::from_millis(150)).await;
    harness.write_file("foo1", "2024-01-15", "b.json", r#"{"UUID":"bbbbbbbbbbbbbbbbbbbb"}"#);

    harness
        .wait_for_object(
            |p| p.contains("/foo1/date=2024-01-15/") && p.ends_with("-data.jsonl.gz"),
            Duration::from_secs(5),
        )
        .await;

    // Flush whatever remains active (the second bundle, age-bound) so both
    // bundles are visible in the store for assertion.
    harness.cancellation.cancel();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut data_bundles = Vec::new();
    for entry in walkdir::WalkDir::new(harness.store_root.path())
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let rel = entry
            .path()
            .strip_prefix(harness.store_root.path())
            .unwrap()
            .to_string_lossy()
            .to_string();
        if rel.contains("/foo1/date=2024-01-15/") && rel.ends_with("-data.jsonl.gz") {
            data_bundles.push(rel);
        }
    }
    assert_eq!(data_bundles.len(), 2, "expected one bundle per file");

    let mut uuids = Vec::new();
    for rel in &data_bundles {
        let bytes = harness.store.download(rel).await.unwrap().unwrap();
        let text = decompress(&bytes);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1, "each bundle should hold exactly one file");
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        uuids.push(parsed["raw"]["UUID"].as_str().unwrap().to_string());
    }
    uuids.sort();
    assert_eq!(uuids, vec!["aaaaaaaaaaaaaaaaaaaa", "bbbbbbbbbbbbbbbbbbbb"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn age_trigger_uploads_after_idle() {
    let harness = Harness::start("foo1", 1024 * 1024, Duration::from_millis(300));
    harness.write_file("foo1", "2024-01-15", "a.json", r#"{"UUID":"u"}"#);

    let data_rel = harness
        .wait_for_object(
            |p| p.contains("/foo1/date=2024-01-15/") && p.ends_with("-data.jsonl.gz"),
            Duration::from_secs(3),
        )
        .await;
    let bytes = harness.store.download(&data_rel).await.unwrap().unwrap();
    let text = decompress(&bytes);
    assert_eq!(text.lines().count(), 1);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_file_is_isolated_and_still_removed() {
    let harness = Harness::start("foo1", 1024 * 1024, Duration::from_secs(3600));
    let good = harness.write_file("foo1", "2024-01-15", "a.json", r#"{"UUID":"good"}"#);
    let bad = harness.write_file("foo1", "2024-01-15", "b.json", "not json");

    // Age-trigger the bundle by using a short age max would complicate the
    // size config above; instead overflow it with a third large file so the
    // bundle hosting both a and b is promoted deterministically.
    let filler = "x".repeat(2 * 1024 * 1024);
    harness.write_file(
        "foo1",
        "2024-01-15",
        "c.json",
        &format!(r#"{{"UUID":"{filler}"}}"#),
    );

    let data_rel = harness
        .wait_for_object(
            |p| p.contains("/foo1/date=2024-01-15/") && p.ends_with("-data.jsonl.gz"),
            Duration::from_secs(5),
        )
        .await;
    let bytes = harness.store.download(&data_rel).await.unwrap().unwrap();
    let text = decompress(&bytes);
    assert_eq!(text.lines().count(), 1);
    let parsed: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
    assert_eq!(parsed["raw"]["UUID"], "good");

    let index_rel = harness
        .wait_for_object(
            |p| p.contains("/index1/date=2024-01-15/") && p.ends_with("-index1.jsonl.gz"),
            Duration::from_secs(5),
        )
        .await;
    let index_bytes = harness.store.download(&index_rel).await.unwrap().unwrap();
    let index_text = decompress(&index_bytes);
    assert_eq!(index_text.lines().count(), 1);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while (good.exists() || bad.exists()) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!good.exists());
    assert!(!bad.exists(), "bad file should be removed alongside the bundle");

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn missed_sweep_picks_up_file_written_before_watcher_started() {
    // Write the file first, then start a watcher with a very short
    // missed-file age so the periodic sweep (not a native event) is what
    // reports it.
    let spool_root = TempDir::new().unwrap();
    let store_root = TempDir::new().unwrap();
    let datatype_root = spool_root.path().join("ndt").join("foo1");
    let dir = datatype_root.join("2024/01/15");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("a.json");
    std::fs::write(&path, r#"{"UUID":"u"}"#).unwrap();

    // Ensure mtime is old enough to be picked up immediately.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let store = Arc::new(LocalObjectStore::new(store_root.path().to_path_buf()));
    let metrics = Arc::new(InMemoryMetrics::new());
    let cancellation = CancellationToken::new();

    let watch: Arc<dyn WatchSource> = DirectoryWatcher::start(
        datatype_root,
        vec!["json".to_string()],
        Duration::from_millis(1),
        Duration::from_millis(30),
        cancellation.clone(),
    )
    .unwrap();

    let identity = EngineIdentity {
        datatype: "foo1".to_string(),
        experiment: "ndt".to_string(),
        machine: "mlab1".to_string(),
        site: "lga03".to_string(),
        object_store_home: "autoload/v1".to_string(),
        archiver_version: "test".to_string(),
        archiver_git_commit: "abc".to_string(),
    };
    let tuning = EngineTuning {
        spool_root: spool_root.path().to_path_buf(),
        bundle_size_max: 1024 * 1024,
        bundle_age_max: Duration::from_secs(3600),
        flush_timeout: Duration::from_secs(5),
        keep_local_files: false,
    };
    let engine = Engine::new(
        identity,
        tuning,
        watch,
        store.clone() as Arc<dyn ObjectStore>,
        metrics as Arc<dyn BundleMetrics>,
        cancellation.clone(),
    );
    let engine_handle = tokio::spawn(engine.run());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut uploaded = None;
    while tokio::time::Instant::now() < deadline {
        for entry in walkdir::WalkDir::new(store_root.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let rel = entry
                .path()
                .strip_prefix(store_root.path())
                .unwrap()
                .to_string_lossy()
                .to_string();
            if rel.ends_with("-data.jsonl.gz") {
                uploaded = Some(rel);
            }
        }
        if uploaded.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let uploaded = uploaded.expect("missed-file sweep should have uploaded the bundle");
    let bytes = store.download(&uploaded).await.unwrap().unwrap();
    let text = decompress(&bytes);
    assert_eq!(text.lines().count(), 1);

    cancellation.cancel();
    tokio::time::timeout(Duration::from_secs(5), engine_handle)
        .await
        .expect("engine did not shut down")
        .expect("engine task panicked");
}
