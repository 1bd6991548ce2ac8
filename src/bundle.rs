//! In-memory representation of a single line-delimited JSON archive being
//! assembled for one date, plus its parallel index (spec.md §3, §4.1).

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BundleError;

/// One entry of the index bundle: the originating filename, its byte size in
/// the data bundle, and when it was added.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexEntry {
    #[serde(rename = "Filename")]
    pub filename: String,
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "TimeAdded")]
    pub time_added: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
struct Archiver {
    #[serde(rename = "Version")]
    version: String,
    #[serde(rename = "GitCommit")]
    git_commit: String,
    #[serde(rename = "ArchiveURL")]
    archive_url: String,
    #[serde(rename = "Filename")]
    filename: String,
}

#[derive(Debug, Clone, Serialize)]
struct Envelope {
    date: String,
    archiver: Archiver,
    raw: String,
}

/// Everything needed to compute a bundle's identity and object-store paths
/// once, at creation time.
pub struct BundleParams<'a> {
    pub datatype: &'a str,
    pub experiment: &'a str,
    pub machine: &'a str,
    pub site: &'a str,
    pub object_store_home: &'a str,
    pub date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

/// A bundle being assembled for one (datatype, date) pair. Single-writer by
/// construction: the engine owns it while active, an upload task owns it
/// after promotion (spec.md §5).
#[derive(Debug)]
pub struct BundleRecord {
    datatype: String,
    date: NaiveDate,
    created_at: DateTime<Utc>,
    data_object_path: String,
    index_object_path: String,
    lines: Vec<String>,
    index: Vec<IndexEntry>,
    bad_files: Vec<PathBuf>,
    size: u64,
}

fn base_id(datatype: &str, machine: &str, site: &str, experiment: &str) -> String {
    format!("{datatype}-{machine}-{site}-{experiment}")
}

fn compact_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%S%.6fZ").to_string()
}

impl BundleRecord {
    pub fn new(params: BundleParams<'_>) -> Self {
        let id = base_id(
            params.datatype,
            params.machine,
            params.site,
            params.experiment,
        );
        let ts = compact_timestamp(params.created_at);
        let date_str = params.date.format("%Y-%m-%d");

        let data_object_path = format!(
            "{home}/{experiment}/{datatype}/date={date_str}/{ts}-{id}-data.jsonl.gz",
            home = params.object_store_home,
            experiment = params.experiment,
            datatype = params.datatype,
        );
        let index_object_path = format!(
            "{home}/{experiment}/index1/date={date_str}/{ts}-{id}-index1.jsonl.gz",
            home = params.object_store_home,
            experiment = params.experiment,
        );

        Self {
            datatype: params.datatype.to_string(),
            date: params.date,
            created_at: params.created_at,
            data_object_path,
            index_object_path,
            lines: Vec::new(),
            index: Vec::new(),
            bad_files: Vec::new(),
            size: 0,
        }
    }

    pub fn datatype(&self) -> &str {
        &self.datatype
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    /// The bundle's identity: its creation instant. Two bundles created in
    /// the same microsecond would collide (spec.md §9); this is asserted in
    /// debug builds by the engine when it allocates a bundle.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn data_object_path(&self) -> &str {
        &self.data_object_path
    }

    pub fn index_object_path(&self) -> &str {
        &self.index_object_path
    }

    pub fn bad_files(&self) -> &[PathBuf] {
        &self.bad_files
    }

    /// Stable human string used in logs: `bundle <timestamp datatype date>`.
    pub fn description(&self) -> String {
        format!(
            "bundle {} {} {}",
            self.created_at.format("%Y/%m/%dT%H%M%S%.6fZ"),
            self.datatype,
            self.date.format("%Y-%m-%d"),
        )
    }

    /// True iff `path` was already accepted into the index or rejected into
    /// `bad_files`.
    pub fn has_file(&self, path: &Path) -> bool {
        let path_str = path.to_string_lossy();
        self.index.iter().any(|e| e.filename == path_str) || self.bad_files.iter().any(|p| p == path)
    }

    /// Reads `path`, validates it, and on success appends it to the bundle.
    /// On rejection, `path` is recorded in `bad_files` and the specific
    /// reason is returned as `Err`; the bundle is otherwise unaffected.
    pub fn add_file(
        &mut self,
        path: &Path,
        version: &str,
        git_commit: &str,
    ) -> Result<(), BundleError> {
        match self.try_add_file(path, version, git_commit) {
            Ok(line_len) => {
                self.size += line_len;
                Ok(())
            }
            Err(err) => {
                self.bad_files.push(path.to_path_buf());
                Err(err)
            }
        }
    }

    fn try_add_file(
        &mut self,
        path: &Path,
        version: &str,
        git_commit: &str,
    ) -> Result<u64, BundleError> {
        let contents = std::fs::read_to_string(path).map_err(BundleError::Read)?;
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return Err(BundleError::Empty);
        }

        let logical_lines = trimmed.lines().filter(|l| !l.trim().is_empty()).count();
        if logical_lines > 1 {
            return Err(BundleError::MultiLine);
        }

        // Validate without re-parsing into the output: the `raw` slot must
        // carry the exact bytes, not a round-tripped re-serialization.
        serde_json::from_str::<serde_json::Value>(trimmed).map_err(BundleError::InvalidJson)?;

        let filename = path.to_string_lossy().to_string();
        let envelope = Envelope {
            date: self.date.format("%Y-%m-%d").to_string(),
            archiver: Archiver {
                version: version.to_string(),
                git_commit: git_commit.to_string(),
                archive_url: self.data_object_path.clone(),
                filename: filename.clone(),
            },
            raw: String::new(),
        };
        let marshaled = serde_json::to_string(&envelope).map_err(BundleError::Marshal)?;

        // Placeholder substitution (spec.md §9): `"raw":""` cannot appear
        // anywhere else in this template, so a literal substring replace
        // preserves the input's numeric precision and key order exactly.
        let placeholder = "\"raw\":\"\"";
        debug_assert_eq!(marshaled.matches(placeholder).count(), 1);
        let line = marshaled.replacen(placeholder, &format!("\"raw\":{trimmed}"), 1);

        let line_len = line.len() as u64;
        self.lines.push(line);
        self.index.push(IndexEntry {
            filename,
            size: line_len,
            time_added: Utc::now(),
        });

        Ok(line_len)
    }

    /// Concatenates index entries one JSON object per line, no trailing newline.
    pub fn marshal_index(&self) -> Result<String, BundleError> {
        let mut out = String::new();
        for (i, entry) in self.index.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(&serde_json::to_string(entry).map_err(BundleError::Marshal)?);
        }
        Ok(out)
    }

    /// The data bundle payload: lines joined by `\n`, no trailing newline.
    pub fn marshal_data(&self) -> String {
        self.lines.join("\n")
    }

    /// Filenames in index order, used to acknowledge the watcher.
    pub fn index_filenames(&self) -> Vec<String> {
        self.index.iter().map(|e| e.filename.clone()).collect()
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Best-effort unlink of every accepted and every rejected path. Never
    /// aborts on a failure; each is logged individually.
    ///
    /// When `keep_local_files` is set (spec.md §9's "no-remove" debug aid),
    /// every path is still walked and logged as if it would be removed, but
    /// no unlink happens. Callers must still acknowledge the watcher exactly
    /// as on a real removal.
    pub fn remove_local_files(&self, keep_local_files: bool) {
        let all_paths = self
            .index
            .iter()
            .map(|e| PathBuf::from(&e.filename))
            .chain(self.bad_files.iter().cloned());

        for path in all_paths {
            if keep_local_files {
                tracing::debug!(path = %path.display(), "keep_local_files set, not removing");
                continue;
            }
            if let Err(err) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %err, "failed to remove local file");
            }
        }
    }
}
