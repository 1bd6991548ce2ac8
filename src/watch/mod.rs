//! Watcher capability boundary (spec.md §4.2, §9's "source pattern
//! re-architecture"): a [`WatchSource`] hands the engine a stream of
//! [`WatchEvent`]s and takes acknowledgements back, without the engine
//! knowing whether events come from `notify` or a periodic directory walk.

mod notify_watcher;

use std::path::PathBuf;

use async_trait::async_trait;

pub use notify_watcher::DirectoryWatcher;

/// One file becoming ready for bundling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    /// True if this event came from the periodic missed-file sweep rather
    /// than a native filesystem notification (spec.md §4.2, §8 scenario 6).
    pub missed: bool,
}

/// A source of [`WatchEvent`]s the engine drains and acknowledges.
///
/// Acknowledging a path tells the source the file has been consumed (bundled
/// and removed, or rejected into `bad_files`) and it no longer needs to be
/// tracked for dedup against the missed-file sweep.
#[async_trait]
pub trait WatchSource: Send + Sync {
    async fn next_event(&self) -> Option<WatchEvent>;

    fn ack(&self, path: &std::path::Path);
}
