//! Typed configuration surface (spec.md §6) plus a `clap`-driven loader.
//!
//! The command-line/environment layer is an external collaborator to the
//! bundling pipeline (spec.md §1), but the pipeline still needs a concrete
//! [`Config`] to run. [`CliArgs`] is the thin loader; [`Config`] is the value
//! every other component actually consumes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::ConfigError;

/// One datatype's watch/schema binding.
#[derive(Debug, Clone)]
pub struct DatatypeConfig {
    pub name: String,
    pub schema_path: PathBuf,
}

/// Fully validated configuration consumed by the supervisor, engine, and
/// schema gate.
#[derive(Debug, Clone)]
pub struct Config {
    pub bucket: String,
    pub object_store_home: String,
    pub machine: String,
    pub site: String,
    pub experiment: String,

    pub bundle_size_max: u64,
    pub bundle_age_max: Duration,
    pub missed_file_age: Duration,
    pub missed_sweep_interval: Duration,
    pub flush_timeout: Duration,

    pub spool_root: PathBuf,
    pub datatypes: Vec<DatatypeConfig>,
    /// File extensions (without the leading dot) the watcher emits events
    /// for (spec.md §4.2's "configured extensions" filter).
    pub extensions: Vec<String>,

    pub local_mode: bool,
    pub verbose: bool,
    /// Equivalent of the source's "no-remove" debug switch (spec.md §9):
    /// local files are never unlinked, but acknowledgement semantics are
    /// unaffected.
    pub keep_local_files: bool,
}

impl Config {
    pub fn schema_path_for(&self, datatype: &str) -> Option<&PathBuf> {
        self.datatypes
            .iter()
            .find(|d| d.name == datatype)
            .map(|d| &d.schema_path)
    }
}

/// Command-line / environment arguments, mirroring the `clap::Parser`
/// pattern used for the host's server binary.
#[derive(Parser, Debug)]
#[command(name = "autoloader")]
#[command(about = "Bundles measurement results and uploads them to an object store")]
pub struct CliArgs {
    /// Object store bucket name.
    #[arg(long, env = "AUTOLOADER_BUCKET")]
    pub bucket: String,

    /// Object store path prefix under which tables/data/index objects are published.
    #[arg(long, env = "AUTOLOADER_HOME", default_value = "autoload/v1")]
    pub home: String,

    /// Machine-node identifier, used to build the base id for object paths.
    #[arg(long, env = "AUTOLOADER_MACHINE")]
    pub machine: String,

    /// Site identifier, used to build the base id for object paths. Parsing
    /// this out of a raw hostname is the configuration layer's job, out of
    /// scope here (spec.md §1); this crate only consumes the final value.
    #[arg(long, env = "AUTOLOADER_SITE")]
    pub site: String,

    /// Experiment name.
    #[arg(long, env = "AUTOLOADER_EXPERIMENT")]
    pub experiment: String,

    /// Datatype names to watch, comma-separated.
    #[arg(long, env = "AUTOLOADER_DATATYPES", value_delimiter = ',')]
    pub datatypes: Vec<String>,

    /// `datatype=path` schema-file bindings, comma-separated.
    #[arg(long, env = "AUTOLOADER_SCHEMAS", value_delimiter = ',')]
    pub schemas: Vec<String>,

    /// Root directory the measurement service deposits files under.
    #[arg(long, env = "AUTOLOADER_SPOOL_ROOT")]
    pub spool_root: PathBuf,

    /// File extensions (without the leading dot) the watcher picks up, comma-separated.
    #[arg(long, env = "AUTOLOADER_EXTENSIONS", value_delimiter = ',', default_value = "json")]
    pub extensions: Vec<String>,

    /// Maximum size in bytes of an active bundle before it is promoted.
    #[arg(long, env = "AUTOLOADER_BUNDLE_SIZE_MAX", default_value_t = 20 * 1024 * 1024)]
    pub bundle_size_max: u64,

    /// Maximum age in seconds of an active bundle before it is promoted.
    #[arg(long, env = "AUTOLOADER_BUNDLE_AGE_MAX_SECS", default_value_t = 3600)]
    pub bundle_age_max_secs: u64,

    /// Age in seconds a file must reach before the periodic sweep reports it as missed.
    #[arg(long, env = "AUTOLOADER_MISSED_FILE_AGE_SECS", default_value_t = 60)]
    pub missed_file_age_secs: u64,

    /// Interval in seconds between periodic missed-file sweeps.
    #[arg(long, env = "AUTOLOADER_MISSED_SWEEP_INTERVAL_SECS", default_value_t = 30)]
    pub missed_sweep_interval_secs: u64,

    /// Seconds to wait for in-flight uploads to drain on graceful shutdown.
    #[arg(long, env = "AUTOLOADER_FLUSH_TIMEOUT_SECS", default_value_t = 300)]
    pub flush_timeout_secs: u64,

    /// Run the schema gate only; never upload bundles.
    #[arg(long, env = "AUTOLOADER_LOCAL_MODE", default_value_t = false)]
    pub local_mode: bool,

    /// Verbose logging (origin annotations, debug level).
    #[arg(short, long, env = "AUTOLOADER_VERBOSE", default_value_t = false)]
    pub verbose: bool,

    /// Never unlink local files after a successful upload (debug aid).
    #[arg(long, env = "AUTOLOADER_KEEP_LOCAL_FILES", default_value_t = false)]
    pub keep_local_files: bool,
}

impl TryFrom<CliArgs> for Config {
    type Error = ConfigError;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.bundle_size_max == 0 {
            return Err(ConfigError::ZeroSizeMax);
        }
        if args.datatypes.is_empty() {
            return Err(ConfigError::NoDatatypes);
        }
        if args.machine.trim().is_empty() {
            return Err(ConfigError::InvalidNodeName(args.machine));
        }

        let mut schema_bindings: HashMap<String, PathBuf> = HashMap::new();
        for binding in &args.schemas {
            if let Some((datatype, path)) = binding.split_once('=') {
                schema_bindings.insert(datatype.to_string(), PathBuf::from(path));
            }
        }

        let mut datatypes = Vec::with_capacity(args.datatypes.len());
        for name in &args.datatypes {
            let schema_path = schema_bindings
                .get(name)
                .cloned()
                .ok_or_else(|| ConfigError::MissingSchemaBinding(name.clone()))?;
            datatypes.push(DatatypeConfig {
                name: name.clone(),
                schema_path,
            });
        }

        Ok(Config {
            bucket: args.bucket,
            object_store_home: args.home,
            machine: args.machine,
            site: args.site,
            experiment: args.experiment,
            bundle_size_max: args.bundle_size_max,
            bundle_age_max: Duration::from_secs(args.bundle_age_max_secs),
            missed_file_age: Duration::from_secs(args.missed_file_age_secs),
            missed_sweep_interval: Duration::from_secs(args.missed_sweep_interval_secs),
            flush_timeout: Duration::from_secs(args.flush_timeout_secs),
            spool_root: args.spool_root,
            datatypes,
            extensions: args.extensions,
            local_mode: args.local_mode,
            verbose: args.verbose,
            keep_local_files: args.keep_local_files,
        })
    }
}
