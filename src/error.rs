use thiserror::Error;

/// Failure modes for assembling or inspecting a [`crate::bundle::BundleRecord`].
#[derive(Error, Debug)]
pub enum BundleError {
    #[error("could not read input file: {0}")]
    Read(#[source] std::io::Error),

    #[error("input file is empty")]
    Empty,

    #[error("input file is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("input file contains more than one logical line")]
    MultiLine,

    #[error("failed to marshal index: {0}")]
    Marshal(#[source] serde_json::Error),
}

/// Failure modes for the directory watcher.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("failed to initialize native watcher: {0}")]
    Init(#[source] notify::Error),

    #[error("failed to watch root {path}: {source}")]
    Watch {
        path: std::path::PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("failed to walk spool root: {0}")]
    Sweep(#[source] std::io::Error),
}

/// Failure modes for the schema compatibility gate.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("failed to read datatype schema file {path}: {source}")]
    ReadSchema {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("datatype schema is not valid JSON: {0}")]
    Unmarshal(#[source] serde_json::Error),

    #[error("failed to download previous table schema: {0}")]
    Download(#[source] StoreError),

    #[error("failed to upload table schema: {0}")]
    Upload(#[source] StoreError),

    #[error(
        "new table schema for datatype {datatype} is incompatible with the published schema: \
         {missing} field(s) dropped, {mismatched} field(s) changed type"
    )]
    Incompatible {
        datatype: String,
        missing: usize,
        mismatched: usize,
    },
}

/// Failure modes for the object-store client.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object store transport error: {0}")]
    Transport(String),

    #[error("object store operation timed out")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure modes for loading and validating the configuration surface.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("bundle size max must be greater than zero")]
    ZeroSizeMax,

    #[error("at least one datatype must be configured")]
    NoDatatypes,

    #[error("datatype {0} has no schema file binding")]
    MissingSchemaBinding(String),

    #[error("invalid machine node identifier: {0}")]
    InvalidNodeName(String),
}

/// Failure modes raised directly by the bundling engine's control loop.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("path {path} rejected: {reason}")]
    InvalidPath {
        path: std::path::PathBuf,
        reason: String,
    },
}

/// Top-level crate error, aggregating every component's error kind.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
