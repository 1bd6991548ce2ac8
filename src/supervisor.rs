//! Process Supervisor (spec.md §2 item 6): runs the Schema Gate for every
//! configured datatype, then starts one watcher/engine pair per datatype and
//! waits for all of them to quiesce on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::engine::{Engine, EngineIdentity, EngineTuning};
use crate::error::AgentError;
use crate::metrics::BundleMetrics;
use crate::schema::{GateOutcome, SchemaGate};
use crate::store::ObjectStore;
use crate::watch::{DirectoryWatcher, WatchSource};

/// Fixed identity values stamped into every uploaded envelope
/// (spec.md §6's `archiver` column).
pub struct BuildInfo {
    pub version: String,
    pub git_commit: String,
}

pub struct Supervisor {
    config: Config,
    store: Arc<dyn ObjectStore>,
    metrics: Arc<dyn BundleMetrics>,
    build_info: BuildInfo,
    shutdown: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(
        config: Config,
        store: Arc<dyn ObjectStore>,
        metrics: Arc<dyn BundleMetrics>,
        build_info: BuildInfo,
    ) -> Self {
        Self {
            config,
            store,
            metrics,
            build_info,
            shutdown: CancellationToken::new(),
            worker_handles: Vec::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs the Schema Gate for every configured datatype. Any datatype
    /// whose schema is incompatible with what's published aborts the whole
    /// run (spec.md §4.4): publishing measurement data under a schema that
    /// silently drops or retypes a field is worse than not starting.
    async fn run_schema_gate(&self) -> Result<(), AgentError> {
        let gate = SchemaGate::new(&*self.store, &self.config.object_store_home, &self.config.experiment);
        for datatype in &self.config.datatypes {
            let outcome = gate.check(&datatype.name, &datatype.schema_path).await?;
            match outcome {
                GateOutcome::FirstPublish => {
                    info!(datatype = %datatype.name, "published table schema for the first time")
                }
                GateOutcome::AlreadyPublished => {
                    info!(datatype = %datatype.name, "table schema already up to date")
                }
                GateOutcome::CompatibleExtension => {
                    info!(datatype = %datatype.name, "published an extended, backward-compatible table schema")
                }
            }
        }
        Ok(())
    }

    /// Runs the schema gate, then starts one watcher/engine pair per
    /// datatype and blocks until every pair has quiesced following a
    /// shutdown signal.
    pub async fn run(mut self) -> Result<(), AgentError> {
        self.run_schema_gate().await?;

        if self.config.local_mode {
            // "local mode" is schema generation only (spec.md §6): the
            // gate above already ran, so there is nothing left to do.
            info!("local mode: schema gate complete, not starting any watchers");
            return Ok(());
        }

        for datatype in self.config.datatypes.clone() {
            let datatype_root = self
                .config
                .spool_root
                .join(&self.config.experiment)
                .join(&datatype.name);
            let watch: Arc<dyn WatchSource> = DirectoryWatcher::start(
                datatype_root,
                self.config.extensions.clone(),
                self.config.missed_file_age,
                self.config.missed_sweep_interval,
                self.shutdown.clone(),
            )
            .map_err(AgentError::from)?;

            let identity = EngineIdentity {
                datatype: datatype.name.clone(),
                experiment: self.config.experiment.clone(),
                machine: self.config.machine.clone(),
                site: self.config.site.clone(),
                object_store_home: self.config.object_store_home.clone(),
                archiver_version: self.build_info.version.clone(),
                archiver_git_commit: self.build_info.git_commit.clone(),
            };
            let tuning = EngineTuning {
                spool_root: self.config.spool_root.clone(),
                bundle_size_max: self.config.bundle_size_max,
                bundle_age_max: self.config.bundle_age_max,
                flush_timeout: self.config.flush_timeout,
                keep_local_files: self.config.keep_local_files,
            };

            let engine = Engine::new(
                identity,
                tuning,
                watch,
                Arc::clone(&self.store),
                Arc::clone(&self.metrics),
                self.shutdown.clone(),
            );

            let datatype_name = datatype.name.clone();
            self.worker_handles.push(tokio::spawn(async move {
                info!(datatype = %datatype_name, "engine started");
                engine.run().await;
                info!(datatype = %datatype_name, "engine stopped");
            }));
        }

        for handle in self.worker_handles.drain(..) {
            if let Err(err) = handle.await {
                error!(error = %err, "engine task panicked");
            }
        }
        Ok(())
    }
}
