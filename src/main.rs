//! Sidecar agent binary: parses configuration, builds an object-store
//! client, and hands off to the [`Supervisor`] (spec.md §2 item 6).

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use autoloader::config::{CliArgs, Config};
use autoloader::metrics::NullMetrics;
use autoloader::store::{HttpObjectStore, LocalObjectStore, ObjectStore};
use autoloader::supervisor::{BuildInfo, Supervisor};

/// Crate version stamped into every uploaded envelope's `archiver.Version`.
const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Git commit stamped into every uploaded envelope's `archiver.GitCommit`;
/// populated by the build environment, `"unknown"` otherwise.
const GIT_COMMIT: &str = match option_env!("AUTOLOADER_GIT_COMMIT") {
    Some(sha) => sha,
    None => "unknown",
};

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_file(verbose)
        .with_line_number(verbose)
        .with_target(verbose);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_tracing(args.verbose);

    let config = Config::try_from(args).map_err(|err| {
        error!(error = %err, "invalid configuration");
        err
    })?;

    info!(
        experiment = %config.experiment,
        datatypes = config.datatypes.len(),
        local_mode = config.local_mode,
        "starting autoloader"
    );

    let store: Arc<dyn ObjectStore> = if config.local_mode {
        // Local mode only ever runs the schema gate (spec.md §6); it still
        // needs a store to read/write the table schema against, kept on
        // disk rather than reaching a real bucket.
        let local_root = config.spool_root.join(".local-object-store");
        Arc::new(LocalObjectStore::new(local_root))
    } else {
        Arc::new(HttpObjectStore::new(
            format!("https://{}", config.bucket),
            config.bucket.clone(),
            5,
        ))
    };

    let build_info = BuildInfo {
        version: VERSION.to_string(),
        git_commit: GIT_COMMIT.to_string(),
    };

    let supervisor = Supervisor::new(config, store, Arc::new(NullMetrics), build_info);
    let shutdown = supervisor.shutdown_token();

    let run_future = supervisor.run();
    tokio::pin!(run_future);

    tokio::select! {
        result = &mut run_future => {
            if let Err(err) = result {
                error!(error = %err, "fatal startup failure");
                return Err(err.into());
            }
        }
        _ = signal::ctrl_c() => {
            info!("received shutdown signal, draining active bundles");
            shutdown.cancel();
            if let Err(err) = run_future.await {
                error!(error = %err, "fatal failure while draining");
                return Err(err.into());
            }
        }
    }

    Ok(())
}
