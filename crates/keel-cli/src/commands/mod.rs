pub mod pipeline;
pub mod release;
pub mod render;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, ValueEnum};
use keel_core::{EnvironmentConfig, ValueTree};
use keel_release::{ApplyConfig, FileCluster, ReleaseManager};
use keel_state::ReleaseStore;
use tokio::sync::watch;
use tracing::warn;

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Value overrides, lowest precedence first: environment, files, `--set`.
#[derive(Args, Debug, Default)]
pub struct ValuesArgs {
    /// Values file layered over the chart defaults (repeatable)
    #[arg(short = 'f', long = "values")]
    pub files: Vec<PathBuf>,
    /// Single value override, e.g. `--set services.client.replicas=3` (repeatable)
    #[arg(long = "set")]
    pub sets: Vec<String>,
    /// Environment config TOML; defaults to the KEEL_* environment variables
    #[arg(long)]
    pub env_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct StateArgs {
    /// Directory holding the release store
    #[arg(long, env = "KEEL_DATA_DIR", default_value = ".keel")]
    pub data_dir: PathBuf,
    /// Directory-backed target cluster (default: <data-dir>/cluster)
    #[arg(long, env = "KEEL_CLUSTER_DIR")]
    pub cluster_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Seconds allowed for each cluster call
    #[arg(long, default_value_t = 30)]
    pub call_timeout: u64,
    /// Seconds to wait for each resource to become ready
    #[arg(long, default_value_t = 300)]
    pub readiness_timeout: u64,
    /// Seconds between readiness checks
    #[arg(long, default_value_t = 2)]
    pub poll_interval: u64,
}

impl ApplyArgs {
    pub fn config(&self) -> ApplyConfig {
        ApplyConfig {
            call_timeout: Duration::from_secs(self.call_timeout),
            readiness_timeout: Duration::from_secs(self.readiness_timeout),
            poll_interval: Duration::from_secs(self.poll_interval),
        }
    }
}

pub fn load_environment(env_file: Option<&Path>) -> anyhow::Result<EnvironmentConfig> {
    match env_file {
        Some(path) => Ok(EnvironmentConfig::from_file(path)?),
        None => Ok(EnvironmentConfig::from_env()),
    }
}

/// The override layers for one invocation.
pub fn load_overrides(args: &ValuesArgs) -> anyhow::Result<Vec<ValueTree>> {
    let environment = load_environment(args.env_file.as_deref())?;
    let mut layers = vec![environment.to_values()?];
    for path in &args.files {
        layers.push(ValueTree::from_yaml_file(path)?);
    }
    for expr in &args.sets {
        layers.push(ValueTree::from_set_expr(expr)?);
    }
    Ok(layers)
}

/// Release manager over the data dir. Other `keel` processes using the same
/// data dir queue behind writes to the same release.
pub fn open_manager(state: &StateArgs, apply: &ApplyArgs) -> anyhow::Result<ReleaseManager> {
    std::fs::create_dir_all(&state.data_dir).map_err(|e| {
        anyhow::anyhow!("creating data dir {}: {e}", state.data_dir.display())
    })?;
    let store = ReleaseStore::open(&state.data_dir.join("releases.redb"))?;
    let cluster_dir = state
        .cluster_dir
        .clone()
        .unwrap_or_else(|| state.data_dir.join("cluster"));
    let manager = ReleaseManager::new(
        store,
        Arc::new(FileCluster::new(cluster_dir)),
        apply.config(),
    );
    Ok(manager.with_lock_dir(state.data_dir.join("locks")))
}

/// Cancel flag raised on Ctrl-C. The apply stops before its next resource.
pub fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current resource");
            let _ = tx.send(true);
        }
    });
    rx
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
