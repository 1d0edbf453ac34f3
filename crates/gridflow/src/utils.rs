use anyhow::Context;
use colored::Colorize;
use gridflow_cloud::{CloudContext, ClusterStore, EngineConfig, MultiCloudContext};
use gridflow_cloud_openstack::OpenStackProvider;
use gridflow_cluster::ClusterManager;
use gridflow_config::{ClusterConfig, ConfigError, expand_home, find_config_file, state_dir};
use gridflow_core::{CleanupFailure, ClusterRecord, NodeEntry, NodeStatus};
use gridflow_setup::{AnsiblePlaybook, ConfigurationOrchestrator, SetupPolicy, SshConnector};
use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Configuration files named on the command line.
pub struct ConfigOptions {
    pub config: Option<PathBuf>,
    pub default: Option<PathBuf>,
    pub enforced: Option<PathBuf>,
}

impl ConfigOptions {
    pub fn load(&self) -> anyhow::Result<ClusterConfig> {
        let path = match &self.config {
            Some(path) => expand_home(path),
            None => find_config_file()?,
        };
        println!("📄 {}", path.display().to_string().cyan());

        let default = self.default.as_deref().map(expand_home);
        let enforced = self.enforced.as_deref().map(expand_home);
        gridflow_config::load(&path, default.as_deref(), enforced.as_deref())
            .with_context(|| format!("failed to load {}", path.display()))
    }

    /// Like [`ConfigOptions::load`], but a configuration that was neither
    /// named nor found is not an error.
    pub fn load_optional(&self) -> anyhow::Result<Option<ClusterConfig>> {
        if self.config.is_none() {
            match find_config_file() {
                Ok(_) => {}
                Err(ConfigError::ConfigFileNotFound) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
        self.load().map(Some)
    }
}

/// Name of the log file kept in the state directory.
pub const LOG_FILE: &str = "gridflow.log";

/// Log file of this run. Commands that touch the clouds create the state
/// directory for it; the others only log there when it already exists.
pub fn log_file(create_dir: bool) -> Option<PathBuf> {
    let dir = state_dir().ok()?;
    if create_dir {
        std::fs::create_dir_all(&dir).ok()?;
    } else if !dir.is_dir() {
        return None;
    }
    Some(dir.join(LOG_FILE))
}

pub fn open_store() -> anyhow::Result<ClusterStore> {
    Ok(ClusterStore::open(state_dir()?))
}

/// The given cluster id, or the last cluster created from this directory.
pub async fn resolve_cluster(
    store: &ClusterStore,
    cluster_id: Option<&str>,
) -> anyhow::Result<String> {
    match cluster_id {
        Some(id) => Ok(id.to_string()),
        None => store.last_cluster().await?.ok_or_else(|| {
            anyhow::anyhow!("no cluster given with --cluster-id and none created here yet")
        }),
    }
}

/// Clouds a recorded cluster has resources on.
pub fn record_clouds(record: &ClusterRecord) -> BTreeSet<String> {
    record.spec.groups.iter().map(|g| g.cloud.clone()).collect()
}

/// Wires OpenStack providers, the state directory and the SSH transport
/// into a manager.
///
/// Clouds come from the configuration plus `extra_clouds`. Without a
/// configuration the engine and setup policies are the defaults and no
/// playbook runs.
pub fn build_manager(
    config: Option<&ClusterConfig>,
    extra_clouds: &BTreeSet<String>,
    private_key: Option<PathBuf>,
) -> anyhow::Result<ClusterManager> {
    let mut names: BTreeSet<String> = config
        .map(|c| c.cloud_names().map(str::to_string).collect())
        .unwrap_or_default();
    names.extend(extra_clouds.iter().cloned());

    let mut clouds = MultiCloudContext::new();
    for name in &names {
        clouds.add(CloudContext::new(
            name.clone(),
            Arc::new(OpenStackProvider::new(name.clone())),
        ));
    }

    let (engine, policy) = match config {
        Some(config) => (config.engine_config(), config.setup_policy()),
        None => (EngineConfig::default(), SetupPolicy::default()),
    };
    let mut orchestrator = ConfigurationOrchestrator::new(Arc::new(SshConnector::new()), policy);
    if let Some(playbook) = config.and_then(ClusterConfig::playbook) {
        let runner = AnsiblePlaybook::new(expand_home(&playbook)).with_private_key(private_key);
        orchestrator = orchestrator.with_playbook(Arc::new(runner));
    }

    Ok(ClusterManager::new(
        Arc::new(clouds),
        engine,
        open_store()?,
        orchestrator,
    ))
}

/// Cancels the returned token on the first Ctrl-C so the running operation
/// can release what it created. A second Ctrl-C exits immediately.
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "{}",
                "⚠ Interrupted, releasing what was created (Ctrl-C again to abort)".yellow()
            );
            token.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        }
    });
    cancel
}

/// Runs an action and reports how long it took, also when it fails.
pub async fn timed<T>(
    action: &str,
    operation: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    let started = Instant::now();
    let result = operation.await;
    let elapsed = format_duration(started.elapsed());
    match &result {
        Ok(_) => eprintln!("⏱  {} finished in {}", action, elapsed.bold()),
        Err(_) => eprintln!("⏱  {} failed after {}", action, elapsed.bold()),
    }
    result
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        format!("{}h {:02}m {:02}s", secs / 3600, secs % 3600 / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}

pub fn print_roster(record: &ClusterRecord) {
    println!(
        "  {:<28} {:<10} {:<14} {:<16} STATUS",
        "NODE", "GROUP", "CLOUD", "ADDRESS"
    );
    if let Some(master) = &record.master {
        print_node(master, true);
    }
    for worker in &record.workers {
        print_node(worker, false);
    }
}

fn print_node(node: &NodeEntry, master: bool) {
    let name = if master {
        format!("{} (master)", node.name)
    } else {
        node.name.clone()
    };
    let status = match node.status {
        NodeStatus::Configured => node.status.to_string().green(),
        NodeStatus::Pending => node.status.to_string().yellow(),
        _ => node.status.to_string().red(),
    };
    println!(
        "  {:<28} {:<10} {:<14} {:<16} {}",
        name,
        node.group,
        node.cloud,
        node.address.as_deref().unwrap_or("-"),
        status
    );
    if let Some(detail) = &node.detail {
        println!("    {}", detail.dimmed());
    }
}

pub fn print_cleanup_failures(title: &str, failures: &[CleanupFailure]) {
    if failures.is_empty() {
        return;
    }
    println!();
    println!("{}", title.yellow().bold());
    for failure in failures {
        println!(
            "  ⚠ {} {} on {} (provider id {}): {}",
            failure.kind,
            failure.resource.to_string().cyan(),
            failure.cloud,
            failure.provider_id.as_deref().unwrap_or("unknown").bold(),
            failure.message
        );
    }
}
