//! Typed configuration
//!
//! One [`CloudConfig`] per configured cloud. The first one hosts the master
//! and carries the cluster-wide sections (`defaults`, `ssh`, `setup`,
//! `engine`, `playbook`); those sections are ignored on later documents.

use crate::discovery::expand_home;
use crate::error::{ConfigError, Result};
use gridflow_cloud::{EngineConfig, RetryConfig};
use gridflow_core::{
    CloudSettings, ClusterSettings, ClusterSpec, NodeGroup, Role, SshSettings, VolumeSpec,
};
use gridflow_setup::{BaselineSetup, MountSpec, SetupPolicy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Name of the master group.
pub const MASTER_GROUP: &str = "master";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudConfig {
    /// Entry of the cloud in the OpenStack client configuration
    pub cloud: String,

    /// Cloud-local settings
    #[serde(flatten)]
    pub settings: ClusterSettings,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<InstanceConfig>,

    #[serde(default)]
    pub workers: Vec<WorkerConfig>,

    /// Cluster-wide defaults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<ClusterSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<SetupConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineSection>,

    /// Playbook applied after the baseline setup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playbook: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub flavor: String,
    pub image: String,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Group-local settings
    #[serde(default)]
    pub settings: ClusterSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Group name used by scale requests; defaults to `<cloud>-<flavor>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub count: u32,
    #[serde(flatten)]
    pub instance: InstanceConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SshConfig {
    /// Keypair already registered on every cloud
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
    /// Public key file to register when no `key_name` is given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupConfig {
    #[serde(default = "default_setup_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_fraction")]
    pub min_worker_fraction: f64,
    #[serde(default = "default_reachability_timeout")]
    pub reachability_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    #[serde(default = "default_true")]
    pub distribute_cluster_key: bool,
}

fn default_setup_concurrency() -> usize {
    8
}
fn default_fraction() -> f64 {
    1.0
}
fn default_reachability_timeout() -> u64 {
    300
}
fn default_command_timeout() -> u64 {
    600
}
fn default_true() -> bool {
    true
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            concurrency: default_setup_concurrency(),
            min_worker_fraction: default_fraction(),
            reachability_timeout_secs: default_reachability_timeout(),
            command_timeout_secs: default_command_timeout(),
            users: Vec::new(),
            mounts: Vec::new(),
            distribute_cluster_key: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_engine_concurrency")]
    pub concurrency_per_cloud: usize,
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_delete_timeout")]
    pub delete_timeout_secs: u64,
}

fn default_engine_concurrency() -> usize {
    4
}
fn default_attempts() -> u32 {
    5
}
fn default_ready_timeout() -> u64 {
    600
}
fn default_delete_timeout() -> u64 {
    300
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            concurrency_per_cloud: default_engine_concurrency(),
            max_attempts: default_attempts(),
            ready_timeout_secs: default_ready_timeout(),
            delete_timeout_secs: default_delete_timeout(),
        }
    }
}

/// A parsed and layered configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterConfig {
    clouds: Vec<CloudConfig>,
}

impl ClusterConfig {
    pub fn new(clouds: Vec<CloudConfig>) -> Result<Self> {
        let Some(primary) = clouds.first() else {
            return Err(ConfigError::Invalid("no cloud configured".to_string()));
        };
        if primary.master.is_none() {
            return Err(ConfigError::Invalid(format!(
                "the first cloud ({}) must define the master",
                primary.cloud
            )));
        }
        if let Some(extra) = clouds.iter().skip(1).find(|c| c.master.is_some()) {
            return Err(ConfigError::Invalid(format!(
                "only the first cloud may define a master, {} does too",
                extra.cloud
            )));
        }
        let mut names = std::collections::BTreeSet::new();
        if let Some(duplicate) = clouds.iter().find(|c| !names.insert(c.cloud.as_str())) {
            return Err(ConfigError::Invalid(format!(
                "cloud {} is configured twice",
                duplicate.cloud
            )));
        }
        Ok(Self { clouds })
    }

    fn primary(&self) -> &CloudConfig {
        &self.clouds[0]
    }

    pub fn clouds(&self) -> &[CloudConfig] {
        &self.clouds
    }

    pub fn cloud_names(&self) -> impl Iterator<Item = &str> {
        self.clouds.iter().map(|c| c.cloud.as_str())
    }

    /// The cluster specification. Reads the public key file when one is
    /// configured.
    pub fn spec(&self) -> Result<ClusterSpec> {
        let primary = self.primary();
        let mut groups = Vec::new();

        if let Some(master) = &primary.master {
            groups.push(group(MASTER_GROUP, Role::Master, 1, &primary.cloud, master));
        }
        for cloud in &self.clouds {
            for worker in &cloud.workers {
                let name = worker
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("{}-{}", cloud.cloud, worker.instance.flavor));
                groups.push(group(&name, Role::Worker, worker.count, &cloud.cloud, &worker.instance));
            }
        }

        Ok(ClusterSpec {
            groups,
            defaults: primary.defaults.clone().unwrap_or_default(),
            clouds: self
                .clouds
                .iter()
                .map(|c| CloudSettings {
                    name: c.cloud.clone(),
                    settings: c.settings.clone(),
                })
                .collect(),
            ssh: self.ssh_settings()?,
        })
    }

    fn ssh_settings(&self) -> Result<SshSettings> {
        let ssh = self.primary().ssh.clone().unwrap_or_default();
        let public_key = match (&ssh.key_name, &ssh.public_key_file) {
            (None, Some(file)) => {
                let path = expand_home(file);
                let key = std::fs::read_to_string(&path).map_err(|e| {
                    ConfigError::Invalid(format!(
                        "cannot read public key {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Some(key.trim().to_string())
            }
            _ => None,
        };
        Ok(SshSettings {
            key_name: ssh.key_name,
            public_key,
            private_key_path: ssh.private_key_file.as_deref().map(expand_home),
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        let section = self.primary().engine.clone().unwrap_or_default();
        EngineConfig {
            concurrency_per_cloud: section.concurrency_per_cloud,
            retry: RetryConfig::with_max_attempts(section.max_attempts),
            ready_timeout: Duration::from_secs(section.ready_timeout_secs),
            delete_timeout: Duration::from_secs(section.delete_timeout_secs),
            ..Default::default()
        }
    }

    pub fn setup_policy(&self) -> SetupPolicy {
        let section = self.primary().setup.clone().unwrap_or_default();
        SetupPolicy {
            concurrency: section.concurrency,
            min_worker_fraction: section.min_worker_fraction,
            reachability_timeout: Duration::from_secs(section.reachability_timeout_secs),
            command_timeout: Duration::from_secs(section.command_timeout_secs),
            baseline: BaselineSetup {
                users: section.users,
                mounts: section.mounts,
                distribute_cluster_key: section.distribute_cluster_key,
            },
            ..Default::default()
        }
    }

    pub fn playbook(&self) -> Option<PathBuf> {
        self.primary().playbook.as_deref().map(expand_home)
    }
}

fn group(name: &str, role: Role, count: u32, cloud: &str, instance: &InstanceConfig) -> NodeGroup {
    NodeGroup {
        name: name.to_string(),
        role,
        count,
        cloud: cloud.to_string(),
        flavor: instance.flavor.clone(),
        image: instance.image.clone(),
        volumes: instance.volumes.clone(),
        tags: instance.tags.clone(),
        settings: instance.settings.clone(),
    }
}
