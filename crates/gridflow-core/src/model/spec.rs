//! Cluster specification
//!
//! The declarative description of a cluster: one master group, any number of
//! worker groups, each pinned to one configured cloud.

use super::settings::{ClusterSettings, Merge, SshSettings};
use crate::error::{ClusterError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Role of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Master,
    Worker,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Worker => write!(f, "worker"),
        }
    }
}

/// A block volume attached to every instance of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub size_gb: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,

    /// Where the baseline setup mounts the volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<String>,
}

/// A homogeneous set of instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroup {
    /// Group name, also the template name used by scaling requests
    pub name: String,

    pub role: Role,

    pub count: u32,

    /// Name of the configured cloud the group is placed on
    pub cloud: String,

    pub flavor: String,

    /// Image name or id
    pub image: String,

    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,

    /// Software tags, used as inventory groups
    #[serde(default)]
    pub tags: Vec<String>,

    /// Group-local overrides
    #[serde(default)]
    pub settings: ClusterSettings,
}

impl NodeGroup {
    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }
}

/// Cloud-local overrides for one configured cloud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudSettings {
    pub name: String,

    #[serde(default)]
    pub settings: ClusterSettings,
}

/// Desired state of a cluster. Immutable once submitted for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub groups: Vec<NodeGroup>,

    /// Cluster-wide defaults
    #[serde(default)]
    pub defaults: ClusterSettings,

    /// Cloud-local overrides, keyed by cloud name
    #[serde(default)]
    pub clouds: Vec<CloudSettings>,

    #[serde(default)]
    pub ssh: SshSettings,
}

impl ClusterSpec {
    pub fn master_group(&self) -> Option<&NodeGroup> {
        self.groups.iter().find(|g| g.is_master())
    }

    pub fn worker_groups(&self) -> impl Iterator<Item = &NodeGroup> {
        self.groups.iter().filter(|g| !g.is_master())
    }

    pub fn group(&self, name: &str) -> Option<&NodeGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Clouds that host at least one instance.
    pub fn participating_clouds(&self) -> BTreeSet<&str> {
        self.groups
            .iter()
            .filter(|g| g.count > 0)
            .map(|g| g.cloud.as_str())
            .collect()
    }

    /// Settings of a cloud, merged over the cluster defaults.
    pub fn cloud_settings(&self, cloud: &str) -> ClusterSettings {
        let mut settings = self.defaults.clone();
        for local in self.clouds.iter().filter(|c| c.name == cloud) {
            settings.merge(&local.settings);
        }
        settings
    }

    /// Effective settings of a group: defaults < cloud-local < group-local.
    pub fn effective_settings(&self, group: &NodeGroup) -> ClusterSettings {
        self.cloud_settings(&group.cloud).merged(&group.settings)
    }

    /// Builds the spec of a scale-up: `count` more workers of `template`,
    /// nothing else. Settings and SSH access are kept so the delta resolves
    /// to the same shared resources as the original cluster.
    pub fn delta(&self, template: &str, count: u32) -> Result<ClusterSpec> {
        let group = self.group(template).ok_or_else(|| {
            ClusterError::InvalidOperation(format!("unknown worker group template '{}'", template))
        })?;
        if group.is_master() {
            return Err(ClusterError::InvalidOperation(
                "the master group cannot be scaled".to_string(),
            ));
        }
        if count == 0 {
            return Err(ClusterError::InvalidOperation(
                "scale-up count must be at least 1".to_string(),
            ));
        }

        Ok(ClusterSpec {
            groups: vec![NodeGroup {
                count,
                ..group.clone()
            }],
            ..self.clone()
        })
    }
}
