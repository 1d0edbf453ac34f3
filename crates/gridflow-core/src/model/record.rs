//! Persisted cluster record

use super::resource::{ResourceId, ResourceKind, ResourceNode, ResourceSpec};
use super::spec::ClusterSpec;
use crate::error::{ClusterError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const RECORD_VERSION: u32 = 1;

/// Lifecycle of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterPhase {
    /// Provisioned, configuration not finished yet
    Provisioning,
    Stable,
    Scaling,
    ScaleFailed,
    /// Configuration did not reach readiness
    Degraded,
    Terminating,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::Provisioning => write!(f, "provisioning"),
            ClusterPhase::Stable => write!(f, "stable"),
            ClusterPhase::Scaling => write!(f, "scaling"),
            ClusterPhase::ScaleFailed => write!(f, "scale-failed"),
            ClusterPhase::Degraded => write!(f, "degraded"),
            ClusterPhase::Terminating => write!(f, "terminating"),
        }
    }
}

/// Configuration status of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Created, not configured yet
    Pending,
    Configured,
    Unreachable,
    Failed,
    /// Part of a failed scaling delta, resources still to be released
    PendingCleanup,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Pending => write!(f, "pending"),
            NodeStatus::Configured => write!(f, "configured"),
            NodeStatus::Unreachable => write!(f, "unreachable"),
            NodeStatus::Failed => write!(f, "failed"),
            NodeStatus::PendingCleanup => write!(f, "pending-cleanup"),
        }
    }
}

/// Roster entry of a master or worker node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    /// The instance resource backing this node
    pub resource: ResourceId,
    pub name: String,
    pub group: String,
    pub cloud: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub ssh_user: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl NodeEntry {
    /// Builds the roster entry of a realized instance node.
    pub fn from_instance(node: &ResourceNode) -> Option<Self> {
        match &node.spec {
            ResourceSpec::Instance {
                name,
                group,
                ssh_user,
                tags,
                ..
            } => Some(Self {
                resource: node.id.clone(),
                name: name.clone(),
                group: group.clone(),
                cloud: node.cloud.clone(),
                address: node.get_output("address"),
                ssh_user: ssh_user.clone(),
                tags: tags.clone(),
                status: NodeStatus::Pending,
                detail: None,
            }),
            _ => None,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.status == NodeStatus::Configured
    }
}

/// SSH access metadata of a cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SshAccess {
    /// Keypair registered on the clouds
    pub key_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<PathBuf>,
    /// Set once the baseline setup of the master succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_address: Option<String>,
    /// Cluster-internal public key, generated on the master
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_public_key: Option<String>,
}

/// Everything created for one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub version: u32,
    pub cluster_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub phase: ClusterPhase,
    /// The specification the cluster was created from
    pub spec: ClusterSpec,
    /// Realized resources in creation order
    pub resources: Vec<ResourceNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<NodeEntry>,
    #[serde(default)]
    pub workers: Vec<NodeEntry>,
    pub ssh: SshAccess,
    /// Counter used to name the next worker
    pub next_worker_index: u32,
}

impl ClusterRecord {
    pub fn new(cluster_id: impl Into<String>, spec: ClusterSpec, ssh: SshAccess) -> Self {
        let now = Utc::now();
        Self {
            version: RECORD_VERSION,
            cluster_id: cluster_id.into(),
            created_at: now,
            updated_at: now,
            phase: ClusterPhase::Provisioning,
            spec,
            resources: Vec::new(),
            master: None,
            workers: Vec::new(),
            ssh,
            next_worker_index: 1,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn resource(&self, id: &ResourceId) -> Option<&ResourceNode> {
        self.resources.iter().find(|r| &r.id == id)
    }

    pub fn resource_mut(&mut self, id: &ResourceId) -> Option<&mut ResourceNode> {
        self.resources.iter_mut().find(|r| &r.id == id)
    }

    pub fn resources_of(&self, kind: ResourceKind) -> impl Iterator<Item = &ResourceNode> {
        self.resources.iter().filter(move |r| r.kind() == kind)
    }

    /// Adds resources realized by a later run, replacing nodes with the same id.
    pub fn absorb_resources(&mut self, nodes: impl IntoIterator<Item = ResourceNode>) {
        for node in nodes {
            match self.resource_mut(&node.id) {
                Some(existing) => *existing = node,
                None => self.resources.push(node),
            }
        }
    }

    pub fn worker(&self, id: &ResourceId) -> Option<&NodeEntry> {
        self.workers.iter().find(|w| &w.resource == id)
    }

    /// Master and workers.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeEntry> {
        self.master.iter().chain(self.workers.iter())
    }

    pub fn node_mut(&mut self, id: &ResourceId) -> Option<&mut NodeEntry> {
        self.master
            .iter_mut()
            .chain(self.workers.iter_mut())
            .find(|n| &n.resource == id)
    }

    pub fn is_master(&self, id: &ResourceId) -> bool {
        self.master.as_ref().is_some_and(|m| &m.resource == id)
    }

    pub fn set_master(&mut self, entry: NodeEntry) -> Result<()> {
        self.check_backed(&entry)?;
        self.master = Some(entry);
        Ok(())
    }

    pub fn add_worker(&mut self, entry: NodeEntry) -> Result<()> {
        self.check_backed(&entry)?;
        if self.worker(&entry.resource).is_some() {
            return Err(ClusterError::StateError(format!(
                "worker {} is already part of cluster {}",
                entry.resource, self.cluster_id
            )));
        }
        self.workers.push(entry);
        Ok(())
    }

    /// Removes workers and the resources recorded for them.
    pub fn remove_workers(&mut self, ids: &[ResourceId]) {
        self.workers.retain(|w| !ids.contains(&w.resource));
        self.resources.retain(|r| !ids.contains(&r.id));
    }

    /// Roster entries must be backed by instance resources of this record.
    fn check_backed(&self, entry: &NodeEntry) -> Result<()> {
        match self.resource(&entry.resource) {
            Some(node) if node.kind() == ResourceKind::Instance => Ok(()),
            _ => Err(ClusterError::StateError(format!(
                "node {} is not backed by an instance of cluster {}",
                entry.resource, self.cluster_id
            ))),
        }
    }

    pub fn roster_is_consistent(&self) -> bool {
        self.nodes().all(|n| {
            self.resource(&n.resource)
                .is_some_and(|r| r.kind() == ResourceKind::Instance)
        })
    }

    /// True once every owned resource is deleted or failed-and-acknowledged.
    pub fn is_releasable(&self) -> bool {
        self.resources.iter().all(|r| r.is_released())
    }

    /// Resources still alive on a cloud.
    pub fn live_resources(&self) -> impl Iterator<Item = &ResourceNode> {
        self.resources.iter().filter(|r| !r.is_released())
    }

    /// Volumes attached to an instance: volume nodes the instance depends on
    /// that no other instance uses.
    pub fn attached_volumes(&self, instance: &ResourceId) -> Vec<ResourceId> {
        let Some(node) = self.resource(instance) else {
            return Vec::new();
        };
        node.depends_on
            .iter()
            .filter(|dep| {
                self.resource(dep)
                    .is_some_and(|r| r.kind() == ResourceKind::Volume)
                    && !self.resources.iter().any(|other| {
                        &other.id != instance && other.depends_on.contains(*dep)
                    })
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::resource::{NetworkRef, ResourceStatus};
    use crate::model::spec::Role;

    fn instance(name: &str) -> ResourceNode {
        let mut node = ResourceNode::planned(
            "cloud-a",
            name,
            ResourceSpec::Instance {
                name: name.to_string(),
                group: "compute".to_string(),
                role: Role::Worker,
                flavor: "small".to_string(),
                image: "ubuntu".to_string(),
                network: NetworkRef::Planned,
                key_name: "grid-abc".to_string(),
                ssh_user: "ubuntu".to_string(),
                tags: vec!["slurm".to_string()],
            },
        );
        node.set_status(ResourceStatus::Ready);
        node.set_output("address", serde_json::json!("10.0.0.5"));
        node
    }

    fn record() -> ClusterRecord {
        let spec = ClusterSpec {
            groups: Vec::new(),
            defaults: Default::default(),
            clouds: Vec::new(),
            ssh: Default::default(),
        };
        ClusterRecord::new("abc", spec, SshAccess::default())
    }

    #[test]
    fn test_worker_must_be_backed_by_instance() {
        let mut record = record();
        let node = instance("grid-worker-abc-1");
        let entry = NodeEntry::from_instance(&node).unwrap();

        assert!(record.add_worker(entry.clone()).is_err());

        record.absorb_resources([node]);
        record.add_worker(entry.clone()).unwrap();
        assert_eq!(record.workers[0].address.as_deref(), Some("10.0.0.5"));
        assert!(record.roster_is_consistent());

        // duplicates are rejected
        assert!(record.add_worker(entry).is_err());
    }

    #[test]
    fn test_attached_volumes_are_exclusive() {
        let mut record = record();
        let volume = ResourceNode::planned(
            "cloud-a",
            "grid-worker-abc-1-vol0",
            ResourceSpec::Volume {
                name: "grid-worker-abc-1-vol0".to_string(),
                size_gb: 10,
                volume_type: None,
                mount_point: None,
            },
        );
        let worker = instance("grid-worker-abc-1").depends_on(&volume.id);
        let worker_id = worker.id.clone();
        record.absorb_resources([volume.clone(), worker]);

        assert_eq!(record.attached_volumes(&worker_id), vec![volume.id.clone()]);

        let other = instance("grid-worker-abc-2").depends_on(&volume.id);
        record.absorb_resources([other]);
        assert!(record.attached_volumes(&worker_id).is_empty());
    }

    #[test]
    fn test_is_releasable() {
        let mut record = record();
        let mut node = instance("grid-worker-abc-1");
        node.provider_id = Some("srv-1".to_string());
        record.absorb_resources([node.clone()]);
        assert!(!record.is_releasable());

        node.set_status(ResourceStatus::Deleted);
        record.absorb_resources([node]);
        assert!(record.is_releasable());
    }
}
