//! Planned and realized cloud resources

use super::settings::SecurityRule;
use super::spec::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Scope of resources that span several clouds.
pub const MULTI_CLOUD_SCOPE: &str = "*";

/// Kind of a cloud object.
///
/// The declaration order is the creation precedence: a kind only ever depends
/// on kinds declared before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Network,
    Subnet,
    Router,
    SecurityGroup,
    Keypair,
    Volume,
    Instance,
    /// Cross-cloud connectivity between the participating clouds
    Tunnel,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Network => "network",
            ResourceKind::Subnet => "subnet",
            ResourceKind::Router => "router",
            ResourceKind::SecurityGroup => "security-group",
            ResourceKind::Keypair => "keypair",
            ResourceKind::Volume => "volume",
            ResourceKind::Instance => "instance",
            ResourceKind::Tunnel => "tunnel",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Planned,
    Creating,
    Ready,
    Failed,
    Deleting,
    Deleted,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceStatus::Planned => write!(f, "planned"),
            ResourceStatus::Creating => write!(f, "creating"),
            ResourceStatus::Ready => write!(f, "ready"),
            ResourceStatus::Failed => write!(f, "failed"),
            ResourceStatus::Deleting => write!(f, "deleting"),
            ResourceStatus::Deleted => write!(f, "deleted"),
        }
    }
}

/// Identifier of a resource node: `<cloud>:<kind>:<key>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(cloud: &str, kind: ResourceKind, key: &str) -> Self {
        Self(format!("{}:{}:{}", cloud, kind, key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// How an instance is attached to its network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkRef {
    /// A network that exists outside of the cluster
    Existing(String),
    /// The network node among the instance's dependencies
    Planned,
}

/// Desired attributes of a resource, by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ResourceSpec {
    Network {
        name: String,
    },
    Subnet {
        name: String,
        cidr: String,
        #[serde(default)]
        dns_nameservers: Vec<String>,
    },
    Router {
        name: String,
        external_network: String,
    },
    SecurityGroup {
        name: String,
        rules: Vec<SecurityRule>,
    },
    Keypair {
        name: String,
        public_key: String,
    },
    Volume {
        name: String,
        size_gb: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        volume_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mount_point: Option<String>,
    },
    Instance {
        name: String,
        group: String,
        role: Role,
        flavor: String,
        image: String,
        network: NetworkRef,
        /// Keypair injected into the instance
        key_name: String,
        ssh_user: String,
        #[serde(default)]
        tags: Vec<String>,
    },
    Tunnel {
        name: String,
        clouds: Vec<String>,
    },
}

impl ResourceSpec {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceSpec::Network { .. } => ResourceKind::Network,
            ResourceSpec::Subnet { .. } => ResourceKind::Subnet,
            ResourceSpec::Router { .. } => ResourceKind::Router,
            ResourceSpec::SecurityGroup { .. } => ResourceKind::SecurityGroup,
            ResourceSpec::Keypair { .. } => ResourceKind::Keypair,
            ResourceSpec::Volume { .. } => ResourceKind::Volume,
            ResourceSpec::Instance { .. } => ResourceKind::Instance,
            ResourceSpec::Tunnel { .. } => ResourceKind::Tunnel,
        }
    }

    /// Name the resource carries on the provider side.
    pub fn name(&self) -> &str {
        match self {
            ResourceSpec::Network { name }
            | ResourceSpec::Subnet { name, .. }
            | ResourceSpec::Router { name, .. }
            | ResourceSpec::SecurityGroup { name, .. }
            | ResourceSpec::Keypair { name, .. }
            | ResourceSpec::Volume { name, .. }
            | ResourceSpec::Instance { name, .. }
            | ResourceSpec::Tunnel { name, .. } => name,
        }
    }
}

/// One planned or created cloud object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceNode {
    pub id: ResourceId,

    /// Owning cloud, or [`MULTI_CLOUD_SCOPE`]
    pub cloud: String,

    #[serde(flatten)]
    pub spec: ResourceSpec,

    /// Nodes that must be ready before this one is created
    #[serde(default)]
    pub depends_on: BTreeSet<ResourceId>,

    pub status: ResourceStatus,

    /// Provider-assigned id once created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Provider outputs (addresses, CIDRs, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// A failed node an operator has accepted as gone
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub acknowledged: bool,

    pub updated_at: DateTime<Utc>,
}

impl ResourceNode {
    pub fn planned(cloud: impl Into<String>, key: &str, spec: ResourceSpec) -> Self {
        let cloud = cloud.into();
        Self {
            id: ResourceId::new(&cloud, spec.kind(), key),
            cloud,
            spec,
            depends_on: BTreeSet::new(),
            status: ResourceStatus::Planned,
            provider_id: None,
            outputs: BTreeMap::new(),
            error: None,
            acknowledged: false,
            updated_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.spec.kind()
    }

    pub fn name(&self) -> &str {
        self.spec.name()
    }

    pub fn depends_on(mut self, id: &ResourceId) -> Self {
        self.depends_on.insert(id.clone());
        self
    }

    pub fn set_status(&mut self, status: ResourceStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.set_status(ResourceStatus::Failed);
    }

    pub fn is_ready(&self) -> bool {
        self.status == ResourceStatus::Ready
    }

    /// Nothing left on the cloud: deleted, never created, or failed and
    /// accepted as gone.
    pub fn is_released(&self) -> bool {
        match self.status {
            ResourceStatus::Deleted => true,
            ResourceStatus::Planned => self.provider_id.is_none(),
            ResourceStatus::Failed => self.acknowledged || self.provider_id.is_none(),
            _ => false,
        }
    }

    pub fn get_output<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.outputs
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn set_output(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.outputs.insert(key.into(), value);
    }
}
