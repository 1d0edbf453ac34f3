//! Provider adapter trait definition

use crate::context::{Flavor, Image, Quota};
use crate::retry::{self, Attempt, RetryConfig, RetryError};
use async_trait::async_trait;
use gridflow_core::{ProviderError, ResourceKind, SecurityRule};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Per-cloud capability surface
///
/// Every supported cloud implements this trait; the planner, the engine and
/// the catalog refresh only ever talk to clouds through it. Authentication
/// is resolved by whoever builds the adapter.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Returns the provider name (e.g., "openstack")
    fn name(&self) -> &str;

    /// Check if the provider is properly configured and authenticated
    async fn check_auth(&self) -> ProviderResult<AuthStatus>;

    async fn list_flavors(&self) -> ProviderResult<Vec<Flavor>>;

    async fn list_images(&self) -> ProviderResult<Vec<Image>>;

    /// Names of the networks visible to the project
    async fn list_networks(&self) -> ProviderResult<Vec<String>>;

    /// Remaining capacity of the project
    async fn quota(&self) -> ProviderResult<Quota>;

    async fn create_network(&self, request: &NetworkRequest) -> ProviderResult<CreatedResource>;

    async fn create_subnet(&self, request: &SubnetRequest) -> ProviderResult<CreatedResource>;

    /// Creates a router on the external network and attaches the subnet
    async fn create_router(&self, request: &RouterRequest) -> ProviderResult<CreatedResource>;

    /// Creates a security group with all of its rules
    async fn create_security_group(
        &self,
        request: &SecurityGroupRequest,
    ) -> ProviderResult<CreatedResource>;

    async fn create_keypair(&self, request: &KeypairRequest) -> ProviderResult<CreatedResource>;

    async fn create_volume(&self, request: &VolumeRequest) -> ProviderResult<CreatedResource>;

    async fn create_instance(&self, request: &InstanceRequest) -> ProviderResult<CreatedResource>;

    /// Current view of one resource, `None` when it does not exist
    async fn get(&self, kind: ResourceKind, id: &str) -> ProviderResult<Option<ResourceInfo>>;

    async fn list(&self, kind: ResourceKind) -> ProviderResult<Vec<ResourceInfo>>;

    /// Deletes a resource. A missing resource yields `ProviderError::NotFound`.
    async fn delete(&self, kind: ResourceKind, id: &str) -> ProviderResult<()>;

    /// Polls until the resource reaches `target`, bounded by `timeout`.
    async fn wait_for_status(
        &self,
        kind: ResourceKind,
        id: &str,
        target: WaitTarget,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ProviderResult<Option<ResourceInfo>> {
        let poll = RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(15),
            backoff_multiplier: 1.5,
            jitter: false,
        };
        wait_with(self, &poll, kind, id, target, timeout, cancel).await
    }
}

/// Shared polling loop behind [`ProviderAdapter::wait_for_status`], usable by
/// adapters with their own poll cadence.
pub async fn wait_with<P: ProviderAdapter + ?Sized>(
    provider: &P,
    poll: &RetryConfig,
    kind: ResourceKind,
    id: &str,
    target: WaitTarget,
    timeout: Duration,
    cancel: &CancellationToken,
) -> ProviderResult<Option<ResourceInfo>> {
    let operation = format!("wait {} {} {:?}", kind, id, target);
    let result = retry::poll_until(poll, &operation, timeout, cancel, |_| async move {
        match (provider.get(kind, id).await, target) {
            (Ok(Some(info)), WaitTarget::Active) => match info.status {
                RemoteStatus::Active => Attempt::Done(Some(info)),
                RemoteStatus::Error => Attempt::Abort(ProviderError::Fatal(format!(
                    "{} {} entered error state{}",
                    kind,
                    id,
                    info.fault
                        .as_deref()
                        .map(|f| format!(": {}", f))
                        .unwrap_or_default()
                ))),
                _ => Attempt::Retry(ProviderError::Transient(format!(
                    "{} {} is {}",
                    kind, id, info.status
                ))),
            },
            (Ok(None), WaitTarget::Active) => Attempt::Abort(ProviderError::NotFound(format!(
                "{} {} disappeared",
                kind, id
            ))),
            (Ok(None), WaitTarget::Gone) => Attempt::Done(None),
            (Ok(Some(info)), WaitTarget::Gone) => Attempt::Retry(ProviderError::Transient(
                format!("{} {} is still {}", kind, id, info.status),
            )),
            (Err(e), _) if e.is_transient() => Attempt::Retry(e),
            (Err(e), _) => Attempt::Abort(e),
        }
    })
    .await;

    result.map_err(|e| match e {
        RetryError::Aborted(e) => e,
        RetryError::Cancelled => ProviderError::Fatal(format!("{} cancelled", operation)),
        other => ProviderError::Fatal(format!("{}: {}", operation, other)),
    })
}

/// Authentication status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStatus {
    /// Whether authentication is valid
    pub authenticated: bool,

    /// Account/project information if available
    pub account_info: Option<String>,

    /// Error message if not authenticated
    pub error: Option<String>,
}

impl AuthStatus {
    pub fn ok(account_info: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            account_info: Some(account_info.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            authenticated: false,
            account_info: None,
            error: Some(error.into()),
        }
    }
}

/// What [`ProviderAdapter::wait_for_status`] waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    Active,
    Gone,
}

/// Provider-side status of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Building,
    Active,
    Error,
    Deleting,
}

impl std::fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteStatus::Building => write!(f, "building"),
            RemoteStatus::Active => write!(f, "active"),
            RemoteStatus::Error => write!(f, "error"),
            RemoteStatus::Deleting => write!(f, "deleting"),
        }
    }
}

/// Result of a create call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedResource {
    pub provider_id: String,

    /// Attributes known at creation time (CIDR, addresses, ...)
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
}

impl CreatedResource {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn with_output(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.outputs.insert(key.into(), value);
        self
    }
}

/// Provider view of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub provider_id: String,
    pub name: String,
    pub kind: ResourceKind,
    pub status: RemoteStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetRequest {
    pub name: String,
    pub network_id: String,
    pub cidr: String,
    pub dns_nameservers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterRequest {
    pub name: String,
    pub external_network: String,
    pub subnet_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupRequest {
    pub name: String,
    pub rules: Vec<SecurityRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeypairRequest {
    pub name: String,
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRequest {
    pub name: String,
    pub size_gb: u32,
    pub volume_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRequest {
    pub name: String,
    pub flavor: String,
    pub image: String,
    /// Network id or name
    pub network: String,
    pub security_groups: Vec<String>,
    pub key_name: String,
    /// Volume ids to attach
    pub volumes: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}
