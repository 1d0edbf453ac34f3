//! Provisioning engine
//!
//! Executes a [`ProvisionPlan`] against the provider adapters. A node starts
//! once every dependency is ready; independent nodes run concurrently, capped
//! per cloud by a semaphore. Transient provider errors are retried with
//! backoff, everything else fails the node.
//!
//! The first unrecoverable failure (or a cancellation) halts new creations.
//! In-flight creations settle, then every node created by the run is deleted
//! again in reverse dependency order. A creation whose request went out but
//! whose response never arrived is looked up by name first, so a halt during
//! its backoff does not leave the resource behind. Resources the compensating
//! deletion cannot release are reported with their provider ids.

use crate::context::MultiCloudContext;
use crate::plan::ProvisionPlan;
use crate::planner::TUNNEL_KEY;
use crate::provider::{
    CreatedResource, InstanceRequest, KeypairRequest, NetworkRequest, ProviderAdapter,
    RouterRequest, SecurityGroupRequest, SubnetRequest, VolumeRequest, WaitTarget,
};
use crate::retry::{retry_with_backoff, Attempt, RetryConfig, RetryError};
use futures_util::stream::{FuturesUnordered, StreamExt};
use gridflow_core::{
    CleanupFailure, ClusterError, ClusterRecord, NetworkRef, NodeFailure, ProviderError,
    ProvisioningFailure, ResourceId, ResourceKind, ResourceNode, ResourceSpec, ResourceStatus,
    Result, SshAccess,
};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Concurrency, retry and timeout policy of the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Provider calls in flight per cloud
    pub concurrency_per_cloud: usize,

    /// Backoff for transient provider errors
    pub retry: RetryConfig,

    /// Upper bound of a single provider call
    pub call_timeout: Duration,

    /// How long an instance or volume may take to become active
    pub ready_timeout: Duration,

    /// How long an instance or volume may take to disappear
    pub delete_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency_per_cloud: 4,
            retry: RetryConfig::default(),
            call_timeout: Duration::from_secs(120),
            ready_timeout: Duration::from_secs(600),
            delete_timeout: Duration::from_secs(300),
        }
    }
}

/// Outcome of a deletion run.
#[derive(Debug, Clone, Default)]
pub struct DeletionReport {
    /// The input nodes with their final status
    pub nodes: Vec<ResourceNode>,

    /// Resources that are still alive
    pub failures: Vec<CleanupFailure>,
}

impl DeletionReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn deleted(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes
            .iter()
            .filter(|n| n.status == ResourceStatus::Deleted)
    }
}

pub struct ProvisioningEngine {
    clouds: Arc<MultiCloudContext>,
    config: EngineConfig,
    limits: BTreeMap<String, Arc<Semaphore>>,
}

/// Result of one node operation.
struct Settled {
    index: usize,
    provider_id: Option<String>,
    outputs: BTreeMap<String, serde_json::Value>,
    outcome: std::result::Result<(), Failure>,
    /// A create went out but neither its result nor a lookup confirmed it
    unconfirmed: Option<String>,
}

enum Failure {
    Error(String),
    Cancelled,
}

impl Failure {
    fn message(&self) -> String {
        match self {
            Failure::Error(message) => message.clone(),
            Failure::Cancelled => "cancelled".to_string(),
        }
    }
}

impl Settled {
    fn failed(index: usize, provider_id: Option<String>, failure: Failure) -> Self {
        Self {
            index,
            provider_id,
            outputs: BTreeMap::new(),
            outcome: Err(failure),
            unconfirmed: None,
        }
    }

    fn ok(index: usize, provider_id: Option<String>, outputs: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            index,
            provider_id,
            outputs,
            outcome: Ok(()),
            unconfirmed: None,
        }
    }
}

fn describe<E: std::fmt::Display>(error: RetryError<E>) -> Failure {
    match error {
        RetryError::Cancelled => Failure::Cancelled,
        RetryError::Aborted(e) => Failure::Error(e.to_string()),
        other => Failure::Error(other.to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deletion {
    Pending,
    Running,
    Done,
    Failed,
}

impl ProvisioningEngine {
    pub fn new(clouds: Arc<MultiCloudContext>, config: EngineConfig) -> Self {
        let permits = config.concurrency_per_cloud.max(1);
        let limits = clouds
            .names()
            .map(|name| (name.to_string(), Arc::new(Semaphore::new(permits))))
            .collect();
        Self {
            clouds,
            config,
            limits,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clouds(&self) -> &Arc<MultiCloudContext> {
        &self.clouds
    }

    /// Realizes every node of `plan` that is not ready yet.
    ///
    /// Returns all plan nodes, ready, on success. On failure or cancellation
    /// the created nodes are deleted again and `ProvisioningFailed` carries
    /// the nodes with their final status plus whatever could not be deleted.
    pub async fn provision(
        &self,
        plan: &ProvisionPlan,
        cancel: &CancellationToken,
    ) -> Result<Vec<ResourceNode>> {
        self.provision_reporting(plan, cancel, None).await
    }

    /// [`ProvisioningEngine::provision`], sending every node to `progress`
    /// as soon as its creation settles, provider id included.
    pub async fn provision_reporting(
        &self,
        plan: &ProvisionPlan,
        cancel: &CancellationToken,
        progress: Option<UnboundedSender<ResourceNode>>,
    ) -> Result<Vec<ResourceNode>> {
        let mut nodes: Vec<ResourceNode> = plan.nodes().to_vec();
        let index: HashMap<ResourceId, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();

        info!(
            cluster_id = %plan.cluster_id,
            summary = %plan.summary(),
            "Provisioning plan"
        );

        // Stops queued and retrying creations once the run fails
        let halt = cancel.child_token();
        let mut started = vec![false; nodes.len()];
        let mut running = FuturesUnordered::new();
        let mut cause: Option<NodeFailure> = None;
        let mut unconfirmed: Vec<(usize, String)> = Vec::new();
        let mut halted = false;

        loop {
            if !halted && (cause.is_some() || cancel.is_cancelled()) {
                halted = true;
                halt.cancel();
                warn!(
                    cluster_id = %plan.cluster_id,
                    in_flight = running.len(),
                    "Halting provisioning, waiting for in-flight creations"
                );
            }

            if !halted {
                for i in 0..nodes.len() {
                    if started[i] || nodes[i].status != ResourceStatus::Planned {
                        continue;
                    }
                    let deps_ready = nodes[i].depends_on.iter().all(|dep| {
                        index
                            .get(dep)
                            .is_some_and(|&d| nodes[d].status == ResourceStatus::Ready)
                    });
                    if !deps_ready {
                        continue;
                    }

                    let deps: Vec<ResourceNode> = nodes[i]
                        .depends_on
                        .iter()
                        .filter_map(|dep| index.get(dep).map(|&d| nodes[d].clone()))
                        .collect();
                    started[i] = true;
                    nodes[i].set_status(ResourceStatus::Creating);
                    debug!(resource = %nodes[i].id, "Creating");
                    running.push(self.create_node(
                        i,
                        nodes[i].clone(),
                        deps,
                        &plan.cluster_id,
                        &halt,
                    ));
                }
            }

            if running.is_empty() {
                break;
            }

            tokio::select! {
                Some(settled) = running.next() => {
                    if let Some(reason) = settled.unconfirmed {
                        unconfirmed.push((settled.index, reason));
                    }
                    let node = &mut nodes[settled.index];
                    node.provider_id = settled.provider_id.or(node.provider_id.take());
                    node.outputs.extend(settled.outputs);
                    match settled.outcome {
                        Ok(()) => {
                            node.error = None;
                            node.set_status(ResourceStatus::Ready);
                            info!(
                                cloud = %node.cloud,
                                resource = %node.id,
                                provider_id = node.provider_id.as_deref().unwrap_or("-"),
                                "Resource ready"
                            );
                        }
                        Err(failure) => {
                            let message = failure.message();
                            node.mark_failed(message.clone());
                            if matches!(failure, Failure::Error(_)) && cause.is_none() {
                                error!(
                                    cloud = %node.cloud,
                                    resource = %node.id,
                                    error = %message,
                                    "Resource creation failed"
                                );
                                cause = Some(NodeFailure {
                                    resource: node.id.clone(),
                                    cloud: node.cloud.clone(),
                                    kind: node.kind(),
                                    message,
                                });
                            }
                        }
                    }
                    if let Some(progress) = &progress {
                        // a dropped receiver only loses the updates
                        let _ = progress.send(node.clone());
                    }
                }
                _ = cancel.cancelled(), if !halted => {}
            }
        }

        if cause.is_none() && !cancel.is_cancelled() {
            info!(cluster_id = %plan.cluster_id, "Provisioning complete");
            return Ok(nodes);
        }

        // Compensating deletion for everything this run created
        let created: Vec<usize> = (0..nodes.len())
            .filter(|&i| {
                started[i]
                    && (nodes[i].provider_id.is_some()
                        || (nodes[i].kind() == ResourceKind::Tunnel && nodes[i].is_ready()))
            })
            .collect();
        warn!(
            cluster_id = %plan.cluster_id,
            resources = created.len(),
            "Rolling back created resources"
        );

        let targets: Vec<ResourceNode> = created.iter().map(|&i| nodes[i].clone()).collect();
        let mut report = self.destroy(&targets, &CancellationToken::new()).await;
        for (&i, node) in created.iter().zip(report.nodes) {
            nodes[i] = node;
        }
        for (i, reason) in unconfirmed {
            let node = &nodes[i];
            report.failures.push(CleanupFailure {
                resource: node.id.clone(),
                cloud: node.cloud.clone(),
                kind: node.kind(),
                provider_id: None,
                message: format!(
                    "create of {} was sent but could not be confirmed ({}), check the cloud for it",
                    node.name(),
                    reason
                ),
            });
        }
        if !report.failures.is_empty() {
            error!(
                cluster_id = %plan.cluster_id,
                failures = report.failures.len(),
                "Rollback left resources behind"
            );
        }

        let mut partial = ClusterRecord::new(
            plan.cluster_id.clone(),
            plan.spec.clone(),
            SshAccess::default(),
        );
        partial.resources = nodes;
        Err(ClusterError::ProvisioningFailed(Box::new(ProvisioningFailure {
            partial,
            cause,
            cleanup_failures: report.failures,
        })))
    }

    /// Deletes `nodes` in reverse dependency order.
    ///
    /// Already released nodes are skipped and a resource that is gone counts
    /// as deleted, so running a deletion twice is harmless. A node whose
    /// dependent could not be deleted is left alone and reported as well.
    pub async fn destroy(&self, nodes: &[ResourceNode], cancel: &CancellationToken) -> DeletionReport {
        let mut nodes: Vec<ResourceNode> = nodes.to_vec();
        let mut state: Vec<Deletion> = nodes
            .iter()
            .map(|n| {
                if n.is_released() {
                    Deletion::Done
                } else {
                    Deletion::Pending
                }
            })
            .collect();
        let mut messages: Vec<Option<String>> = vec![None; nodes.len()];

        // dependents[i]: nodes that have to be gone before node i
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            for (j, other) in nodes.iter().enumerate() {
                if i != j && other.depends_on.contains(&node.id) {
                    dependents[i].push(j);
                }
            }
        }

        let previous: Vec<ResourceStatus> = nodes.iter().map(|n| n.status).collect();
        let mut running = FuturesUnordered::new();

        loop {
            let mut changed = true;
            while changed {
                changed = false;
                for i in 0..nodes.len() {
                    if state[i] != Deletion::Pending {
                        continue;
                    }
                    if let Some(&blocker) = dependents[i]
                        .iter()
                        .find(|&&j| state[j] == Deletion::Failed)
                    {
                        state[i] = Deletion::Failed;
                        messages[i] = Some(format!(
                            "not deleted, {} could not be released",
                            nodes[blocker].id
                        ));
                        changed = true;
                        continue;
                    }
                    if cancel.is_cancelled() {
                        continue;
                    }
                    if dependents[i].iter().all(|&j| state[j] == Deletion::Done) {
                        state[i] = Deletion::Running;
                        nodes[i].set_status(ResourceStatus::Deleting);
                        debug!(resource = %nodes[i].id, "Deleting");
                        running.push(self.delete_node(i, nodes[i].clone(), cancel));
                    }
                }
            }

            let Some(settled) = running.next().await else {
                break;
            };
            let i = settled.index;
            match settled.outcome {
                Ok(()) => {
                    state[i] = Deletion::Done;
                    nodes[i].error = None;
                    nodes[i].set_status(ResourceStatus::Deleted);
                    info!(cloud = %nodes[i].cloud, resource = %nodes[i].id, "Resource deleted");
                }
                Err(failure) => {
                    state[i] = Deletion::Failed;
                    messages[i] = Some(failure.message());
                }
            }
        }

        let mut failures = Vec::new();
        for i in 0..nodes.len() {
            let message = match state[i] {
                Deletion::Done => continue,
                Deletion::Failed => messages[i].take().unwrap_or_default(),
                Deletion::Pending | Deletion::Running => "cancelled".to_string(),
            };
            let node = &mut nodes[i];
            node.error = Some(message.clone());
            node.set_status(previous[i]);
            warn!(
                cloud = %node.cloud,
                resource = %node.id,
                provider_id = node.provider_id.as_deref().unwrap_or("-"),
                error = %message,
                "Resource could not be deleted"
            );
            failures.push(CleanupFailure {
                resource: node.id.clone(),
                cloud: node.cloud.clone(),
                kind: node.kind(),
                provider_id: node.provider_id.clone(),
                message,
            });
        }

        DeletionReport { nodes, failures }
    }

    async fn create_node(
        &self,
        index: usize,
        node: ResourceNode,
        deps: Vec<ResourceNode>,
        cluster_id: &str,
        cancel: &CancellationToken,
    ) -> Settled {
        if let ResourceSpec::Tunnel { clouds, .. } = &node.spec {
            return Settled::ok(index, None, tunnel_outputs(clouds, &deps));
        }

        let request = match build_request(&node, &deps, cluster_id) {
            Ok(request) => request,
            Err(message) => return Settled::failed(index, None, Failure::Error(message)),
        };
        let (adapter, limit) = match self.cloud(&node.cloud) {
            Ok(cloud) => cloud,
            Err(message) => return Settled::failed(index, None, Failure::Error(message)),
        };

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Settled::failed(index, None, Failure::Cancelled),
            permit = limit.acquire() => match permit {
                Ok(permit) => permit,
                Err(e) => return Settled::failed(index, None, Failure::Error(e.to_string())),
            },
        };

        let kind = node.kind();
        let name = node.name();
        let operation = format!("create {}", node.id);
        let adapter = adapter.as_ref();
        let request = &request;
        let call_timeout = self.config.call_timeout;
        // Set while a sent request has no confirmed outcome
        let unconfirmed = &AtomicBool::new(false);

        let created = retry_with_backoff(&self.config.retry, &operation, cancel, move |attempt| async move {
            // A previous attempt may have been applied without us seeing the
            // response; adopt the resource instead of creating a duplicate.
            if attempt > 1 {
                match adapter.list(kind).await {
                    Ok(existing) => {
                        if let Some(info) = existing.into_iter().find(|info| info.name == name) {
                            debug!(resource = name, provider_id = %info.provider_id, "Adopting existing resource");
                            return Attempt::Done(CreatedResource {
                                provider_id: info.provider_id,
                                outputs: info.outputs,
                            });
                        }
                    }
                    Err(e) if e.is_transient() => return Attempt::Retry(e),
                    Err(e) => return Attempt::Abort(e),
                }
            }

            unconfirmed.store(true, Ordering::SeqCst);
            match tokio::time::timeout(call_timeout, request.send(adapter)).await {
                Ok(Ok(created)) => Attempt::Done(created),
                Ok(Err(e)) if e.is_transient() => Attempt::Retry(e),
                Ok(Err(e)) => {
                    // rejected, and the lookup above found no earlier copy
                    unconfirmed.store(false, Ordering::SeqCst);
                    Attempt::Abort(e)
                }
                Err(_) => Attempt::Retry(ProviderError::Transient(format!(
                    "no response within {:?}",
                    call_timeout
                ))),
            }
        })
        .await;

        let created = match created {
            Ok(created) => created,
            Err(e) => {
                let failure = describe(e);
                if !unconfirmed.load(Ordering::SeqCst) {
                    return Settled::failed(index, None, failure);
                }
                return self.settle_unconfirmed(index, adapter, kind, name, failure).await;
            }
        };

        let mut outputs = created.outputs;
        if matches!(kind, ResourceKind::Instance | ResourceKind::Volume) {
            let waited = adapter
                .wait_for_status(
                    kind,
                    &created.provider_id,
                    WaitTarget::Active,
                    self.config.ready_timeout,
                    cancel,
                )
                .await;
            match waited {
                Ok(Some(info)) => outputs.extend(info.outputs),
                Ok(None) => {}
                Err(e) => {
                    let failure = if cancel.is_cancelled() {
                        Failure::Cancelled
                    } else {
                        Failure::Error(e.to_string())
                    };
                    return Settled {
                        index,
                        provider_id: Some(created.provider_id),
                        outputs,
                        outcome: Err(failure),
                        unconfirmed: None,
                    };
                }
            }
        }

        Settled::ok(index, Some(created.provider_id), outputs)
    }

    /// Looks up a resource whose create request went out without a
    /// confirmed outcome before the retry loop gave up.
    ///
    /// Runs outside the run's cancellation so a halted run still learns the
    /// provider id and can delete the resource again. If the lookup itself
    /// fails the node is reported as possibly left behind.
    async fn settle_unconfirmed(
        &self,
        index: usize,
        adapter: &dyn ProviderAdapter,
        kind: ResourceKind,
        name: &str,
        failure: Failure,
    ) -> Settled {
        let lookup = tokio::time::timeout(self.config.call_timeout, adapter.list(kind)).await;
        match lookup {
            Ok(Ok(existing)) => match existing.into_iter().find(|info| info.name == name) {
                Some(info) => {
                    warn!(resource = name, provider_id = %info.provider_id, "Found resource of an unconfirmed create");
                    Settled {
                        index,
                        provider_id: Some(info.provider_id),
                        outputs: info.outputs,
                        outcome: Err(failure),
                        unconfirmed: None,
                    }
                }
                None => Settled::failed(index, None, failure),
            },
            Ok(Err(e)) => {
                warn!(resource = name, error = %e, "Could not look up resource of an unconfirmed create");
                Settled {
                    unconfirmed: Some(e.to_string()),
                    ..Settled::failed(index, None, failure)
                }
            }
            Err(_) => {
                warn!(resource = name, "Lookup of an unconfirmed create timed out");
                Settled {
                    unconfirmed: Some(format!("no response within {:?}", self.config.call_timeout)),
                    ..Settled::failed(index, None, failure)
                }
            }
        }
    }

    async fn delete_node(&self, index: usize, node: ResourceNode, cancel: &CancellationToken) -> Settled {
        let Some(provider_id) = node.provider_id.clone() else {
            return Settled::ok(index, None, BTreeMap::new());
        };
        if node.kind() == ResourceKind::Tunnel {
            return Settled::ok(index, Some(provider_id), BTreeMap::new());
        }

        let (adapter, limit) = match self.cloud(&node.cloud) {
            Ok(cloud) => cloud,
            Err(message) => {
                return Settled::failed(index, Some(provider_id), Failure::Error(message));
            }
        };
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Settled::failed(index, Some(provider_id), Failure::Cancelled),
            permit = limit.acquire() => match permit {
                Ok(permit) => permit,
                Err(e) => return Settled::failed(index, Some(provider_id), Failure::Error(e.to_string())),
            },
        };

        let kind = node.kind();
        let operation = format!("delete {}", node.id);
        let adapter = adapter.as_ref();
        let id = provider_id.as_str();
        let call_timeout = self.config.call_timeout;

        let deleted = retry_with_backoff(&self.config.retry, &operation, cancel, move |_| async move {
            match tokio::time::timeout(call_timeout, adapter.delete(kind, id)).await {
                Ok(Ok(())) => Attempt::Done(()),
                Ok(Err(e)) if e.is_not_found() => Attempt::Done(()),
                Ok(Err(e)) if e.is_transient() => Attempt::Retry(e),
                Ok(Err(e)) => Attempt::Abort(e),
                Err(_) => Attempt::Retry(ProviderError::Transient(format!(
                    "no response within {:?}",
                    call_timeout
                ))),
            }
        })
        .await;

        if let Err(e) = deleted {
            return Settled::failed(index, Some(provider_id), describe(e));
        }

        if matches!(kind, ResourceKind::Instance | ResourceKind::Volume) {
            let gone = adapter
                .wait_for_status(kind, id, WaitTarget::Gone, self.config.delete_timeout, cancel)
                .await;
            match gone {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    let failure = if cancel.is_cancelled() {
                        Failure::Cancelled
                    } else {
                        Failure::Error(e.to_string())
                    };
                    return Settled::failed(index, Some(provider_id), failure);
                }
            }
        }

        Settled::ok(index, Some(provider_id), BTreeMap::new())
    }

    fn cloud(&self, name: &str) -> std::result::Result<(Arc<dyn ProviderAdapter>, &Arc<Semaphore>), String> {
        let context = self.clouds.get(name).ok_or_else(|| format!("unknown cloud '{}'", name))?;
        let limit = self
            .limits
            .get(name)
            .ok_or_else(|| format!("no concurrency limit for cloud '{}'", name))?;
        Ok((Arc::clone(context.adapter()), limit))
    }
}

/// Collects the subnet of every participating cloud into the tunnel outputs.
fn tunnel_outputs(clouds: &[String], deps: &[ResourceNode]) -> BTreeMap<String, serde_json::Value> {
    let peers: Vec<serde_json::Value> = deps
        .iter()
        .filter_map(|dep| {
            let cidr = match &dep.spec {
                ResourceSpec::Subnet { cidr, .. } => Some(cidr.clone()),
                _ => dep.get_output::<String>("cidr"),
            }?;
            Some(json!({ "cloud": dep.cloud, "cidr": cidr }))
        })
        .collect();
    BTreeMap::from([
        ("name".to_string(), json!(TUNNEL_KEY)),
        ("clouds".to_string(), json!(clouds)),
        ("peers".to_string(), json!(peers)),
    ])
}

/// A typed create request.
enum Request {
    Network(NetworkRequest),
    Subnet(SubnetRequest),
    Router(RouterRequest),
    SecurityGroup(SecurityGroupRequest),
    Keypair(KeypairRequest),
    Volume(VolumeRequest),
    Instance(InstanceRequest),
}

impl Request {
    async fn send(&self, adapter: &dyn ProviderAdapter) -> crate::provider::ProviderResult<CreatedResource> {
        match self {
            Request::Network(r) => adapter.create_network(r).await,
            Request::Subnet(r) => adapter.create_subnet(r).await,
            Request::Router(r) => adapter.create_router(r).await,
            Request::SecurityGroup(r) => adapter.create_security_group(r).await,
            Request::Keypair(r) => adapter.create_keypair(r).await,
            Request::Volume(r) => adapter.create_volume(r).await,
            Request::Instance(r) => adapter.create_instance(r).await,
        }
    }
}

fn provider_id_of(deps: &[ResourceNode], kind: ResourceKind) -> Option<String> {
    deps.iter()
        .find(|d| d.kind() == kind)
        .and_then(|d| d.provider_id.clone())
}

fn require_dep(deps: &[ResourceNode], kind: ResourceKind, node: &ResourceNode) -> std::result::Result<String, String> {
    provider_id_of(deps, kind)
        .ok_or_else(|| format!("{} has no ready {} dependency", node.id, kind))
}

fn build_request(
    node: &ResourceNode,
    deps: &[ResourceNode],
    cluster_id: &str,
) -> std::result::Result<Request, String> {
    let request = match &node.spec {
        ResourceSpec::Network { name } => Request::Network(NetworkRequest { name: name.clone() }),
        ResourceSpec::Subnet {
            name,
            cidr,
            dns_nameservers,
        } => Request::Subnet(SubnetRequest {
            name: name.clone(),
            network_id: require_dep(deps, ResourceKind::Network, node)?,
            cidr: cidr.clone(),
            dns_nameservers: dns_nameservers.clone(),
        }),
        ResourceSpec::Router {
            name,
            external_network,
        } => Request::Router(RouterRequest {
            name: name.clone(),
            external_network: external_network.clone(),
            subnet_id: require_dep(deps, ResourceKind::Subnet, node)?,
        }),
        ResourceSpec::SecurityGroup { name, rules } => {
            Request::SecurityGroup(SecurityGroupRequest {
                name: name.clone(),
                rules: rules.clone(),
            })
        }
        ResourceSpec::Keypair { name, public_key } => Request::Keypair(KeypairRequest {
            name: name.clone(),
            public_key: public_key.clone(),
        }),
        ResourceSpec::Volume {
            name,
            size_gb,
            volume_type,
            ..
        } => Request::Volume(VolumeRequest {
            name: name.clone(),
            size_gb: *size_gb,
            volume_type: volume_type.clone(),
        }),
        ResourceSpec::Instance {
            name,
            group,
            role,
            flavor,
            image,
            network,
            key_name,
            ..
        } => {
            let network = match network {
                NetworkRef::Existing(existing) => existing.clone(),
                NetworkRef::Planned => require_dep(deps, ResourceKind::Network, node)?,
            };
            let of_kind = |kind: ResourceKind| -> Vec<String> {
                deps.iter()
                    .filter(|d| d.kind() == kind)
                    .filter_map(|d| d.provider_id.clone())
                    .collect()
            };
            let metadata = BTreeMap::from([
                ("gridflow-cluster".to_string(), cluster_id.to_string()),
                ("gridflow-role".to_string(), role.to_string()),
                ("gridflow-group".to_string(), group.clone()),
            ]);
            Request::Instance(InstanceRequest {
                name: name.clone(),
                flavor: flavor.clone(),
                image: image.clone(),
                network,
                security_groups: of_kind(ResourceKind::SecurityGroup),
                key_name: key_name.clone(),
                volumes: of_kind(ResourceKind::Volume),
                metadata,
            })
        }
        ResourceSpec::Tunnel { .. } => {
            return Err(format!("{} is realized locally", node.id));
        }
    };
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CloudContext;
    use crate::memory::{Fault, InMemoryProvider, Op};
    use crate::planner::ResourcePlanner;
    use gridflow_core::{ClusterSettings, ClusterSpec, NetworkSettings, NodeGroup, Role, SshSettings};

    fn group(name: &str, role: Role, count: u32, cloud: &str) -> NodeGroup {
        NodeGroup {
            name: name.to_string(),
            role,
            count,
            cloud: cloud.to_string(),
            flavor: "small".to_string(),
            image: "ubuntu-24.04".to_string(),
            volumes: Vec::new(),
            tags: Vec::new(),
            settings: ClusterSettings::default(),
        }
    }

    fn spec(workers: u32) -> ClusterSpec {
        ClusterSpec {
            groups: vec![
                group("master", Role::Master, 1, "cloud-a"),
                group("compute", Role::Worker, workers, "cloud-a"),
            ],
            defaults: ClusterSettings {
                network: NetworkSettings {
                    external_network: Some("public".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
            clouds: Vec::new(),
            ssh: SshSettings {
                public_key: Some("ssh-ed25519 AAAA test".to_string()),
                ..Default::default()
            },
        }
    }

    async fn setup(provider: Arc<InMemoryProvider>, config: EngineConfig) -> (ProvisioningEngine, Arc<MultiCloudContext>) {
        let clouds = Arc::new(MultiCloudContext::new().with_cloud(CloudContext::new("cloud-a", provider)));
        clouds.refresh_all().await.unwrap();
        (ProvisioningEngine::new(clouds.clone(), config), clouds)
    }

    fn config(concurrency: usize) -> EngineConfig {
        EngineConfig {
            concurrency_per_cloud: concurrency,
            retry: RetryConfig::immediate(3),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_provision_creates_every_node() {
        let provider = Arc::new(InMemoryProvider::new("cloud-a"));
        let (engine, clouds) = setup(provider.clone(), config(4)).await;
        let plan = ResourcePlanner::new(&clouds).plan("abc", &spec(3)).unwrap();

        let nodes = engine.provision(&plan, &CancellationToken::new()).await.unwrap();

        assert!(nodes.iter().all(|n| n.is_ready()));
        assert_eq!(provider.live(ResourceKind::Instance).len(), 4);
        assert_eq!(provider.live(ResourceKind::Network).len(), 1);
        let master = nodes.iter().find(|n| n.name() == "grid-master-abc").unwrap();
        assert!(master.get_output::<String>("address").is_some());
    }

    #[tokio::test]
    async fn test_fatal_error_rolls_back_created_nodes() {
        let provider = Arc::new(InMemoryProvider::new("cloud-a"));
        provider.inject(
            Fault::on_create(
                ResourceKind::Instance,
                ProviderError::Fatal("Quota exceeded for instances".to_string()),
            )
            .named("worker-abc-2"),
        );
        let (engine, clouds) = setup(provider.clone(), config(1)).await;
        let plan = ResourcePlanner::new(&clouds).plan("abc", &spec(3)).unwrap();

        let err = engine.provision(&plan, &CancellationToken::new()).await.unwrap_err();
        let ClusterError::ProvisioningFailed(failure) = err else {
            panic!("expected ProvisioningFailed");
        };

        let cause = failure.cause.as_ref().unwrap();
        assert!(cause.message.contains("Quota exceeded"));
        assert_eq!(cause.kind, ResourceKind::Instance);
        assert!(failure.cleanup_failures.is_empty());
        assert_eq!(provider.live_count(), 0);
        assert!(failure.partial.is_releasable());

        let master = failure
            .partial
            .resources
            .iter()
            .find(|n| n.name() == "grid-master-abc")
            .unwrap();
        assert_eq!(master.status, ResourceStatus::Deleted);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let provider = Arc::new(InMemoryProvider::new("cloud-a"));
        provider.inject(
            Fault::on_create(
                ResourceKind::SecurityGroup,
                ProviderError::Transient("503 Service Unavailable".to_string()),
            )
            .times(2),
        );
        let (engine, clouds) = setup(provider.clone(), config(4)).await;
        let plan = ResourcePlanner::new(&clouds).plan("abc", &spec(1)).unwrap();

        engine.provision(&plan, &CancellationToken::new()).await.unwrap();
        assert_eq!(provider.count_calls(Op::Create, ResourceKind::SecurityGroup), 3);
        assert_eq!(provider.live(ResourceKind::SecurityGroup).len(), 1);
    }

    #[tokio::test]
    async fn test_lost_response_is_adopted_not_duplicated() {
        let provider = Arc::new(InMemoryProvider::new("cloud-a"));
        provider.inject(
            Fault::on_create(
                ResourceKind::Network,
                ProviderError::Transient("timed out".to_string()),
            )
            .after_creating()
            .times(1),
        );
        let (engine, clouds) = setup(provider.clone(), config(4)).await;
        let plan = ResourcePlanner::new(&clouds).plan("abc", &spec(1)).unwrap();

        engine.provision(&plan, &CancellationToken::new()).await.unwrap();
        assert_eq!(provider.live(ResourceKind::Network).len(), 1);
        assert_eq!(provider.count_calls(Op::Create, ResourceKind::Network), 1);
    }

    #[tokio::test]
    async fn test_halt_during_backoff_releases_unconfirmed_create() {
        let provider = Arc::new(InMemoryProvider::new("cloud-a"));
        provider.inject(
            Fault::on_create(
                ResourceKind::Network,
                ProviderError::Transient("timed out".to_string()),
            )
            .after_creating()
            .times(1),
        );
        provider.inject(Fault::on_create(
            ResourceKind::Keypair,
            ProviderError::Fatal("quota".to_string()),
        ));
        let config = EngineConfig {
            concurrency_per_cloud: 4,
            retry: RetryConfig {
                max_attempts: 5,
                initial_delay: Duration::from_millis(200),
                max_delay: Duration::from_millis(200),
                backoff_multiplier: 1.0,
                jitter: false,
            },
            ..Default::default()
        };
        let (engine, clouds) = setup(provider.clone(), config).await;
        let plan = ResourcePlanner::new(&clouds).plan("abc", &spec(1)).unwrap();

        let err = engine.provision(&plan, &CancellationToken::new()).await.unwrap_err();
        let ClusterError::ProvisioningFailed(failure) = err else {
            panic!("expected ProvisioningFailed");
        };

        assert_eq!(failure.cause.as_ref().unwrap().kind, ResourceKind::Keypair);
        // the network was created before the halt cut its backoff short
        assert_eq!(provider.count_calls(Op::Create, ResourceKind::Network), 1);
        assert!(failure.cleanup_failures.is_empty());
        assert_eq!(provider.live_count(), 0);

        let network = failure
            .partial
            .resources
            .iter()
            .find(|n| n.kind() == ResourceKind::Network)
            .unwrap();
        assert!(network.provider_id.is_some());
        assert_eq!(network.status, ResourceStatus::Deleted);
    }

    #[tokio::test]
    async fn test_cancel_during_readiness_wait_releases_instances() {
        let provider = Arc::new(InMemoryProvider::new("cloud-a").with_build_polls(u32::MAX));
        let (engine, clouds) = setup(provider.clone(), config(4)).await;
        let plan = ResourcePlanner::new(&clouds).plan("abc", &spec(2)).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let watcher = provider.clone();
        tokio::spawn(async move {
            while watcher.live(ResourceKind::Instance).len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = engine.provision(&plan, &cancel).await.unwrap_err();
        let ClusterError::ProvisioningFailed(failure) = err else {
            panic!("expected ProvisioningFailed");
        };

        assert!(failure.cause.is_none());
        assert!(failure.cleanup_failures.is_empty());
        assert_eq!(provider.live_count(), 0);
        let instances: Vec<&ResourceNode> = failure
            .partial
            .resources
            .iter()
            .filter(|n| n.kind() == ResourceKind::Instance)
            .collect();
        assert_eq!(instances.len(), 3);
        assert!(instances
            .iter()
            .all(|n| n.provider_id.is_some() && n.status == ResourceStatus::Deleted));
    }

    #[tokio::test]
    async fn test_settled_nodes_are_reported_while_running() {
        let provider = Arc::new(InMemoryProvider::new("cloud-a"));
        let (engine, clouds) = setup(provider.clone(), config(4)).await;
        let plan = ResourcePlanner::new(&clouds).plan("abc", &spec(1)).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let nodes = engine
            .provision_reporting(&plan, &CancellationToken::new(), Some(tx))
            .await
            .unwrap();

        let mut reported = Vec::new();
        while let Ok(node) = rx.try_recv() {
            reported.push(node);
        }
        assert_eq!(reported.len(), nodes.len());
        assert!(reported.iter().all(|n| n.is_ready() && n.provider_id.is_some()));
    }

    #[tokio::test]
    async fn test_concurrency_is_capped_per_cloud() {
        let provider = Arc::new(
            InMemoryProvider::new("cloud-a").with_latency(Duration::from_millis(20)),
        );
        let (engine, clouds) = setup(provider.clone(), config(2)).await;
        let plan = ResourcePlanner::new(&clouds).plan("abc", &spec(6)).unwrap();

        engine.provision(&plan, &CancellationToken::new()).await.unwrap();
        assert!(provider.max_in_flight() <= 2);
        assert_eq!(provider.live(ResourceKind::Instance).len(), 7);
    }

    #[tokio::test]
    async fn test_cancelled_run_is_rolled_back() {
        let provider = Arc::new(InMemoryProvider::new("cloud-a"));
        let (engine, clouds) = setup(provider.clone(), config(4)).await;
        let plan = ResourcePlanner::new(&clouds).plan("abc", &spec(2)).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = engine.provision(&plan, &cancel).await.unwrap_err();

        let ClusterError::ProvisioningFailed(failure) = err else {
            panic!("expected ProvisioningFailed");
        };
        assert!(failure.cause.is_none());
        assert_eq!(provider.live_count(), 0);
    }

    #[tokio::test]
    async fn test_destroy_twice_is_idempotent() {
        let provider = Arc::new(InMemoryProvider::new("cloud-a"));
        let (engine, clouds) = setup(provider.clone(), config(4)).await;
        let plan = ResourcePlanner::new(&clouds).plan("abc", &spec(2)).unwrap();
        let nodes = engine.provision(&plan, &CancellationToken::new()).await.unwrap();

        let first = engine.destroy(&nodes, &CancellationToken::new()).await;
        assert!(first.is_complete());
        assert_eq!(provider.live_count(), 0);

        // same input again: every resource is already gone
        let second = engine.destroy(&nodes, &CancellationToken::new()).await;
        assert!(second.is_complete());
        assert!(second.nodes.iter().all(|n| n.status == ResourceStatus::Deleted));
    }

    #[tokio::test]
    async fn test_failed_deletion_blocks_dependencies() {
        let provider = Arc::new(InMemoryProvider::new("cloud-a"));
        let (engine, clouds) = setup(provider.clone(), config(4)).await;
        let plan = ResourcePlanner::new(&clouds).plan("abc", &spec(1)).unwrap();
        let nodes = engine.provision(&plan, &CancellationToken::new()).await.unwrap();

        provider.inject(Fault::on_delete(
            ResourceKind::Instance,
            ProviderError::Fatal("instance is locked".to_string()),
        ).named("master"));
        let report = engine.destroy(&nodes, &CancellationToken::new()).await;

        assert!(!report.is_complete());
        let failed: Vec<ResourceKind> = report.failures.iter().map(|f| f.kind).collect();
        assert!(failed.contains(&ResourceKind::Instance));
        assert!(failed.contains(&ResourceKind::Network));
        assert!(report
            .failures
            .iter()
            .all(|f| f.provider_id.is_some()));
        // the unaffected worker is gone
        assert!(provider
            .live(ResourceKind::Instance)
            .iter()
            .all(|i| i.name == "grid-master-abc"));
    }
}
