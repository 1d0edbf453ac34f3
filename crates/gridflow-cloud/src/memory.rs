//! In-memory provider
//!
//! A simulated cloud used by tests and dry runs. It keeps resources in a map,
//! enforces its quota, refuses to delete resources that are still referenced
//! and lets callers inject faults per operation, kind and resource name.

use crate::context::{Catalog, Flavor, Image, Quota};
use crate::provider::{
    self, AuthStatus, CreatedResource, InstanceRequest, KeypairRequest, NetworkRequest,
    ProviderAdapter, ProviderResult, RemoteStatus, ResourceInfo, RouterRequest,
    SecurityGroupRequest, SubnetRequest, VolumeRequest, WaitTarget,
};
use crate::retry::RetryConfig;
use async_trait::async_trait;
use gridflow_core::{ProviderError, ResourceKind};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Provider operation, as recorded in the call log and matched by faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Create,
    Get,
    List,
    Delete,
}

/// One call received by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    pub kind: ResourceKind,
    /// Resource name for creations, provider id otherwise
    pub target: String,
}

/// An injected failure.
#[derive(Debug, Clone)]
pub struct Fault {
    op: Op,
    kind: ResourceKind,
    name_contains: Option<String>,
    error: ProviderError,
    skip: u32,
    remaining: Option<u32>,
    persist: bool,
}

impl Fault {
    pub fn on_create(kind: ResourceKind, error: ProviderError) -> Self {
        Self::new(Op::Create, kind, error)
    }

    pub fn on_delete(kind: ResourceKind, error: ProviderError) -> Self {
        Self::new(Op::Delete, kind, error)
    }

    pub fn on_get(kind: ResourceKind, error: ProviderError) -> Self {
        Self::new(Op::Get, kind, error)
    }

    fn new(op: Op, kind: ResourceKind, error: ProviderError) -> Self {
        Self {
            op,
            kind,
            name_contains: None,
            error,
            skip: 0,
            remaining: None,
            persist: false,
        }
    }

    /// Only fire for resources whose name contains `fragment`.
    pub fn named(mut self, fragment: impl Into<String>) -> Self {
        self.name_contains = Some(fragment.into());
        self
    }

    /// Let the first `calls` matching calls pass.
    pub fn after(mut self, calls: u32) -> Self {
        self.skip = calls;
        self
    }

    /// Fire at most `times` times.
    pub fn times(mut self, times: u32) -> Self {
        self.remaining = Some(times);
        self
    }

    /// Create the resource anyway and still report the error, like a
    /// response lost after the cloud accepted the request.
    pub fn after_creating(mut self) -> Self {
        self.persist = true;
        self
    }

    fn matches(&self, op: Op, kind: ResourceKind, name: &str) -> bool {
        self.op == op
            && self.kind == kind
            && self.remaining != Some(0)
            && self
                .name_contains
                .as_deref()
                .is_none_or(|fragment| name.contains(fragment))
    }
}

#[derive(Debug, Clone, Default)]
struct Usage {
    instances: u64,
    cores: u64,
    ram_mb: u64,
    volumes: u64,
    volume_gb: u64,
}

#[derive(Debug, Clone)]
struct Stored {
    info: ResourceInfo,
    /// Provider ids or names this resource depends on
    refs: Vec<String>,
    usage: Usage,
    /// `get` calls left before a building resource turns active
    pending_polls: u32,
}

#[derive(Debug, Default)]
struct State {
    resources: BTreeMap<String, Stored>,
    next_id: u64,
    next_address: u32,
    faults: Vec<Fault>,
    calls: Vec<Call>,
}

impl State {
    fn take_fault(&mut self, op: Op, kind: ResourceKind, name: &str) -> Option<(ProviderError, bool)> {
        for fault in self.faults.iter_mut() {
            if !fault.matches(op, kind, name) {
                continue;
            }
            if fault.skip > 0 {
                fault.skip -= 1;
                continue;
            }
            if let Some(remaining) = fault.remaining.as_mut() {
                *remaining -= 1;
            }
            return Some((fault.error.clone(), fault.persist));
        }
        None
    }

    fn used(&self) -> Usage {
        self.resources.values().fold(Usage::default(), |mut acc, r| {
            acc.instances += r.usage.instances;
            acc.cores += r.usage.cores;
            acc.ram_mb += r.usage.ram_mb;
            acc.volumes += r.usage.volumes;
            acc.volume_gb += r.usage.volume_gb;
            acc
        })
    }
}

fn remaining(limit: Option<u64>, used: u64) -> Option<u64> {
    limit.map(|limit| limit.saturating_sub(used))
}

fn exceeds(limit: Option<u64>, used: u64, requested: u64) -> bool {
    requested > 0 && limit.is_some_and(|limit| used + requested > limit)
}

/// Simulated cloud.
pub struct InMemoryProvider {
    name: String,
    catalog: Catalog,
    latency: Duration,
    build_polls: u32,
    poll: RetryConfig,
    state: Mutex<State>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl InMemoryProvider {
    /// A cloud offering `small` and `large` flavors, an `ubuntu-24.04` image
    /// and a `public` external network.
    pub fn new(name: impl Into<String>) -> Self {
        let catalog = Catalog {
            flavors: vec![
                Flavor {
                    name: "small".to_string(),
                    vcpus: 2,
                    ram_mb: 4096,
                    disk_gb: 20,
                },
                Flavor {
                    name: "large".to_string(),
                    vcpus: 8,
                    ram_mb: 16384,
                    disk_gb: 80,
                },
            ],
            images: vec![Image {
                id: "img-ubuntu-2404".to_string(),
                name: "ubuntu-24.04".to_string(),
                active: true,
            }],
            networks: vec!["public".to_string()],
            quota: Quota {
                instances: Some(20),
                cores: Some(64),
                ram_mb: Some(131072),
                volumes: Some(20),
                volume_gb: Some(2000),
            },
            refreshed_at: None,
        };

        Self {
            name: name.into(),
            catalog,
            latency: Duration::ZERO,
            build_polls: 1,
            poll: RetryConfig::immediate(0),
            state: Mutex::new(State::default()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Project limits; usage of live resources is subtracted from them.
    pub fn with_quota(mut self, quota: Quota) -> Self {
        self.catalog.quota = quota;
        self
    }

    /// Delay every create and delete call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of `get` calls an instance or volume stays in `building`.
    pub fn with_build_polls(mut self, polls: u32) -> Self {
        self.build_polls = polls;
        self
    }

    pub fn inject(&self, fault: Fault) {
        self.state().faults.push(fault);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn count_calls(&self, op: Op, kind: ResourceKind) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.op == op && c.kind == kind)
            .count()
    }

    /// Live resources of a kind.
    pub fn live(&self, kind: ResourceKind) -> Vec<ResourceInfo> {
        self.state()
            .resources
            .values()
            .filter(|r| r.info.kind == kind)
            .map(|r| r.info.clone())
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.state().resources.len()
    }

    /// Highest number of create/delete calls observed at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Registers a resource created outside of gridflow and returns its id.
    pub fn seed(&self, kind: ResourceKind, name: &str) -> String {
        let mut state = self.state();
        let id = allocate_id(&mut state, kind);
        state.resources.insert(
            id.clone(),
            Stored {
                info: ResourceInfo {
                    provider_id: id.clone(),
                    name: name.to_string(),
                    kind,
                    status: RemoteStatus::Active,
                    fault: None,
                    outputs: BTreeMap::new(),
                },
                refs: Vec::new(),
                usage: Usage::default(),
                pending_polls: 0,
            },
        );
        id
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn enter(&self) -> Flight<'_> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let flight = Flight(&self.in_flight);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        flight
    }

    async fn create(
        &self,
        kind: ResourceKind,
        name: &str,
        refs: Vec<String>,
        usage: Usage,
        outputs: BTreeMap<String, serde_json::Value>,
    ) -> ProviderResult<CreatedResource> {
        let _flight = self.enter().await;
        let mut state = self.state();
        state.calls.push(Call {
            op: Op::Create,
            kind,
            target: name.to_string(),
        });

        let fault = state.take_fault(Op::Create, kind, name);
        if let Some((error, false)) = fault {
            return Err(error);
        }

        let used = state.used();
        let quota = &self.catalog.quota;
        for (what, limit, used, requested) in [
            ("instances", quota.instances, used.instances, usage.instances),
            ("cores", quota.cores, used.cores, usage.cores),
            ("ram", quota.ram_mb, used.ram_mb, usage.ram_mb),
            ("volumes", quota.volumes, used.volumes, usage.volumes),
            ("gigabytes", quota.volume_gb, used.volume_gb, usage.volume_gb),
        ] {
            if exceeds(limit, used, requested) {
                return Err(ProviderError::Fatal(format!(
                    "Quota exceeded for {}: requested {}, in use {}, limit {}",
                    what,
                    requested,
                    used,
                    limit.unwrap_or_default()
                )));
            }
        }

        let id = allocate_id(&mut state, kind);
        let building = matches!(kind, ResourceKind::Instance | ResourceKind::Volume);
        let mut outputs = outputs;
        if kind == ResourceKind::Instance {
            state.next_address += 1;
            outputs.insert(
                "address".to_string(),
                serde_json::json!(format!("10.0.0.{}", state.next_address + 9)),
            );
        }

        state.resources.insert(
            id.clone(),
            Stored {
                info: ResourceInfo {
                    provider_id: id.clone(),
                    name: name.to_string(),
                    kind,
                    status: if building && self.build_polls > 0 {
                        RemoteStatus::Building
                    } else {
                        RemoteStatus::Active
                    },
                    fault: None,
                    outputs: outputs.clone(),
                },
                refs,
                usage,
                pending_polls: if building { self.build_polls } else { 0 },
            },
        );

        if let Some((error, true)) = fault {
            return Err(error);
        }
        Ok(CreatedResource {
            provider_id: id,
            outputs,
        })
    }
}

fn allocate_id(state: &mut State, kind: ResourceKind) -> String {
    state.next_id += 1;
    format!("{}-{:04}", kind, state.next_id)
}

struct Flight<'a>(&'a AtomicUsize);

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProviderAdapter for InMemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check_auth(&self) -> ProviderResult<AuthStatus> {
        Ok(AuthStatus::ok(format!("in-memory project {}", self.name)))
    }

    async fn list_flavors(&self) -> ProviderResult<Vec<Flavor>> {
        Ok(self.catalog.flavors.clone())
    }

    async fn list_images(&self) -> ProviderResult<Vec<Image>> {
        Ok(self.catalog.images.clone())
    }

    async fn list_networks(&self) -> ProviderResult<Vec<String>> {
        let mut networks = self.catalog.networks.clone();
        networks.extend(
            self.live(ResourceKind::Network)
                .into_iter()
                .map(|n| n.name),
        );
        Ok(networks)
    }

    async fn quota(&self) -> ProviderResult<Quota> {
        let used = self.state().used();
        let limits = &self.catalog.quota;
        Ok(Quota {
            instances: remaining(limits.instances, used.instances),
            cores: remaining(limits.cores, used.cores),
            ram_mb: remaining(limits.ram_mb, used.ram_mb),
            volumes: remaining(limits.volumes, used.volumes),
            volume_gb: remaining(limits.volume_gb, used.volume_gb),
        })
    }

    async fn create_network(&self, request: &NetworkRequest) -> ProviderResult<CreatedResource> {
        self.create(
            ResourceKind::Network,
            &request.name,
            Vec::new(),
            Usage::default(),
            BTreeMap::new(),
        )
        .await
    }

    async fn create_subnet(&self, request: &SubnetRequest) -> ProviderResult<CreatedResource> {
        let outputs = BTreeMap::from([
            ("cidr".to_string(), serde_json::json!(request.cidr)),
            ("network_id".to_string(), serde_json::json!(request.network_id)),
        ]);
        self.create(
            ResourceKind::Subnet,
            &request.name,
            vec![request.network_id.clone()],
            Usage::default(),
            outputs,
        )
        .await
    }

    async fn create_router(&self, request: &RouterRequest) -> ProviderResult<CreatedResource> {
        let outputs = BTreeMap::from([(
            "external_network".to_string(),
            serde_json::json!(request.external_network),
        )]);
        self.create(
            ResourceKind::Router,
            &request.name,
            vec![request.subnet_id.clone()],
            Usage::default(),
            outputs,
        )
        .await
    }

    async fn create_security_group(
        &self,
        request: &SecurityGroupRequest,
    ) -> ProviderResult<CreatedResource> {
        let outputs = BTreeMap::from([(
            "rules".to_string(),
            serde_json::json!(request.rules.len()),
        )]);
        self.create(
            ResourceKind::SecurityGroup,
            &request.name,
            Vec::new(),
            Usage::default(),
            outputs,
        )
        .await
    }

    async fn create_keypair(&self, request: &KeypairRequest) -> ProviderResult<CreatedResource> {
        self.create(
            ResourceKind::Keypair,
            &request.name,
            Vec::new(),
            Usage::default(),
            BTreeMap::new(),
        )
        .await
    }

    async fn create_volume(&self, request: &VolumeRequest) -> ProviderResult<CreatedResource> {
        let usage = Usage {
            volumes: 1,
            volume_gb: u64::from(request.size_gb),
            ..Default::default()
        };
        let outputs = BTreeMap::from([("size_gb".to_string(), serde_json::json!(request.size_gb))]);
        self.create(ResourceKind::Volume, &request.name, Vec::new(), usage, outputs)
            .await
    }

    async fn create_instance(&self, request: &InstanceRequest) -> ProviderResult<CreatedResource> {
        let flavor = self.catalog.flavor(&request.flavor).ok_or_else(|| {
            ProviderError::Fatal(format!("Flavor {} could not be found", request.flavor))
        })?;
        if self.catalog.image(&request.image).is_none() {
            return Err(ProviderError::Fatal(format!(
                "Image {} could not be found",
                request.image
            )));
        }

        let usage = Usage {
            instances: 1,
            cores: u64::from(flavor.vcpus),
            ram_mb: flavor.ram_mb,
            ..Default::default()
        };
        let mut refs = vec![request.network.clone()];
        refs.extend(request.security_groups.iter().cloned());
        refs.extend(request.volumes.iter().cloned());
        self.create(
            ResourceKind::Instance,
            &request.name,
            refs,
            usage,
            BTreeMap::new(),
        )
        .await
    }

    async fn get(&self, kind: ResourceKind, id: &str) -> ProviderResult<Option<ResourceInfo>> {
        let mut state = self.state();
        state.calls.push(Call {
            op: Op::Get,
            kind,
            target: id.to_string(),
        });

        let name = match state.resources.get(id) {
            Some(stored) if stored.info.kind == kind => stored.info.name.clone(),
            _ => return Ok(None),
        };
        if let Some((error, _)) = state.take_fault(Op::Get, kind, &name) {
            return Err(error);
        }

        let Some(stored) = state.resources.get_mut(id) else {
            return Ok(None);
        };
        if stored.pending_polls > 0 {
            stored.pending_polls -= 1;
            if stored.pending_polls == 0 && stored.info.status == RemoteStatus::Building {
                stored.info.status = RemoteStatus::Active;
            }
            return Ok(Some(ResourceInfo {
                status: RemoteStatus::Building,
                ..stored.info.clone()
            }));
        }
        Ok(Some(stored.info.clone()))
    }

    async fn wait_for_status(
        &self,
        kind: ResourceKind,
        id: &str,
        target: WaitTarget,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ProviderResult<Option<ResourceInfo>> {
        provider::wait_with(self, &self.poll, kind, id, target, timeout, cancel).await
    }

    async fn list(&self, kind: ResourceKind) -> ProviderResult<Vec<ResourceInfo>> {
        self.state().calls.push(Call {
            op: Op::List,
            kind,
            target: String::new(),
        });
        Ok(self.live(kind))
    }

    async fn delete(&self, kind: ResourceKind, id: &str) -> ProviderResult<()> {
        let _flight = self.enter().await;
        let mut state = self.state();
        state.calls.push(Call {
            op: Op::Delete,
            kind,
            target: id.to_string(),
        });

        let name = match state.resources.get(id) {
            Some(stored) if stored.info.kind == kind => stored.info.name.clone(),
            _ => {
                return Err(ProviderError::NotFound(format!(
                    "{} {} could not be found",
                    kind, id
                )));
            }
        };
        if let Some((error, _)) = state.take_fault(Op::Delete, kind, &name) {
            return Err(error);
        }

        let in_use = state
            .resources
            .iter()
            .any(|(other, stored)| other != id && stored.refs.iter().any(|r| r == id));
        if in_use {
            return Err(ProviderError::Fatal(format!(
                "{} {} is still in use",
                kind, id
            )));
        }

        state.resources.remove(id);
        Ok(())
    }
}
