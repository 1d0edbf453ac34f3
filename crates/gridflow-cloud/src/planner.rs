//! Resource planner
//!
//! Expands a [`ClusterSpec`] into the resource graph of a cluster. Every node
//! group becomes one instance node per member; network, subnet, router,
//! security group and keypair nodes are shared between groups through
//! structural keys, so two groups asking for the same network end up on one
//! node. Edges never cross clouds: when several clouds take part, a tunnel
//! node in the multi-cloud scope depends on one anchor node per cloud.
//!
//! All validation happens against the cached catalogs before a single
//! resource is created.

use crate::context::{Catalog, MultiCloudContext};
use crate::plan::ProvisionPlan;
use gridflow_core::{
    ClusterError, ClusterRecord, ClusterSettings, ClusterSpec, Direction, NetworkRef, NodeGroup,
    ResourceId, ResourceKind, ResourceNode, ResourceSpec, Result, Role, SecurityRule,
    MULTI_CLOUD_SCOPE,
};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

pub const DEFAULT_CIDR: &str = "10.0.0.0/24";
pub const DEFAULT_SSH_USER: &str = "ubuntu";
pub const DEFAULT_PREFIX: &str = "grid";
pub const WIREGUARD_PORT: u16 = 51820;

/// Key of the cross-cloud tunnel node.
pub const TUNNEL_KEY: &str = "vpn";

/// What a plan is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    /// A new cluster: exactly one master
    Full,
    /// Additional workers for an existing cluster
    Delta,
}

pub struct ResourcePlanner<'a> {
    clouds: &'a MultiCloudContext,
    prefix: String,
}

impl<'a> ResourcePlanner<'a> {
    pub fn new(clouds: &'a MultiCloudContext) -> Self {
        Self {
            clouds,
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }

    /// Prefix of every resource name
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Plans a new cluster.
    pub fn plan(&self, cluster_id: &str, spec: &ClusterSpec) -> Result<ProvisionPlan> {
        self.validate(spec, PlanMode::Full)?;

        let mut builder = Builder::new(&self.prefix, cluster_id, spec, None, 1);
        for group in spec.groups.iter().filter(|g| g.count > 0) {
            builder.expand(group)?;
        }
        builder.tunnel()?;
        builder.finish()
    }

    /// Plans additional workers for an existing cluster.
    ///
    /// Shared nodes the record already holds in `ready` state are reused as
    /// they are, so only what the delta adds is created.
    pub fn plan_delta(&self, record: &ClusterRecord, delta: &ClusterSpec) -> Result<ProvisionPlan> {
        self.validate(delta, PlanMode::Delta)?;

        let mut builder = Builder::new(
            &self.prefix,
            &record.cluster_id,
            delta,
            Some(record),
            record.next_worker_index,
        );
        for group in delta.groups.iter().filter(|g| g.count > 0) {
            builder.expand(group)?;
        }
        builder.tunnel()?;
        builder.finish()
    }

    /// Checks a spec against the cached catalogs without touching a cloud.
    ///
    /// Every problem found is reported in one `SpecInvalid` error.
    pub fn validate(&self, spec: &ClusterSpec, mode: PlanMode) -> Result<()> {
        let mut problems = Vec::new();

        let masters: Vec<&NodeGroup> = spec.groups.iter().filter(|g| g.is_master()).collect();
        match mode {
            PlanMode::Full => match masters.as_slice() {
                [master] if master.count == 1 => {}
                [master] => problems.push(format!(
                    "master group '{}' must have a count of 1, got {}",
                    master.name, master.count
                )),
                [] => problems.push("a cluster needs exactly one master group".to_string()),
                _ => problems.push(format!(
                    "a cluster needs exactly one master group, got {}",
                    masters.len()
                )),
            },
            PlanMode::Delta => {
                if !masters.is_empty() {
                    problems.push("a scaling delta cannot contain the master group".to_string());
                }
            }
        }

        let mut names = BTreeSet::new();
        for group in &spec.groups {
            if !names.insert(group.name.as_str()) {
                problems.push(format!("duplicate node group name '{}'", group.name));
            }
        }

        if spec.ssh.key_name.is_none() && spec.ssh.public_key.is_none() {
            problems.push("ssh needs either an existing key_name or a public_key".to_string());
        }

        let mut usage: BTreeMap<&str, Demand> = BTreeMap::new();
        let mut cidrs: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();

        for group in &spec.groups {
            let Some(context) = self.clouds.get(&group.cloud) else {
                problems.push(format!(
                    "group '{}' references unknown cloud '{}'",
                    group.name, group.cloud
                ));
                continue;
            };
            let catalog = context.catalog();
            let settings = spec.effective_settings(group);

            match catalog.flavor(&group.flavor) {
                Some(flavor) => {
                    let demand = usage.entry(group.cloud.as_str()).or_default();
                    let count = u64::from(group.count);
                    demand.instances += count;
                    demand.cores += u64::from(flavor.vcpus) * count;
                    demand.ram_mb += flavor.ram_mb * count;
                    demand.volumes += group.volumes.len() as u64 * count;
                    demand.volume_gb += group
                        .volumes
                        .iter()
                        .map(|v| u64::from(v.size_gb))
                        .sum::<u64>()
                        * count;
                }
                None => problems.push(format!(
                    "group '{}' references unknown flavor '{}' on cloud '{}'",
                    group.name, group.flavor, group.cloud
                )),
            }

            if catalog.image(&group.image).is_none() {
                problems.push(format!(
                    "group '{}' references unknown or inactive image '{}' on cloud '{}'",
                    group.name, group.image, group.cloud
                ));
            }

            if group.volumes.iter().any(|v| v.size_gb == 0) {
                problems.push(format!("group '{}' has a volume of size 0", group.name));
            }

            check_network(group, &settings, &catalog, &mut problems);
            if settings.network.existing_network.is_none() && group.count > 0 {
                let cidr = settings
                    .network
                    .cidr
                    .clone()
                    .unwrap_or_else(|| DEFAULT_CIDR.to_string());
                cidrs.entry(cidr).or_default().insert(group.cloud.as_str());
            }
        }

        for (cidr, clouds) in &cidrs {
            if clouds.len() > 1 {
                problems.push(format!(
                    "clouds {} share the subnet {}; every cloud needs its own cidr",
                    clouds.iter().copied().collect::<Vec<_>>().join(", "),
                    cidr
                ));
            }
        }

        for (cloud, demand) in &usage {
            let Some(context) = self.clouds.get(cloud) else {
                continue;
            };
            let quota = context.catalog().quota.clone();
            for (what, limit, requested) in [
                ("instances", quota.instances, demand.instances),
                ("cores", quota.cores, demand.cores),
                ("ram (MB)", quota.ram_mb, demand.ram_mb),
                ("volumes", quota.volumes, demand.volumes),
                ("volume storage (GB)", quota.volume_gb, demand.volume_gb),
            ] {
                if let Some(limit) = limit {
                    if requested > limit {
                        problems.push(format!(
                            "cloud '{}' has {} {} left, {} requested",
                            cloud, limit, what, requested
                        ));
                    }
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ClusterError::SpecInvalid(problems.join("; ")))
        }
    }
}

#[derive(Debug, Default)]
struct Demand {
    instances: u64,
    cores: u64,
    ram_mb: u64,
    volumes: u64,
    volume_gb: u64,
}

fn check_network(
    group: &NodeGroup,
    settings: &ClusterSettings,
    catalog: &Catalog,
    problems: &mut Vec<String>,
) {
    let network = &settings.network;
    if let Some(existing) = &network.existing_network {
        if !catalog.has_network(existing) {
            problems.push(format!(
                "group '{}' references unknown network '{}' on cloud '{}'",
                group.name, existing, group.cloud
            ));
        }
        return;
    }
    if let Some(cidr) = &network.cidr {
        if parse_cidr(cidr).is_none() {
            problems.push(format!("group '{}' has an invalid cidr '{}'", group.name, cidr));
        }
    }
    if let Some(external) = &network.external_network {
        if !catalog.has_network(external) {
            problems.push(format!(
                "group '{}' references unknown external network '{}' on cloud '{}'",
                group.name, external, group.cloud
            ));
        }
    }
}

fn parse_cidr(cidr: &str) -> Option<(Ipv4Addr, u8)> {
    let (address, prefix) = cidr.split_once('/')?;
    let address: Ipv4Addr = address.parse().ok()?;
    let prefix: u8 = prefix.parse().ok()?;
    (prefix <= 32).then_some((address, prefix))
}

fn sorted_rules(rules: &[SecurityRule]) -> Vec<SecurityRule> {
    let mut sorted = rules.to_vec();
    sorted.sort();
    sorted
}

/// Digest of a rule set, independent of rule order.
///
/// 64-bit FNV-1a, so two rule sets can share a digest. It only names and
/// keys groups; [`unique_rules_key`] keeps colliding sets apart.
fn rules_key(rules: &[SecurityRule]) -> String {
    let serialized = serde_json::to_vec(&sorted_rules(rules)).unwrap_or_default();
    format!("{:016x}", fnv1a(&serialized))
}

/// Key of the security group for `rules`. `planned` returns the rules of a
/// group already planned under a key; a different rule set behind the same
/// digest moves on to `<digest>-2`, `<digest>-3` and so on.
fn unique_rules_key<'r>(
    rules: &[SecurityRule],
    planned: impl Fn(&str) -> Option<&'r [SecurityRule]>,
) -> String {
    let digest = rules_key(rules);
    let wanted = sorted_rules(rules);
    let mut key = digest.clone();
    let mut n = 1;
    while let Some(other) = planned(&key) {
        if sorted_rules(other) == wanted {
            break;
        }
        n += 1;
        key = format!("{}-{}", digest, n);
    }
    key
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

fn slug(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

struct Builder<'p> {
    prefix: &'p str,
    cluster_id: &'p str,
    spec: &'p ClusterSpec,
    existing: Option<&'p ClusterRecord>,
    nodes: BTreeMap<ResourceId, ResourceNode>,
    next_worker: u32,
}

impl<'p> Builder<'p> {
    fn new(
        prefix: &'p str,
        cluster_id: &'p str,
        spec: &'p ClusterSpec,
        existing: Option<&'p ClusterRecord>,
        next_worker: u32,
    ) -> Self {
        Self {
            prefix,
            cluster_id,
            spec,
            existing,
            nodes: BTreeMap::new(),
            next_worker,
        }
    }

    /// Adds a node unless one with the same id is planned already. A node
    /// the cluster already holds in `ready` state replaces the planned one.
    fn add(&mut self, node: ResourceNode) -> Result<ResourceId> {
        let id = node.id.clone();
        if self.nodes.contains_key(&id) {
            return Ok(id);
        }
        let node = match self.existing.and_then(|record| record.resource(&id)) {
            Some(current) if current.is_ready() => current.clone(),
            Some(current) if !current.is_released() => {
                return Err(ClusterError::InvalidOperation(format!(
                    "{} {} of cluster {} is {}; terminate or repair the cluster first",
                    current.kind(),
                    id,
                    self.cluster_id,
                    current.status
                )));
            }
            _ => node,
        };
        self.nodes.insert(id.clone(), node);
        Ok(id)
    }

    fn expand(&mut self, group: &NodeGroup) -> Result<()> {
        let spec = self.spec;
        let settings = spec.effective_settings(group);
        let cloud = group.cloud.as_str();
        let mut shared = Vec::new();

        let network = match &settings.network.existing_network {
            Some(existing) => NetworkRef::Existing(existing.clone()),
            None => {
                shared.extend(self.network(cloud, &settings)?);
                NetworkRef::Planned
            }
        };
        shared.push(self.security_group(cloud, &settings)?);

        let key_name = match &spec.ssh.key_name {
            Some(existing) => existing.clone(),
            None => {
                let name = format!("{}-{}", self.prefix, self.cluster_id);
                let public_key = spec.ssh.public_key.clone().unwrap_or_default();
                shared.push(self.add(ResourceNode::planned(
                    cloud,
                    "cluster",
                    ResourceSpec::Keypair {
                        name: name.clone(),
                        public_key,
                    },
                ))?);
                name
            }
        };

        let ssh_user = settings
            .ssh_user
            .clone()
            .unwrap_or_else(|| DEFAULT_SSH_USER.to_string());

        for _ in 0..group.count {
            let name = match group.role {
                Role::Master => format!("{}-master-{}", self.prefix, self.cluster_id),
                Role::Worker => {
                    let index = self.next_worker;
                    self.next_worker += 1;
                    format!("{}-worker-{}-{}", self.prefix, self.cluster_id, index)
                }
            };

            let mut instance = ResourceNode::planned(
                cloud,
                &name,
                ResourceSpec::Instance {
                    name: name.clone(),
                    group: group.name.clone(),
                    role: group.role,
                    flavor: group.flavor.clone(),
                    image: group.image.clone(),
                    network: network.clone(),
                    key_name: key_name.clone(),
                    ssh_user: ssh_user.clone(),
                    tags: group.tags.clone(),
                },
            );
            for dep in &shared {
                instance = instance.depends_on(dep);
            }
            for (index, volume) in group.volumes.iter().enumerate() {
                let volume_name = format!("{}-vol{}", name, index);
                let id = self.add(ResourceNode::planned(
                    cloud,
                    &volume_name,
                    ResourceSpec::Volume {
                        name: volume_name.clone(),
                        size_gb: volume.size_gb,
                        volume_type: volume.volume_type.clone(),
                        mount_point: volume.mount_point.clone(),
                    },
                ))?;
                instance = instance.depends_on(&id);
            }

            tracing::debug!(cloud, instance = %name, group = %group.name, "Planned instance");
            self.add(instance)?;
        }
        Ok(())
    }

    /// Network and subnet, plus a router when an external network is set.
    /// Returns the nodes instances depend on.
    fn network(&mut self, cloud: &str, settings: &ClusterSettings) -> Result<Vec<ResourceId>> {
        let cidr = settings
            .network
            .cidr
            .clone()
            .unwrap_or_else(|| DEFAULT_CIDR.to_string());
        let base = format!("{}-{}-{}", self.prefix, self.cluster_id, slug(&cidr));

        let network = self.add(ResourceNode::planned(
            cloud,
            &cidr,
            ResourceSpec::Network {
                name: format!("{}-net", base),
            },
        ))?;
        let subnet = self.add(
            ResourceNode::planned(
                cloud,
                &cidr,
                ResourceSpec::Subnet {
                    name: format!("{}-subnet", base),
                    cidr: cidr.clone(),
                    dns_nameservers: settings.network.dns_nameservers.clone().unwrap_or_default(),
                },
            )
            .depends_on(&network),
        )?;

        if let Some(external) = &settings.network.external_network {
            self.add(
                ResourceNode::planned(
                    cloud,
                    &format!("{}@{}", cidr, external),
                    ResourceSpec::Router {
                        name: format!("{}-router", base),
                        external_network: external.clone(),
                    },
                )
                .depends_on(&subnet),
            )?;
        }
        Ok(vec![network, subnet])
    }

    fn security_group(&mut self, cloud: &str, settings: &ClusterSettings) -> Result<ResourceId> {
        let mut rules = settings.security.rules.clone();
        let ssh = SecurityRule::tcp(22);
        if !rules.iter().any(|r| covers(r, 22)) {
            rules.insert(0, ssh);
        }
        if self.multi_cloud() {
            let wireguard = SecurityRule {
                direction: Direction::Ingress,
                protocol: Some("udp".to_string()),
                port_min: Some(WIREGUARD_PORT),
                port_max: Some(WIREGUARD_PORT),
                remote_cidr: Some("0.0.0.0/0".to_string()),
            };
            if !rules.contains(&wireguard) {
                rules.push(wireguard);
            }
        }

        let key = unique_rules_key(&rules, |key| {
            let id = ResourceId::new(cloud, ResourceKind::SecurityGroup, key);
            let node = self.nodes.get(&id).or_else(|| {
                self.existing
                    .and_then(|record| record.resource(&id))
                    .filter(|n| !n.is_released())
            })?;
            match &node.spec {
                ResourceSpec::SecurityGroup { rules, .. } => Some(rules.as_slice()),
                _ => None,
            }
        });
        // short digest plus the collision suffix, if any
        let label = format!("{}{}", &key[..8], &key[16..]);
        self.add(ResourceNode::planned(
            cloud,
            &key,
            ResourceSpec::SecurityGroup {
                name: format!("{}-sg-{}-{}", self.prefix, self.cluster_id, label),
                rules,
            },
        ))
    }

    /// Clouds hosting instances once this plan is applied.
    fn cluster_clouds(&self) -> BTreeSet<String> {
        let mut clouds: BTreeSet<String> = self
            .spec
            .participating_clouds()
            .into_iter()
            .map(str::to_string)
            .collect();
        if let Some(record) = self.existing {
            clouds.extend(
                record
                    .resources_of(ResourceKind::Instance)
                    .filter(|r| !r.is_released())
                    .map(|r| r.cloud.clone()),
            );
        }
        clouds
    }

    fn multi_cloud(&self) -> bool {
        self.cluster_clouds().len() > 1
    }

    /// Plans the tunnel when more than one cloud takes part and the cluster
    /// does not have one spanning exactly these clouds yet.
    fn tunnel(&mut self) -> Result<()> {
        let clouds = self.cluster_clouds();
        if clouds.len() < 2 {
            return Ok(());
        }
        let id = ResourceId::new(MULTI_CLOUD_SCOPE, ResourceKind::Tunnel, TUNNEL_KEY);
        let wanted: Vec<String> = clouds.iter().cloned().collect();
        if let Some(current) = self.existing.and_then(|r| r.resource(&id)) {
            if current.is_ready()
                && matches!(&current.spec, ResourceSpec::Tunnel { clouds, .. } if *clouds == wanted)
            {
                return Ok(());
            }
        }

        let mut tunnel = ResourceNode::planned(
            MULTI_CLOUD_SCOPE,
            TUNNEL_KEY,
            ResourceSpec::Tunnel {
                name: format!("{}-vpn-{}", self.prefix, self.cluster_id),
                clouds: wanted,
            },
        );
        for cloud in &clouds {
            if let Some(anchor) = self.anchor(cloud) {
                tunnel = tunnel.depends_on(&anchor);
            }
        }
        self.nodes.insert(id, tunnel);
        Ok(())
    }

    /// The node of a cloud the tunnel hangs off: its subnet, or its security
    /// group when instances use an existing network.
    fn anchor(&mut self, cloud: &str) -> Option<ResourceId> {
        for kind in [ResourceKind::Subnet, ResourceKind::SecurityGroup] {
            if let Some(node) = self
                .nodes
                .values()
                .find(|n| n.cloud == cloud && n.kind() == kind)
            {
                return Some(node.id.clone());
            }
            let reused = self.existing.and_then(|record| {
                record
                    .resources_of(kind)
                    .find(|r| r.cloud == cloud && r.is_ready())
                    .cloned()
            });
            if let Some(node) = reused {
                let id = node.id.clone();
                self.nodes.insert(id.clone(), node);
                return Some(id);
            }
        }
        None
    }

    fn finish(self) -> Result<ProvisionPlan> {
        let nodes: Vec<ResourceNode> = self.nodes.into_values().collect();
        ProvisionPlan::new(self.cluster_id, self.spec.clone(), nodes)
    }
}

fn covers(rule: &SecurityRule, port: u16) -> bool {
    rule.direction == Direction::Ingress
        && rule.protocol.as_deref().is_none_or(|p| p == "tcp")
        && rule.port_min.is_none_or(|min| min <= port)
        && rule.port_max.is_none_or(|max| max >= port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CloudContext, Quota};
    use crate::memory::InMemoryProvider;
    use gridflow_core::{
        NetworkSettings, ResourceStatus, SshAccess, SshSettings, VolumeSpec,
    };
    use std::sync::Arc;

    async fn clouds(names: &[&str]) -> MultiCloudContext {
        let mut clouds = MultiCloudContext::new();
        for name in names {
            clouds.add(CloudContext::new(
                *name,
                Arc::new(InMemoryProvider::new(*name)),
            ));
        }
        clouds.refresh_all().await.unwrap();
        clouds
    }

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

    fn spec(groups: Vec<NodeGroup>) -> ClusterSpec {
        ClusterSpec {
            groups,
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

    fn count(plan: &ProvisionPlan, kind: ResourceKind) -> usize {
        plan.nodes().iter().filter(|n| n.kind() == kind).count()
    }

    #[tokio::test]
    async fn test_shared_nodes_are_deduplicated() {
        let clouds = clouds(&["cloud-a"]).await;
        let spec = spec(vec![
            group("master", Role::Master, 1, "cloud-a"),
            group("compute", Role::Worker, 3, "cloud-a"),
        ]);

        let plan = ResourcePlanner::new(&clouds).plan("abc", &spec).unwrap();

        assert_eq!(count(&plan, ResourceKind::Instance), 4);
        assert_eq!(count(&plan, ResourceKind::Network), 1);
        assert_eq!(count(&plan, ResourceKind::Subnet), 1);
        assert_eq!(count(&plan, ResourceKind::Router), 1);
        assert_eq!(count(&plan, ResourceKind::SecurityGroup), 1);
        assert_eq!(count(&plan, ResourceKind::Keypair), 1);
        assert_eq!(count(&plan, ResourceKind::Tunnel), 0);

        let names: Vec<&str> = plan
            .nodes()
            .iter()
            .filter(|n| n.kind() == ResourceKind::Instance)
            .map(|n| n.name())
            .collect();
        assert!(names.contains(&"grid-master-abc"));
        assert!(names.contains(&"grid-worker-abc-3"));
    }

    #[tokio::test]
    async fn test_instances_depend_only_on_same_cloud_prerequisites() {
        let clouds = clouds(&["cloud-a", "cloud-b"]).await;
        let mut gpu = group("gpu", Role::Worker, 2, "cloud-b");
        gpu.volumes.push(VolumeSpec {
            size_gb: 50,
            volume_type: None,
            mount_point: Some("/vol/scratch".to_string()),
        });
        gpu.settings.network.cidr = Some("10.1.0.0/24".to_string());
        let spec = spec(vec![
            group("master", Role::Master, 1, "cloud-a"),
            group("compute", Role::Worker, 2, "cloud-a"),
            gpu,
        ]);

        let plan = ResourcePlanner::new(&clouds).plan("abc", &spec).unwrap();
        let allowed = [
            ResourceKind::Network,
            ResourceKind::Subnet,
            ResourceKind::SecurityGroup,
            ResourceKind::Keypair,
            ResourceKind::Volume,
        ];
        for node in plan.nodes().iter().filter(|n| n.kind() == ResourceKind::Instance) {
            for dep in &node.depends_on {
                let dep = plan.get(dep).unwrap();
                assert_eq!(dep.cloud, node.cloud, "{} crosses clouds", node.id);
                assert!(allowed.contains(&dep.kind()), "{} depends on {}", node.id, dep.id);
            }
        }

        let tunnel = plan
            .nodes()
            .iter()
            .find(|n| n.kind() == ResourceKind::Tunnel)
            .unwrap();
        assert_eq!(tunnel.cloud, MULTI_CLOUD_SCOPE);
        assert_eq!(tunnel.depends_on.len(), 2);
        assert_eq!(count(&plan, ResourceKind::Volume), 2);
    }

    #[tokio::test]
    async fn test_unknown_references_fail_fast() {
        let clouds = clouds(&["cloud-a"]).await;
        let mut worker = group("compute", Role::Worker, 1, "cloud-z");
        worker.flavor = "huge".to_string();
        let mut other = group("other", Role::Worker, 1, "cloud-a");
        other.image = "centos-6".to_string();
        let spec = spec(vec![group("master", Role::Master, 1, "cloud-a"), worker, other]);

        let err = ResourcePlanner::new(&clouds).plan("abc", &spec).unwrap_err();
        let ClusterError::SpecInvalid(message) = err else {
            panic!("expected SpecInvalid");
        };
        assert!(message.contains("cloud-z"));
        assert!(message.contains("centos-6"));
    }

    #[tokio::test]
    async fn test_quota_is_checked_against_catalog() {
        let mut clouds = MultiCloudContext::new();
        clouds.add(CloudContext::new(
            "cloud-a",
            Arc::new(InMemoryProvider::new("cloud-a").with_quota(Quota {
                instances: Some(3),
                ..Default::default()
            })),
        ));
        clouds.refresh_all().await.unwrap();
        let spec = spec(vec![
            group("master", Role::Master, 1, "cloud-a"),
            group("compute", Role::Worker, 3, "cloud-a"),
        ]);

        let err = ResourcePlanner::new(&clouds).plan("abc", &spec).unwrap_err();
        assert!(err.to_string().contains("instances"));
    }

    #[tokio::test]
    async fn test_multi_cloud_requires_distinct_cidrs() {
        let clouds = clouds(&["cloud-a", "cloud-b"]).await;
        let spec = spec(vec![
            group("master", Role::Master, 1, "cloud-a"),
            group("gpu", Role::Worker, 1, "cloud-b"),
        ]);

        let err = ResourcePlanner::new(&clouds).plan("abc", &spec).unwrap_err();
        assert!(err.to_string().contains("10.0.0.0/24"));
    }

    #[tokio::test]
    async fn test_master_count_is_validated() {
        let clouds = clouds(&["cloud-a"]).await;
        let spec = spec(vec![
            group("master", Role::Master, 2, "cloud-a"),
            group("compute", Role::Worker, 1, "cloud-a"),
        ]);

        assert!(matches!(
            ResourcePlanner::new(&clouds).plan("abc", &spec),
            Err(ClusterError::SpecInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_delta_reuses_ready_shared_nodes() {
        let clouds = clouds(&["cloud-a"]).await;
        let spec = spec(vec![
            group("master", Role::Master, 1, "cloud-a"),
            group("compute", Role::Worker, 2, "cloud-a"),
        ]);
        let planner = ResourcePlanner::new(&clouds);
        let plan = planner.plan("abc", &spec).unwrap();

        let mut record = ClusterRecord::new("abc", spec.clone(), SshAccess::default());
        record.absorb_resources(plan.nodes().iter().cloned().map(|mut n| {
            n.provider_id = Some(format!("id-{}", n.name()));
            n.set_status(ResourceStatus::Ready);
            n
        }));
        record.next_worker_index = 3;

        let delta = spec.delta("compute", 2).unwrap();
        let plan = planner.plan_delta(&record, &delta).unwrap();

        let new: Vec<&str> = plan.to_create().map(|n| n.name()).collect();
        assert_eq!(new, vec!["grid-worker-abc-3", "grid-worker-abc-4"]);
        assert!(plan
            .nodes()
            .iter()
            .filter(|n| n.kind() != ResourceKind::Instance)
            .all(|n| n.is_ready()));
    }

    #[test]
    fn test_rules_key_ignores_order() {
        let a = [SecurityRule::tcp(22), SecurityRule::tcp(80)];
        let b = [SecurityRule::tcp(80), SecurityRule::tcp(22)];
        assert_eq!(rules_key(&a), rules_key(&b));
        assert_ne!(rules_key(&a), rules_key(&a[..1]));
    }

    #[test]
    fn test_colliding_rule_sets_get_separate_keys() {
        let web = [SecurityRule::tcp(22), SecurityRule::tcp(80)];
        let db = [SecurityRule::tcp(5432)];
        let digest = rules_key(&web);

        // same rules in another order share the group
        let reordered = [SecurityRule::tcp(80), SecurityRule::tcp(22)];
        assert_eq!(
            unique_rules_key(&web, |key| (key == digest).then_some(&reordered[..])),
            digest
        );

        // a different rule set planned under the same digest
        assert_eq!(
            unique_rules_key(&web, |key| (key == digest).then_some(&db[..])),
            format!("{}-2", digest)
        );
        let second = format!("{}-2", digest);
        assert_eq!(
            unique_rules_key(&web, |key| (key == digest || key == second).then_some(&db[..])),
            format!("{}-3", digest)
        );
    }
}
