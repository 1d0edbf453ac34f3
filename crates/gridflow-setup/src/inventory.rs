//! Inventory generation
//!
//! The inventory is regenerated from the cluster record for every run and
//! never stored on its own. Hosts are grouped by role (`master`, `workers`),
//! by node group (`group_<name>`), by software tag (`tag_<tag>`) and by
//! cloud (`cloud_<name>`). Nodes without an address and nodes that failed
//! configuration are left out.

use gridflow_core::{
    ClusterRecord, NodeEntry, NodeStatus, ResourceKind, ResourceSpec, Role,
};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};

/// One reachable node.
#[derive(Debug, Clone, PartialEq)]
pub struct Host {
    pub name: String,
    pub address: String,
    pub user: String,
    pub role: Role,
    pub group: String,
    pub cloud: String,
    pub tags: Vec<String>,
    /// Mount points of the volumes attached to this node
    pub mounts: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Inventory {
    hosts: Vec<Host>,
    groups: BTreeMap<String, BTreeSet<String>>,
    vars: BTreeMap<String, Value>,
}

/// Group names only keep characters playbook tools accept.
fn group_name(prefix: &str, raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    format!("{}_{}", prefix, cleaned)
}

fn participates(node: &NodeEntry) -> bool {
    node.address.is_some()
        && !matches!(
            node.status,
            NodeStatus::Failed | NodeStatus::Unreachable | NodeStatus::PendingCleanup
        )
}

impl Inventory {
    pub fn from_record(record: &ClusterRecord) -> Self {
        let mut inventory = Inventory::default();

        for (role, node) in record
            .master
            .iter()
            .map(|m| (Role::Master, m))
            .chain(record.workers.iter().map(|w| (Role::Worker, w)))
        {
            if !participates(node) {
                continue;
            }
            let Some(address) = node.address.clone() else {
                continue;
            };
            let mounts = record
                .attached_volumes(&node.resource)
                .iter()
                .filter_map(|id| match record.resource(id).map(|r| &r.spec) {
                    Some(ResourceSpec::Volume { mount_point, .. }) => mount_point.clone(),
                    _ => None,
                })
                .collect();

            inventory.add(Host {
                name: node.name.clone(),
                address,
                user: node.ssh_user.clone(),
                role,
                group: node.group.clone(),
                cloud: node.cloud.clone(),
                tags: node.tags.clone(),
                mounts,
            });
        }

        inventory.vars = cluster_vars(record, &inventory);
        inventory
    }

    fn add(&mut self, host: Host) {
        let role_group = match host.role {
            Role::Master => "master".to_string(),
            Role::Worker => "workers".to_string(),
        };
        let mut memberships = vec![
            role_group,
            group_name("group", &host.group),
            group_name("cloud", &host.cloud),
        ];
        memberships.extend(host.tags.iter().map(|t| group_name("tag", t)));

        for group in memberships {
            self.groups
                .entry(group)
                .or_default()
                .insert(host.name.clone());
        }
        self.hosts.push(host);
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.name == name)
    }

    pub fn groups(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.groups
    }

    /// Hosts of a group, in roster order.
    pub fn group(&self, name: &str) -> Vec<&Host> {
        match self.groups.get(name) {
            Some(members) => self
                .hosts
                .iter()
                .filter(|h| members.contains(&h.name))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn vars(&self) -> &BTreeMap<String, Value> {
        &self.vars
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Inventory document in the YAML layout of configuration management
    /// tools: `all.hosts`, `all.vars` and one child group per grouping.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        let mut hosts = Map::new();
        for host in &self.hosts {
            let mut vars = json!({
                "ansible_host": host.address,
                "ansible_user": host.user,
                "gridflow_role": host.role,
                "gridflow_group": host.group,
                "gridflow_cloud": host.cloud,
            });
            if !host.mounts.is_empty() {
                vars["gridflow_mounts"] = json!(host.mounts);
            }
            hosts.insert(host.name.clone(), vars);
        }

        let mut children = Map::new();
        for (group, members) in &self.groups {
            let members: Map<String, Value> = members
                .iter()
                .map(|m| (m.clone(), Value::Object(Map::new())))
                .collect();
            children.insert(group.clone(), json!({ "hosts": members }));
        }

        let document = json!({
            "all": {
                "vars": self.vars,
                "hosts": hosts,
                "children": children,
            }
        });
        serde_yaml::to_string(&document)
    }
}

fn cluster_vars(record: &ClusterRecord, inventory: &Inventory) -> BTreeMap<String, Value> {
    let mut vars = BTreeMap::new();
    vars.insert("cluster_id".to_string(), json!(record.cluster_id));

    let master_address = record
        .ssh
        .master_address
        .clone()
        .or_else(|| record.master.as_ref().and_then(|m| m.address.clone()));
    if let Some(address) = master_address {
        vars.insert("master_address".to_string(), json!(address));
    }
    if let Some(key) = &record.ssh.cluster_public_key {
        vars.insert("cluster_public_key".to_string(), json!(key));
    }

    let cidrs: BTreeSet<String> = record
        .resources_of(ResourceKind::Subnet)
        .filter(|r| r.is_ready())
        .filter_map(|r| match &r.spec {
            ResourceSpec::Subnet { cidr, .. } => Some(cidr.clone()),
            _ => None,
        })
        .collect();
    vars.insert("cluster_cidrs".to_string(), json!(cidrs));

    if let Some(tunnel) = record.resources_of(ResourceKind::Tunnel).find(|r| r.is_ready()) {
        vars.insert(
            "wireguard_peers".to_string(),
            json!(wireguard_peers(tunnel.get_output("peers").unwrap_or_default(), inventory)),
        );
    }
    vars
}

/// Tunnel peers with the endpoint of each cloud: its master if it hosts
/// one, its first worker otherwise.
fn wireguard_peers(peers: Vec<Value>, inventory: &Inventory) -> Vec<Value> {
    peers
        .into_iter()
        .filter_map(|peer| {
            let cloud = peer.get("cloud")?.as_str()?.to_string();
            let cidr = peer.get("cidr")?.as_str()?.to_string();
            let on_cloud = |role: Role| {
                inventory
                    .hosts
                    .iter()
                    .find(|h| h.cloud == cloud && h.role == role)
            };
            let gateway = on_cloud(Role::Master).or_else(|| on_cloud(Role::Worker));
            let mut entry = json!({ "cloud": cloud, "cidr": cidr });
            if let Some(gateway) = gateway {
                entry["endpoint"] = json!(gateway.address);
                entry["gateway"] = json!(gateway.name);
            }
            Some(entry)
        })
        .collect()
}
