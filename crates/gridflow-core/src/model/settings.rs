//! Layered cluster settings
//!
//! Settings are declared at three levels and deep-merged in this order, each
//! level overriding the previous one:
//!
//! 1. cluster defaults (`ClusterSpec::defaults`)
//! 2. cloud-local settings (`ClusterSpec::clouds[..].settings`)
//! 3. group-local settings (`NodeGroup::settings`)
//!
//! Scalars set at a later level win. Security rules are unioned, so a worker
//! group keeps the cluster-wide rules while adding its own.

use serde::{Deserialize, Serialize};

/// Deep merge of an overlay into `self`.
pub trait Merge {
    fn merge(&mut self, overlay: &Self);

    /// Returns `self` merged with `overlay`, leaving both untouched.
    fn merged(&self, overlay: &Self) -> Self
    where
        Self: Clone,
    {
        let mut result = self.clone();
        result.merge(overlay);
        result
    }
}

fn merge_option<T: Clone>(base: &mut Option<T>, overlay: &Option<T>) {
    if overlay.is_some() {
        base.clone_from(overlay);
    }
}

/// Settings that may be given at every level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSettings {
    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub security: SecuritySettings,

    /// Login user of the image (e.g. "ubuntu")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,
}

impl Merge for ClusterSettings {
    fn merge(&mut self, overlay: &Self) {
        self.network.merge(&overlay.network);
        self.security.merge(&overlay.security);
        merge_option(&mut self.ssh_user, &overlay.ssh_user);
    }
}

/// Network placement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Attach instances to this pre-existing network instead of creating one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_network: Option<String>,

    /// CIDR of the subnet to create (e.g. "10.0.0.0/24")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,

    /// External network the router is attached to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_network: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_nameservers: Option<Vec<String>>,
}

impl Merge for NetworkSettings {
    fn merge(&mut self, overlay: &Self) {
        merge_option(&mut self.existing_network, &overlay.existing_network);
        merge_option(&mut self.cidr, &overlay.cidr);
        merge_option(&mut self.external_network, &overlay.external_network);
        merge_option(&mut self.dns_nameservers, &overlay.dns_nameservers);
    }
}

/// Traffic direction of a security rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Ingress,
    Egress,
}

/// One security group rule.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SecurityRule {
    #[serde(default)]
    pub direction: Direction,

    /// "tcp", "udp", "icmp"; `None` allows every protocol
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_min: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_max: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_cidr: Option<String>,
}

impl SecurityRule {
    /// Ingress TCP rule for a single port from anywhere.
    pub fn tcp(port: u16) -> Self {
        Self {
            direction: Direction::Ingress,
            protocol: Some("tcp".to_string()),
            port_min: Some(port),
            port_max: Some(port),
            remote_cidr: Some("0.0.0.0/0".to_string()),
        }
    }
}

/// Security group contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecuritySettings {
    #[serde(default)]
    pub rules: Vec<SecurityRule>,
}

impl Merge for SecuritySettings {
    fn merge(&mut self, overlay: &Self) {
        for rule in &overlay.rules {
            if !self.rules.contains(rule) {
                self.rules.push(rule.clone());
            }
        }
    }
}

/// Access settings of the cluster, given once per cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshSettings {
    /// Reuse this keypair, already registered on every cloud
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,

    /// Public key to register when no `key_name` is given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,

    /// Private key used to reach the nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<std::path::PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_scalars_win() {
        let base = ClusterSettings {
            network: NetworkSettings {
                cidr: Some("10.0.0.0/24".to_string()),
                external_network: Some("public".to_string()),
                ..Default::default()
            },
            ssh_user: Some("ubuntu".to_string()),
            ..Default::default()
        };
        let overlay = ClusterSettings {
            network: NetworkSettings {
                cidr: Some("10.1.0.0/24".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let merged = base.merged(&overlay);
        assert_eq!(merged.network.cidr.as_deref(), Some("10.1.0.0/24"));
        assert_eq!(merged.network.external_network.as_deref(), Some("public"));
        assert_eq!(merged.ssh_user.as_deref(), Some("ubuntu"));
    }

    #[test]
    fn test_security_rules_are_unioned() {
        let mut base = SecuritySettings {
            rules: vec![SecurityRule::tcp(22)],
        };
        base.merge(&SecuritySettings {
            rules: vec![SecurityRule::tcp(22), SecurityRule::tcp(8080)],
        });

        assert_eq!(base.rules, vec![SecurityRule::tcp(22), SecurityRule::tcp(8080)]);
    }
}
