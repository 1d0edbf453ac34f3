//! Baseline node setup
//!
//! Commands run directly over a remote session on every node before the
//! playbook: OS users, the cluster-internal SSH key and mounts. Every
//! command is idempotent so a node can be set up again after a partial run.

use crate::remote::shell_quote;
use serde::{Deserialize, Serialize};

/// Where the cluster key lives on the master.
pub const CLUSTER_KEY_PATH: &str = "~/.ssh/gridflow_cluster";

/// What the baseline setup does on every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineSetup {
    /// OS users to create
    #[serde(default)]
    pub users: Vec<String>,

    /// Filesystems to mount
    #[serde(default)]
    pub mounts: Vec<MountSpec>,

    /// Generate a key on the master and authorize it on every node
    #[serde(default = "default_true")]
    pub distribute_cluster_key: bool,
}

fn default_true() -> bool {
    true
}

impl Default for BaselineSetup {
    fn default() -> Self {
        Self {
            users: Vec::new(),
            mounts: Vec::new(),
            distribute_cluster_key: true,
        }
    }
}

/// A filesystem to mount. `{master}` in `source` is replaced with the
/// address of the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fstype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
    /// Mount on workers only, e.g. a share exported by the master
    #[serde(default)]
    pub workers_only: bool,
}

/// Command that creates the cluster key on the master if needed and prints
/// its public half.
pub fn cluster_key_command(cluster_id: &str) -> String {
    format!(
        "mkdir -p ~/.ssh && chmod 700 ~/.ssh && \
         (test -f {path} || ssh-keygen -q -t ed25519 -N '' -C {comment} -f {path}) && \
         cat {path}.pub",
        path = CLUSTER_KEY_PATH,
        comment = shell_quote(&format!("gridflow-{}", cluster_id)),
    )
}

fn user_command(user: &str) -> String {
    let user = shell_quote(user);
    format!(
        "id -u {user} >/dev/null 2>&1 || sudo useradd -m -s /bin/bash {user}",
        user = user
    )
}

fn authorize_command(public_key: &str) -> String {
    let key = shell_quote(public_key.trim());
    format!(
        "mkdir -p ~/.ssh && chmod 700 ~/.ssh && \
         (grep -qxF {key} ~/.ssh/authorized_keys 2>/dev/null || echo {key} >> ~/.ssh/authorized_keys) && \
         chmod 600 ~/.ssh/authorized_keys",
        key = key
    )
}

fn mount_command(mount: &MountSpec, master_address: Option<&str>) -> String {
    let source = match master_address {
        Some(address) => mount.source.replace("{master}", address),
        None => mount.source.clone(),
    };
    let target = shell_quote(&mount.target);
    let mut options = String::new();
    if let Some(fstype) = &mount.fstype {
        options.push_str(&format!(" -t {}", shell_quote(fstype)));
    }
    if let Some(opts) = &mount.options {
        options.push_str(&format!(" -o {}", shell_quote(opts)));
    }
    format!(
        "sudo mkdir -p {target} && (mountpoint -q {target} || sudo mount{options} {source} {target})",
        target = target,
        options = options,
        source = shell_quote(&source),
    )
}

/// Formats a blank attached volume and mounts it.
fn volume_command(device: &str, target: &str) -> String {
    let device = shell_quote(device);
    let target = shell_quote(target);
    format!(
        "sudo mkdir -p {target} && (mountpoint -q {target} || \
         ((sudo blkid {device} >/dev/null || sudo mkfs.ext4 -q {device}) && sudo mount {device} {target}))",
        target = target,
        device = device,
    )
}

/// Device name of the n-th attached volume (`/dev/vdb`, `/dev/vdc`, ...).
pub fn volume_device(index: usize) -> String {
    let letter = (b'b' + (index.min(24) as u8)) as char;
    format!("/dev/vd{}", letter)
}

/// Node facts the command list depends on.
#[derive(Debug, Clone, Default)]
pub struct NodeContext<'a> {
    pub is_master: bool,
    pub master_address: Option<&'a str>,
    pub cluster_public_key: Option<&'a str>,
    /// Mount points of attached volumes, in attachment order
    pub volume_mounts: &'a [String],
}

impl BaselineSetup {
    /// Commands for one node, in execution order. The cluster key command of
    /// the master is issued separately.
    pub fn commands(&self, node: &NodeContext<'_>) -> Vec<String> {
        let mut commands: Vec<String> = self.users.iter().map(|u| user_command(u)).collect();

        if self.distribute_cluster_key {
            if let Some(key) = node.cluster_public_key {
                commands.push(authorize_command(key));
            }
        }

        for (index, target) in node.volume_mounts.iter().enumerate() {
            commands.push(volume_command(&volume_device(index), target));
        }

        commands.extend(
            self.mounts
                .iter()
                .filter(|m| !(m.workers_only && node.is_master))
                .map(|m| mount_command(m, node.master_address)),
        );
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_in_order() {
        let setup = BaselineSetup {
            users: vec!["slurm".to_string()],
            mounts: vec![MountSpec {
                source: "{master}:/vol/spool".to_string(),
                target: "/vol/spool".to_string(),
                fstype: Some("nfs".to_string()),
                options: None,
                workers_only: true,
            }],
            distribute_cluster_key: true,
        };
        let volumes = vec!["/vol/scratch".to_string()];
        let node = NodeContext {
            is_master: false,
            master_address: Some("10.0.0.10"),
            cluster_public_key: Some("ssh-ed25519 AAAA gridflow-abc"),
            volume_mounts: &volumes,
        };

        let commands = setup.commands(&node);
        assert_eq!(commands.len(), 4);
        assert!(commands[0].contains("useradd -m -s /bin/bash slurm"));
        assert!(commands[1].contains("'ssh-ed25519 AAAA gridflow-abc'"));
        assert!(commands[2].contains("/dev/vdb"));
        assert!(commands[3].contains("10.0.0.10:/vol/spool"));
        assert!(commands[3].contains("-t nfs"));
    }

    #[test]
    fn test_worker_mounts_skip_master() {
        let setup = BaselineSetup {
            mounts: vec![MountSpec {
                source: "{master}:/vol/spool".to_string(),
                target: "/vol/spool".to_string(),
                fstype: None,
                options: None,
                workers_only: true,
            }],
            ..Default::default()
        };
        let node = NodeContext {
            is_master: true,
            ..Default::default()
        };
        assert!(setup.commands(&node).is_empty());
    }

    #[test]
    fn test_cluster_key_command() {
        let command = cluster_key_command("abc");
        assert!(command.contains("ssh-keygen"));
        assert!(command.ends_with("cat ~/.ssh/gridflow_cluster.pub"));
    }

    #[test]
    fn test_volume_devices() {
        assert_eq!(volume_device(0), "/dev/vdb");
        assert_eq!(volume_device(2), "/dev/vdd");
    }
}
