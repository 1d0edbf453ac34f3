//! Delegated configuration runs
//!
//! Role-specific software is applied by an external playbook runner, once
//! per run against the whole inventory. The runner orders master before
//! workers and converges idempotently on its own.

use crate::inventory::Inventory;
use crate::remote::{RemoteError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Per-host result of a playbook run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostRecap {
    pub ok: u32,
    pub changed: u32,
    pub unreachable: u32,
    pub failed: u32,
}

impl HostRecap {
    pub fn succeeded(&self) -> bool {
        self.unreachable == 0 && self.failed == 0
    }
}

/// Outcome of a playbook run that completed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybookReport {
    pub hosts: BTreeMap<String, HostRecap>,
}

impl PlaybookReport {
    pub fn failed_hosts(&self) -> impl Iterator<Item = &str> {
        self.hosts
            .iter()
            .filter(|(_, recap)| !recap.succeeded())
            .map(|(host, _)| host.as_str())
    }
}

/// Applies configuration to an inventory.
#[async_trait]
pub trait PlaybookRunner: Send + Sync {
    /// Runs against `inventory`, restricted to `limit` when given. Host
    /// failures are reported in the returned report; an `Err` means the run
    /// itself could not complete.
    async fn apply(
        &self,
        inventory: &Inventory,
        limit: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> Result<PlaybookReport>;
}

/// `ansible-playbook` invocation.
#[derive(Debug, Clone)]
pub struct AnsiblePlaybook {
    playbook: PathBuf,
    binary: String,
    private_key: Option<PathBuf>,
    timeout: Duration,
    extra_args: Vec<String>,
}

impl AnsiblePlaybook {
    pub fn new(playbook: impl Into<PathBuf>) -> Self {
        Self {
            playbook: playbook.into(),
            binary: "ansible-playbook".to_string(),
            private_key: None,
            timeout: Duration::from_secs(3600),
            extra_args: Vec::new(),
        }
    }

    pub fn with_private_key(mut self, key: Option<PathBuf>) -> Self {
        self.private_key = key;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.extra_args.extend(args);
        self
    }

    fn args(&self, inventory_path: &str, limit: Option<&[String]>) -> Vec<String> {
        let mut args = vec!["-i".to_string(), inventory_path.to_string()];
        if let Some(limit) = limit {
            args.push("--limit".to_string());
            args.push(limit.join(","));
        }
        if let Some(key) = &self.private_key {
            args.push("--private-key".to_string());
            args.push(key.to_string_lossy().to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args.push(self.playbook.to_string_lossy().to_string());
        args
    }
}

#[async_trait]
impl PlaybookRunner for AnsiblePlaybook {
    async fn apply(
        &self,
        inventory: &Inventory,
        limit: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> Result<PlaybookReport> {
        let yaml = inventory
            .to_yaml()
            .map_err(|e| RemoteError::Playbook(format!("cannot render inventory: {}", e)))?;
        let mut file = tempfile::Builder::new()
            .prefix("gridflow-inventory-")
            .suffix(".yml")
            .tempfile()?;
        file.write_all(yaml.as_bytes())?;
        file.flush()?;
        let inventory_path = file.path().to_string_lossy().to_string();

        let args = self.args(&inventory_path, limit);
        tracing::info!(playbook = %self.playbook.display(), hosts = inventory.hosts().len(), "Running playbook");
        tracing::debug!("Running: {} {}", self.binary, args.join(" "));

        let child = Command::new(&self.binary)
            .args(&args)
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RemoteError::Playbook("cancelled".to_string()));
            }
            result = tokio::time::timeout(self.timeout, child) => match result {
                Ok(output) => output?,
                Err(_) => {
                    return Err(RemoteError::Playbook(format!(
                        "timed out after {:?}",
                        self.timeout
                    )));
                }
            },
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let report = PlaybookReport {
            hosts: parse_recap(&stdout),
        };

        // exit 2 = host failures, 4 = unreachable hosts; both carry a recap
        let host_failures = matches!(output.status.code(), Some(2) | Some(4));
        if output.status.success() || (host_failures && !report.hosts.is_empty()) {
            Ok(report)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(RemoteError::Playbook(format!(
                "exited with {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )))
        }
    }
}

/// Parses the `PLAY RECAP` section of a playbook run.
pub fn parse_recap(stdout: &str) -> BTreeMap<String, HostRecap> {
    let mut hosts = BTreeMap::new();
    let Some((_, recap)) = stdout.split_once("PLAY RECAP") else {
        return hosts;
    };

    for line in recap.lines() {
        let Some((host, counters)) = line.split_once(" : ") else {
            continue;
        };
        let mut entry = HostRecap::default();
        for pair in counters.split_whitespace() {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let value = value.parse().unwrap_or(0);
            match key {
                "ok" => entry.ok = value,
                "changed" => entry.changed = value,
                "unreachable" => entry.unreachable = value,
                "failed" => entry.failed = value,
                _ => {}
            }
        }
        hosts.insert(host.trim().to_string(), entry);
    }
    hosts
}
