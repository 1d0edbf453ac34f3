//! openstack CLI wrapper
//!
//! Wraps the `openstack` command line client. Every call selects the cloud
//! through `--os-cloud`, so credentials come from the usual `clouds.yaml`.

use crate::error::{OpenStackError, Result};
use serde_json::Value;
use std::io::Write;
use std::process::Stdio;
use tokio::process::Command;

/// openstack CLI wrapper
pub struct OpenStackCli {
    cloud: String,
    binary: String,
}

impl OpenStackCli {
    /// `cloud` is the entry name in `clouds.yaml`.
    pub fn new(cloud: impl Into<String>) -> Self {
        Self {
            cloud: cloud.into(),
            binary: "openstack".to_string(),
        }
    }

    /// Uses another executable, e.g. a wrapper script.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn cloud(&self) -> &str {
        &self.cloud
    }

    /// Check if the CLI is installed and the credentials work
    pub async fn check_auth(&self) -> Result<Value> {
        let which = Command::new("which").arg(&self.binary).output().await?;
        if !which.status.success() {
            return Err(OpenStackError::CliNotFound);
        }

        self.json(&["token", "issue"]).await
    }

    /// Run a command and return stdout
    pub async fn run(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--os-cloud").arg(&self.cloud);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        tracing::debug!(
            "Running: {} --os-cloud {} {}",
            self.binary,
            self.cloud,
            args.join(" ")
        );

        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                OpenStackError::CliNotFound
            } else {
                e.into()
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OpenStackError::CommandFailed(stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Run a command with `-f json` and parse its output
    pub async fn json(&self, args: &[&str]) -> Result<Value> {
        let mut args = args.to_vec();
        args.extend(["-f", "json"]);
        let output = self.run(&args).await?;

        if output.trim().is_empty() {
            return Ok(Value::Array(Vec::new()));
        }
        Ok(serde_json::from_str(&output)?)
    }

    /// Rows of a `list` command
    pub async fn list(&self, args: &[&str]) -> Result<Vec<Value>> {
        match self.json(args).await? {
            Value::Array(rows) => Ok(rows),
            other => Err(OpenStackError::UnexpectedOutput(other.to_string())),
        }
    }

    /// Runs `keypair create` with the public key in a temporary file.
    pub async fn create_keypair(&self, name: &str, public_key: &str) -> Result<Value> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(public_key.as_bytes())?;
        file.flush()?;
        let path = file.path().to_string_lossy().to_string();

        self.json(&["keypair", "create", "--public-key", &path, name])
            .await
    }
}

/// Looks a field up under several spellings.
///
/// `list` output uses column titles ("ID", "Name") while `show` output uses
/// attribute names ("id", "name").
pub fn field<'a>(value: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| value.get(*name))
}

pub fn field_str(value: &Value, names: &[&str]) -> Option<String> {
    match field(value, names)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn field_u64(value: &Value, names: &[&str]) -> Option<u64> {
    match field(value, names)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// First IPv4 address of a server.
///
/// Depending on the client version `addresses` is either a map of network
/// names to address lists or a string like `"net=10.0.0.5, 172.24.4.10"`.
/// The last address of a network is preferred since floating IPs are
/// appended after fixed ones.
pub fn server_address(server: &Value) -> Option<String> {
    let is_v4 = |s: &str| s.parse::<std::net::Ipv4Addr>().is_ok();

    match server.get("addresses")? {
        Value::Object(networks) => networks.values().find_map(|addresses| {
            let addresses = addresses.as_array()?;
            addresses
                .iter()
                .rev()
                .filter_map(|a| match a {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(_) => field_str(a, &["addr"]),
                    _ => None,
                })
                .find(|a| is_v4(a))
        }),
        Value::String(text) => text.split(';').find_map(|network| {
            let (_, addresses) = network.split_once('=')?;
            addresses
                .split(',')
                .map(str::trim)
                .rev()
                .find(|a| is_v4(a))
                .map(str::to_string)
        }),
        _ => None,
    }
}

/// Subnet ids attached to a router.
pub fn router_subnets(router: &Value) -> Vec<String> {
    let interfaces = match router.get("interfaces_info") {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::String(text)) => serde_json::from_str(text).unwrap_or_default(),
        _ => Vec::new(),
    };
    interfaces
        .iter()
        .filter_map(|i| field_str(i, &["subnet_id"]))
        .collect()
}

/// Remaining value of an absolute limit pair, `None` when unlimited.
pub fn remaining(limits: &[Value], max: &str, used: &str) -> Option<u64> {
    let value = |name: &str| -> Option<i64> {
        limits.iter().find_map(|row| {
            if field_str(row, &["Name", "name"])? == name {
                field(row, &["Value", "value"])?.as_i64()
            } else {
                None
            }
        })
    };
    let max = value(max)?;
    if max < 0 {
        return None;
    }
    let used = value(used).unwrap_or(0).max(0);
    Some((max - used).max(0) as u64)
}
