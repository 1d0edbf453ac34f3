//! Remote execution channel
//!
//! The orchestrator only needs two capabilities: open a session on a host
//! with a key, and run a command in it. [`SshConnector`] provides both on top
//! of the system `ssh` client.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Exit code `ssh` uses for its own failures.
const SSH_TRANSPORT_EXIT: i32 = 255;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The host could not be reached or refused the key
    #[error("cannot connect to {host}: {message}")]
    Connect { host: String, message: String },

    #[error("command on {host} exited with {exit_code}: {stderr}")]
    CommandFailed {
        host: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("command on {host} timed out after {timeout:?}")]
    Timeout { host: String, timeout: Duration },

    #[error("playbook run failed: {0}")]
    Playbook(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for RemoteError {
    fn from(err: std::io::Error) -> Self {
        RemoteError::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turns a non-zero exit into [`RemoteError::CommandFailed`].
    pub fn check(self, host: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(RemoteError::CommandFailed {
                host: host.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Credentials of a remote login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshKey {
    pub user: String,
    /// `None` uses the agent or the client defaults
    pub private_key: Option<PathBuf>,
}

impl SshKey {
    pub fn new(user: impl Into<String>, private_key: Option<PathBuf>) -> Self {
        Self {
            user: user.into(),
            private_key,
        }
    }
}

/// An open remote shell session.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    fn host(&self) -> &str;

    /// Runs a shell command. A non-zero exit is an `Ok` output, only
    /// transport failures are errors.
    async fn run(&self, command: &str) -> Result<CommandOutput>;
}

/// Opens remote sessions.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, host: &str, key: &SshKey) -> Result<Box<dyn RemoteSession>>;
}

/// Quotes a string for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Sessions over the system `ssh` client.
#[derive(Debug, Clone)]
pub struct SshConnector {
    binary: String,
    connect_timeout: Duration,
    /// `user@host` to jump through, e.g. the master of the cluster
    jump: Option<String>,
}

impl Default for SshConnector {
    fn default() -> Self {
        Self {
            binary: "ssh".to_string(),
            connect_timeout: Duration::from_secs(10),
            jump: None,
        }
    }
}

impl SshConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_jump(mut self, jump: impl Into<String>) -> Self {
        self.jump = Some(jump.into());
        self
    }

    fn base_args(&self, host: &str, key: &SshKey) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ];
        if let Some(path) = &key.private_key {
            args.push("-i".to_string());
            args.push(path.to_string_lossy().to_string());
        }
        if let Some(jump) = &self.jump {
            args.push("-J".to_string());
            args.push(jump.clone());
        }
        args.push(format!("{}@{}", key.user, host));
        args
    }
}

#[async_trait]
impl RemoteConnector for SshConnector {
    async fn connect(&self, host: &str, key: &SshKey) -> Result<Box<dyn RemoteSession>> {
        let session = SshSession {
            binary: self.binary.clone(),
            host: host.to_string(),
            args: self.base_args(host, key),
        };

        let probe = session.run("true").await?;
        if !probe.success() {
            return Err(RemoteError::Connect {
                host: host.to_string(),
                message: probe.stderr.trim().to_string(),
            });
        }
        Ok(Box::new(session))
    }
}

struct SshSession {
    binary: String,
    host: String,
    args: Vec<String>,
}

#[async_trait]
impl RemoteSession for SshSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, command: &str) -> Result<CommandOutput> {
        tracing::debug!(host = %self.host, "ssh: {}", command);

        let output = Command::new(&self.binary)
            .args(&self.args)
            .arg("--")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if exit_code == SSH_TRANSPORT_EXIT {
            return Err(RemoteError::Connect {
                host: self.host.clone(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
        })
    }
}
