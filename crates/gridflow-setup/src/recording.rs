//! Recording transport and playbook runner
//!
//! Stand-ins for `ssh` and `ansible-playbook` used by tests and dry runs.
//! Every command is logged per host; hosts can be made unreachable and
//! commands can be made to fail by substring.

use crate::inventory::Inventory;
use crate::playbook::{HostRecap, PlaybookReport, PlaybookRunner};
use crate::remote::{CommandOutput, RemoteConnector, RemoteError, RemoteSession, Result, SshKey};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Public key printed by the fake cluster key command.
pub const FAKE_CLUSTER_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIGridflowTestKey gridflow-test";

#[derive(Debug, Default)]
struct Transcript {
    unreachable: HashSet<String>,
    /// `(host, command fragment)`
    failing: Vec<(String, String)>,
    /// `(command fragment, stdout)`
    responses: Vec<(String, String)>,
    /// `(host, command)` in execution order
    commands: Vec<(String, String)>,
    connections: usize,
}

fn lock(transcript: &Mutex<Transcript>) -> MutexGuard<'_, Transcript> {
    transcript.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Connector whose sessions succeed unless told otherwise.
#[derive(Debug, Clone)]
pub struct RecordingConnector {
    transcript: Arc<Mutex<Transcript>>,
}

impl Default for RecordingConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingConnector {
    pub fn new() -> Self {
        let connector = Self {
            transcript: Arc::new(Mutex::new(Transcript::default())),
        };
        connector.respond("ssh-keygen", FAKE_CLUSTER_KEY);
        connector
    }

    /// Refuse every connection to `host`.
    pub fn unreachable(&self, host: &str) {
        lock(&self.transcript).unreachable.insert(host.to_string());
    }

    pub fn reachable(&self, host: &str) {
        lock(&self.transcript).unreachable.remove(host);
    }

    /// Fail commands on `host` that contain `fragment`.
    pub fn fail_commands_on(&self, host: &str, fragment: &str) {
        lock(&self.transcript)
            .failing
            .push((host.to_string(), fragment.to_string()));
    }

    /// Print `stdout` for commands containing `fragment`.
    pub fn respond(&self, fragment: &str, stdout: &str) {
        lock(&self.transcript)
            .responses
            .insert(0, (fragment.to_string(), stdout.to_string()));
    }

    pub fn commands(&self) -> Vec<(String, String)> {
        lock(&self.transcript).commands.clone()
    }

    pub fn commands_on(&self, host: &str) -> Vec<String> {
        lock(&self.transcript)
            .commands
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Hosts that ran at least one command.
    pub fn touched_hosts(&self) -> BTreeSet<String> {
        lock(&self.transcript)
            .commands
            .iter()
            .map(|(h, _)| h.clone())
            .collect()
    }

    pub fn connections(&self) -> usize {
        lock(&self.transcript).connections
    }
}

#[async_trait]
impl RemoteConnector for RecordingConnector {
    async fn connect(&self, host: &str, _key: &SshKey) -> Result<Box<dyn RemoteSession>> {
        let mut transcript = lock(&self.transcript);
        if transcript.unreachable.contains(host) {
            return Err(RemoteError::Connect {
                host: host.to_string(),
                message: "Connection refused".to_string(),
            });
        }
        transcript.connections += 1;
        Ok(Box::new(RecordingSession {
            host: host.to_string(),
            transcript: Arc::clone(&self.transcript),
        }))
    }
}

struct RecordingSession {
    host: String,
    transcript: Arc<Mutex<Transcript>>,
}

#[async_trait]
impl RemoteSession for RecordingSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, command: &str) -> Result<CommandOutput> {
        let mut transcript = lock(&self.transcript);
        transcript
            .commands
            .push((self.host.clone(), command.to_string()));

        let fails = transcript
            .failing
            .iter()
            .any(|(host, fragment)| *host == self.host && command.contains(fragment.as_str()));
        if fails {
            return Ok(CommandOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: format!("simulated failure: {}", command),
            });
        }

        let stdout = transcript
            .responses
            .iter()
            .find(|(fragment, _)| command.contains(fragment.as_str()))
            .map(|(_, stdout)| format!("{}\n", stdout))
            .unwrap_or_default();
        Ok(CommandOutput {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        })
    }
}

/// One recorded playbook run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybookRun {
    /// Inventory hosts, in roster order
    pub hosts: Vec<String>,
    pub limit: Option<Vec<String>>,
}

#[derive(Debug, Default)]
struct PlaybookState {
    runs: Vec<PlaybookRun>,
    failing_hosts: HashSet<String>,
    run_error: Option<String>,
}

/// Playbook runner that records its runs and reports success unless told
/// otherwise.
#[derive(Debug, Clone, Default)]
pub struct RecordingPlaybook {
    state: Arc<Mutex<PlaybookState>>,
}

impl RecordingPlaybook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a failed recap for `host`.
    pub fn fail_host(&self, host: &str) {
        self.lock().failing_hosts.insert(host.to_string());
    }

    /// Fail the whole run.
    pub fn fail_runs(&self, message: &str) {
        self.lock().run_error = Some(message.to_string());
    }

    pub fn runs(&self) -> Vec<PlaybookRun> {
        self.lock().runs.clone()
    }

    fn lock(&self) -> MutexGuard<'_, PlaybookState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PlaybookRunner for RecordingPlaybook {
    async fn apply(
        &self,
        inventory: &Inventory,
        limit: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> Result<PlaybookReport> {
        if cancel.is_cancelled() {
            return Err(RemoteError::Playbook("cancelled".to_string()));
        }

        let mut state = self.lock();
        state.runs.push(PlaybookRun {
            hosts: inventory.hosts().iter().map(|h| h.name.clone()).collect(),
            limit: limit.map(|l| l.to_vec()),
        });
        if let Some(message) = &state.run_error {
            return Err(RemoteError::Playbook(message.clone()));
        }

        let hosts = inventory
            .hosts()
            .iter()
            .filter(|h| limit.is_none_or(|l| l.contains(&h.name)))
            .map(|h| {
                let failed = u32::from(state.failing_hosts.contains(&h.name));
                (
                    h.name.clone(),
                    HostRecap {
                        ok: 5,
                        changed: 2,
                        unreachable: 0,
                        failed,
                    },
                )
            })
            .collect();
        Ok(PlaybookReport { hosts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_session() {
        let connector = RecordingConnector::new();
        connector.fail_commands_on("h1", "useradd");
        let key = SshKey::new("ubuntu", None);

        let session = connector.connect("h1", &key).await.unwrap();
        let keygen = session.run("ssh-keygen -f x && cat x.pub").await.unwrap();
        assert_eq!(keygen.stdout.trim(), FAKE_CLUSTER_KEY);
        assert_eq!(session.run("sudo useradd slurm").await.unwrap().exit_code, 1);
        assert_eq!(connector.commands_on("h1").len(), 2);

        connector.unreachable("h2");
        assert!(matches!(
            connector.connect("h2", &key).await,
            Err(RemoteError::Connect { .. })
        ));
        assert_eq!(connector.connections(), 1);
    }
}
