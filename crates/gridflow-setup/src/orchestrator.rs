//! Configuration orchestrator
//!
//! Brings provisioned nodes into their configured state:
//!
//! 1. wait until each node accepts a remote session
//! 2. baseline setup over that session (users, cluster key, mounts), master
//!    first, then the workers concurrently
//! 3. one playbook run against the whole inventory
//!
//! The orchestrator never writes the cluster record. It returns a
//! [`ConfigurationReport`] that the caller applies through the state store,
//! then asks the report whether the cluster reached readiness.

use crate::baseline::{BaselineSetup, NodeContext, cluster_key_command};
use crate::inventory::Inventory;
use crate::playbook::{PlaybookReport, PlaybookRunner};
use crate::remote::{RemoteConnector, RemoteError, RemoteSession, SshKey};
use futures_util::stream::{self, StreamExt};
use gridflow_cloud::{Attempt, RetryConfig, RetryError, poll_until};
use gridflow_core::{
    ClusterError, ClusterRecord, ConfigurationFailure, NodeEntry, NodeStatus, ResourceId,
    ResourceSpec, Result,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Concurrency, timeouts and readiness threshold of configuration runs.
#[derive(Debug, Clone)]
pub struct SetupPolicy {
    /// Nodes set up at the same time
    pub concurrency: usize,

    /// Poll cadence of the reachability check
    pub reachability: RetryConfig,

    /// How long a node may take to accept a session
    pub reachability_timeout: Duration,

    /// Upper bound of a single remote command
    pub command_timeout: Duration,

    /// Share of workers that must configure for the cluster to be ready
    pub min_worker_fraction: f64,

    pub baseline: BaselineSetup,
}

impl Default for SetupPolicy {
    fn default() -> Self {
        Self {
            concurrency: 8,
            reachability: RetryConfig {
                max_attempts: 0,
                initial_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(15),
                backoff_multiplier: 1.5,
                jitter: true,
            },
            reachability_timeout: Duration::from_secs(300),
            command_timeout: Duration::from_secs(600),
            min_worker_fraction: 1.0,
            baseline: BaselineSetup::default(),
        }
    }
}

/// Which nodes a run configures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupScope {
    /// Master and every worker
    Cluster,
    /// Only these nodes, e.g. the workers added by a scale-up
    Nodes(Vec<ResourceId>),
}

impl SetupScope {
    fn includes(&self, id: &ResourceId) -> bool {
        match self {
            SetupScope::Cluster => true,
            SetupScope::Nodes(ids) => ids.contains(id),
        }
    }
}

/// Result of one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutcome {
    pub resource: ResourceId,
    pub name: String,
    pub address: Option<String>,
    pub is_master: bool,
    pub status: NodeStatus,
    pub detail: Option<String>,
}

impl NodeOutcome {
    fn new(node: &NodeEntry, is_master: bool, status: NodeStatus, detail: Option<String>) -> Self {
        Self {
            resource: node.resource.clone(),
            name: node.name.clone(),
            address: node.address.clone(),
            is_master,
            status,
            detail,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.status == NodeStatus::Configured
    }
}

/// What a configuration run achieved.
#[derive(Debug, Clone)]
pub struct ConfigurationReport {
    pub cluster_id: String,
    pub nodes: Vec<NodeOutcome>,
    /// Set only when the master's baseline setup succeeded in this run
    pub master_address: Option<String>,
    pub cluster_public_key: Option<String>,
    pub playbook: Option<PlaybookReport>,
    min_worker_fraction: f64,
}

impl ConfigurationReport {
    pub fn master(&self) -> Option<&NodeOutcome> {
        self.nodes.iter().find(|n| n.is_master)
    }

    pub fn workers(&self) -> impl Iterator<Item = &NodeOutcome> {
        self.nodes.iter().filter(|n| !n.is_master)
    }

    pub fn configured(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_configured()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &NodeOutcome> {
        self.nodes.iter().filter(|n| !n.is_configured())
    }

    /// Writes node statuses and SSH access data into the record.
    pub fn apply_to(&self, record: &mut ClusterRecord) {
        for outcome in &self.nodes {
            if let Some(node) = record.node_mut(&outcome.resource) {
                node.status = outcome.status;
                node.detail = outcome.detail.clone();
            }
        }
        if let Some(address) = &self.master_address {
            record.ssh.master_address = Some(address.clone());
        }
        if let Some(key) = &self.cluster_public_key {
            record.ssh.cluster_public_key = Some(key.clone());
        }
    }

    /// Whether the configured nodes make a ready cluster: the master (when
    /// part of the run) succeeded and enough workers did.
    pub fn readiness(&self) -> Result<()> {
        if let Some(master) = self.master() {
            match master.status {
                NodeStatus::Configured => {}
                NodeStatus::Unreachable => {
                    return Err(ClusterError::UnreachableNode {
                        node: master.name.clone(),
                        address: master.address.clone().unwrap_or_default(),
                        message: master.detail.clone().unwrap_or_default(),
                    });
                }
                _ => {
                    return Err(self.failed(format!(
                        "master {} failed: {}",
                        master.name,
                        master.detail.as_deref().unwrap_or("unknown error")
                    )));
                }
            }
        }

        let total = self.workers().count();
        let configured = self.workers().filter(|w| w.is_configured()).count();
        let fraction = self.min_worker_fraction.clamp(0.0, 1.0);
        let required = (fraction * total as f64).ceil() as usize;
        if configured < required {
            return Err(self.failed(format!(
                "{} of {} workers configured, at least {} required",
                configured, total, required
            )));
        }
        Ok(())
    }

    fn failed(&self, reason: String) -> ClusterError {
        ClusterError::ConfigurationFailed(Box::new(ConfigurationFailure {
            cluster_id: self.cluster_id.clone(),
            reason,
            nodes: self
                .failures()
                .map(|n| {
                    (
                        n.name.clone(),
                        n.detail.clone().unwrap_or_else(|| n.status.to_string()),
                    )
                })
                .collect(),
        }))
    }
}

/// Result of setting up one node.
struct NodeRun {
    outcome: NodeOutcome,
    public_key: Option<String>,
    cancelled: bool,
}

pub struct ConfigurationOrchestrator {
    connector: Arc<dyn RemoteConnector>,
    playbook: Option<Arc<dyn PlaybookRunner>>,
    policy: SetupPolicy,
}

impl ConfigurationOrchestrator {
    pub fn new(connector: Arc<dyn RemoteConnector>, policy: SetupPolicy) -> Self {
        Self {
            connector,
            playbook: None,
            policy,
        }
    }

    pub fn with_playbook(mut self, runner: Arc<dyn PlaybookRunner>) -> Self {
        self.playbook = Some(runner);
        self
    }

    pub fn policy(&self) -> &SetupPolicy {
        &self.policy
    }

    /// Configures the nodes of `record` selected by `scope`.
    ///
    /// Node failures end up in the report, not in the error: the caller
    /// persists them first and then checks
    /// [`readiness`](ConfigurationReport::readiness). Only cancellation is
    /// returned as an error.
    pub async fn configure(
        &self,
        record: &ClusterRecord,
        scope: &SetupScope,
        cancel: &CancellationToken,
    ) -> Result<ConfigurationReport> {
        let mut report = ConfigurationReport {
            cluster_id: record.cluster_id.clone(),
            nodes: Vec::new(),
            master_address: None,
            cluster_public_key: None,
            playbook: None,
            min_worker_fraction: self.policy.min_worker_fraction,
        };

        let mut master_address = record.ssh.master_address.clone();
        let mut public_key = record.ssh.cluster_public_key.clone();

        let master = record.master.as_ref().filter(|m| scope.includes(&m.resource));
        let workers: Vec<&NodeEntry> = record
            .workers
            .iter()
            .filter(|w| scope.includes(&w.resource))
            .collect();

        info!(
            cluster_id = %record.cluster_id,
            master = master.is_some(),
            workers = workers.len(),
            "Configuring nodes"
        );

        if let Some(master) = master {
            let run = self
                .setup_node(record, master, true, master.address.as_deref(), None, cancel)
                .await;
            if run.cancelled {
                return Err(ClusterError::Cancelled);
            }
            let succeeded = run.outcome.is_configured();
            if succeeded {
                master_address = master.address.clone();
                report.master_address = master_address.clone();
                if run.public_key.is_some() {
                    public_key = run.public_key.clone();
                    report.cluster_public_key = run.public_key;
                }
            }
            report.nodes.push(run.outcome);

            if !succeeded {
                warn!(cluster_id = %record.cluster_id, "Master setup failed, workers skipped");
                report.nodes.extend(workers.iter().map(|w| {
                    NodeOutcome::new(
                        w,
                        false,
                        NodeStatus::Pending,
                        Some("skipped: master setup failed".to_string()),
                    )
                }));
                return Ok(report);
            }
        }

        let runs: Vec<NodeRun> = stream::iter(workers.iter().copied())
            .map(|worker| {
                self.setup_node(
                    record,
                    worker,
                    false,
                    master_address.as_deref(),
                    public_key.as_deref(),
                    cancel,
                )
            })
            .buffer_unordered(self.policy.concurrency.max(1))
            .collect()
            .await;

        if cancel.is_cancelled() || runs.iter().any(|r| r.cancelled) {
            return Err(ClusterError::Cancelled);
        }

        // roster order
        let mut outcomes: Vec<NodeOutcome> = runs.into_iter().map(|r| r.outcome).collect();
        outcomes.sort_by_key(|o| workers.iter().position(|w| w.resource == o.resource));
        report.nodes.extend(outcomes);

        if report.readiness().is_ok() {
            self.run_playbook(record, scope, &mut report, cancel).await?;
        }

        info!(
            cluster_id = %record.cluster_id,
            configured = report.configured(),
            failed = report.failures().count(),
            "Configuration finished"
        );
        Ok(report)
    }

    async fn run_playbook(
        &self,
        record: &ClusterRecord,
        scope: &SetupScope,
        report: &mut ConfigurationReport,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(runner) = &self.playbook else {
            return Ok(());
        };

        let limit: Option<Vec<String>> = match scope {
            SetupScope::Cluster => None,
            SetupScope::Nodes(_) => Some(
                report
                    .nodes
                    .iter()
                    .filter(|n| n.is_configured())
                    .map(|n| n.name.clone())
                    .collect(),
            ),
        };
        if limit.as_ref().is_some_and(|l| l.is_empty()) {
            return Ok(());
        }

        let mut view = record.clone();
        report.apply_to(&mut view);
        let inventory = Inventory::from_record(&view);

        match runner.apply(&inventory, limit.as_deref(), cancel).await {
            Ok(playbook) => {
                for host in playbook.failed_hosts() {
                    if let Some(node) = report.nodes.iter_mut().find(|n| n.name == host) {
                        warn!(node = %node.name, "Playbook failed on node");
                        node.status = NodeStatus::Failed;
                        node.detail = Some("playbook failed on this node".to_string());
                    }
                }
                report.playbook = Some(playbook);
                Ok(())
            }
            Err(_) if cancel.is_cancelled() => Err(ClusterError::Cancelled),
            Err(e) => {
                warn!(cluster_id = %record.cluster_id, error = %e, "Playbook run failed");
                for node in report.nodes.iter_mut().filter(|n| n.is_configured()) {
                    node.status = NodeStatus::Failed;
                    node.detail = Some(e.to_string());
                }
                Ok(())
            }
        }
    }

    async fn setup_node(
        &self,
        record: &ClusterRecord,
        node: &NodeEntry,
        is_master: bool,
        master_address: Option<&str>,
        public_key: Option<&str>,
        cancel: &CancellationToken,
    ) -> NodeRun {
        let finish = |status: NodeStatus, detail: Option<String>| NodeRun {
            outcome: NodeOutcome::new(node, is_master, status, detail),
            public_key: None,
            cancelled: false,
        };

        let Some(address) = node.address.as_deref() else {
            return finish(NodeStatus::Failed, Some("node has no address".to_string()));
        };
        let key = SshKey::new(&node.ssh_user, record.ssh.private_key_path.clone());

        let session = match self.reach(&node.name, address, &key, cancel).await {
            Ok(session) => session,
            Err(RetryError::Cancelled) => {
                return NodeRun {
                    cancelled: true,
                    ..finish(NodeStatus::Pending, Some("cancelled".to_string()))
                };
            }
            Err(e) => {
                warn!(node = %node.name, address, error = %e, "Node is unreachable");
                return finish(NodeStatus::Unreachable, Some(e.to_string()));
            }
        };

        let mut cluster_key = None;
        if is_master && self.policy.baseline.distribute_cluster_key {
            match self
                .run(session.as_ref(), &cluster_key_command(&record.cluster_id), cancel)
                .await
            {
                Ok(output) => {
                    cluster_key = output
                        .lines()
                        .rev()
                        .find(|l| l.starts_with("ssh-"))
                        .map(|l| l.trim().to_string());
                }
                Err(e) => return self.command_failure(node, is_master, e, cancel),
            }
        }

        let mounts: Vec<String> = record
            .attached_volumes(&node.resource)
            .iter()
            .filter_map(|id| match record.resource(id).map(|r| &r.spec) {
                Some(ResourceSpec::Volume { mount_point, .. }) => mount_point.clone(),
                _ => None,
            })
            .collect();
        let context = NodeContext {
            is_master,
            master_address: if is_master { Some(address) } else { master_address },
            cluster_public_key: cluster_key.as_deref().or(public_key),
            volume_mounts: &mounts,
        };

        for command in self.policy.baseline.commands(&context) {
            if let Err(e) = self.run(session.as_ref(), &command, cancel).await {
                return self.command_failure(node, is_master, e, cancel);
            }
        }

        debug!(node = %node.name, address, "Baseline setup finished");
        NodeRun {
            public_key: cluster_key,
            ..finish(NodeStatus::Configured, None)
        }
    }

    fn command_failure(
        &self,
        node: &NodeEntry,
        is_master: bool,
        error: RemoteError,
        cancel: &CancellationToken,
    ) -> NodeRun {
        let cancelled = cancel.is_cancelled();
        if !cancelled {
            warn!(node = %node.name, error = %error, "Baseline setup failed");
        }
        NodeRun {
            outcome: NodeOutcome::new(node, is_master, NodeStatus::Failed, Some(error.to_string())),
            public_key: None,
            cancelled,
        }
    }

    /// Polls until the node accepts a session.
    async fn reach(
        &self,
        name: &str,
        address: &str,
        key: &SshKey,
        cancel: &CancellationToken,
    ) -> std::result::Result<Box<dyn RemoteSession>, RetryError<RemoteError>> {
        let connector = self.connector.as_ref();
        let operation = format!("reach {} at {}", name, address);
        poll_until(
            &self.policy.reachability,
            &operation,
            self.policy.reachability_timeout,
            cancel,
            |_| async move {
                match connector.connect(address, key).await {
                    Ok(session) => Attempt::Done(session),
                    Err(e) => Attempt::Retry(e),
                }
            },
        )
        .await
    }

    /// Runs one command bounded by the command timeout; returns stdout.
    async fn run(
        &self,
        session: &dyn RemoteSession,
        command: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<String, RemoteError> {
        let timeout = self.policy.command_timeout;
        tokio::select! {
            _ = cancel.cancelled() => Err(RemoteError::Io("cancelled".to_string())),
            result = tokio::time::timeout(timeout, session.run(command)) => match result {
                Ok(output) => Ok(output?.check(session.host())?.stdout),
                Err(_) => Err(RemoteError::Timeout {
                    host: session.host().to_string(),
                    timeout,
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{RecordingConnector, RecordingPlaybook};
    use gridflow_core::{
        ClusterSpec, NetworkRef, ResourceNode, ResourceStatus, Role, SshAccess,
    };
    use serde_json::json;

    fn instance(name: &str, role: Role, address: &str) -> ResourceNode {
        let mut node = ResourceNode::planned(
            "cloud-a",
            name,
            ResourceSpec::Instance {
                name: name.to_string(),
                group: if role == Role::Master { "master" } else { "compute" }.to_string(),
                role,
                flavor: "small".to_string(),
                image: "ubuntu".to_string(),
                network: NetworkRef::Planned,
                key_name: "grid-abc".to_string(),
                ssh_user: "ubuntu".to_string(),
                tags: Vec::new(),
            },
        );
        node.provider_id = Some(format!("{}-id", name));
        node.set_output("address", json!(address));
        node.set_status(ResourceStatus::Ready);
        node
    }

    fn record(workers: usize) -> ClusterRecord {
        let spec = ClusterSpec {
            groups: Vec::new(),
            defaults: Default::default(),
            clouds: Vec::new(),
            ssh: Default::default(),
        };
        let mut record = ClusterRecord::new("abc", spec, SshAccess::default());
        let master = instance("grid-master-abc", Role::Master, "10.0.0.10");
        record.absorb_resources([master.clone()]);
        record
            .set_master(NodeEntry::from_instance(&master).unwrap())
            .unwrap();
        for i in 1..=workers {
            let worker = instance(
                &format!("grid-worker-abc-{}", i),
                Role::Worker,
                &format!("10.0.0.{}", 10 + i),
            );
            record.absorb_resources([worker.clone()]);
            record
                .add_worker(NodeEntry::from_instance(&worker).unwrap())
                .unwrap();
        }
        record
    }

    fn policy() -> SetupPolicy {
        SetupPolicy {
            reachability: RetryConfig::immediate(3),
            reachability_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(5),
            baseline: BaselineSetup {
                users: vec!["slurm".to_string()],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_configures_master_then_workers() {
        let connector = Arc::new(RecordingConnector::new());
        let playbook = Arc::new(RecordingPlaybook::new());
        let orchestrator = ConfigurationOrchestrator::new(connector.clone(), policy())
            .with_playbook(playbook.clone());

        let mut record = record(3);
        let report = orchestrator
            .configure(&record, &SetupScope::Cluster, &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.readiness().is_ok());
        assert_eq!(report.configured(), 4);
        assert_eq!(report.master_address.as_deref(), Some("10.0.0.10"));
        assert!(report.cluster_public_key.as_deref().unwrap().starts_with("ssh-ed25519"));

        // the master generated the key before any worker was touched
        let commands = connector.commands();
        assert_eq!(commands[0].0, "10.0.0.10");
        assert!(commands[0].1.contains("ssh-keygen"));
        let worker_commands = connector.commands_on("10.0.0.11");
        assert!(worker_commands.iter().any(|c| c.contains("authorized_keys")));

        assert_eq!(playbook.runs().len(), 1);
        assert_eq!(playbook.runs()[0].limit, None);

        report.apply_to(&mut record);
        assert!(record.nodes().all(|n| n.status == NodeStatus::Configured));
        assert_eq!(record.ssh.master_address.as_deref(), Some("10.0.0.10"));
    }

    #[tokio::test]
    async fn test_failed_worker_does_not_stop_the_rest() {
        let connector = Arc::new(RecordingConnector::new());
        connector.fail_commands_on("10.0.0.12", "useradd");
        let orchestrator = ConfigurationOrchestrator::new(
            connector.clone(),
            SetupPolicy {
                min_worker_fraction: 0.5,
                ..policy()
            },
        );

        let report = orchestrator
            .configure(&record(3), &SetupScope::Cluster, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.configured(), 3);
        let failed: Vec<_> = report.failures().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].name, "grid-worker-abc-2");
        assert_eq!(failed[0].status, NodeStatus::Failed);
        assert!(report.readiness().is_ok());
    }

    #[tokio::test]
    async fn test_threshold_not_met_is_configuration_failed() {
        let connector = Arc::new(RecordingConnector::new());
        connector.fail_commands_on("10.0.0.11", "useradd");
        let orchestrator = ConfigurationOrchestrator::new(connector, policy());

        let report = orchestrator
            .configure(&record(2), &SetupScope::Cluster, &CancellationToken::new())
            .await
            .unwrap();

        match report.readiness() {
            Err(ClusterError::ConfigurationFailed(failure)) => {
                assert_eq!(failure.cluster_id, "abc");
                assert_eq!(failure.nodes.len(), 1);
                assert_eq!(failure.nodes[0].0, "grid-worker-abc-1");
            }
            other => panic!("expected ConfigurationFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_master_is_fatal() {
        let connector = Arc::new(RecordingConnector::new());
        connector.unreachable("10.0.0.10");
        let playbook = Arc::new(RecordingPlaybook::new());
        let orchestrator = ConfigurationOrchestrator::new(connector.clone(), policy())
            .with_playbook(playbook.clone());

        let report = orchestrator
            .configure(&record(2), &SetupScope::Cluster, &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(
            report.readiness(),
            Err(ClusterError::UnreachableNode { .. })
        ));
        assert!(report.master_address.is_none());
        assert!(connector.commands_on("10.0.0.11").is_empty());
        assert!(playbook.runs().is_empty());
    }

    #[tokio::test]
    async fn test_scoped_run_leaves_master_alone() {
        let connector = Arc::new(RecordingConnector::new());
        let playbook = Arc::new(RecordingPlaybook::new());
        let orchestrator = ConfigurationOrchestrator::new(connector.clone(), policy())
            .with_playbook(playbook.clone());

        let mut record = record(3);
        record.ssh.master_address = Some("10.0.0.10".to_string());
        record.ssh.cluster_public_key = Some("ssh-ed25519 KEY gridflow-abc".to_string());
        let new_worker = record.workers[2].resource.clone();

        let report = orchestrator
            .configure(
                &record,
                &SetupScope::Nodes(vec![new_worker]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.nodes.len(), 1);
        assert!(report.master().is_none());
        assert!(connector.commands_on("10.0.0.10").is_empty());
        assert!(connector
            .commands_on("10.0.0.13")
            .iter()
            .any(|c| c.contains("ssh-ed25519 KEY gridflow-abc")));
        assert_eq!(
            playbook.runs()[0].limit,
            Some(vec!["grid-worker-abc-3".to_string()])
        );
    }

    #[tokio::test]
    async fn test_playbook_host_failure_marks_node() {
        let connector = Arc::new(RecordingConnector::new());
        let playbook = Arc::new(RecordingPlaybook::new());
        playbook.fail_host("grid-worker-abc-1");
        let orchestrator =
            ConfigurationOrchestrator::new(connector, policy()).with_playbook(playbook);

        let report = orchestrator
            .configure(&record(1), &SetupScope::Cluster, &CancellationToken::new())
            .await
            .unwrap();

        let worker = report.workers().next().unwrap();
        assert_eq!(worker.status, NodeStatus::Failed);
        assert!(report.readiness().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_run() {
        let connector = Arc::new(RecordingConnector::new());
        let orchestrator = ConfigurationOrchestrator::new(connector, policy());
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            orchestrator
                .configure(&record(1), &SetupScope::Cluster, &cancel)
                .await,
            Err(ClusterError::Cancelled)
        ));
    }
}
