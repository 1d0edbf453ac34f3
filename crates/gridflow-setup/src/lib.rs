//! Gridflow node configuration
//!
//! Takes the nodes of a provisioned cluster to their configured state:
//! reachability polling, baseline setup over SSH and one playbook run
//! against an inventory generated from the cluster record.
//!
//! ```text
//!   ClusterRecord ──▶ ConfigurationOrchestrator ──▶ ConfigurationReport
//!                        │              │
//!              trait RemoteConnector   trait PlaybookRunner
//!                 (ssh / recording)    (ansible-playbook / recording)
//! ```

pub mod baseline;
pub mod inventory;
pub mod orchestrator;
pub mod playbook;
pub mod recording;
pub mod remote;

// Re-exports
pub use baseline::{BaselineSetup, MountSpec, NodeContext, cluster_key_command};
pub use inventory::{Host, Inventory};
pub use orchestrator::{
    ConfigurationOrchestrator, ConfigurationReport, NodeOutcome, SetupPolicy, SetupScope,
};
pub use playbook::{AnsiblePlaybook, HostRecap, PlaybookReport, PlaybookRunner, parse_recap};
pub use recording::{FAKE_CLUSTER_KEY, PlaybookRun, RecordingConnector, RecordingPlaybook};
pub use remote::{
    CommandOutput, RemoteConnector, RemoteError, RemoteSession, SshConnector, SshKey,
    shell_quote,
};
