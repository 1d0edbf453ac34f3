//! Gridflow core model
//!
//! Shared vocabulary of every Gridflow crate:
//!
//! - [`ClusterSpec`]: the desired master/worker topology, with layered
//!   settings (cluster defaults, cloud-local, group-local) merged by
//!   [`Merge`]
//! - [`ResourceNode`]: one planned or realized cloud object and its
//!   dependency edges
//! - [`ClusterRecord`]: the persisted aggregate of everything created for a
//!   cluster
//! - [`ClusterError`]: the error taxonomy returned by every core operation

pub mod error;
pub mod model;

pub use error::{
    CleanupFailure, ClusterError, ConfigurationFailure, NodeFailure, ProviderError,
    ProvisioningFailure, Result,
};
pub use model::{
    CloudSettings, ClusterPhase, ClusterRecord, ClusterSettings, ClusterSpec, Direction, Merge,
    NetworkRef, NetworkSettings, NodeEntry, NodeGroup, NodeStatus, ResourceId, ResourceKind,
    ResourceNode, ResourceSpec, ResourceStatus, Role, SecurityRule, SecuritySettings, SshAccess,
    SshSettings, VolumeSpec, MULTI_CLOUD_SCOPE, RECORD_VERSION,
};
