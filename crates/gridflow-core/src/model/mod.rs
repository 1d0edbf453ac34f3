//! Cluster model

pub mod record;
pub mod resource;
pub mod settings;
pub mod spec;

pub use record::{ClusterPhase, ClusterRecord, NodeEntry, NodeStatus, SshAccess, RECORD_VERSION};
pub use resource::{
    NetworkRef, ResourceId, ResourceKind, ResourceNode, ResourceSpec, ResourceStatus,
    MULTI_CLOUD_SCOPE,
};
pub use settings::{
    ClusterSettings, Direction, Merge, NetworkSettings, SecurityRule, SecuritySettings,
    SshSettings,
};
pub use spec::{CloudSettings, ClusterSpec, NodeGroup, Role, VolumeSpec};
