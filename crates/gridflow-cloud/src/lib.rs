//! Gridflow Cloud Infrastructure
//!
//! This crate turns a cluster specification into cloud resources and keeps
//! track of them, across any number of OpenStack-style clouds.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                gridflow-cluster                  │
//! │        (create / scale / terminate)              │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                gridflow-cloud                    │
//! │  ┌──────────────┐  ┌──────────────────────┐     │
//! │  │   Planner    │─▶│  Provisioning Engine │     │
//! │  └──────────────┘  └──────────┬───────────┘     │
//! │  ┌──────────────┐  ┌──────────▼───────────┐     │
//! │  │ State Store  │  │  trait ProviderAdapter│     │
//! │  └──────────────┘  └──────────┬───────────┘     │
//! └───────────────────────────────┼─────────────────┘
//!                  ┌──────────────┴──────────┐
//!          ┌───────▼────────┐        ┌───────▼───────┐
//!          │   openstack    │        │   in-memory   │
//!          │ (CLI adapter)  │        │  (simulation) │
//!          └────────────────┘        └───────────────┘
//! ```

pub mod context;
pub mod engine;
pub mod memory;
pub mod plan;
pub mod planner;
pub mod provider;
pub mod retry;
pub mod state;

// Re-exports
pub use context::{Catalog, CloudContext, Flavor, Image, MultiCloudContext, Quota};
pub use engine::{DeletionReport, EngineConfig, ProvisioningEngine};
pub use memory::{Call, Fault, InMemoryProvider, Op};
pub use plan::{CloudPlan, PlanSummary, ProvisionPlan};
pub use planner::{PlanMode, ResourcePlanner, TUNNEL_KEY, WIREGUARD_PORT};
pub use provider::{
    AuthStatus, CreatedResource, InstanceRequest, KeypairRequest, NetworkRequest,
    ProviderAdapter, ProviderResult, RemoteStatus, ResourceInfo, RouterRequest,
    SecurityGroupRequest, SubnetRequest, VolumeRequest, WaitTarget,
};
pub use retry::{Attempt, RetryConfig, RetryError, poll_until, retry_with_backoff};
pub use state::{ClusterLease, ClusterStore, FileBackend, MemoryBackend, StateBackend, StateLock};
