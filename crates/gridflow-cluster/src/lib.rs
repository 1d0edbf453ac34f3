//! Gridflow cluster lifecycle
//!
//! Ties the planner, the provisioning engine, the state store and the
//! configuration orchestrator together:
//!
//! - [`ClusterManager::check`]: credentials, catalogs and a dry-run plan
//! - [`ClusterManager::create`]: provision, record, configure
//! - [`ScalingController::scale_up`] / [`ScalingController::scale_down`]
//! - [`ClusterManager::terminate`]: release everything, drop the record
//!
//! ```no_run
//! use gridflow_cloud::{ClusterStore, EngineConfig, MultiCloudContext};
//! use gridflow_cluster::ClusterManager;
//! use gridflow_setup::{ConfigurationOrchestrator, SetupPolicy, SshConnector};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(spec: gridflow_core::ClusterSpec) -> gridflow_core::Result<()> {
//! let clouds = Arc::new(MultiCloudContext::new());
//! let orchestrator =
//!     ConfigurationOrchestrator::new(Arc::new(SshConnector::new()), SetupPolicy::default());
//! let manager = ClusterManager::new(
//!     clouds,
//!     EngineConfig::default(),
//!     ClusterStore::open(".gridflow/state"),
//!     orchestrator,
//! );
//! let record = manager.create(spec, &CancellationToken::new()).await?;
//! println!("master at {:?}", record.ssh.master_address);
//! # Ok(())
//! # }
//! ```

pub mod id;
pub mod manager;
pub mod report;
pub mod scaling;

pub use id::{generate_cluster_id, is_valid_cluster_id, CLUSTER_ID_LENGTH};
pub use manager::ClusterManager;
pub use report::{CheckReport, CloudCheck, ClusterSummary, ScaleReport, TerminationReport};
pub use scaling::ScalingController;
