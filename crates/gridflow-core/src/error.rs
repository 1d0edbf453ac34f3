//! Error taxonomy shared by the planner, the engine, the store and the
//! configuration orchestrator.

use crate::model::{ClusterRecord, ResourceId, ResourceKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors returned by a provider adapter for a single call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Timeouts, rate limits, unavailable endpoints. Retried by the engine.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Quota, permission, invalid image and everything else the cloud will
    /// keep refusing.
    #[error("provider error: {0}")]
    Fatal(String),

    #[error("resource not found: {0}")]
    NotFound(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

/// Errors returned by core operations.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Bad input. Raised before any cloud call is made.
    #[error("invalid cluster specification: {0}")]
    SpecInvalid(String),

    #[error("transient error on cloud {cloud}: {message}")]
    ProviderTransient { cloud: String, message: String },

    #[error("provider error on cloud {cloud}: {message}")]
    ProviderFatal { cloud: String, message: String },

    #[error("{0}")]
    ProvisioningFailed(Box<ProvisioningFailure>),

    #[error("node {node} at {address} is unreachable: {message}")]
    UnreachableNode {
        node: String,
        address: String,
        message: String,
    },

    #[error("{0}")]
    ConfigurationFailed(Box<ConfigurationFailure>),

    /// Another mutating operation holds the cluster. Callers retry later.
    #[error("cluster {0} is locked by another operation")]
    StateConflict(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("cluster not found: {0}")]
    NotFound(String),

    #[error("cleanup of cluster {cluster_id} is incomplete:{}", format_cleanup(.failures))]
    CleanupIncomplete {
        cluster_id: String,
        failures: Vec<CleanupFailure>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("state error: {0}")]
    StateError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClusterError {
    /// Wraps an adapter error with the cloud it came from.
    pub fn from_provider(cloud: impl Into<String>, err: ProviderError) -> Self {
        let cloud = cloud.into();
        match err {
            ProviderError::Transient(message) => ClusterError::ProviderTransient { cloud, message },
            ProviderError::Fatal(message) | ProviderError::NotFound(message) => {
                ClusterError::ProviderFatal { cloud, message }
            }
        }
    }

    /// Resources left behind by this error, if any.
    pub fn cleanup_failures(&self) -> &[CleanupFailure] {
        match self {
            ClusterError::ProvisioningFailed(failure) => &failure.cleanup_failures,
            ClusterError::CleanupIncomplete { failures, .. } => failures,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;

/// The node whose failure stopped a provisioning run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub resource: ResourceId,
    pub cloud: String,
    pub kind: ResourceKind,
    pub message: String,
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} on cloud {}: {}",
            self.kind, self.resource, self.cloud, self.message
        )
    }
}

/// A resource that could not be released and needs manual attention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupFailure {
    pub resource: ResourceId,
    pub cloud: String,
    pub kind: ResourceKind,
    pub provider_id: Option<String>,
    pub message: String,
}

impl fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (provider id {}) on cloud {}: {}",
            self.kind,
            self.resource,
            self.provider_id.as_deref().unwrap_or("unknown"),
            self.cloud,
            self.message
        )
    }
}

fn format_cleanup(failures: &[CleanupFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("\n  - {}", failure))
        .collect()
}

/// Aggregate outcome of a provisioning run that did not complete.
#[derive(Debug, Clone)]
pub struct ProvisioningFailure {
    /// Every node of the run with its final status.
    pub partial: ClusterRecord,
    /// The failure that halted the run. `None` when the run was cancelled.
    pub cause: Option<NodeFailure>,
    /// Resources the compensating deletion could not release.
    pub cleanup_failures: Vec<CleanupFailure>,
}

impl fmt::Display for ProvisioningFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "provisioning failed: {}", cause)?,
            None => write!(f, "provisioning cancelled")?,
        }
        if self.cleanup_failures.is_empty() {
            write!(f, " (all created resources were released)")
        } else {
            write!(
                f,
                "; resources requiring manual cleanup:{}",
                format_cleanup(&self.cleanup_failures)
            )
        }
    }
}

/// Per-node detail of a configuration run that did not reach readiness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationFailure {
    pub cluster_id: String,
    pub reason: String,
    /// `(node name, error)` for every node that failed.
    pub nodes: Vec<(String, String)>,
}

impl fmt::Display for ConfigurationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "configuration of cluster {} failed: {}",
            self.cluster_id, self.reason
        )?;
        for (node, error) in &self.nodes {
            write!(f, "\n  - {}: {}", node, error)?;
        }
        Ok(())
    }
}
