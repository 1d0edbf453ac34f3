//! Structured results of lifecycle operations

use chrono::{DateTime, Utc};
use gridflow_cloud::PlanSummary;
use gridflow_core::{CleanupFailure, ClusterPhase, ClusterRecord, ResourceKind};
use serde::Serialize;
use std::collections::BTreeSet;

/// One cloud as seen by `check`.
#[derive(Debug, Clone, Serialize)]
pub struct CloudCheck {
    pub name: String,
    pub account: Option<String>,
    pub flavors: usize,
    pub images: usize,
    pub networks: usize,
}

/// Outcome of a successful `check`.
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub clouds: Vec<CloudCheck>,
    pub summary: PlanSummary,
}

/// One line of `list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterSummary {
    pub cluster_id: String,
    pub created_at: DateTime<Utc>,
    pub phase: ClusterPhase,
    pub master_address: Option<String>,
    pub workers: usize,
    pub configured_workers: usize,
    pub clouds: BTreeSet<String>,
}

impl From<&ClusterRecord> for ClusterSummary {
    fn from(record: &ClusterRecord) -> Self {
        Self {
            cluster_id: record.cluster_id.clone(),
            created_at: record.created_at,
            phase: record.phase,
            master_address: record
                .ssh
                .master_address
                .clone()
                .or_else(|| record.master.as_ref().and_then(|m| m.address.clone())),
            workers: record.workers.len(),
            configured_workers: record.workers.iter().filter(|w| w.is_configured()).count(),
            clouds: record
                .resources_of(ResourceKind::Instance)
                .filter(|r| !r.is_released())
                .map(|r| r.cloud.clone())
                .collect(),
        }
    }
}

/// Outcome of a completed `terminate`.
#[derive(Debug, Clone)]
pub struct TerminationReport {
    pub cluster_id: String,
    /// Resources deleted by this run
    pub deleted: usize,
    /// Resources left behind and acknowledged with `force`
    pub abandoned: Vec<CleanupFailure>,
}

/// Outcome of a completed scaling operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleReport {
    pub cluster_id: String,
    /// Names of the workers added
    pub added: Vec<String>,
    /// Names of the workers removed
    pub removed: Vec<String>,
    pub phase: ClusterPhase,
}
