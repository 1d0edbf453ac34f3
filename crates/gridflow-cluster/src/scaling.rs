//! Scaling controller
//!
//! Adds workers from a node group template or removes named workers from a
//! running cluster. Scale-up plans and provisions only the delta; shared
//! resources the cluster already owns are reused. The master is never
//! touched by either direction.

use crate::manager::{advance_worker_index, finish, provision_recorded, refresh_missing};
use crate::report::ScaleReport;
use gridflow_cloud::{
    ClusterLease, ClusterStore, MultiCloudContext, ProvisioningEngine, ResourcePlanner,
};
use gridflow_core::{
    ClusterError, ClusterPhase, ClusterRecord, NodeEntry, NodeStatus, ResourceId, ResourceKind,
    ResourceNode, Result,
};
use gridflow_setup::{ConfigurationOrchestrator, SetupScope};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct ScalingController<'a> {
    clouds: &'a MultiCloudContext,
    engine: &'a ProvisioningEngine,
    store: &'a ClusterStore,
    orchestrator: &'a ConfigurationOrchestrator,
}

impl<'a> ScalingController<'a> {
    pub fn new(
        clouds: &'a MultiCloudContext,
        engine: &'a ProvisioningEngine,
        store: &'a ClusterStore,
        orchestrator: &'a ConfigurationOrchestrator,
    ) -> Self {
        Self {
            clouds,
            engine,
            store,
            orchestrator,
        }
    }

    /// Adds `count` workers built from the `template` node group.
    ///
    /// The template may be a group that currently has no members. Invalid
    /// requests fail before any resource is created.
    pub async fn scale_up(
        &self,
        cluster_id: &str,
        template: &str,
        count: u32,
        cancel: &CancellationToken,
    ) -> Result<ScaleReport> {
        let started = Instant::now();
        let lease = self.store.lock(cluster_id).await?;
        let result = self.scale_up_locked(&lease, template, count, cancel).await;
        let result = finish(lease, result).await;
        log_outcome("Scale-up", cluster_id, started, &result);
        result
    }

    /// Removes workers by name or resource id, with their volumes.
    pub async fn scale_down(
        &self,
        cluster_id: &str,
        targets: &[String],
        cancel: &CancellationToken,
    ) -> Result<ScaleReport> {
        let started = Instant::now();
        let lease = self.store.lock(cluster_id).await?;
        let result = self.scale_down_locked(&lease, targets, cancel).await;
        let result = finish(lease, result).await;
        log_outcome("Scale-down", cluster_id, started, &result);
        result
    }

    async fn scale_up_locked(
        &self,
        lease: &ClusterLease<'_>,
        template: &str,
        count: u32,
        cancel: &CancellationToken,
    ) -> Result<ScaleReport> {
        let mut record = lease.load().await?;
        ensure_scalable(&record)?;
        let resume = resume_phase(&record);

        let delta = record.spec.delta(template, count)?;
        refresh_missing(self.clouds).await?;
        let plan = ResourcePlanner::new(self.clouds).plan_delta(&record, &delta)?;
        let created: BTreeSet<ResourceId> = plan.to_create().map(|n| n.id.clone()).collect();
        let instances: Vec<ResourceId> = plan
            .to_create()
            .filter(|n| n.kind() == ResourceKind::Instance)
            .map(|n| n.id.clone())
            .collect();
        info!(
            cluster_id = %record.cluster_id,
            template,
            count,
            summary = %plan.summary(),
            "Scaling up"
        );

        record.phase = ClusterPhase::Scaling;
        record.touch();
        lease.save(&record).await?;

        match provision_recorded(self.engine, &plan, lease, &mut record, cancel).await {
            Ok(nodes) => record.absorb_resources(nodes),
            Err(err) => {
                if let ClusterError::ProvisioningFailed(failure) = &err {
                    // nodes saved while running get their rolled back status
                    let settled: Vec<ResourceNode> = failure
                        .partial
                        .resources
                        .iter()
                        .filter(|n| !n.is_released() || record.resource(&n.id).is_some())
                        .cloned()
                        .collect();
                    record.absorb_resources(settled);
                    for id in &instances {
                        let leftover = record.resource(id).and_then(NodeEntry::from_instance);
                        let Some(mut entry) = leftover else {
                            continue;
                        };
                        entry.status = NodeStatus::PendingCleanup;
                        entry.detail = Some("left behind by a failed scale-up".to_string());
                        record.add_worker(entry)?;
                    }
                    advance_worker_index(&mut record);
                }
                record.phase = ClusterPhase::ScaleFailed;
                record.touch();
                lease.save(&record).await?;
                return Err(err);
            }
        }

        let mut added = Vec::new();
        for id in &instances {
            let entry = record
                .resource(id)
                .and_then(NodeEntry::from_instance)
                .ok_or_else(|| {
                    ClusterError::StateError(format!("instance {} missing after provisioning", id))
                })?;
            added.push(entry.name.clone());
            record.add_worker(entry)?;
        }
        advance_worker_index(&mut record);
        record.touch();
        lease.save(&record).await?;

        let scope = SetupScope::Nodes(instances.clone());
        let report = match self.orchestrator.configure(&record, &scope, cancel).await {
            Ok(report) => report,
            Err(ClusterError::Cancelled) => {
                warn!(cluster_id = %record.cluster_id, "Scale-up cancelled, releasing new workers");
                let targets: Vec<ResourceNode> = record
                    .resources
                    .iter()
                    .filter(|r| created.contains(&r.id))
                    .cloned()
                    .collect();
                let deletion = self.engine.destroy(&targets, &CancellationToken::new()).await;
                record.absorb_resources(deletion.nodes);

                let released: Vec<ResourceId> = instances
                    .iter()
                    .filter(|id| record.resource(id).is_some_and(|r| r.is_released()))
                    .cloned()
                    .collect();
                record.remove_workers(&released);
                record
                    .resources
                    .retain(|r| !(created.contains(&r.id) && r.is_released()));
                for id in &instances {
                    if let Some(node) = record.node_mut(id) {
                        node.status = NodeStatus::PendingCleanup;
                        node.detail = Some("left behind by a cancelled scale-up".to_string());
                    }
                }
                record.phase = if deletion.failures.is_empty() {
                    resume
                } else {
                    ClusterPhase::ScaleFailed
                };
                record.touch();
                lease.save(&record).await?;
                return Err(ClusterError::Cancelled);
            }
            Err(err) => return Err(err),
        };

        report.apply_to(&mut record);
        let readiness = report.readiness();
        record.phase = if readiness.is_ok() {
            resume
        } else {
            ClusterPhase::ScaleFailed
        };
        record.touch();
        lease.save(&record).await?;
        readiness?;

        Ok(ScaleReport {
            cluster_id: record.cluster_id.clone(),
            added,
            removed: Vec::new(),
            phase: record.phase,
        })
    }

    async fn scale_down_locked(
        &self,
        lease: &ClusterLease<'_>,
        targets: &[String],
        cancel: &CancellationToken,
    ) -> Result<ScaleReport> {
        let mut record = lease.load().await?;
        ensure_scalable(&record)?;
        let resume = resume_phase(&record);

        let ids = resolve_targets(&record, targets)?;
        let volumes: BTreeMap<ResourceId, Vec<ResourceId>> = ids
            .iter()
            .map(|id| (id.clone(), record.attached_volumes(id)))
            .collect();
        info!(cluster_id = %record.cluster_id, workers = ids.len(), "Scaling down");

        record.phase = ClusterPhase::Scaling;
        record.touch();
        lease.save(&record).await?;

        let doomed: Vec<ResourceNode> = volumes
            .iter()
            .flat_map(|(id, attached)| std::iter::once(id).chain(attached.iter()))
            .filter_map(|id| record.resource(id).cloned())
            .collect();
        let deletion = self.engine.destroy(&doomed, cancel).await;
        record.absorb_resources(deletion.nodes);

        let mut removed = Vec::new();
        let mut released = Vec::new();
        for (id, attached) in &volumes {
            let gone = record.resource(id).is_none_or(|r| r.is_released())
                && attached
                    .iter()
                    .all(|v| record.resource(v).is_none_or(|r| r.is_released()));
            if gone {
                if let Some(worker) = record.worker(id) {
                    removed.push(worker.name.clone());
                }
                released.push(id.clone());
            } else if let Some(node) = record.node_mut(id) {
                node.status = NodeStatus::PendingCleanup;
                node.detail = Some("removal incomplete".to_string());
            }
        }
        let released_volumes: Vec<&ResourceId> =
            released.iter().flat_map(|id| &volumes[id]).collect();
        record.remove_workers(&released);
        record
            .resources
            .retain(|r| !released_volumes.contains(&&r.id));

        record.phase = if deletion.failures.is_empty() {
            resume
        } else {
            ClusterPhase::ScaleFailed
        };
        record.touch();
        lease.save(&record).await?;

        if !deletion.failures.is_empty() {
            return Err(ClusterError::CleanupIncomplete {
                cluster_id: record.cluster_id.clone(),
                failures: deletion.failures,
            });
        }
        Ok(ScaleReport {
            cluster_id: record.cluster_id.clone(),
            added: Vec::new(),
            removed,
            phase: record.phase,
        })
    }
}

fn ensure_scalable(record: &ClusterRecord) -> Result<()> {
    match record.phase {
        ClusterPhase::Provisioning | ClusterPhase::Terminating => {
            Err(ClusterError::InvalidOperation(format!(
                "cluster {} is {} and cannot be scaled",
                record.cluster_id, record.phase
            )))
        }
        _ => Ok(()),
    }
}

/// Phase to return to after a successful scaling operation.
fn resume_phase(record: &ClusterRecord) -> ClusterPhase {
    match record.phase {
        ClusterPhase::Degraded => ClusterPhase::Degraded,
        _ => ClusterPhase::Stable,
    }
}

/// Worker resource ids for names or ids. The master is never a valid target.
fn resolve_targets(record: &ClusterRecord, targets: &[String]) -> Result<Vec<ResourceId>> {
    if targets.is_empty() {
        return Err(ClusterError::InvalidOperation(
            "no workers given to remove".to_string(),
        ));
    }

    let mut ids = Vec::new();
    for target in targets {
        let matches =
            |node: &NodeEntry| node.name == *target || node.resource.as_str() == target.as_str();
        if record.master.as_ref().is_some_and(matches) {
            return Err(ClusterError::InvalidOperation(format!(
                "{} is the master of cluster {} and cannot be removed",
                target, record.cluster_id
            )));
        }
        let worker = record.workers.iter().find(|w| matches(w)).ok_or_else(|| {
            ClusterError::InvalidOperation(format!(
                "cluster {} has no worker {}",
                record.cluster_id, target
            ))
        })?;
        if !ids.contains(&worker.resource) {
            ids.push(worker.resource.clone());
        }
    }
    Ok(ids)
}

fn log_outcome(action: &str, cluster_id: &str, started: Instant, result: &Result<ScaleReport>) {
    match result {
        Ok(report) => info!(
            cluster_id,
            added = report.added.len(),
            removed = report.removed.len(),
            phase = %report.phase,
            elapsed = ?started.elapsed(),
            "{} finished",
            action
        ),
        Err(e) => warn!(
            cluster_id,
            elapsed = ?started.elapsed(),
            error = %e,
            "{} failed",
            action
        ),
    }
}
