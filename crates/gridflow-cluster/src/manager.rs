//! Cluster manager
//!
//! Drives a cluster through its lifecycle. Every mutating operation holds the
//! cluster lease from the first write to the last, so a second operation on
//! the same cluster fails with `StateConflict` instead of interleaving.

use crate::id::generate_cluster_id;
use crate::report::{CheckReport, CloudCheck, ClusterSummary, TerminationReport};
use crate::scaling::ScalingController;
use gridflow_cloud::planner::DEFAULT_PREFIX;
use gridflow_cloud::{
    ClusterLease, ClusterStore, EngineConfig, MultiCloudContext, ProvisionPlan,
    ProvisioningEngine, ResourcePlanner,
};
use gridflow_core::{
    ClusterError, ClusterPhase, ClusterRecord, ClusterSpec, NodeEntry, ResourceKind,
    ResourceNode, ResourceSpec, ResourceStatus, Result, Role, SshAccess,
};
use gridflow_setup::{ConfigurationOrchestrator, SetupScope};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cluster id used for dry-run plans.
const CHECK_ID: &str = "check";

pub struct ClusterManager {
    clouds: Arc<MultiCloudContext>,
    engine: ProvisioningEngine,
    store: ClusterStore,
    orchestrator: ConfigurationOrchestrator,
}

impl ClusterManager {
    pub fn new(
        clouds: Arc<MultiCloudContext>,
        engine: EngineConfig,
        store: ClusterStore,
        orchestrator: ConfigurationOrchestrator,
    ) -> Self {
        Self {
            engine: ProvisioningEngine::new(Arc::clone(&clouds), engine),
            clouds,
            store,
            orchestrator,
        }
    }

    pub fn store(&self) -> &ClusterStore {
        &self.store
    }

    pub fn clouds(&self) -> &Arc<MultiCloudContext> {
        &self.clouds
    }

    pub fn scaling(&self) -> ScalingController<'_> {
        ScalingController::new(&self.clouds, &self.engine, &self.store, &self.orchestrator)
    }

    /// Fetches the catalogs of clouds that were never refreshed.
    pub async fn refresh_catalogs(&self) -> Result<()> {
        refresh_missing(&self.clouds).await
    }

    /// Verifies credentials and plans `spec` without creating anything.
    pub async fn check(&self, spec: &ClusterSpec) -> Result<CheckReport> {
        let mut clouds = Vec::new();
        for context in self.clouds.iter() {
            let status = context
                .adapter()
                .check_auth()
                .await
                .map_err(|e| ClusterError::from_provider(context.name(), e))?;
            if !status.authenticated {
                return Err(ClusterError::ProviderFatal {
                    cloud: context.name().to_string(),
                    message: status
                        .error
                        .unwrap_or_else(|| "authentication failed".to_string()),
                });
            }

            let catalog = context.refresh_catalog().await?;
            clouds.push(CloudCheck {
                name: context.name().to_string(),
                account: status.account_info,
                flavors: catalog.flavors.len(),
                images: catalog.images.iter().filter(|i| i.active).count(),
                networks: catalog.networks.len(),
            });
        }

        let plan = ResourcePlanner::new(&self.clouds).plan(CHECK_ID, spec)?;
        Ok(CheckReport {
            clouds,
            summary: plan.summary(),
        })
    }

    /// Creates a cluster under a fresh id.
    pub async fn create(
        &self,
        spec: ClusterSpec,
        cancel: &CancellationToken,
    ) -> Result<ClusterRecord> {
        self.create_with_id(&generate_cluster_id(), spec, cancel)
            .await
    }

    /// Provisions and configures a cluster.
    ///
    /// Returns the record once the cluster is ready. When configuration does
    /// not reach readiness the record is kept in the `degraded` phase and the
    /// configuration error is returned.
    pub async fn create_with_id(
        &self,
        cluster_id: &str,
        spec: ClusterSpec,
        cancel: &CancellationToken,
    ) -> Result<ClusterRecord> {
        let started = Instant::now();
        self.refresh_catalogs().await?;
        let plan = ResourcePlanner::new(&self.clouds).plan(cluster_id, &spec)?;
        info!(cluster_id, summary = %plan.summary(), "Creating cluster");

        let lease = self.store.lock(cluster_id).await?;
        let result = self.create_locked(&lease, spec, &plan, cancel).await;
        let result = finish(lease, result).await;
        match &result {
            Ok(record) => info!(
                cluster_id,
                workers = record.workers.len(),
                elapsed = ?started.elapsed(),
                "Cluster ready"
            ),
            Err(e) => warn!(
                cluster_id,
                elapsed = ?started.elapsed(),
                error = %e,
                "Cluster creation failed"
            ),
        }
        result
    }

    /// Every cluster in the store, oldest first.
    pub async fn list(&self) -> Result<Vec<ClusterSummary>> {
        Ok(self
            .store
            .list()
            .await?
            .iter()
            .map(ClusterSummary::from)
            .collect())
    }

    /// The record of a cluster, or of the last one created.
    pub async fn status(&self, cluster_id: Option<&str>) -> Result<ClusterRecord> {
        let cluster_id = self.resolve(cluster_id).await?;
        self.store.load(&cluster_id).await
    }

    /// The given id, or the last cluster created from this machine.
    pub async fn resolve(&self, cluster_id: Option<&str>) -> Result<String> {
        match cluster_id {
            Some(id) => Ok(id.to_string()),
            None => self.store.last_cluster().await?.ok_or_else(|| {
                ClusterError::NotFound("no cluster id given and no cluster created yet".to_string())
            }),
        }
    }

    /// Releases every resource of a cluster and deletes its record.
    ///
    /// Resources that cannot be deleted keep the record alive and yield
    /// `CleanupIncomplete`. With `force` they are marked failed and
    /// acknowledged instead, so the record goes away and the leftovers are
    /// listed in the report for manual cleanup.
    pub async fn terminate(
        &self,
        cluster_id: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<TerminationReport> {
        let started = Instant::now();
        let lease = self.store.lock(cluster_id).await?;
        let result = self.terminate_locked(&lease, force, cancel).await;
        let result = finish(lease, result).await;
        if let Ok(report) = &result {
            info!(
                cluster_id,
                deleted = report.deleted,
                abandoned = report.abandoned.len(),
                elapsed = ?started.elapsed(),
                "Cluster terminated"
            );
        }
        result
    }

    async fn create_locked(
        &self,
        lease: &ClusterLease<'_>,
        spec: ClusterSpec,
        plan: &ProvisionPlan,
        cancel: &CancellationToken,
    ) -> Result<ClusterRecord> {
        let cluster_id = lease.cluster_id();
        if lease.try_load().await?.is_some() {
            return Err(ClusterError::InvalidOperation(format!(
                "cluster {} already exists",
                cluster_id
            )));
        }

        let ssh = SshAccess {
            key_name: spec
                .ssh
                .key_name
                .clone()
                .unwrap_or_else(|| format!("{}-{}", DEFAULT_PREFIX, cluster_id)),
            private_key_path: spec.ssh.private_key_path.clone(),
            ..Default::default()
        };
        let mut record = ClusterRecord::new(cluster_id, spec, ssh);
        record.resources = plan.nodes().to_vec();
        lease.save(&record).await?;

        match provision_recorded(&self.engine, plan, lease, &mut record, cancel).await {
            Ok(nodes) => record.absorb_resources(nodes),
            Err(err) => {
                if let ClusterError::ProvisioningFailed(failure) = &err {
                    record.absorb_resources(failure.partial.resources.iter().cloned());
                }
                settle(lease, &mut record).await?;
                return Err(err);
            }
        }

        build_roster(&mut record)?;
        record.touch();
        lease.save(&record).await?;
        self.store.remember(cluster_id).await?;

        let report = match self
            .orchestrator
            .configure(&record, &SetupScope::Cluster, cancel)
            .await
        {
            Ok(report) => report,
            Err(ClusterError::Cancelled) => {
                warn!(cluster_id, "Creation cancelled, releasing resources");
                let deletion = self
                    .engine
                    .destroy(&record.resources, &CancellationToken::new())
                    .await;
                record.absorb_resources(deletion.nodes);
                settle(lease, &mut record).await?;
                return Err(ClusterError::Cancelled);
            }
            Err(err) => return Err(err),
        };

        report.apply_to(&mut record);
        let readiness = report.readiness();
        record.phase = if readiness.is_ok() {
            ClusterPhase::Stable
        } else {
            ClusterPhase::Degraded
        };
        record.touch();
        lease.save(&record).await?;
        readiness?;
        Ok(record)
    }

    async fn terminate_locked(
        &self,
        lease: &ClusterLease<'_>,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<TerminationReport> {
        let cluster_id = lease.cluster_id();
        let mut record = lease.load().await?;
        info!(cluster_id, force, resources = record.resources.len(), "Terminating cluster");
        record.phase = ClusterPhase::Terminating;
        record.touch();
        lease.save(&record).await?;

        let already = record
            .resources
            .iter()
            .filter(|r| r.status == ResourceStatus::Deleted)
            .count();
        let deletion = self.engine.destroy(&record.resources, cancel).await;
        let deleted = deletion.deleted().count().saturating_sub(already);
        record.absorb_resources(deletion.nodes);

        let mut abandoned = Vec::new();
        if force {
            for failure in &deletion.failures {
                if let Some(node) = record.resource_mut(&failure.resource) {
                    node.mark_failed(failure.message.clone());
                    node.acknowledged = true;
                }
            }
            abandoned = deletion.failures.clone();
        }

        record.touch();
        if record.is_releasable() {
            lease.remove(&record).await?;
            return Ok(TerminationReport {
                cluster_id: cluster_id.to_string(),
                deleted,
                abandoned,
            });
        }

        lease.save(&record).await?;
        if cancel.is_cancelled() {
            return Err(ClusterError::Cancelled);
        }
        Err(ClusterError::CleanupIncomplete {
            cluster_id: cluster_id.to_string(),
            failures: deletion.failures,
        })
    }
}

/// Refreshes the catalogs that have never been fetched.
pub(crate) async fn refresh_missing(clouds: &MultiCloudContext) -> Result<()> {
    for context in clouds.iter() {
        if context.catalog().refreshed_at.is_none() {
            context.refresh_catalog().await?;
        }
    }
    Ok(())
}

/// Releases the lease and returns the operation's result. A lease that
/// cannot be released only fails an otherwise successful operation.
pub(crate) async fn finish<T>(lease: ClusterLease<'_>, result: Result<T>) -> Result<T> {
    let released = lease.release().await;
    let value = result?;
    released?;
    Ok(value)
}

/// Runs `plan` and saves `record` whenever a node settles, so the provider
/// ids of a run are on disk before the run ends.
pub(crate) async fn provision_recorded(
    engine: &ProvisioningEngine,
    plan: &ProvisionPlan,
    lease: &ClusterLease<'_>,
    record: &mut ClusterRecord,
    cancel: &CancellationToken,
) -> Result<Vec<ResourceNode>> {
    let (progress, mut settled) = mpsc::unbounded_channel();
    let provisioning = engine.provision_reporting(plan, cancel, Some(progress));
    tokio::pin!(provisioning);

    loop {
        tokio::select! {
            outcome = &mut provisioning => return outcome,
            Some(node) = settled.recv() => {
                record.absorb_resources([node]);
                record.touch();
                // the engine keeps going; the final state is saved by the caller
                if let Err(e) = lease.save(record).await {
                    warn!(
                        cluster_id = %record.cluster_id,
                        error = %e,
                        "Could not save provisioning progress"
                    );
                }
            }
        }
    }
}

/// Deletes the record once nothing is left on the clouds, saves it otherwise.
async fn settle(lease: &ClusterLease<'_>, record: &mut ClusterRecord) -> Result<()> {
    record.touch();
    if record.is_releasable() {
        lease.remove(record).await
    } else {
        warn!(
            cluster_id = %record.cluster_id,
            live = record.live_resources().count(),
            "Resources left behind, keeping the cluster record"
        );
        lease.save(record).await.map(|_| ())
    }
}

/// Numeric suffix of a worker name, `0` when there is none.
pub(crate) fn worker_index(name: &str) -> u32 {
    name.rsplit('-')
        .next()
        .and_then(|suffix| suffix.parse().ok())
        .unwrap_or(0)
}

/// Moves the worker counter past every worker name in the record.
pub(crate) fn advance_worker_index(record: &mut ClusterRecord) {
    let highest = record
        .resources_of(ResourceKind::Instance)
        .filter(|r| {
            matches!(
                r.spec,
                ResourceSpec::Instance {
                    role: Role::Worker,
                    ..
                }
            )
        })
        .map(|r| worker_index(r.name()))
        .max()
        .unwrap_or(0);
    record.next_worker_index = record.next_worker_index.max(highest + 1);
}

/// Master and workers from the realized instances of a fresh cluster.
fn build_roster(record: &mut ClusterRecord) -> Result<()> {
    let mut master = None;
    let mut workers = Vec::new();
    for node in record.resources_of(ResourceKind::Instance) {
        let Some(entry) = NodeEntry::from_instance(node) else {
            continue;
        };
        match &node.spec {
            ResourceSpec::Instance {
                role: Role::Master,
                ..
            } => master = Some(entry),
            _ => workers.push(entry),
        }
    }
    workers.sort_by_key(|w| worker_index(&w.name));

    let master = master.ok_or_else(|| {
        ClusterError::StateError(format!(
            "cluster {} has no master instance",
            record.cluster_id
        ))
    })?;
    record.set_master(master)?;
    for worker in workers {
        record.add_worker(worker)?;
    }
    advance_worker_index(record);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_index() {
        assert_eq!(worker_index("grid-worker-abc-12"), 12);
        assert_eq!(worker_index("grid-master-abc"), 0);
        assert_eq!(worker_index(""), 0);
    }
}
