mod common;

use common::{CLOUD_A, CLOUD_B, Harness, multi_cloud_spec, spec};
use gridflow_cloud::{Fault, InMemoryProvider, Op, StateBackend};
use gridflow_core::{
    ClusterError, ClusterPhase, NodeStatus, ProviderError, ResourceKind, ResourceStatus,
};
use gridflow_setup::FAKE_CLUSTER_KEY;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CLUSTER: &str = "c1";

#[tokio::test]
async fn test_create_shares_network_resources() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();

    let record = harness
        .manager
        .create_with_id(CLUSTER, spec(3), &cancel)
        .await
        .unwrap();

    let provider = harness.provider();
    assert_eq!(provider.count_calls(Op::Create, ResourceKind::Instance), 4);
    assert_eq!(provider.count_calls(Op::Create, ResourceKind::Volume), 3);
    assert_eq!(provider.count_calls(Op::Create, ResourceKind::Network), 1);
    assert_eq!(provider.count_calls(Op::Create, ResourceKind::Subnet), 1);
    assert_eq!(provider.count_calls(Op::Create, ResourceKind::Router), 1);
    assert_eq!(provider.count_calls(Op::Create, ResourceKind::SecurityGroup), 1);
    assert_eq!(provider.count_calls(Op::Create, ResourceKind::Keypair), 1);

    assert_eq!(record.phase, ClusterPhase::Stable);
    assert!(record.roster_is_consistent());
    let master = record.master.as_ref().unwrap();
    assert_eq!(master.name, "grid-master-c1");
    assert_eq!(master.status, NodeStatus::Configured);
    let workers: Vec<&str> = record.workers.iter().map(|w| w.name.as_str()).collect();
    assert_eq!(
        workers,
        vec!["grid-worker-c1-1", "grid-worker-c1-2", "grid-worker-c1-3"]
    );
    assert!(record.workers.iter().all(|w| w.is_configured()));
    assert_eq!(record.next_worker_index, 4);

    assert_eq!(record.ssh.key_name, "grid-c1");
    assert_eq!(record.ssh.master_address, master.address);
    assert_eq!(record.ssh.cluster_public_key.as_deref(), Some(FAKE_CLUSTER_KEY));

    let runs = harness.playbook.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].hosts.len(), 4);
    assert_eq!(runs[0].limit, None);

    let stored = harness.manager.store().load(CLUSTER).await.unwrap();
    assert_eq!(stored, record);
    assert_eq!(
        harness.manager.store().last_cluster().await.unwrap().as_deref(),
        Some(CLUSTER)
    );
}

#[tokio::test]
async fn test_failed_worker_rolls_back_everything() {
    let harness = Harness::with_providers(vec![InMemoryProvider::new(CLOUD_A)], 1);
    harness.provider().inject(
        Fault::on_create(
            ResourceKind::Instance,
            ProviderError::Fatal("Quota exceeded for instances".to_string()),
        )
        .named("worker-c1-2"),
    );

    let err = harness
        .manager
        .create_with_id(CLUSTER, spec(3), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        ClusterError::ProvisioningFailed(failure) => {
            let cause = failure.cause.unwrap();
            assert!(cause.resource.as_str().contains("grid-worker-c1-2"));
            assert!(cause.message.contains("Quota exceeded"));
            assert!(failure.cleanup_failures.is_empty());
        }
        other => panic!("expected a provisioning failure, got {:?}", other),
    }

    let provider = harness.provider();
    assert_eq!(provider.count_calls(Op::Delete, ResourceKind::Network), 1);
    assert!(provider.live(ResourceKind::Instance).is_empty());
    assert_eq!(provider.live_count(), 0);
    assert!(harness.manager.store().try_load(CLUSTER).await.unwrap().is_none());
    assert!(harness.playbook.runs().is_empty());
}

#[tokio::test]
async fn test_provider_ids_are_saved_while_provisioning() {
    let harness = Harness::with_providers(
        vec![InMemoryProvider::new(CLOUD_A).with_build_polls(u32::MAX)],
        4,
    );
    let cancel = CancellationToken::new();
    let backend = harness.backend.clone();
    let trigger = cancel.clone();
    let watcher = tokio::spawn(async move {
        // instances never become active, so only a save made mid-run can
        // carry the network's provider id
        loop {
            if let Some(bytes) = backend.read(CLUSTER).await.unwrap() {
                let saved: gridflow_core::ClusterRecord = serde_json::from_slice(&bytes).unwrap();
                let network = saved
                    .resources
                    .iter()
                    .find(|r| r.kind() == ResourceKind::Network)
                    .cloned();
                if let Some(network) = network.filter(|n| n.provider_id.is_some()) {
                    trigger.cancel();
                    return network;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    let err = harness
        .manager
        .create_with_id(CLUSTER, spec(1), &cancel)
        .await
        .unwrap_err();
    let network = watcher.await.unwrap();

    assert_eq!(network.status, ResourceStatus::Ready);
    assert!(matches!(err, ClusterError::ProvisioningFailed(_)));
    assert_eq!(harness.provider().live_count(), 0);
    assert!(harness.manager.store().try_load(CLUSTER).await.unwrap().is_none());
}

#[tokio::test]
async fn test_invalid_spec_makes_no_cloud_call() {
    let harness = Harness::new();
    let mut spec = spec(2);
    spec.groups[1].flavor = "huge".to_string();

    let err = harness
        .manager
        .create_with_id(CLUSTER, spec, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ClusterError::SpecInvalid(_)));
    assert_eq!(harness.provider().live_count(), 0);
    assert!(
        harness
            .provider()
            .calls()
            .iter()
            .all(|c| c.op != Op::Create)
    );
    assert_eq!(harness.backend.writes(), 0);
}

#[tokio::test]
async fn test_scale_up_creates_only_the_delta() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();
    let before = harness
        .manager
        .create_with_id(CLUSTER, spec(2), &cancel)
        .await
        .unwrap();
    let provider = harness.provider();
    let instances = provider.count_calls(Op::Create, ResourceKind::Instance);

    let report = harness
        .manager
        .scaling()
        .scale_up(CLUSTER, "compute", 2, &cancel)
        .await
        .unwrap();

    assert_eq!(report.added, vec!["grid-worker-c1-3", "grid-worker-c1-4"]);
    assert_eq!(report.phase, ClusterPhase::Stable);
    assert_eq!(
        provider.count_calls(Op::Create, ResourceKind::Instance),
        instances + 2
    );
    assert_eq!(provider.count_calls(Op::Create, ResourceKind::Network), 1);
    assert_eq!(provider.count_calls(Op::Create, ResourceKind::SecurityGroup), 1);
    assert_eq!(provider.count_calls(Op::Create, ResourceKind::Keypair), 1);

    let after = harness.manager.status(Some(CLUSTER)).await.unwrap();
    assert_eq!(after.master, before.master);
    assert_eq!(after.ssh.master_address, before.ssh.master_address);
    assert_eq!(after.workers.len(), 4);
    assert!(after.workers.iter().all(|w| w.is_configured()));
    assert_eq!(after.next_worker_index, 5);
    assert!(after.roster_is_consistent());

    let last = harness.playbook.runs().pop().unwrap();
    assert_eq!(
        last.limit,
        Some(vec![
            "grid-worker-c1-3".to_string(),
            "grid-worker-c1-4".to_string()
        ])
    );
}

#[tokio::test]
async fn test_scale_up_from_empty_group() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();
    harness
        .manager
        .create_with_id(CLUSTER, spec(1), &cancel)
        .await
        .unwrap();

    let report = harness
        .manager
        .scaling()
        .scale_up(CLUSTER, "gpu", 1, &cancel)
        .await
        .unwrap();

    assert_eq!(report.added, vec!["grid-worker-c1-2"]);
    let record = harness.manager.status(Some(CLUSTER)).await.unwrap();
    assert_eq!(record.workers[1].group, "gpu");
}

#[tokio::test]
async fn test_scale_up_rejects_bad_requests_before_cloud_calls() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();
    harness
        .manager
        .create_with_id(CLUSTER, spec(1), &cancel)
        .await
        .unwrap();
    let calls = harness.provider().calls().len();
    let scaling = harness.manager.scaling();

    for (template, count) in [("master", 1), ("nope", 1), ("compute", 0)] {
        let err = scaling
            .scale_up(CLUSTER, template, count, &cancel)
            .await
            .unwrap_err();
        assert!(
            matches!(err, ClusterError::InvalidOperation(_)),
            "{} x{}: {:?}",
            template,
            count,
            err
        );
    }
    assert_eq!(harness.provider().calls().len(), calls);

    let record = harness.manager.status(Some(CLUSTER)).await.unwrap();
    assert_eq!(record.phase, ClusterPhase::Stable);
}

#[tokio::test]
async fn test_scale_down_master_is_rejected() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();
    harness
        .manager
        .create_with_id(CLUSTER, spec(2), &cancel)
        .await
        .unwrap();
    let calls = harness.provider().calls().len();
    let writes = harness.backend.writes();

    let err = harness
        .manager
        .scaling()
        .scale_down(CLUSTER, &["grid-master-c1".to_string()], &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, ClusterError::InvalidOperation(_)));
    assert_eq!(harness.provider().calls().len(), calls);
    assert_eq!(harness.backend.writes(), writes);
}

#[tokio::test]
async fn test_scale_down_removes_worker_and_volume() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();
    harness
        .manager
        .create_with_id(CLUSTER, spec(3), &cancel)
        .await
        .unwrap();
    let provider = harness.provider();
    assert_eq!(provider.live(ResourceKind::Volume).len(), 3);

    let report = harness
        .manager
        .scaling()
        .scale_down(CLUSTER, &["grid-worker-c1-2".to_string()], &cancel)
        .await
        .unwrap();

    assert_eq!(report.removed, vec!["grid-worker-c1-2"]);
    assert_eq!(provider.live(ResourceKind::Instance).len(), 3);
    assert_eq!(provider.live(ResourceKind::Volume).len(), 2);

    let record = harness.manager.status(Some(CLUSTER)).await.unwrap();
    let workers: Vec<&str> = record.workers.iter().map(|w| w.name.as_str()).collect();
    assert_eq!(workers, vec!["grid-worker-c1-1", "grid-worker-c1-3"]);
    assert!(record.roster_is_consistent());
    assert!(
        record
            .resources
            .iter()
            .all(|r| !r.name().starts_with("grid-worker-c1-2"))
    );

    // names are never reused
    let report = harness
        .manager
        .scaling()
        .scale_up(CLUSTER, "compute", 1, &cancel)
        .await
        .unwrap();
    assert_eq!(report.added, vec!["grid-worker-c1-4"]);
}

#[tokio::test]
async fn test_scale_down_unknown_worker() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();
    harness
        .manager
        .create_with_id(CLUSTER, spec(1), &cancel)
        .await
        .unwrap();

    let err = harness
        .manager
        .scaling()
        .scale_down(CLUSTER, &["grid-worker-c1-9".to_string()], &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::InvalidOperation(_)));
}

#[tokio::test]
async fn test_concurrent_scaling_conflicts() {
    let harness = Harness::with_providers(
        vec![InMemoryProvider::new(CLOUD_A).with_latency(Duration::from_millis(20))],
        4,
    );
    let cancel = CancellationToken::new();
    harness
        .manager
        .create_with_id(CLUSTER, spec(1), &cancel)
        .await
        .unwrap();

    let first = harness.manager.scaling();
    let second = harness.manager.scaling();
    let (a, b) = tokio::join!(
        first.scale_up(CLUSTER, "compute", 1, &cancel),
        second.scale_up(CLUSTER, "compute", 1, &cancel),
    );

    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(ClusterError::StateConflict(id)) if id == CLUSTER))
    );

    let record = harness.manager.status(Some(CLUSTER)).await.unwrap();
    assert_eq!(record.workers.len(), 2);
    assert!(record.roster_is_consistent());
}

#[tokio::test]
async fn test_failed_scale_up_keeps_cluster() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();
    let before = harness
        .manager
        .create_with_id(CLUSTER, spec(1), &cancel)
        .await
        .unwrap();
    harness.provider().inject(
        Fault::on_create(
            ResourceKind::Instance,
            ProviderError::Fatal("No valid host was found".to_string()),
        )
        .named("worker-c1-3"),
    );

    let err = harness
        .manager
        .scaling()
        .scale_up(CLUSTER, "compute", 2, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::ProvisioningFailed(_)));

    let record = harness.manager.status(Some(CLUSTER)).await.unwrap();
    assert_eq!(record.phase, ClusterPhase::ScaleFailed);
    assert_eq!(record.workers, before.workers);
    assert_eq!(record.master, before.master);
    assert_eq!(harness.provider().live(ResourceKind::Instance).len(), 2);
}

#[tokio::test]
async fn test_playbook_failure_degrades_cluster() {
    let harness = Harness::new();
    harness.playbook.fail_host("grid-worker-c1-2");

    let err = harness
        .manager
        .create_with_id(CLUSTER, spec(2), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        ClusterError::ConfigurationFailed(failure) => {
            assert_eq!(failure.cluster_id, CLUSTER);
            assert_eq!(failure.nodes.len(), 1);
            assert_eq!(failure.nodes[0].0, "grid-worker-c1-2");
        }
        other => panic!("expected a configuration failure, got {:?}", other),
    }

    // the cluster stays around for inspection
    let record = harness.manager.status(None).await.unwrap();
    assert_eq!(record.phase, ClusterPhase::Degraded);
    assert_eq!(record.workers[1].status, NodeStatus::Failed);
    assert!(record.master.as_ref().unwrap().is_configured());
    assert_eq!(harness.provider().live(ResourceKind::Instance).len(), 3);
}

#[tokio::test]
async fn test_record_round_trip_writes_nothing() {
    let harness = Harness::new();
    harness
        .manager
        .create_with_id(CLUSTER, spec(2), &CancellationToken::new())
        .await
        .unwrap();
    let store = harness.manager.store();
    let writes = harness.backend.writes();

    let record = store.load(CLUSTER).await.unwrap();
    assert!(!store.save(&record).await.unwrap());
    assert_eq!(harness.backend.writes(), writes);

    let bytes = harness.backend.read(CLUSTER).await.unwrap().unwrap();
    let reparsed: gridflow_core::ClusterRecord = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(reparsed, record);
}

#[tokio::test]
async fn test_terminate_releases_everything() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();
    let record = harness
        .manager
        .create_with_id(CLUSTER, spec(2), &cancel)
        .await
        .unwrap();

    let report = harness
        .manager
        .terminate(CLUSTER, false, &cancel)
        .await
        .unwrap();

    assert_eq!(report.deleted, record.resources.len());
    assert!(report.abandoned.is_empty());
    assert_eq!(harness.provider().live_count(), 0);
    assert!(harness.manager.store().try_load(CLUSTER).await.unwrap().is_none());
    assert!(harness.manager.list().await.unwrap().is_empty());

    let err = harness
        .manager
        .terminate(CLUSTER, false, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::NotFound(_)));
}

#[tokio::test]
async fn test_terminate_with_stuck_resource() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();
    harness
        .manager
        .create_with_id(CLUSTER, spec(2), &cancel)
        .await
        .unwrap();
    harness.provider().inject(
        Fault::on_delete(
            ResourceKind::Instance,
            ProviderError::Fatal("instance is locked".to_string()),
        )
        .named("worker-c1-1"),
    );

    let err = harness
        .manager
        .terminate(CLUSTER, false, &cancel)
        .await
        .unwrap_err();
    match &err {
        ClusterError::CleanupIncomplete { cluster_id, failures } => {
            assert_eq!(cluster_id, CLUSTER);
            assert!(
                failures
                    .iter()
                    .any(|f| f.resource.as_str().contains("grid-worker-c1-1")
                        && f.provider_id.is_some())
            );
        }
        other => panic!("expected incomplete cleanup, got {:?}", other),
    }

    let record = harness.manager.status(Some(CLUSTER)).await.unwrap();
    assert_eq!(record.phase, ClusterPhase::Terminating);
    assert!(!record.is_releasable());

    let report = harness
        .manager
        .terminate(CLUSTER, true, &cancel)
        .await
        .unwrap();
    assert!(
        report
            .abandoned
            .iter()
            .any(|f| f.resource.as_str().contains("grid-worker-c1-1"))
    );
    assert!(harness.manager.store().try_load(CLUSTER).await.unwrap().is_none());
    assert_eq!(harness.provider().live(ResourceKind::Instance).len(), 1);
}

#[tokio::test]
async fn test_list_and_last_cluster() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();

    let err = harness.manager.status(None).await.unwrap_err();
    assert!(matches!(err, ClusterError::NotFound(_)));

    harness
        .manager
        .create_with_id("first", spec(1), &cancel)
        .await
        .unwrap();
    harness
        .manager
        .create_with_id("second", spec(2), &cancel)
        .await
        .unwrap();

    let clusters = harness.manager.list().await.unwrap();
    let ids: Vec<&str> = clusters.iter().map(|c| c.cluster_id.as_str()).collect();
    assert_eq!(ids, vec!["first", "second"]);
    assert_eq!(clusters[1].workers, 2);
    assert_eq!(clusters[1].configured_workers, 2);
    assert!(clusters[1].master_address.is_some());

    let latest = harness.manager.status(None).await.unwrap();
    assert_eq!(latest.cluster_id, "second");
}

#[tokio::test]
async fn test_create_rejects_existing_id() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();
    harness
        .manager
        .create_with_id(CLUSTER, spec(1), &cancel)
        .await
        .unwrap();
    let instances = harness
        .provider()
        .count_calls(Op::Create, ResourceKind::Instance);

    let err = harness
        .manager
        .create_with_id(CLUSTER, spec(1), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::InvalidOperation(_)));
    assert_eq!(
        harness
            .provider()
            .count_calls(Op::Create, ResourceKind::Instance),
        instances
    );
}

#[tokio::test]
async fn test_check_plans_without_creating() {
    let harness = Harness::new();

    let report = harness.manager.check(&spec(3)).await.unwrap();

    assert_eq!(report.clouds.len(), 1);
    assert_eq!(report.clouds[0].name, CLOUD_A);
    assert_eq!(report.clouds[0].flavors, 2);
    assert_eq!(report.summary.create, 4 + 3 + 5);
    assert_eq!(harness.provider().live_count(), 0);
    assert_eq!(harness.backend.writes(), 0);
}

#[tokio::test]
async fn test_multi_cloud_cluster_gets_tunnel() {
    let harness = Harness::with_providers(
        vec![InMemoryProvider::new(CLOUD_A), InMemoryProvider::new(CLOUD_B)],
        4,
    );
    let cancel = CancellationToken::new();

    let record = harness
        .manager
        .create_with_id(CLUSTER, multi_cloud_spec(1, 2), &cancel)
        .await
        .unwrap();

    assert_eq!(record.workers.len(), 3);
    let tunnels: Vec<_> = record.resources_of(ResourceKind::Tunnel).collect();
    assert_eq!(tunnels.len(), 1);
    assert_eq!(tunnels[0].status, ResourceStatus::Ready);

    let remote = harness.provider_named(CLOUD_B);
    assert_eq!(remote.count_calls(Op::Create, ResourceKind::Instance), 2);
    assert_eq!(remote.count_calls(Op::Create, ResourceKind::Network), 1);

    harness
        .manager
        .terminate(CLUSTER, false, &cancel)
        .await
        .unwrap();
    assert_eq!(harness.provider().live_count(), 0);
    assert_eq!(remote.live_count(), 0);
}
