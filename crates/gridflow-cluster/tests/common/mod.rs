use gridflow_cloud::{
    CloudContext, ClusterStore, EngineConfig, InMemoryProvider, MemoryBackend, MultiCloudContext,
    ProviderAdapter, RetryConfig,
};
use gridflow_cluster::ClusterManager;
use gridflow_core::{
    CloudSettings, ClusterSettings, ClusterSpec, NetworkSettings, NodeGroup, Role, SshSettings,
    VolumeSpec,
};
use gridflow_setup::{
    ConfigurationOrchestrator, RecordingConnector, RecordingPlaybook, SetupPolicy,
};
use std::sync::Arc;
use std::time::Duration;

pub const CLOUD_A: &str = "cloud-a";
#[allow(dead_code)]
pub const CLOUD_B: &str = "cloud-b";

/// A manager wired to in-memory clouds, a recording transport and an
/// in-memory state store.
pub struct Harness {
    pub providers: Vec<Arc<InMemoryProvider>>,
    pub backend: Arc<MemoryBackend>,
    pub connector: RecordingConnector,
    pub playbook: RecordingPlaybook,
    pub manager: ClusterManager,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_providers(vec![InMemoryProvider::new(CLOUD_A)], 4)
    }

    pub fn with_providers(providers: Vec<InMemoryProvider>, concurrency: usize) -> Self {
        let providers: Vec<Arc<InMemoryProvider>> = providers.into_iter().map(Arc::new).collect();
        let mut clouds = MultiCloudContext::new();
        for provider in &providers {
            clouds.add(CloudContext::new(provider.name(), provider.clone()));
        }

        let engine = EngineConfig {
            concurrency_per_cloud: concurrency,
            retry: RetryConfig::immediate(3),
            call_timeout: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(5),
            delete_timeout: Duration::from_secs(5),
        };
        let policy = SetupPolicy {
            reachability: RetryConfig::immediate(3),
            reachability_timeout: Duration::from_secs(1),
            command_timeout: Duration::from_secs(5),
            ..Default::default()
        };

        let backend = Arc::new(MemoryBackend::new());
        let connector = RecordingConnector::new();
        let playbook = RecordingPlaybook::new();
        let orchestrator = ConfigurationOrchestrator::new(Arc::new(connector.clone()), policy)
            .with_playbook(Arc::new(playbook.clone()));
        let manager = ClusterManager::new(
            Arc::new(clouds),
            engine,
            ClusterStore::new(backend.clone()),
            orchestrator,
        );

        Self {
            providers,
            backend,
            connector,
            playbook,
            manager,
        }
    }

    pub fn provider(&self) -> &InMemoryProvider {
        &self.providers[0]
    }

    #[allow(dead_code)]
    pub fn provider_named(&self, name: &str) -> &InMemoryProvider {
        self.providers
            .iter()
            .find(|p| p.name() == name)
            .expect("unknown provider")
    }
}

pub fn group(name: &str, role: Role, count: u32, cloud: &str) -> NodeGroup {
    NodeGroup {
        name: name.to_string(),
        role,
        count,
        cloud: cloud.to_string(),
        flavor: "small".to_string(),
        image: "ubuntu-24.04".to_string(),
        volumes: Vec::new(),
        tags: Vec::new(),
        settings: ClusterSettings::default(),
    }
}

/// One master and `workers` compute nodes with a scratch volume each, plus
/// an empty `gpu` group to scale from.
pub fn spec(workers: u32) -> ClusterSpec {
    let mut compute = group("compute", Role::Worker, workers, CLOUD_A);
    compute.volumes.push(VolumeSpec {
        size_gb: 10,
        volume_type: None,
        mount_point: None,
    });
    ClusterSpec {
        groups: vec![
            group("master", Role::Master, 1, CLOUD_A),
            compute,
            group("gpu", Role::Worker, 0, CLOUD_A),
        ],
        defaults: ClusterSettings {
            network: NetworkSettings {
                external_network: Some("public".to_string()),
                ..Default::default()
            },
            ..Default::default()
        },
        clouds: Vec::new(),
        ssh: SshSettings {
            key_name: None,
            public_key: Some("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAITest test@gridflow".to_string()),
            private_key_path: None,
        },
    }
}

/// `spec(workers)` with a second group of workers on cloud B.
#[allow(dead_code)]
pub fn multi_cloud_spec(workers: u32, remote_workers: u32) -> ClusterSpec {
    let mut spec = spec(workers);
    spec.groups
        .push(group("remote", Role::Worker, remote_workers, CLOUD_B));
    spec.clouds.push(CloudSettings {
        name: CLOUD_B.to_string(),
        settings: ClusterSettings {
            network: NetworkSettings {
                cidr: Some("10.1.0.0/24".to_string()),
                ..Default::default()
            },
            ..Default::default()
        },
    });
    spec
}
