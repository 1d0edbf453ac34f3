use assert_cmd::Command;
use gridflow_cloud::ClusterStore;
use gridflow_core::{ClusterRecord, ClusterSettings, ClusterSpec, SshAccess, SshSettings};
use tempfile::TempDir;

/// A working directory with its own state directory and no configuration.
pub struct TestProject {
    dir: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }

    pub fn state_dir(&self) -> std::path::PathBuf {
        self.dir.path().join(".gridflow")
    }

    /// `grid` running inside the project.
    pub fn grid(&self) -> Command {
        let mut cmd = Command::cargo_bin("grid").unwrap();
        cmd.current_dir(self.path())
            .env("GRIDFLOW_STATE_DIR", self.state_dir())
            .env_remove("GRIDFLOW_CONFIG_PATH")
            .env_remove("GRIDFLOW_CLUSTER_ID")
            .env_remove("RUST_LOG");
        cmd
    }

    /// Records a cluster that owns no cloud resources.
    pub async fn record_cluster(&self, cluster_id: &str) {
        let spec = ClusterSpec {
            groups: Vec::new(),
            defaults: ClusterSettings::default(),
            clouds: Vec::new(),
            ssh: SshSettings::default(),
        };
        let record = ClusterRecord::new(
            cluster_id,
            spec,
            SshAccess {
                key_name: format!("grid-{}", cluster_id),
                ..Default::default()
            },
        );
        let store = ClusterStore::open(self.state_dir());
        store.save(&record).await.unwrap();
        store.remember(cluster_id).await.unwrap();
    }
}
