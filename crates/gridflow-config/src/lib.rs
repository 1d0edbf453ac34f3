//! Gridflow configuration
//!
//! Finds the configuration file, layers the optional default and enforced
//! documents around it and converts the result into a
//! [`ClusterSpec`](gridflow_core::ClusterSpec) plus the engine and setup
//! policies.

pub mod discovery;
pub mod error;
pub mod layers;
pub mod model;

pub use discovery::{
    CONFIG_PATH_ENV, PROJECT_DIR, STATE_DIR_ENV, expand_home, find_config_file, get_config_dir,
    state_dir,
};
pub use error::*;
pub use layers::{deep_merge, documents, layer, read_yaml};
pub use model::{
    CloudConfig, ClusterConfig, EngineSection, InstanceConfig, MASTER_GROUP, SetupConfig,
    SshConfig, WorkerConfig,
};

use std::path::Path;

/// Reads `path` with its default and enforced layers.
pub fn load(
    path: &Path,
    default: Option<&Path>,
    enforced: Option<&Path>,
) -> Result<ClusterConfig> {
    tracing::debug!(path = %path.display(), "Loading configuration");
    let user = documents(read_yaml(path)?)?;
    let default = default.map(read_yaml).transpose()?;
    let enforced = enforced.map(read_yaml).transpose()?;

    let clouds = layer(user, default.as_ref(), enforced.as_ref())
        .into_iter()
        .map(|document| {
            serde_yaml::from_value::<CloudConfig>(document).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    ClusterConfig::new(clouds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_with_layers() {
        let dir = tempfile::tempdir().unwrap();
        let user = dir.path().join("gridflow.yml");
        let default = dir.path().join("default.yml");
        let enforced = dir.path().join("enforced.yml");
        fs::write(
            &user,
            "- cloud: cloud-a\n  ssh: {key_name: k}\n  master: {flavor: small, image: ubuntu}\n  \
             workers: [{name: compute, count: 2, flavor: small, image: ubuntu}]\n",
        )
        .unwrap();
        fs::write(&default, "ssh_user: ubuntu\nnetwork: {external_network: public}\n").unwrap();
        fs::write(&enforced, "network: {cidr: 10.9.0.0/24}\n").unwrap();

        let config = load(&user, Some(&default), Some(&enforced)).unwrap();
        let spec = config.spec().unwrap();
        let settings = spec.cloud_settings("cloud-a");

        assert_eq!(settings.ssh_user.as_deref(), Some("ubuntu"));
        assert_eq!(settings.network.external_network.as_deref(), Some("public"));
        assert_eq!(settings.network.cidr.as_deref(), Some("10.9.0.0/24"));
        assert_eq!(spec.group("compute").unwrap().count, 2);
    }

    #[test]
    fn test_parse_error_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let user = dir.path().join("gridflow.yml");
        fs::write(&user, "- cloud: a\n  workers: nope\n").unwrap();

        match load(&user, None, None) {
            Err(ConfigError::Parse { path, .. }) => assert_eq!(path, user),
            other => panic!("expected a parse error, got {:?}", other),
        }
    }
}
