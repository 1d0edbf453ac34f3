//! Cloud contexts and catalog caches
//!
//! A [`CloudContext`] bundles one configured cloud: its adapter and a cached
//! catalog of flavors, images, networks and remaining quota. Several contexts
//! form a [`MultiCloudContext`], the namespace the planner resolves node
//! groups against.
//!
//! Catalogs are read-mostly. A refresh builds a complete new catalog and swaps
//! it in, so readers always see either the old or the new snapshot and
//! in-flight provisioning is never blocked.

use crate::provider::ProviderAdapter;
use chrono::{DateTime, Utc};
use gridflow_core::{ClusterError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flavor {
    pub name: String,
    pub vcpus: u32,
    pub ram_mb: u64,
    pub disk_gb: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub name: String,
    pub active: bool,
}

/// Remaining capacity of a project. `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub instances: Option<u64>,
    pub cores: Option<u64>,
    pub ram_mb: Option<u64>,
    pub volumes: Option<u64>,
    pub volume_gb: Option<u64>,
}

/// Snapshot of what a cloud offers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub flavors: Vec<Flavor>,
    pub images: Vec<Image>,
    pub networks: Vec<String>,
    pub quota: Quota,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl Catalog {
    pub fn flavor(&self, name: &str) -> Option<&Flavor> {
        self.flavors.iter().find(|f| f.name == name)
    }

    /// Looks an active image up by name or id.
    pub fn image(&self, name_or_id: &str) -> Option<&Image> {
        self.images
            .iter()
            .filter(|i| i.active)
            .find(|i| i.name == name_or_id || i.id == name_or_id)
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.networks.iter().any(|n| n == name)
    }
}

/// One configured cloud.
pub struct CloudContext {
    name: String,
    adapter: Arc<dyn ProviderAdapter>,
    catalog: RwLock<Arc<Catalog>>,
}

impl CloudContext {
    pub fn new(name: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) -> Self {
        Self {
            name: name.into(),
            adapter,
            catalog: RwLock::new(Arc::new(Catalog::default())),
        }
    }

    pub fn with_catalog(self, catalog: Catalog) -> Self {
        self.replace_catalog(catalog);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn adapter(&self) -> &Arc<dyn ProviderAdapter> {
        &self.adapter
    }

    /// Provider-qualified name, unique across the clouds of a cluster.
    pub fn qualified(&self, name: &str) -> String {
        format!("{}/{}", self.name, name)
    }

    /// Current catalog snapshot.
    pub fn catalog(&self) -> Arc<Catalog> {
        match self.catalog.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    pub fn replace_catalog(&self, catalog: Catalog) {
        let catalog = Arc::new(catalog);
        match self.catalog.write() {
            Ok(mut guard) => *guard = catalog,
            Err(poisoned) => *poisoned.into_inner() = catalog,
        }
    }

    /// Fetches a fresh catalog and swaps it in as a whole.
    pub async fn refresh_catalog(&self) -> Result<Arc<Catalog>> {
        let adapter = &self.adapter;
        let (flavors, images, networks, quota) = tokio::try_join!(
            adapter.list_flavors(),
            adapter.list_images(),
            adapter.list_networks(),
            adapter.quota(),
        )
        .map_err(|e| ClusterError::from_provider(&self.name, e))?;

        tracing::debug!(
            cloud = %self.name,
            flavors = flavors.len(),
            images = images.len(),
            networks = networks.len(),
            "Refreshed catalog"
        );

        self.replace_catalog(Catalog {
            flavors,
            images,
            networks,
            quota,
            refreshed_at: Some(Utc::now()),
        });
        Ok(self.catalog())
    }
}

impl std::fmt::Debug for CloudContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudContext")
            .field("name", &self.name)
            .field("provider", &self.adapter.name())
            .finish()
    }
}

/// All clouds participating in a cluster.
#[derive(Debug, Default, Clone)]
pub struct MultiCloudContext {
    clouds: BTreeMap<String, Arc<CloudContext>>,
}

impl MultiCloudContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cloud(mut self, cloud: CloudContext) -> Self {
        self.add(cloud);
        self
    }

    pub fn add(&mut self, cloud: CloudContext) {
        self.clouds.insert(cloud.name().to_string(), Arc::new(cloud));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<CloudContext>> {
        self.clouds.get(name)
    }

    /// Like [`get`](Self::get), failing with `SpecInvalid` for unknown clouds.
    pub fn require(&self, name: &str) -> Result<&Arc<CloudContext>> {
        self.get(name).ok_or_else(|| {
            ClusterError::SpecInvalid(format!(
                "unknown cloud '{}' (configured: {})",
                name,
                self.names().collect::<Vec<_>>().join(", ")
            ))
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.clouds.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CloudContext>> {
        self.clouds.values()
    }

    pub fn len(&self) -> usize {
        self.clouds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clouds.is_empty()
    }

    /// Refreshes every catalog concurrently.
    pub async fn refresh_all(&self) -> Result<()> {
        futures_util::future::try_join_all(self.clouds.values().map(|c| c.refresh_catalog()))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryProvider;

    #[tokio::test]
    async fn test_refresh_replaces_catalog() {
        let provider = Arc::new(InMemoryProvider::new("cloud-a"));
        let context = CloudContext::new("cloud-a", provider.clone());

        let before = context.catalog();
        assert!(before.flavors.is_empty());

        context.refresh_catalog().await.unwrap();
        let after = context.catalog();
        assert!(after.flavor("small").is_some());
        assert!(after.refreshed_at.is_some());

        // earlier snapshots stay intact
        assert!(before.flavors.is_empty());
    }

    #[test]
    fn test_require_unknown_cloud() {
        let clouds = MultiCloudContext::new().with_cloud(CloudContext::new(
            "cloud-a",
            Arc::new(InMemoryProvider::new("cloud-a")),
        ));

        assert!(clouds.require("cloud-a").is_ok());
        assert!(matches!(
            clouds.require("cloud-z"),
            Err(ClusterError::SpecInvalid(_))
        ));
    }

    #[test]
    fn test_image_lookup_by_name_or_id() {
        let catalog = Catalog {
            images: vec![
                Image {
                    id: "img-1".to_string(),
                    name: "ubuntu-24.04".to_string(),
                    active: true,
                },
                Image {
                    id: "img-2".to_string(),
                    name: "old".to_string(),
                    active: false,
                },
            ],
            ..Default::default()
        };

        assert!(catalog.image("ubuntu-24.04").is_some());
        assert!(catalog.image("img-1").is_some());
        assert!(catalog.image("old").is_none());
    }
}
