//! OpenStack provider for Gridflow
//!
//! This crate implements the `ProviderAdapter` trait for OpenStack clouds,
//! enabling Gridflow to create networks, security groups, keypairs, volumes
//! and servers for a cluster.
//!
//! # Requirements
//!
//! - `openstack` CLI (python-openstackclient) must be installed
//! - Credentials are read from `clouds.yaml`; each Gridflow cloud names the
//!   entry it uses
//!
//! # Example
//!
//! ```ignore
//! use gridflow_cloud::ProviderAdapter;
//! use gridflow_cloud_openstack::OpenStackProvider;
//!
//! let provider = OpenStackProvider::new("de-bielefeld");
//!
//! let auth = provider.check_auth().await?;
//! if !auth.authenticated {
//!     panic!("Not authenticated: {:?}", auth.error);
//! }
//!
//! let flavors = provider.list_flavors().await?;
//! ```

pub mod error;
pub mod openstack;
pub mod provider;

pub use error::{OpenStackError, Result, classify};
pub use openstack::OpenStackCli;
pub use provider::OpenStackProvider;
