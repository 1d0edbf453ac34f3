//! OpenStack provider implementation

use crate::error::OpenStackError;
use crate::openstack::{
    OpenStackCli, field, field_str, field_u64, remaining, router_subnets, server_address,
};
use async_trait::async_trait;
use gridflow_cloud::{
    AuthStatus, CreatedResource, Flavor, Image, InstanceRequest, KeypairRequest, NetworkRequest,
    ProviderAdapter, ProviderResult, Quota, RemoteStatus, ResourceInfo, RouterRequest,
    SecurityGroupRequest, SubnetRequest, VolumeRequest,
};
use gridflow_core::{Direction, ProviderError, ResourceKind, SecurityRule};
use serde_json::{Value, json};

/// OpenStack provider backed by the `openstack` CLI
pub struct OpenStackProvider {
    cli: OpenStackCli,
}

/// CLI noun of a resource kind
fn noun(kind: ResourceKind) -> ProviderResult<&'static [&'static str]> {
    match kind {
        ResourceKind::Network => Ok(&["network"]),
        ResourceKind::Subnet => Ok(&["subnet"]),
        ResourceKind::Router => Ok(&["router"]),
        ResourceKind::SecurityGroup => Ok(&["security", "group"]),
        ResourceKind::Keypair => Ok(&["keypair"]),
        ResourceKind::Volume => Ok(&["volume"]),
        ResourceKind::Instance => Ok(&["server"]),
        ResourceKind::Tunnel => Err(OpenStackError::Unsupported(kind.to_string()).into()),
    }
}

/// Maps a provider status string. Resources without a status (subnets,
/// keypairs, security groups) are active once they exist.
pub fn parse_status(status: Option<&str>) -> RemoteStatus {
    let Some(status) = status else {
        return RemoteStatus::Active;
    };
    match status.to_ascii_uppercase().as_str() {
        "ACTIVE" | "AVAILABLE" | "IN-USE" | "UP" => RemoteStatus::Active,
        "DELETING" | "DELETED" | "SOFT_DELETED" => RemoteStatus::Deleting,
        s if s.starts_with("ERROR") => RemoteStatus::Error,
        _ => RemoteStatus::Building,
    }
}

/// Arguments of `security group rule create` for one rule
pub fn rule_args(group_id: &str, rule: &SecurityRule) -> Vec<String> {
    let mut args = vec![
        "security".to_string(),
        "group".to_string(),
        "rule".to_string(),
        "create".to_string(),
        match rule.direction {
            Direction::Ingress => "--ingress".to_string(),
            Direction::Egress => "--egress".to_string(),
        },
        "--ethertype".to_string(),
        "IPv4".to_string(),
        "--protocol".to_string(),
        rule.protocol.clone().unwrap_or_else(|| "any".to_string()),
    ];

    match (rule.port_min, rule.port_max) {
        (Some(min), Some(max)) => args.extend(["--dst-port".to_string(), format!("{}:{}", min, max)]),
        (Some(port), None) | (None, Some(port)) => {
            args.extend(["--dst-port".to_string(), format!("{}:{}", port, port)])
        }
        (None, None) => {}
    }
    if let Some(cidr) = &rule.remote_cidr {
        args.extend(["--remote-ip".to_string(), cidr.clone()]);
    }
    args.push(group_id.to_string());
    args
}

fn info_from_show(kind: ResourceKind, value: &Value) -> ProviderResult<ResourceInfo> {
    let provider_id = match kind {
        // keypairs are addressed by name
        ResourceKind::Keypair => field_str(value, &["name", "Name"]),
        _ => field_str(value, &["id", "ID"]),
    }
    .ok_or_else(|| ProviderError::Fatal(format!("{} without id: {}", kind, value)))?;
    let name = field_str(value, &["name", "Name"]).unwrap_or_else(|| provider_id.clone());

    let status = parse_status(field_str(value, &["status", "Status"]).as_deref());
    let fault = match value.get("fault") {
        Some(Value::Object(fault)) => fault.get("message").and_then(|m| m.as_str()).map(str::to_string),
        Some(Value::String(fault)) if !fault.is_empty() => Some(fault.clone()),
        _ => None,
    };

    let mut info = ResourceInfo {
        provider_id,
        name,
        kind,
        status,
        fault,
        outputs: Default::default(),
    };
    if kind == ResourceKind::Instance {
        if let Some(address) = server_address(value) {
            info.outputs.insert("address".to_string(), json!(address));
        }
    }
    if kind == ResourceKind::Subnet {
        if let Some(cidr) = field_str(value, &["cidr"]) {
            info.outputs.insert("cidr".to_string(), json!(cidr));
        }
    }
    Ok(info)
}

fn created(kind: ResourceKind, value: &Value) -> ProviderResult<CreatedResource> {
    let info = info_from_show(kind, value)?;
    Ok(CreatedResource {
        provider_id: info.provider_id,
        outputs: info.outputs,
    })
}

impl OpenStackProvider {
    /// `cloud` is the entry name in `clouds.yaml`.
    pub fn new(cloud: impl Into<String>) -> Self {
        Self {
            cli: OpenStackCli::new(cloud),
        }
    }

    pub fn with_cli(cli: OpenStackCli) -> Self {
        Self { cli }
    }

    async fn show(&self, kind: ResourceKind, id: &str) -> ProviderResult<Value> {
        let mut args: Vec<&str> = noun(kind)?.to_vec();
        args.extend(["show", id]);
        Ok(self.cli.json(&args).await?)
    }

    /// Detaches a router from its subnets and gateway so it can be deleted.
    async fn clear_router(&self, id: &str) -> ProviderResult<()> {
        let router = self.show(ResourceKind::Router, id).await?;
        for subnet in router_subnets(&router) {
            match self.cli.run(&["router", "remove", "subnet", id, &subnet]).await {
                Ok(_) => {}
                Err(e) => match ProviderError::from(e) {
                    ProviderError::NotFound(_) => {}
                    other => return Err(other),
                },
            }
        }
        if field(&router, &["external_gateway_info"]).is_some_and(|g| !g.is_null()) {
            self.cli
                .run(&["router", "unset", "--external-gateway", id])
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ProviderAdapter for OpenStackProvider {
    fn name(&self) -> &str {
        "openstack"
    }

    async fn check_auth(&self) -> ProviderResult<AuthStatus> {
        match self.cli.check_auth().await {
            Ok(token) => {
                let project = field_str(&token, &["project_id"]).unwrap_or_default();
                Ok(AuthStatus::ok(format!(
                    "cloud {} (project {})",
                    self.cli.cloud(),
                    project
                )))
            }
            Err(OpenStackError::CliNotFound) => Ok(AuthStatus::failed(
                OpenStackError::CliNotFound.to_string(),
            )),
            Err(OpenStackError::CommandFailed(stderr)) => Ok(AuthStatus::failed(stderr)),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_flavors(&self) -> ProviderResult<Vec<Flavor>> {
        let rows = self.cli.list(&["flavor", "list", "--all"]).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(Flavor {
                    name: field_str(row, &["Name", "name"])?,
                    vcpus: field_u64(row, &["VCPUs", "vcpus"])? as u32,
                    ram_mb: field_u64(row, &["RAM", "ram"])?,
                    disk_gb: field_u64(row, &["Disk", "disk"]).unwrap_or(0) as u32,
                })
            })
            .collect())
    }

    async fn list_images(&self) -> ProviderResult<Vec<Image>> {
        let rows = self.cli.list(&["image", "list"]).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(Image {
                    id: field_str(row, &["ID", "id"])?,
                    name: field_str(row, &["Name", "name"]).unwrap_or_default(),
                    active: field_str(row, &["Status", "status"])
                        .is_some_and(|s| s.eq_ignore_ascii_case("active")),
                })
            })
            .collect())
    }

    async fn list_networks(&self) -> ProviderResult<Vec<String>> {
        let rows = self.cli.list(&["network", "list"]).await?;
        Ok(rows
            .iter()
            .filter_map(|row| field_str(row, &["Name", "name"]))
            .collect())
    }

    async fn quota(&self) -> ProviderResult<Quota> {
        let limits = self.cli.list(&["limits", "show", "--absolute"]).await?;
        Ok(Quota {
            instances: remaining(&limits, "maxTotalInstances", "totalInstancesUsed"),
            cores: remaining(&limits, "maxTotalCores", "totalCoresUsed"),
            ram_mb: remaining(&limits, "maxTotalRAMSize", "totalRAMUsed"),
            volumes: remaining(&limits, "maxTotalVolumes", "totalVolumesUsed"),
            volume_gb: remaining(&limits, "maxTotalVolumeGigabytes", "totalGigabytesUsed"),
        })
    }

    async fn create_network(&self, request: &NetworkRequest) -> ProviderResult<CreatedResource> {
        let value = self
            .cli
            .json(&["network", "create", &request.name])
            .await?;
        created(ResourceKind::Network, &value)
    }

    async fn create_subnet(&self, request: &SubnetRequest) -> ProviderResult<CreatedResource> {
        let mut args = vec![
            "subnet",
            "create",
            "--network",
            request.network_id.as_str(),
            "--subnet-range",
            request.cidr.as_str(),
        ];
        for dns in &request.dns_nameservers {
            args.push("--dns-nameserver");
            args.push(dns.as_str());
        }
        args.push(request.name.as_str());

        let value = self.cli.json(&args).await?;
        created(ResourceKind::Subnet, &value)
    }

    async fn create_router(&self, request: &RouterRequest) -> ProviderResult<CreatedResource> {
        let value = self
            .cli
            .json(&["router", "create", &request.name])
            .await?;
        let router = created(ResourceKind::Router, &value)?;
        let id = router.provider_id.as_str();

        self.cli
            .run(&[
                "router",
                "set",
                "--external-gateway",
                &request.external_network,
                id,
            ])
            .await?;
        self.cli
            .run(&["router", "add", "subnet", id, &request.subnet_id])
            .await?;

        Ok(router.with_output("subnet_id", json!(request.subnet_id)))
    }

    async fn create_security_group(
        &self,
        request: &SecurityGroupRequest,
    ) -> ProviderResult<CreatedResource> {
        let value = self
            .cli
            .json(&["security", "group", "create", &request.name])
            .await?;
        let group = created(ResourceKind::SecurityGroup, &value)?;

        for rule in &request.rules {
            let args = rule_args(&group.provider_id, rule);
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            self.cli.run(&args).await?;
        }
        Ok(group)
    }

    async fn create_keypair(&self, request: &KeypairRequest) -> ProviderResult<CreatedResource> {
        let value = self
            .cli
            .create_keypair(&request.name, &request.public_key)
            .await?;
        created(ResourceKind::Keypair, &value)
    }

    async fn create_volume(&self, request: &VolumeRequest) -> ProviderResult<CreatedResource> {
        let size = request.size_gb.to_string();
        let mut args = vec!["volume", "create", "--size", size.as_str()];
        if let Some(volume_type) = &request.volume_type {
            args.push("--type");
            args.push(volume_type.as_str());
        }
        args.push(request.name.as_str());

        let value = self.cli.json(&args).await?;
        created(ResourceKind::Volume, &value)
    }

    async fn create_instance(&self, request: &InstanceRequest) -> ProviderResult<CreatedResource> {
        let mut args: Vec<String> = [
            "server",
            "create",
            "--flavor",
            request.flavor.as_str(),
            "--image",
            request.image.as_str(),
            "--network",
            request.network.as_str(),
            "--key-name",
            request.key_name.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        for group in &request.security_groups {
            args.extend(["--security-group".to_string(), group.clone()]);
        }
        for volume in &request.volumes {
            args.extend([
                "--block-device".to_string(),
                format!(
                    "uuid={},source_type=volume,destination_type=volume,delete_on_termination=false",
                    volume
                ),
            ]);
        }
        for (key, value) in &request.metadata {
            args.extend(["--property".to_string(), format!("{}={}", key, value)]);
        }
        args.push(request.name.clone());

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let value = self.cli.json(&args).await?;
        created(ResourceKind::Instance, &value)
    }

    async fn get(&self, kind: ResourceKind, id: &str) -> ProviderResult<Option<ResourceInfo>> {
        match self.show(kind, id).await {
            Ok(value) => Ok(Some(info_from_show(kind, &value)?)),
            Err(ProviderError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, kind: ResourceKind) -> ProviderResult<Vec<ResourceInfo>> {
        let mut args: Vec<&str> = noun(kind)?.to_vec();
        args.push("list");
        let rows = self.cli.list(&args).await?;

        rows.iter().map(|row| info_from_show(kind, row)).collect()
    }

    async fn delete(&self, kind: ResourceKind, id: &str) -> ProviderResult<()> {
        if kind == ResourceKind::Router {
            self.clear_router(id).await?;
        }

        let mut args: Vec<&str> = noun(kind)?.to_vec();
        args.extend(["delete", id]);
        self.cli.run(&args).await?;

        tracing::debug!(kind = %kind, id, cloud = self.cli.cloud(), "Deleted resource");
        Ok(())
    }
}
