use crate::utils::{self, ConfigOptions};
use colored::Colorize;
use gridflow_cluster::{generate_cluster_id, is_valid_cluster_id};
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;

pub async fn handle(
    options: &ConfigOptions,
    cluster_id: Option<&str>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let config = options.load()?;
    let spec = config.spec()?;

    let cluster_id = match cluster_id {
        Some(id) if !is_valid_cluster_id(id) => anyhow::bail!(
            "invalid cluster id '{}': expected {} lowercase letters or digits",
            id,
            gridflow_cluster::CLUSTER_ID_LENGTH
        ),
        Some(id) => id.to_string(),
        None => generate_cluster_id(),
    };

    println!("{}", format!("Creating cluster {}...", cluster_id).yellow());
    for group in spec.groups.iter().filter(|g| g.count > 0) {
        println!(
            "  • {} × {} ({} / {}) on {}",
            group.count,
            group.name.cyan(),
            group.flavor,
            group.image,
            group.cloud
        );
    }

    let private_key = spec.ssh.private_key_path.clone();
    let manager = utils::build_manager(Some(&config), &BTreeSet::new(), private_key.clone())?;

    match manager.create_with_id(&cluster_id, spec, cancel).await {
        Ok(record) => {
            println!();
            println!(
                "{}",
                format!("✓ Cluster {} is ready", record.cluster_id)
                    .green()
                    .bold()
            );
            utils::print_roster(&record);

            if let (Some(master), Some(address)) = (&record.master, &record.ssh.master_address) {
                let key = private_key
                    .map(|path| format!("-i {} ", path.display()))
                    .unwrap_or_default();
                println!();
                println!("  ssh {}{}@{}", key, master.ssh_user, address);
            }
            Ok(())
        }
        Err(err) => {
            if manager.store().try_load(&cluster_id).await?.is_some() {
                println!();
                println!(
                    "  ⚠ The cluster record was kept. Inspect it with `grid status -c {}` and release it with `grid terminate -c {}`",
                    cluster_id, cluster_id
                );
            }
            Err(err.into())
        }
    }
}
