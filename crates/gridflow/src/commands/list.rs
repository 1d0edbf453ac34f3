use crate::utils;
use colored::Colorize;
use std::collections::BTreeSet;

pub async fn handle(json: bool) -> anyhow::Result<()> {
    let manager = utils::build_manager(None, &BTreeSet::new(), None)?;
    let clusters = manager.list().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&clusters)?);
        return Ok(());
    }

    if clusters.is_empty() {
        println!("No clusters recorded.");
        return Ok(());
    }

    let last = manager.store().last_cluster().await?;
    println!(
        "  {:<17} {:<13} {:<9} {:<16} {:<20} CREATED",
        "CLUSTER", "PHASE", "WORKERS", "MASTER", "CLOUDS"
    );
    for cluster in &clusters {
        let marker = if last.as_deref() == Some(cluster.cluster_id.as_str()) {
            "*"
        } else {
            " "
        };
        let clouds: Vec<&str> = cluster.clouds.iter().map(String::as_str).collect();
        println!(
            "{} {} {:<13} {:<9} {:<16} {:<20} {}",
            marker,
            format!("{:<17}", cluster.cluster_id).cyan(),
            cluster.phase.to_string(),
            format!("{}/{}", cluster.configured_workers, cluster.workers),
            cluster.master_address.as_deref().unwrap_or("-"),
            clouds.join(","),
            cluster.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}
