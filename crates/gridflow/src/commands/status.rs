use crate::utils;
use colored::Colorize;
use gridflow_core::{ClusterPhase, ResourceKind, ResourceStatus};
use std::collections::{BTreeMap, BTreeSet};

pub async fn handle(cluster_id: Option<&str>, json: bool) -> anyhow::Result<()> {
    let manager = utils::build_manager(None, &BTreeSet::new(), None)?;
    let record = manager.status(cluster_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    let phase = match record.phase {
        ClusterPhase::Stable => record.phase.to_string().green(),
        ClusterPhase::Provisioning | ClusterPhase::Scaling => record.phase.to_string().yellow(),
        _ => record.phase.to_string().red(),
    };
    println!("{} {}", "Cluster".bold(), record.cluster_id.cyan().bold());
    println!("  phase:    {}", phase);
    println!(
        "  created:  {}",
        record.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "  updated:  {}",
        record.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("  keypair:  {}", record.ssh.key_name);
    if let Some(address) = &record.ssh.master_address {
        println!("  master:   {}", address);
    }

    println!();
    utils::print_roster(&record);

    let mut counts: BTreeMap<(&str, ResourceKind), usize> = BTreeMap::new();
    for resource in record.live_resources() {
        *counts
            .entry((resource.cloud.as_str(), resource.kind()))
            .or_default() += 1;
    }
    println!();
    println!("{}", "Resources:".bold());
    for ((cloud, kind), count) in &counts {
        println!("  • {:<16} {:<16} {}", cloud, kind.to_string(), count);
    }

    let failed: Vec<_> = record
        .resources
        .iter()
        .filter(|r| r.status == ResourceStatus::Failed && !r.is_released())
        .collect();
    if !failed.is_empty() {
        println!();
        println!("{}", "Resources needing attention:".yellow().bold());
        for resource in failed {
            println!(
                "  ⚠ {} (provider id {}): {}",
                resource.id.to_string().cyan(),
                resource.provider_id.as_deref().unwrap_or("unknown"),
                resource.error.as_deref().unwrap_or("failed")
            );
        }
    }
    Ok(())
}
