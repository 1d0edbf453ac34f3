use crate::utils::{self, ConfigOptions};
use colored::Colorize;
use gridflow_cluster::ClusterManager;
use tokio_util::sync::CancellationToken;

/// Manager for a recorded cluster: its clouds come from the record, the
/// engine and setup policies from the configuration when one is present.
async fn manager_for(
    options: &ConfigOptions,
    cluster_id: Option<&str>,
) -> anyhow::Result<(ClusterManager, String)> {
    let store = utils::open_store()?;
    let cluster_id = utils::resolve_cluster(&store, cluster_id).await?;
    let record = store.load(&cluster_id).await?;
    let config = options.load_optional()?;
    let manager = utils::build_manager(
        config.as_ref(),
        &utils::record_clouds(&record),
        record.ssh.private_key_path.clone(),
    )?;
    Ok((manager, cluster_id))
}

pub async fn up(
    options: &ConfigOptions,
    cluster_id: Option<&str>,
    group: &str,
    count: u32,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let (manager, cluster_id) = manager_for(options, cluster_id).await?;
    println!(
        "{}",
        format!(
            "Adding {} worker(s) from group {} to cluster {}...",
            count, group, cluster_id
        )
        .yellow()
    );

    let report = manager
        .scaling()
        .scale_up(&cluster_id, group, count, cancel)
        .await?;

    println!();
    for name in &report.added {
        println!("  ✓ {}", name.cyan());
    }
    println!(
        "{}",
        format!(
            "✓ Cluster {} now {} ({} added)",
            report.cluster_id,
            report.phase,
            report.added.len()
        )
        .green()
        .bold()
    );
    Ok(())
}

pub async fn down(
    options: &ConfigOptions,
    cluster_id: Option<&str>,
    workers: &[String],
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let (manager, cluster_id) = manager_for(options, cluster_id).await?;
    println!(
        "{}",
        format!(
            "Removing {} worker(s) from cluster {}...",
            workers.len(),
            cluster_id
        )
        .yellow()
    );

    let report = manager
        .scaling()
        .scale_down(&cluster_id, workers, cancel)
        .await?;

    println!();
    for name in &report.removed {
        println!("  ✓ {} removed", name.cyan());
    }
    println!(
        "{}",
        format!(
            "✓ Cluster {} now {} ({} removed)",
            report.cluster_id,
            report.phase,
            report.removed.len()
        )
        .green()
        .bold()
    );
    Ok(())
}
