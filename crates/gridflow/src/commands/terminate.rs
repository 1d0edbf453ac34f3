use crate::utils::{self, ConfigOptions};
use colored::Colorize;
use gridflow_core::ClusterError;
use tokio_util::sync::CancellationToken;

pub async fn handle(
    options: &ConfigOptions,
    cluster_id: Option<&str>,
    force: bool,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let store = utils::open_store()?;
    let cluster_id = utils::resolve_cluster(&store, cluster_id).await?;
    let record = store.load(&cluster_id).await?;
    let config = options.load_optional()?;

    println!(
        "{}",
        format!(
            "Terminating cluster {} ({} resources)...",
            cluster_id,
            record.live_resources().count()
        )
        .yellow()
    );

    let manager = utils::build_manager(
        config.as_ref(),
        &utils::record_clouds(&record),
        record.ssh.private_key_path.clone(),
    )?;

    match manager.terminate(&cluster_id, force, cancel).await {
        Ok(report) => {
            println!();
            println!("  ✓ {} resources deleted", report.deleted);
            utils::print_cleanup_failures(
                "Left behind, delete these by hand:",
                &report.abandoned,
            );
            println!();
            println!(
                "{}",
                format!("✓ Cluster {} terminated", report.cluster_id)
                    .green()
                    .bold()
            );
            Ok(())
        }
        Err(err @ ClusterError::CleanupIncomplete { .. }) => {
            println!();
            println!(
                "  ⚠ The record of cluster {} was kept. Run `grid terminate` again, or add --force to give up on the remaining resources",
                cluster_id
            );
            Err(err.into())
        }
        Err(err) => Err(err.into()),
    }
}
