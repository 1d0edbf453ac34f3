use crate::utils::{self, ConfigOptions};
use colored::Colorize;
use std::collections::BTreeSet;

pub async fn handle(options: &ConfigOptions) -> anyhow::Result<()> {
    let config = options.load()?;
    let spec = config.spec()?;
    println!("{}", "Checking clouds...".yellow());

    let manager =
        utils::build_manager(Some(&config), &BTreeSet::new(), spec.ssh.private_key_path.clone())?;
    let report = manager.check(&spec).await?;

    println!();
    for cloud in &report.clouds {
        let account = cloud
            .account
            .as_deref()
            .map(|a| format!(" ({})", a))
            .unwrap_or_default();
        println!("  ✓ {}{}", cloud.name.cyan().bold(), account);
        println!(
            "    {} flavors, {} images, {} networks",
            cloud.flavors, cloud.images, cloud.networks
        );
    }

    println!();
    println!("{}", "Resources to create:".bold());
    for (kind, count) in &report.summary.by_kind {
        println!("  • {:<16} {}", kind.to_string(), count);
    }
    println!();
    println!(
        "{}",
        format!(
            "✓ Plan is valid: {} resources across {} cloud(s)",
            report.summary.create,
            report.clouds.len()
        )
        .green()
        .bold()
    );
    Ok(())
}
