mod commands;
mod utils;

use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "grid")]
#[command(about = "Ephemeral compute clusters on one or more OpenStack clouds", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: gridflow.yml found from the current directory)
    #[arg(short = 'i', long = "config", global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Defaults merged underneath the configuration file
    #[arg(long, global = true, value_name = "FILE")]
    default_config: Option<PathBuf>,

    /// Settings merged over the configuration file
    #[arg(long, global = true, value_name = "FILE")]
    enforced_config: Option<PathBuf>,

    /// Cluster to act on (default: the last cluster created here)
    #[arg(short = 'c', long, global = true, env = "GRIDFLOW_CLUSTER_ID")]
    cluster_id: Option<String>,

    /// More log output (-v info, -vv debug, -vvv trace). RUST_LOG wins when set
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Print the full error chain when a command fails
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check credentials, catalogs and the resource plan without creating anything
    Check,
    /// Provision and configure a new cluster
    Create,
    /// List the clusters recorded in the state directory
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show the nodes and resources of a cluster
    Status {
        /// Print the full record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add workers built from a node group
    ScaleUp {
        /// Node group used as the template
        group: String,
        /// Number of workers to add
        #[arg(default_value_t = 1)]
        count: u32,
    },
    /// Remove workers by name
    ScaleDown {
        /// Worker names (see `grid status`)
        #[arg(required = true)]
        workers: Vec<String>,
    },
    /// Delete every resource of a cluster and forget it
    Terminate {
        /// Drop the record even if some resources cannot be deleted
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let action = cli.command.action();
    let log_file = utils::log_file(action.is_some());
    init_tracing(cli.verbose, log_file.as_deref());

    let options = utils::ConfigOptions {
        config: cli.config,
        default: cli.default_config,
        enforced: cli.enforced_config,
    };
    let cluster_id = cli.cluster_id.as_deref();
    let cancel = utils::cancel_on_ctrl_c();

    let operation = run(cli.command, &options, cluster_id, &cancel);
    let result = match action {
        Some(action) => utils::timed(action, operation).await,
        None => operation.await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!(error = ?e, "Command failed");
            if cli.debug {
                eprintln!("{} {:?}", "Error:".red().bold(), e);
            } else {
                eprintln!("{} {:#}", "Error:".red().bold(), e);
            }
            ExitCode::FAILURE
        }
    }
}

impl Commands {
    /// Name under which the duration of a cloud-facing command is reported.
    fn action(&self) -> Option<&'static str> {
        match self {
            Commands::Check => Some("check"),
            Commands::Create => Some("create"),
            Commands::ScaleUp { .. } => Some("scale-up"),
            Commands::ScaleDown { .. } => Some("scale-down"),
            Commands::Terminate { .. } => Some("terminate"),
            Commands::List { .. } | Commands::Status { .. } => None,
        }
    }
}

async fn run(
    command: Commands,
    options: &utils::ConfigOptions,
    cluster_id: Option<&str>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    match command {
        Commands::Check => commands::check::handle(options).await,
        Commands::Create => commands::create::handle(options, cluster_id, cancel).await,
        Commands::List { json } => commands::list::handle(json).await,
        Commands::Status { json } => commands::status::handle(cluster_id, json).await,
        Commands::ScaleUp { group, count } => {
            commands::scale::up(options, cluster_id, &group, count, cancel).await
        }
        Commands::ScaleDown { workers } => {
            commands::scale::down(options, cluster_id, &workers, cancel).await
        }
        Commands::Terminate { force } => {
            commands::terminate::handle(options, cluster_id, force, cancel).await
        }
    }
}

/// Logs to stderr at the verbosity asked for, and to `log_file` at info or
/// above so a failed run can be looked into afterwards.
fn init_tracing(verbose: u8, log_file: Option<&Path>) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = |fallback: &str| {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
    };

    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter(level));
    let file = log_file.and_then(open_log).map(|file| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .with_filter(filter(if verbose < 2 { "info" } else { level }))
    });

    tracing_subscriber::registry().with(stderr).with(file).init();
}

fn open_log(path: &Path) -> Option<File> {
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("⚠ cannot open log file {}: {}", path.display(), e);
            None
        }
    }
}
