//! kubectl plugin for pgha-operator clusters
//!
//! Installed on the PATH as `kubectl-pgha`, invoked as `kubectl pgha ...`.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kube::Client;
use tracing_subscriber::EnvFilter;

use pgha_operator::controller::status::{KubeStatusStore, StatusStore, wait_for_status};
use pgha_operator::{Result, plugin};

#[derive(Parser, Debug)]
#[command(name = "kubectl-pgha", version, about = "Manage pgha-operator PostgreSQL clusters")]
struct Args {
    /// Namespace of the cluster
    #[arg(short, long, global = true, env = "PGHA_NAMESPACE", default_value = "default")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Switch the primary over to another instance
    Promote {
        cluster: String,
        instance: String,
        /// Wait until the instance is the current primary
        #[arg(long)]
        wait: bool,
        #[arg(long, default_value_t = 120)]
        timeout_secs: u64,
    },
    /// Fence an instance, or `*` for all of them
    Fence { cluster: String, instance: String },
    /// Remove an instance, or `*`, from the fenced set
    Unfence { cluster: String, instance: String },
    /// Show the cluster and its instances
    Status { cluster: String },
    /// Request an on-demand backup
    Backup {
        cluster: String,
        /// Name of the Backup object; generated from the cluster name when unset
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let client = Client::try_default().await?;
    let ns = args.namespace.as_str();

    match args.command {
        Commands::Promote {
            cluster,
            instance,
            wait,
            timeout_secs,
        } => {
            let store = KubeStatusStore::new(client.clone());
            let mut rx = store.subscribe(ns, &cluster);
            if plugin::promote(client, ns, &cluster, &instance).await? {
                println!("Promotion of {} requested", instance);
            } else {
                println!("{} is already the primary", instance);
                return Ok(());
            }
            if wait {
                wait_for_status(&mut rx, Duration::from_secs(timeout_secs), |s| {
                    s.current_primary.as_deref() == Some(instance.as_str()) && !s.promotion_in_progress()
                })
                .await?;
                println!("{} is now the primary", instance);
            }
        }
        Commands::Fence { cluster, instance } => {
            if plugin::fence(client, ns, &cluster, &instance, true).await? {
                println!("{} fenced", instance);
            } else {
                println!("{} was already fenced", instance);
            }
        }
        Commands::Unfence { cluster, instance } => {
            if plugin::fence(client, ns, &cluster, &instance, false).await? {
                println!("{} unfenced", instance);
            } else {
                println!("{} was not fenced", instance);
            }
        }
        Commands::Status { cluster } => {
            print!("{}", plugin::status(client, ns, &cluster).await?);
        }
        Commands::Backup { cluster, name } => {
            let created = plugin::backup(client, ns, &cluster, name.as_deref()).await?;
            println!("Backup {} created", created);
        }
    }
    Ok(())
}
