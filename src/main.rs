use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pgha_operator::health::{HealthState, run_health_server};
use pgha_operator::{
    Context, LogFormat, OperatorConfig, run_backup_controller, run_controller, run_scheduled_backup_controller,
    run_webhook_server,
};

const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

/// Grace period for in-flight reconciliations to complete during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = OperatorConfig::parse();

    // Install the TLS crypto provider before any TLS operations
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err("Failed to install rustls crypto provider and no provider is available".into());
    }

    init_tracing(config.log_format)?;

    info!("Starting pgha-operator");

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let holder_id = config.pod_name.clone().unwrap_or_else(|| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });

    info!(
        holder_id = %holder_id,
        namespace = %config.pod_namespace,
        lease_name = %config.lease_name,
        "Initializing leader election"
    );

    let health_state = Arc::new(HealthState::new());

    // Probes answer even while this replica is not the leader
    let health_handle = {
        let health_state = health_state.clone();
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, port).await {
                error!("Health server error: {}", e);
            }
        })
    };

    // Admission is served by every replica
    let webhook_handle = if Path::new(&config.webhook_cert_path).exists() && Path::new(&config.webhook_key_path).exists()
    {
        info!("TLS certificates found, starting webhook server");
        let webhook_client = client.clone();
        let cert_path = config.webhook_cert_path.clone();
        let key_path = config.webhook_key_path.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = run_webhook_server(webhook_client, &cert_path, &key_path).await {
                error!("Webhook server error: {}", e);
            }
        }))
    } else {
        info!(
            "TLS certificates not found at {} and {}, webhook server disabled",
            config.webhook_cert_path, config.webhook_key_path
        );
        None
    };

    let lease_params = || LeaseLockParams {
        holder_id: holder_id.clone(),
        lease_name: config.lease_name.clone(),
        lease_ttl: config.lease_ttl(),
    };
    let lease_lock = LeaseLock::new(client.clone(), &config.pod_namespace, lease_params());

    info!("Waiting to acquire leadership...");
    loop {
        match lease_lock.try_acquire_or_renew().await {
            Ok(result) if matches!(result, LeaseLockResult::Acquired(_)) => {
                info!("Acquired leadership");
                break;
            }
            Ok(_) => info!("Another instance is leader, waiting..."),
            Err(e) => warn!("Failed to acquire lease: {}, retrying...", e),
        }
        tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
    }

    let lease_renewal_handle = {
        let lease_lock = LeaseLock::new(client.clone(), &config.pod_namespace, lease_params());
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;

                match lease_lock.try_acquire_or_renew().await {
                    Ok(result) if matches!(result, LeaseLockResult::Acquired(_)) => {}
                    Ok(_) => {
                        error!("Lost leadership! Shutting down...");
                        // Exit so Kubernetes restarts us and we re-enter election
                        std::process::exit(1);
                    }
                    Err(e) => {
                        error!("Failed to renew lease: {}. Shutting down...", e);
                        std::process::exit(1);
                    }
                }
            }
        })
    };

    let ctx = Arc::new(Context::new(client, Some(health_state.clone()), Arc::new(config))?);

    info!("Watching PostgresCluster, Backup and ScheduledBackup resources (apiVersion: pgha.smoketurner.com/v1alpha1)");

    let controller_handle = tokio::spawn(run_controller(ctx.clone()));
    let backup_controller_handle = tokio::spawn(run_backup_controller(ctx.clone()));
    let scheduled_controller_handle = tokio::spawn(run_scheduled_backup_controller(ctx));

    let webhook_future = async {
        if let Some(handle) = webhook_handle {
            if let Err(e) = handle.await {
                error!("Webhook server task panicked: {}", e);
            }
        } else {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        result = controller_handle => {
            if let Err(e) = result {
                error!("Cluster controller task panicked: {}", e);
            }
        }
        result = backup_controller_handle => {
            if let Err(e) = result {
                error!("Backup controller task panicked: {}", e);
            }
        }
        result = scheduled_controller_handle => {
            if let Err(e) = result {
                error!("ScheduledBackup controller task panicked: {}", e);
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        _ = webhook_future => {}
        // Only reached if the renewal task panicked
        Err(e) = lease_renewal_handle => {
            error!("Lease renewal task panicked: {}", e);
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");

            health_state.set_ready(false).await;
            info!("Marked operator as not ready");

            info!(
                "Waiting {}s for in-flight reconciliations to complete...",
                SHUTDOWN_GRACE_PERIOD_SECS
            );
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;

            info!("Grace period complete, shutting down");
        }
    }

    info!("Operator stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::from_default_env()
        .add_directive("pgha_operator=info".parse()?)
        .add_directive("kube=info".parse()?)
        .add_directive("kube_leader_election=info".parse()?);

    match format {
        LogFormat::Plain => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
    Ok(())
}

/// Wait for SIGTERM or SIGINT
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
