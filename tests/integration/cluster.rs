//! Cluster management for integration tests
//!
//! Uses existing kubeconfig (~/.kube/config or KUBECONFIG environment variable).

use kube::{Client, Config};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::CrdError;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Failed to create kube client: {0}")]
    ClientCreation(#[from] kube::Error),

    #[error("Failed to infer config: {0}")]
    InferConfig(#[from] kube::config::InferConfigError),
}

static SHARED_CLUSTER: OnceCell<Arc<SharedTestCluster>> = OnceCell::const_new();

/// CRDs are installed once per test run
static CRDS_INSTALLED: OnceCell<()> = OnceCell::const_new();

/// The Kubernetes cluster all integration tests share
pub struct SharedTestCluster {
    _marker: (),
}

impl SharedTestCluster {
    pub async fn get() -> Result<Arc<SharedTestCluster>, ClusterError> {
        SHARED_CLUSTER
            .get_or_try_init(|| async { Ok(Arc::new(Self::connect().await?)) })
            .await
            .map(Arc::clone)
    }

    pub async fn new_client(&self) -> Result<Client, ClusterError> {
        let config = Config::infer().await?;
        Ok(Client::try_from(config)?)
    }

    async fn connect() -> Result<Self, ClusterError> {
        let client = Client::try_from(Config::infer().await?)?;
        let version = client.apiserver_version().await?;
        tracing::info!(
            "Connected to Kubernetes cluster: {} {}",
            version.platform,
            version.git_version
        );
        Ok(Self { _marker: () })
    }
}

/// Install the operator's CRDs (idempotent, runs once per test run)
pub async fn ensure_crds_installed(cluster: &SharedTestCluster) -> Result<(), CrdError> {
    CRDS_INSTALLED
        .get_or_try_init(|| async {
            let client = cluster
                .new_client()
                .await
                .map_err(|e| CrdError::Client(e.to_string()))?;
            crate::install_crds(client).await
        })
        .await
        .map(|_| ())
}
