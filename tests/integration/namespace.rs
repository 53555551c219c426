//! Test namespace management for isolation

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{DeleteParams, PostParams, PropagationPolicy};
use kube::core::ObjectMeta;
use kube::{Api, Client};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NamespaceError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),
}

/// A namespace that is deleted when the test cleans up
pub struct TestNamespace {
    pub name: String,
    client: Client,
}

impl TestNamespace {
    /// Create `{prefix}-{random}` labelled for the test run
    pub async fn create(client: Client, prefix: &str) -> Result<Self, NamespaceError> {
        let name = format!("{}-{:08x}", prefix, rand::random::<u32>());

        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(BTreeMap::from([
                    ("pgha-operator.test".to_string(), "true".to_string()),
                    ("test-prefix".to_string(), prefix.to_string()),
                ])),
                ..Default::default()
            },
            ..Default::default()
        };

        let namespaces: Api<Namespace> = Api::all(client.clone());
        namespaces.create(&PostParams::default(), &ns).await?;
        tracing::info!("Created test namespace: {}", name);

        Ok(Self { name, client })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start deleting the namespace without waiting for it to disappear
    pub async fn cleanup(&self) -> Result<(), NamespaceError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let dp = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };

        match namespaces.delete(&self.name, &dp).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(NamespaceError::KubeError(e)),
        }
    }
}
