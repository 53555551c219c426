//! Shared context for the controllers
//!
//! Holds the Kubernetes client, the event recorder identity and the seams
//! the reconcilers talk through: instance commands, the status store and
//! the object store.

use std::sync::Arc;

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

use crate::config::OperatorConfig;
use crate::controller::error::Result;
use crate::controller::status::{KubeStatusStore, StatusStore};
use crate::health::HealthState;
use crate::objectstore::{ObjectStoreProvider, S3ObjectStoreProvider};
use crate::postgres::{ExecInstanceClient, InstanceClient};
use crate::resources::common::FIELD_MANAGER;
use crate::resources::inheritance::InheritanceRules;

#[derive(Clone)]
pub struct Context {
    pub client: Client,
    reporter: Reporter,
    pub health_state: Option<Arc<HealthState>>,
    pub config: Arc<OperatorConfig>,
    pub inheritance: Arc<InheritanceRules>,
    pub instances: Arc<dyn InstanceClient>,
    pub status_store: Arc<dyn StatusStore>,
    pub object_stores: Arc<dyn ObjectStoreProvider>,
}

impl Context {
    pub fn new(
        client: Client,
        health_state: Option<Arc<HealthState>>,
        config: Arc<OperatorConfig>,
    ) -> Result<Self> {
        let inheritance = InheritanceRules::new(&config.inherited_annotations, &config.inherited_labels)?;
        Ok(Self {
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: config.pod_name.clone(),
            },
            health_state,
            inheritance: Arc::new(inheritance),
            instances: Arc::new(ExecInstanceClient::new(client.clone())),
            status_store: Arc::new(KubeStatusStore::new(client.clone())),
            object_stores: Arc::new(S3ObjectStoreProvider::new(client.clone())),
            config,
            client,
        })
    }

    /// Swap the instance client, used by tests driving a fake cluster
    pub fn with_instance_client(mut self, instances: Arc<dyn InstanceClient>) -> Self {
        self.instances = instances;
        self
    }

    pub fn with_status_store(mut self, store: Arc<dyn StatusStore>) -> Self {
        self.status_store = store;
        self
    }

    pub fn with_object_stores(mut self, provider: Arc<dyn ObjectStoreProvider>) -> Self {
        self.object_stores = provider;
        self
    }

    fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }

    async fn publish<K>(&self, resource: &K, type_: EventType, reason: &str, action: &str, note: Option<String>)
    where
        K: Resource<DynamicType = ()>,
    {
        let object_ref = resource.object_ref(&());
        if let Err(e) = self
            .recorder()
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }

    pub async fn publish_normal_event<K>(&self, resource: &K, reason: &str, action: &str, note: Option<String>)
    where
        K: Resource<DynamicType = ()>,
    {
        self.publish(resource, EventType::Normal, reason, action, note).await;
    }

    pub async fn publish_warning_event<K>(&self, resource: &K, reason: &str, action: &str, note: Option<String>)
    where
        K: Resource<DynamicType = ()>,
    {
        self.publish(resource, EventType::Warning, reason, action, note).await;
    }

    pub fn metrics(&self) -> Option<&crate::health::Metrics> {
        self.health_state.as_deref().map(|s| &s.metrics)
    }
}
