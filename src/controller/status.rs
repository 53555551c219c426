//! Status and conditions management for PostgresCluster resources
//!
//! `PostgresClusterStatus` is a versioned aggregate. Writers read it together
//! with its `resourceVersion`, mutate a copy and compare-and-swap it back;
//! a lost race re-reads and re-applies the mutation. Readers that need to
//! wait for a state subscribe to changes instead of polling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use kube::api::{Patch, PatchParams};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, ResourceExt};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::controller::error::{BackoffConfig, Error, Result};
use crate::crd::{Condition, PostgresCluster, PostgresClusterStatus};
use crate::resources::common::FIELD_MANAGER;

/// Standard condition types following Kubernetes conventions
pub mod condition_types {
    /// Cluster is ready to accept connections
    pub const READY: &str = "Ready";
    /// Cluster is progressing towards a goal state
    pub const PROGRESSING: &str = "Progressing";
    /// Cluster is in a degraded state but still functional
    pub const DEGRADED: &str = "Degraded";
    /// Cluster configuration is valid
    pub const CONFIG_VALID: &str = "ConfigurationValid";
    /// Recovery bootstrap resolved to WAL present in the object store
    pub const RECOVERY_VERIFIED: &str = "RecoveryVerified";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
    pub const UNKNOWN: &str = "Unknown";
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    pub fn new(generation: Option<i64>) -> Self {
        Self {
            conditions: Vec::new(),
            generation,
        }
    }

    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition, updating if it exists or adding if it doesn't
    ///
    /// `lastTransitionTime` only moves when the status flips.
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        let now = Utc::now().to_rfc3339();

        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = now;
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: now,
                observed_generation: self.generation,
            });
        }
        self
    }

    fn flag(self, type_: &str, value: bool, reason: &str, message: &str) -> Self {
        let status = if value {
            condition_status::TRUE
        } else {
            condition_status::FALSE
        };
        self.set_condition(type_, status, reason, message)
    }

    pub fn ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        self.flag(condition_types::READY, is_ready, reason, message)
    }

    pub fn progressing(self, is_progressing: bool, reason: &str, message: &str) -> Self {
        self.flag(condition_types::PROGRESSING, is_progressing, reason, message)
    }

    pub fn degraded(self, is_degraded: bool, reason: &str, message: &str) -> Self {
        self.flag(condition_types::DEGRADED, is_degraded, reason, message)
    }

    pub fn config_valid(self, is_valid: bool, reason: &str, message: &str) -> Self {
        self.flag(condition_types::CONFIG_VALID, is_valid, reason, message)
    }

    pub fn recovery_verified(self, verified: bool, reason: &str, message: &str) -> Self {
        self.flag(condition_types::RECOVERY_VERIFIED, verified, reason, message)
    }

    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// A status snapshot and the version it was read at
#[derive(Clone, Debug, PartialEq)]
pub struct VersionedStatus {
    pub resource_version: String,
    pub status: PostgresClusterStatus,
}

/// Versioned storage for cluster status
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<VersionedStatus>;

    /// Write `status` only if the stored version is still `expected_version`
    ///
    /// Returns the new version, or [`Error::Conflict`] when another writer
    /// got there first.
    async fn compare_and_swap(
        &self,
        namespace: &str,
        name: &str,
        expected_version: &str,
        status: &PostgresClusterStatus,
    ) -> Result<String>;

    /// Stream of status values; `None` until the object is first seen
    fn subscribe(&self, namespace: &str, name: &str) -> watch::Receiver<Option<PostgresClusterStatus>>;
}

/// Read-modify-write a status with bounded conflict retry
///
/// `mutate` may run several times and must derive its changes from the
/// status it is given. Returns the status as written (or as found, when the
/// mutation changed nothing).
pub async fn update_status<F>(
    store: &dyn StatusStore,
    namespace: &str,
    name: &str,
    retries: u32,
    mut mutate: F,
) -> Result<PostgresClusterStatus>
where
    F: FnMut(&mut PostgresClusterStatus) -> Result<()> + Send,
{
    let backoff = BackoffConfig::status_update();
    let mut attempt = 0;
    loop {
        let current = store.get(namespace, name).await?;
        let mut next = current.status.clone();
        mutate(&mut next)?;
        if next == current.status {
            return Ok(next);
        }

        match store
            .compare_and_swap(namespace, name, &current.resource_version, &next)
            .await
        {
            Ok(_) => return Ok(next),
            Err(e) if e.is_conflict() && attempt < retries => {
                let delay = backoff.delay_for_attempt(attempt);
                debug!(
                    cluster = %name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "status write conflicted, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) if e.is_conflict() => {
                warn!(cluster = %name, attempts = attempt + 1, "giving up on status write");
                return Err(Error::Conflict(format!("{}/{}", namespace, name)));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Wait until the subscribed status satisfies `predicate`
pub async fn wait_for_status<P>(
    rx: &mut watch::Receiver<Option<PostgresClusterStatus>>,
    timeout: Duration,
    predicate: P,
) -> Result<PostgresClusterStatus>
where
    P: Fn(&PostgresClusterStatus) -> bool,
{
    let waited = tokio::time::timeout(
        timeout,
        rx.wait_for(|status| status.as_ref().is_some_and(&predicate)),
    )
    .await
    .map_err(|_| Error::TransientError(format!("timed out after {:?} waiting for status", timeout)))?;

    let status = waited
        .map_err(|_| Error::TransientError("status subscription closed".to_string()))?
        .clone();
    status.ok_or_else(|| Error::NotFound("status".to_string()))
}

/// Merge patch turning `old` into `new`
///
/// Keys absent from `new` are nulled so the server drops them; arrays are
/// replaced wholesale.
pub fn merge_diff(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut patch = Map::new();
            for (key, new_value) in new_map {
                match old_map.get(key) {
                    Some(old_value) if old_value == new_value => {}
                    Some(old_value @ Value::Object(_)) if new_value.is_object() => {
                        patch.insert(key.clone(), merge_diff(old_value, new_value));
                    }
                    _ => {
                        patch.insert(key.clone(), new_value.clone());
                    }
                }
            }
            for key in old_map.keys() {
                if !new_map.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => new.clone(),
    }
}

/// Status store backed by the PostgresCluster status subresource
///
/// The CAS is a merge patch carrying `metadata.resourceVersion`, which the
/// API server rejects with 409 when the object moved on.
#[derive(Clone)]
pub struct KubeStatusStore {
    client: Client,
}

impl KubeStatusStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusStore for KubeStatusStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<VersionedStatus> {
        let api: Api<PostgresCluster> = Api::namespaced(self.client.clone(), namespace);
        let cluster = api.get(name).await?;
        Ok(VersionedStatus {
            resource_version: cluster
                .resource_version()
                .ok_or(Error::MissingObjectKey(".metadata.resourceVersion"))?,
            status: cluster.status.unwrap_or_default(),
        })
    }

    async fn compare_and_swap(
        &self,
        namespace: &str,
        name: &str,
        expected_version: &str,
        status: &PostgresClusterStatus,
    ) -> Result<String> {
        let api: Api<PostgresCluster> = Api::namespaced(self.client.clone(), namespace);
        let current = api.get(name).await?;
        if current.resource_version().as_deref() != Some(expected_version) {
            return Err(Error::Conflict(format!("{}/{}", namespace, name)));
        }
        let old = serde_json::to_value(current.status.unwrap_or_default())?;
        let new = serde_json::to_value(status)?;

        let patch = serde_json::json!({
            "metadata": { "resourceVersion": expected_version },
            "status": merge_diff(&old, &new),
        });

        let updated = api
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| match e {
                kube::Error::Api(ref resp) if resp.code == 409 => {
                    Error::Conflict(format!("{}/{}", namespace, name))
                }
                other => Error::KubeError(other),
            })?;

        updated
            .resource_version()
            .ok_or(Error::MissingObjectKey(".metadata.resourceVersion"))
    }

    fn subscribe(&self, namespace: &str, name: &str) -> watch::Receiver<Option<PostgresClusterStatus>> {
        let (tx, rx) = watch::channel(None);
        let api: Api<PostgresCluster> = Api::namespaced(self.client.clone(), namespace);
        let config = watcher::Config::default().fields(&format!("metadata.name={}", name));
        let name = name.to_string();

        tokio::spawn(async move {
            let mut stream = watcher(api, config).applied_objects().boxed();
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    next = stream.next() => match next {
                        Some(Ok(cluster)) => {
                            let status = cluster.status.unwrap_or_default();
                            tx.send_if_modified(|current| {
                                if current.as_ref() == Some(&status) {
                                    false
                                } else {
                                    *current = Some(status);
                                    true
                                }
                            });
                        }
                        Some(Err(e)) => debug!(cluster = %name, error = %e, "status watch error"),
                        None => break,
                    },
                }
            }
        });

        rx
    }
}

struct MemoryEntry {
    version: u64,
    status: PostgresClusterStatus,
    tx: watch::Sender<Option<PostgresClusterStatus>>,
}

/// In-process status store used by tests and the functional harness
#[derive(Clone, Default)]
pub struct MemoryStatusStore {
    entries: Arc<Mutex<HashMap<(String, String), MemoryEntry>>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite a status unconditionally
    pub fn insert(&self, namespace: &str, name: &str, status: PostgresClusterStatus) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .entry((namespace.to_string(), name.to_string()))
            .or_insert_with(|| MemoryEntry {
                version: 0,
                status: PostgresClusterStatus::default(),
                tx: watch::channel(None).0,
            });
        entry.version += 1;
        entry.status = status.clone();
        entry.tx.send_replace(Some(status));
    }

    /// Number of successful writes to a status
    pub fn version(&self, namespace: &str, name: &str) -> Option<u64> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&(namespace.to_string(), name.to_string()))
            .map(|e| e.version)
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<VersionedStatus> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&(namespace.to_string(), name.to_string()))
            .filter(|e| e.version > 0)
            .map(|e| VersionedStatus {
                resource_version: e.version.to_string(),
                status: e.status.clone(),
            })
            .ok_or_else(|| Error::NotFound(format!("{}/{}", namespace, name)))
    }

    async fn compare_and_swap(
        &self,
        namespace: &str,
        name: &str,
        expected_version: &str,
        status: &PostgresClusterStatus,
    ) -> Result<String> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .get_mut(&(namespace.to_string(), name.to_string()))
            .filter(|e| e.version > 0)
            .ok_or_else(|| Error::NotFound(format!("{}/{}", namespace, name)))?;

        if entry.version.to_string() != expected_version {
            return Err(Error::Conflict(format!("{}/{}", namespace, name)));
        }
        entry.version += 1;
        entry.status = status.clone();
        entry.tx.send_replace(Some(status.clone()));
        Ok(entry.version.to_string())
    }

    fn subscribe(&self, namespace: &str, name: &str) -> watch::Receiver<Option<PostgresClusterStatus>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry((namespace.to_string(), name.to_string()))
            .or_insert_with(|| MemoryEntry {
                version: 0,
                status: PostgresClusterStatus::default(),
                tx: watch::channel(None).0,
            })
            .tx
            .subscribe()
    }
}
