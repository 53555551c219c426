//! Simulated cluster used by the functional tests

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::Client;

use pgha_operator::OperatorConfig;
use pgha_operator::controller::fencing::plan_fencing;
use pgha_operator::controller::operations::{apply_topology, find_exhausted_instances};
use pgha_operator::controller::state_machine::advance_phase;
use pgha_operator::controller::topology::{TopologyAction, TopologyInput, plan_topology};
use pgha_operator::controller::{
    Context, Error, FencedInstances, Instance, InstanceRegistry, MemoryStatusStore, Result, StatusStore,
    TransitionContext, update_status,
};
use pgha_operator::crd::{
    ClusterPhase, ExtensionSpec, PENDING_FAILOVER_MARKER, PostgresCluster, PostgresClusterStatus, PromotionKind,
};
use pgha_operator::objectstore::MemoryObjectStoreProvider;
use pgha_operator::postgres::{
    BackupRequest, InstalledExtension, InstanceClient, InstanceStatus, Lsn, ReplicationSlot,
    PGDATA_MOUNT, VolumeUsage, WalHealth,
};

use crate::common::*;

pub const NAMESPACE: &str = "default";
pub const CLUSTER: &str = "pg";

pub const ROOMY_VOLUME: VolumeUsage = VolumeUsage {
    total_bytes: 10 << 30,
    used_bytes: 1 << 30,
    available_bytes: 9 << 30,
};

pub const FULL_VOLUME: VolumeUsage = VolumeUsage {
    total_bytes: 10 << 30,
    used_bytes: (10 << 30) - (4 << 20),
    available_bytes: 4 << 20,
};

/// One simulated PostgreSQL instance
#[derive(Clone, Debug)]
pub struct FakeInstance {
    pub ready: bool,
    /// Answers status probes
    pub reachable: bool,
    pub is_primary: bool,
    pub timeline: u32,
    pub replay_lsn: u64,
    pub wal_receiver_active: bool,
    pub node_draining: bool,
    /// Usage of the volume holding WAL
    pub volume: VolumeUsage,
    pub slots: Vec<ReplicationSlot>,
    pub extensions: BTreeMap<String, Vec<InstalledExtension>>,
}

impl FakeInstance {
    pub fn primary() -> Self {
        Self {
            ready: true,
            reachable: true,
            is_primary: true,
            timeline: 1,
            replay_lsn: 0,
            wal_receiver_active: false,
            node_draining: false,
            volume: ROOMY_VOLUME,
            slots: Vec::new(),
            extensions: BTreeMap::new(),
        }
    }

    pub fn standby(replay_lsn: u64) -> Self {
        Self {
            is_primary: false,
            replay_lsn,
            ..Self::primary()
        }
    }
}

/// [`InstanceClient`] over a map of simulated instances
#[derive(Default)]
pub struct FakeInstances {
    instances: Mutex<BTreeMap<String, FakeInstance>>,
    calls: Mutex<Vec<String>>,
    /// Databases whose extension listing fails
    broken_databases: Mutex<Vec<String>>,
}

impl FakeInstances {
    pub fn new(instances: &[(&str, FakeInstance)]) -> Self {
        let fake = Self::default();
        for (name, instance) in instances {
            fake.instances
                .lock()
                .unwrap()
                .insert(name.to_string(), instance.clone());
        }
        fake
    }

    pub fn get(&self, name: &str) -> FakeInstance {
        self.instances.lock().unwrap()[name].clone()
    }

    pub fn update(&self, name: &str, f: impl FnOnce(&mut FakeInstance)) {
        f(self.instances.lock().unwrap().get_mut(name).unwrap());
    }

    /// Pod not ready and postgres unreachable
    pub fn kill(&self, name: &str) {
        self.update(name, |i| {
            i.ready = false;
            i.reachable = false;
        });
    }

    /// WAL volume filled up: postgres stopped and the pod is not ready
    pub fn fill_volume(&self, name: &str) {
        self.update(name, |i| {
            i.ready = false;
            i.reachable = false;
            i.volume = FULL_VOLUME;
        });
    }

    /// The volume was grown; postgres is still starting
    pub fn grow_volume(&self, name: &str) {
        self.update(name, |i| {
            i.volume = VolumeUsage {
                total_bytes: 20 << 30,
                ..ROOMY_VOLUME
            };
        });
    }

    /// Postgres is back up with its previous role
    pub fn restart(&self, name: &str) {
        self.update(name, |i| {
            i.ready = true;
            i.reachable = true;
        });
    }

    pub fn break_database(&self, database: &str) {
        self.broken_databases.lock().unwrap().push(database.to_string());
    }

    /// Commands received so far, as `verb pod [arg]`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn registry(&self) -> InstanceRegistry {
        let instances = self.instances.lock().unwrap();
        let observed: Vec<_> = instances
            .iter()
            .map(|(name, fake)| {
                let serial = name.trim_start_matches("pg-").parse().unwrap();
                Instance {
                    node_draining: fake.node_draining,
                    ..instance(serial, fake.ready)
                }
            })
            .collect();
        InstanceRegistry::from_instances(observed)
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn reachable(&self, pod: &str) -> Result<FakeInstance> {
        let instances = self.instances.lock().unwrap();
        match instances.get(pod) {
            Some(i) if i.reachable => Ok(i.clone()),
            _ => Err(Error::ExecFailed {
                pod: pod.to_string(),
                message: "connection refused".to_string(),
            }),
        }
    }
}

#[async_trait]
impl InstanceClient for FakeInstances {
    async fn status(&self, _namespace: &str, pod: &str) -> Result<InstanceStatus> {
        let i = self.reachable(pod)?;
        let lsn = Some(Lsn(i.replay_lsn));
        Ok(InstanceStatus {
            is_primary: i.is_primary,
            timeline: Some(i.timeline),
            receive_lsn: (!i.is_primary).then_some(Lsn(i.replay_lsn)),
            replay_lsn: (!i.is_primary).then_some(Lsn(i.replay_lsn)),
            current_lsn: if i.is_primary { lsn } else { None },
            wal_receiver_active: i.wal_receiver_active,
        })
    }

    async fn promote(&self, _namespace: &str, pod: &str) -> Result<()> {
        self.reachable(pod)?;
        self.record(format!("promote {}", pod));
        let mut instances = self.instances.lock().unwrap();
        let timeline = instances.values().map(|i| i.timeline).max().unwrap_or(1) + 1;
        let promoted = instances.get_mut(pod).unwrap();
        promoted.is_primary = true;
        promoted.timeline = timeline;
        promoted.wal_receiver_active = false;
        Ok(())
    }

    async fn demote(&self, _namespace: &str, pod: &str) -> Result<()> {
        self.reachable(pod)?;
        self.record(format!("demote {}", pod));
        self.update(pod, |i| i.is_primary = false);
        Ok(())
    }

    // `df` runs even while postgres is down
    async fn volume_usage(&self, _namespace: &str, pod: &str, _path: &str) -> Result<VolumeUsage> {
        let instances = self.instances.lock().unwrap();
        instances.get(pod).map(|i| i.volume).ok_or_else(|| Error::ExecFailed {
            pod: pod.to_string(),
            message: "pod not found".to_string(),
        })
    }

    async fn wal_health(&self, _namespace: &str, pod: &str) -> Result<WalHealth> {
        self.reachable(pod)?;
        Ok(WalHealth {
            archive_healthy: true,
            ..Default::default()
        })
    }

    async fn list_replication_slots(
        &self,
        _namespace: &str,
        pod: &str,
        prefix: &str,
    ) -> Result<Vec<ReplicationSlot>> {
        let i = self.reachable(pod)?;
        Ok(i.slots.into_iter().filter(|s| s.name.starts_with(prefix)).collect())
    }

    async fn create_replication_slot(&self, _namespace: &str, pod: &str, name: &str) -> Result<()> {
        self.reachable(pod)?;
        self.record(format!("create_slot {} {}", pod, name));
        self.update(pod, |i| {
            i.slots.push(ReplicationSlot {
                name: name.to_string(),
                active: false,
                restart_lsn: Some(Lsn(i.replay_lsn)),
            })
        });
        Ok(())
    }

    async fn drop_replication_slot(&self, _namespace: &str, pod: &str, name: &str) -> Result<()> {
        self.reachable(pod)?;
        self.record(format!("drop_slot {} {}", pod, name));
        self.update(pod, |i| i.slots.retain(|s| s.name != name));
        Ok(())
    }

    async fn advance_replication_slot(&self, _namespace: &str, pod: &str, name: &str, lsn: Lsn) -> Result<()> {
        self.reachable(pod)?;
        self.record(format!("advance_slot {} {}", pod, name));
        self.update(pod, |i| {
            for slot in i.slots.iter_mut().filter(|s| s.name == name) {
                slot.restart_lsn = Some(slot.restart_lsn.map_or(lsn, |l| l.max(lsn)));
            }
        });
        Ok(())
    }

    async fn list_extensions(
        &self,
        _namespace: &str,
        pod: &str,
        database: &str,
    ) -> Result<Vec<InstalledExtension>> {
        let i = self.reachable(pod)?;
        if self.broken_databases.lock().unwrap().iter().any(|d| d == database) {
            return Err(Error::ExecFailed {
                pod: pod.to_string(),
                message: format!("database \"{}\" does not exist", database),
            });
        }
        Ok(i.extensions.get(database).cloned().unwrap_or_default())
    }

    async fn create_extension(
        &self,
        _namespace: &str,
        pod: &str,
        database: &str,
        extension: &ExtensionSpec,
    ) -> Result<()> {
        self.reachable(pod)?;
        self.record(format!("create_extension {} {}", database, extension.name));
        self.update(pod, |i| {
            i.extensions
                .entry(database.to_string())
                .or_default()
                .push(InstalledExtension {
                    name: extension.name.clone(),
                    version: extension.version.clone().unwrap_or_else(|| "1.0".to_string()),
                })
        });
        Ok(())
    }

    async fn start_backup(&self, _namespace: &str, pod: &str, request: &BackupRequest) -> Result<()> {
        self.reachable(pod)?;
        self.record(format!("backup {} {}", pod, request.name));
        Ok(())
    }
}

/// Client for an API server that is never reached
///
/// Event publication fails and is only logged, so it never affects a test.
pub fn offline_client() -> Client {
    let config = kube::Config::new("http://127.0.0.1:9".parse().unwrap());
    Client::try_from(config).unwrap()
}

/// A cluster, its status, instances and bucket wired into one [`Context`]
pub struct Simulation {
    pub cluster: PostgresCluster,
    pub store: Arc<MemoryStatusStore>,
    pub instances: Arc<FakeInstances>,
    pub buckets: MemoryObjectStoreProvider,
    pub ctx: Context,
    /// The cluster's `fencedInstances` annotation
    fence_annotation: Mutex<Option<String>>,
}

impl Simulation {
    /// Three instances with `pg-1` as primary on timeline 1
    pub fn three_instances(lsn_2: u64, lsn_3: u64) -> Self {
        let cluster = PostgresClusterBuilder::ha(CLUSTER, NAMESPACE)
            .with_failover_delay(0)
            .build();
        let instances = FakeInstances::new(&[
            ("pg-1", FakeInstance::primary()),
            ("pg-2", FakeInstance::standby(lsn_2)),
            ("pg-3", FakeInstance::standby(lsn_3)),
        ]);
        let status = PostgresClusterStatus {
            phase: ClusterPhase::Ready,
            ..status_with_primary("pg-1")
        };
        Self::new(cluster, instances, status)
    }

    pub fn new(cluster: PostgresCluster, instances: FakeInstances, status: PostgresClusterStatus) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug,kube=warn,hyper=warn")
            .with_test_writer()
            .try_init();

        let store = Arc::new(MemoryStatusStore::new());
        store.insert(NAMESPACE, CLUSTER, status);
        let instances = Arc::new(instances);
        let buckets = MemoryObjectStoreProvider::new();
        let ctx = Context::new(offline_client(), None, Arc::new(OperatorConfig::default()))
            .unwrap()
            .with_status_store(store.clone())
            .with_instance_client(instances.clone())
            .with_object_stores(Arc::new(buckets.clone()));
        Self {
            cluster,
            store,
            instances,
            buckets,
            ctx,
            fence_annotation: Mutex::new(None),
        }
    }

    pub fn fence_annotation(&self) -> Option<String> {
        self.fence_annotation.lock().unwrap().clone()
    }

    /// A user edit of the fence annotation
    pub fn set_fence_annotation(&self, value: Option<&str>) {
        *self.fence_annotation.lock().unwrap() = value.map(String::from);
    }

    pub async fn status(&self) -> PostgresClusterStatus {
        self.store.get(NAMESPACE, CLUSTER).await.unwrap().status
    }

    async fn probe(&self) -> BTreeMap<String, InstanceStatus> {
        let registry = self.instances.registry();
        let mut probes = BTreeMap::new();
        for instance in registry.iter() {
            if let Ok(status) = self.instances.status(NAMESPACE, &instance.name).await {
                probes.insert(instance.name.clone(), status);
            }
        }
        probes
    }

    /// One reconcile pass at `now`: fencing, a topology step, then the phase
    pub async fn step(&self, now: DateTime<Utc>) -> TopologyAction {
        let registry = self.instances.registry();
        let probes = self.probe().await;
        let status = self.status().await;

        let current = FencedInstances::parse(self.fence_annotation().as_deref()).unwrap();
        let exhausted = find_exhausted_instances(self.instances.as_ref(), NAMESPACE, &registry, PGDATA_MOUNT).await;
        let fencing = plan_fencing(&current, &status.disk_pressure_instances, &exhausted);
        if fencing.annotation_changed() {
            self.set_fence_annotation(Some(&fencing.fenced.to_annotation()));
        }

        let action = plan_topology(&TopologyInput {
            registry: &registry,
            status: &status,
            fenced: &fencing.fenced,
            probes: &probes,
            failover_delay: Duration::from_secs(self.cluster.spec.failover_delay.into()),
            wal_receiver_timeout: self.ctx.config.wal_receiver_timeout(),
            fence_recovery_timeout: self.ctx.config.fence_recovery_timeout(),
            now,
        });
        apply_topology(&self.ctx, &self.cluster, &action, now).await.unwrap();

        let status = self.status().await;
        let primary_ready = status
            .current_primary
            .as_deref()
            .and_then(|p| registry.get(p))
            .is_some_and(|i| i.is_healthy());
        let failover_in_progress = status.target_primary.as_deref() == Some(PENDING_FAILOVER_MARKER)
            || status
                .promotion
                .as_ref()
                .is_some_and(|p| p.kind == PromotionKind::Failover);
        let count = |n: usize| i32::try_from(n).unwrap();
        let tctx = TransitionContext {
            ready_instances: count(registry.ready_count()),
            desired_instances: self.cluster.spec.instances,
            existing_instances: count(registry.len()),
            primary_ready,
            failover_in_progress,
            switchover_in_progress: status.promotion_in_progress() && !failover_in_progress,
            no_eligible_standby: matches!(action, TopologyAction::NoEligibleStandby { .. }),
            disk_pressure: !fencing.disk_pressure_instances.is_empty(),
            ..Default::default()
        };
        let (phase, reason) = advance_phase(status.phase, status.phase_reason.as_deref(), &tctx);
        let reason = (!reason.is_empty()).then_some(reason);
        let fenced = fencing.fenced.to_status();

        let unchanged = status.phase == phase
            && status.phase_reason == reason
            && status.fenced_instances == fenced
            && status.disk_pressure_instances == fencing.disk_pressure_instances;
        if !unchanged {
            update_status(self.store.as_ref(), NAMESPACE, CLUSTER, 3, |s| {
                s.phase = phase;
                s.phase_reason = reason.clone();
                s.fenced_instances = fenced.clone();
                s.disk_pressure_instances = fencing.disk_pressure_instances.clone();
                Ok(())
            })
            .await
            .unwrap();
        }
        action
    }

    /// Step until the topology is steady; returns every action taken
    pub async fn settle(&self, now: DateTime<Utc>) -> Vec<TopologyAction> {
        let mut actions = Vec::new();
        for _ in 0..20 {
            let action = self.step(now).await;
            if action == TopologyAction::Steady {
                return actions;
            }
            actions.push(action);
        }
        panic!("topology did not settle: {:?}", actions);
    }
}

/// Short names of the actions, for compact assertions
pub fn kinds(actions: &[TopologyAction]) -> Vec<&'static str> {
    actions
        .iter()
        .map(|a| match a {
            TopologyAction::Steady => "Steady",
            TopologyAction::WaitForBootstrap => "WaitForBootstrap",
            TopologyAction::AdoptPrimary { .. } => "AdoptPrimary",
            TopologyAction::MarkPrimaryFailing => "MarkPrimaryFailing",
            TopologyAction::ClearPrimaryFailing => "ClearPrimaryFailing",
            TopologyAction::MarkFenceLifted { .. } => "MarkFenceLifted",
            TopologyAction::AwaitFencedPrimary { .. } => "AwaitFencedPrimary",
            TopologyAction::AwaitFailoverDelay { .. } => "AwaitFailoverDelay",
            TopologyAction::BeginFailover { .. } => "BeginFailover",
            TopologyAction::WaitForWalReceivers { .. } => "WaitForWalReceivers",
            TopologyAction::ElectPrimary { .. } => "ElectPrimary",
            TopologyAction::CancelFailover => "CancelFailover",
            TopologyAction::NoEligibleStandby { .. } => "NoEligibleStandby",
            TopologyAction::BeginSwitchover { .. } => "BeginSwitchover",
            TopologyAction::Demote { .. } => "Demote",
            TopologyAction::Promote { .. } => "Promote",
            TopologyAction::CompletePromotion { .. } => "CompletePromotion",
            TopologyAction::AbortSwitchover { .. } => "AbortSwitchover",
            TopologyAction::RestartElection { .. } => "RestartElection",
        })
        .collect()
}
