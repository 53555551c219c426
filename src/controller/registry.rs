//! Instance registry
//!
//! A per-pass view of a cluster's instances built from pods, PVCs and nodes.
//! Role comes from `status.currentPrimary`, never from what an instance
//! reports about itself.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod};
use kube::ResourceExt;

use crate::resources::common::LABEL_FENCED;
use crate::resources::instance::{parse_serial, pod_image};
use crate::resources::pvc::{pvc_instance, pvc_role};
use crate::crd::PvcRole;

/// Taints that mean a node is being drained
pub const DEFAULT_DRAIN_TAINTS: [&str; 3] = [
    "node.kubernetes.io/unschedulable",
    "ToBeDeletedByClusterAutoscaler",
    "karpenter.sh/disrupted",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instance {
    pub name: String,
    pub serial: i32,
    pub node: Option<String>,
    pub ready: bool,
    /// Pod failed with reason Evicted
    pub evicted: bool,
    /// Pod has a deletion timestamp
    pub deleting: bool,
    pub image: Option<String>,
    /// Value of the fenced pod label
    pub fenced_label: bool,
    /// Node is unschedulable or carries a drain taint
    pub node_draining: bool,
    pub pvcs: BTreeMap<PvcRole, String>,
}

impl Instance {
    /// Running, ready and not on its way out
    pub fn is_healthy(&self) -> bool {
        self.ready && !self.evicted && !self.deleting
    }
}

/// Instances of one cluster, ordered by serial
#[derive(Clone, Debug, Default)]
pub struct InstanceRegistry {
    instances: BTreeMap<i32, Instance>,
    /// Serials that have PVCs but no pod
    orphan_pvcs: BTreeMap<i32, BTreeMap<PvcRole, String>>,
}

impl InstanceRegistry {
    pub fn from_objects(
        cluster_name: &str,
        pods: &[Pod],
        pvcs: &[PersistentVolumeClaim],
        nodes: &[Node],
        drain_taints: &[String],
    ) -> Self {
        let draining_nodes: BTreeSet<String> = nodes
            .iter()
            .filter(|n| node_is_draining(n, drain_taints))
            .map(|n| n.name_any())
            .collect();

        let mut claims: BTreeMap<i32, BTreeMap<PvcRole, String>> = BTreeMap::new();
        for pvc in pvcs {
            let (Some(instance), Some(role)) = (pvc_instance(pvc), pvc_role(pvc)) else {
                continue;
            };
            if let Some(serial) = parse_serial(cluster_name, instance) {
                claims.entry(serial).or_default().insert(role, pvc.name_any());
            }
        }

        let mut instances = BTreeMap::new();
        for pod in pods {
            let name = pod.name_any();
            let Some(serial) = parse_serial(cluster_name, &name) else {
                continue;
            };
            let node = pod.spec.as_ref().and_then(|s| s.node_name.clone());
            let node_draining = node.as_ref().is_some_and(|n| draining_nodes.contains(n));
            instances.insert(
                serial,
                Instance {
                    serial,
                    node,
                    ready: pod_is_ready(pod),
                    evicted: pod_is_evicted(pod),
                    deleting: pod.metadata.deletion_timestamp.is_some(),
                    image: pod_image(pod).map(str::to_string),
                    fenced_label: pod.labels().get(LABEL_FENCED).is_some_and(|v| v == "true"),
                    node_draining,
                    pvcs: claims.remove(&serial).unwrap_or_default(),
                    name,
                },
            );
        }

        Self {
            instances,
            orphan_pvcs: claims,
        }
    }

    pub fn from_instances(instances: Vec<Instance>) -> Self {
        Self {
            instances: instances.into_iter().map(|i| (i.serial, i)).collect(),
            orphan_pvcs: BTreeMap::new(),
        }
    }

    pub fn with_orphan_pvcs(mut self, serial: i32, pvcs: BTreeMap<PvcRole, String>) -> Self {
        self.orphan_pvcs.insert(serial, pvcs);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Instance> {
        self.instances.values().find(|i| i.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.instances.values().map(|i| i.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn ready_count(&self) -> usize {
        self.instances.values().filter(|i| i.is_healthy()).count()
    }

    /// Standbys relative to the given primary, in serial order
    pub fn standbys<'a>(&'a self, primary: Option<&'a str>) -> impl Iterator<Item = &'a Instance> + 'a {
        self.instances
            .values()
            .filter(move |i| Some(i.name.as_str()) != primary)
    }

    pub fn highest_serial(&self) -> Option<i32> {
        let pods = self.instances.keys().next_back().copied();
        let orphans = self.orphan_pvcs.keys().next_back().copied();
        pods.max(orphans)
    }

    /// Serials whose pod is gone but whose PVCs survive
    pub fn orphan_serials(&self) -> impl Iterator<Item = i32> + '_ {
        self.orphan_pvcs.keys().copied()
    }

    pub fn orphan_pvcs(&self, serial: i32) -> Option<&BTreeMap<PvcRole, String>> {
        self.orphan_pvcs.get(&serial)
    }
}

pub fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

pub fn pod_is_evicted(pod: &Pod) -> bool {
    pod.status.as_ref().is_some_and(|s| {
        s.phase.as_deref() == Some("Failed") && s.reason.as_deref() == Some("Evicted")
    })
}

pub fn node_is_draining(node: &Node, drain_taints: &[String]) -> bool {
    let Some(spec) = &node.spec else {
        return false;
    };
    if spec.unschedulable == Some(true) {
        return true;
    }
    spec.taints
        .as_ref()
        .is_some_and(|taints| taints.iter().any(|t| drain_taints.iter().any(|d| *d == t.key)))
}
