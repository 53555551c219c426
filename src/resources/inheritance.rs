//! Metadata inheritance
//!
//! Which labels and annotations of a PostgresCluster are copied onto the
//! objects generated for it. Rules are an ordered list of key patterns; the
//! first matching rule decides.

use std::collections::BTreeMap;

use glob::Pattern;
use kube::ResourceExt;

use crate::controller::error::{Error, Result};
use crate::crd::PostgresCluster;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InheritancePolicy {
    Never,
    /// Copied to instance pods only
    PodsOnly,
    /// Copied to every generated object
    AllResources,
}

#[derive(Clone, Debug)]
pub struct InheritanceRule {
    pub pattern: Pattern,
    pub policy: InheritancePolicy,
}

impl InheritanceRule {
    fn new(pattern: &str, policy: InheritancePolicy) -> Result<Self> {
        let pattern = Pattern::new(pattern).map_err(|e| {
            Error::InvalidConfig(format!("invalid inheritance pattern '{}': {}", pattern, e))
        })?;
        Ok(Self { pattern, policy })
    }
}

/// Keys the operator owns and never copies
pub const OPERATOR_OWNED_PATTERNS: [&str; 2] = ["pgha.smoketurner.com/*", "kubectl.kubernetes.io/*"];

/// Per-container AppArmor profiles only make sense on pods
pub const POD_ONLY_PATTERNS: [&str; 1] = ["container.apparmor.security.beta.kubernetes.io/*"];

#[derive(Clone, Debug)]
pub struct InheritanceRules {
    annotation_rules: Vec<InheritanceRule>,
    label_rules: Vec<InheritanceRule>,
}

impl Default for InheritanceRules {
    fn default() -> Self {
        Self {
            annotation_rules: base_rules(),
            label_rules: base_rules(),
        }
    }
}

fn base_rules() -> Vec<InheritanceRule> {
    OPERATOR_OWNED_PATTERNS
        .iter()
        .map(|p| (p, InheritancePolicy::Never))
        .chain(POD_ONLY_PATTERNS.iter().map(|p| (p, InheritancePolicy::PodsOnly)))
        .filter_map(|(p, policy)| InheritanceRule::new(p, policy).ok())
        .collect()
}

impl InheritanceRules {
    /// Build rules from the operator's `--inherited-annotations` and
    /// `--inherited-labels` glob lists
    pub fn new(inherited_annotations: &[String], inherited_labels: &[String]) -> Result<Self> {
        let mut rules = Self::default();
        for pattern in inherited_annotations {
            rules
                .annotation_rules
                .push(InheritanceRule::new(pattern, InheritancePolicy::AllResources)?);
        }
        for pattern in inherited_labels {
            rules
                .label_rules
                .push(InheritanceRule::new(pattern, InheritancePolicy::AllResources)?);
        }
        Ok(rules)
    }

    pub fn annotation_policy(&self, key: &str) -> InheritancePolicy {
        first_match(&self.annotation_rules, key)
    }

    pub fn label_policy(&self, key: &str) -> InheritancePolicy {
        first_match(&self.label_rules, key)
    }

    /// Resolve the metadata to copy for one cluster
    pub fn evaluate(&self, cluster: &PostgresCluster) -> InheritedMetadata {
        let mut inherited = InheritedMetadata::default();

        for (key, value) in cluster.labels() {
            match self.label_policy(key) {
                InheritancePolicy::Never => {}
                InheritancePolicy::PodsOnly => {
                    inherited.pod_labels.insert(key.clone(), value.clone());
                }
                InheritancePolicy::AllResources => {
                    inherited.labels.insert(key.clone(), value.clone());
                    inherited.pod_labels.insert(key.clone(), value.clone());
                }
            }
        }

        for (key, value) in cluster.annotations() {
            match self.annotation_policy(key) {
                InheritancePolicy::Never => {}
                InheritancePolicy::PodsOnly => {
                    inherited.pod_annotations.insert(key.clone(), value.clone());
                }
                InheritancePolicy::AllResources => {
                    inherited.annotations.insert(key.clone(), value.clone());
                    inherited.pod_annotations.insert(key.clone(), value.clone());
                }
            }
        }

        if let Some(spec) = &cluster.spec.inherited_metadata {
            for (key, value) in &spec.labels {
                inherited.labels.insert(key.clone(), value.clone());
                inherited.pod_labels.insert(key.clone(), value.clone());
            }
            for (key, value) in &spec.annotations {
                inherited.annotations.insert(key.clone(), value.clone());
                inherited.pod_annotations.insert(key.clone(), value.clone());
            }
        }

        inherited
    }
}

fn first_match(rules: &[InheritanceRule], key: &str) -> InheritancePolicy {
    rules
        .iter()
        .find(|r| r.pattern.matches(key))
        .map(|r| r.policy)
        .unwrap_or(InheritancePolicy::Never)
}

/// Labels and annotations resolved for one reconcile pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InheritedMetadata {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub pod_labels: BTreeMap<String, String>,
    pub pod_annotations: BTreeMap<String, String>,
}
