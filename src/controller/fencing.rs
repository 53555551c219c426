//! Fencing
//!
//! A fenced instance is taken out of every service and is never a promotion
//! target. The set lives in the `fencedInstances` annotation as a sorted
//! JSON array; `"*"` fences every instance. The operator only ever adds to
//! the set. Users unfence by editing the annotation.

use std::collections::BTreeSet;

use crate::controller::error::{Error, Result};
use crate::postgres::{VolumeUsage, WAL_SEGMENT_SIZE};

pub const FENCE_ALL: &str = "*";

/// Used-space percentage at which a full volume is assumed
pub const DISK_FULL_PERCENT: u8 = 99;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FencedInstances {
    all: bool,
    names: BTreeSet<String>,
}

impl FencedInstances {
    /// Parse the annotation value; a missing or empty annotation fences nothing
    pub fn parse(annotation: Option<&str>) -> Result<Self> {
        let Some(raw) = annotation.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(Self::default());
        };
        let names: Vec<String> = serde_json::from_str(raw).map_err(|e| {
            Error::InvalidConfig(format!("fencedInstances must be a JSON array of strings: {}", e))
        })?;

        let mut fenced = Self::default();
        for name in names {
            if name == FENCE_ALL {
                fenced.all = true;
            } else if name.is_empty() {
                return Err(Error::InvalidConfig(
                    "fencedInstances contains an empty name".to_string(),
                ));
            } else {
                fenced.names.insert(name);
            }
        }
        Ok(fenced)
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut fenced = Self::default();
        for name in names {
            let name = name.into();
            if name == FENCE_ALL {
                fenced.all = true;
            } else {
                fenced.names.insert(name);
            }
        }
        fenced
    }

    pub fn all() -> Self {
        Self {
            all: true,
            names: BTreeSet::new(),
        }
    }

    pub fn is_all(&self) -> bool {
        self.all
    }

    pub fn is_empty(&self) -> bool {
        !self.all && self.names.is_empty()
    }

    pub fn is_fenced(&self, instance: &str) -> bool {
        self.all || self.names.contains(instance)
    }

    /// Add an instance; returns false if it was already fenced
    pub fn fence(&mut self, instance: &str) -> bool {
        if self.is_fenced(instance) {
            return false;
        }
        self.names.insert(instance.to_string())
    }

    /// Remove an instance from the set
    pub fn unfence(&mut self, instance: &str) -> Result<bool> {
        if instance == FENCE_ALL {
            let changed = !self.is_empty();
            *self = Self::default();
            return Ok(changed);
        }
        if self.all {
            return Err(Error::ValidationError(format!(
                "cannot unfence {} while all instances are fenced",
                instance
            )));
        }
        Ok(self.names.remove(instance))
    }

    /// Explicitly named instances, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Sorted JSON array for the annotation
    pub fn to_annotation(&self) -> String {
        let mut values: Vec<&str> = Vec::new();
        if self.all {
            values.push(FENCE_ALL);
        }
        values.extend(self.names());
        serde_json::to_string(&values).unwrap_or_else(|_| "[]".to_string())
    }

    /// Names to publish in status, `*` first when set
    pub fn to_status(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.all {
            out.push(FENCE_ALL.to_string());
        }
        out.extend(self.names.iter().cloned());
        out
    }
}

/// True when an instance has run out of WAL space
///
/// Only instances whose pod is not ready are considered. The volume is full
/// when less than one WAL segment is free or it is at least 99% used.
pub fn is_disk_exhausted(ready: bool, usage: &VolumeUsage) -> bool {
    !ready && (usage.available_bytes < WAL_SEGMENT_SIZE || usage.percent_used() >= DISK_FULL_PERCENT)
}

/// Result of a fencing pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FencingPlan {
    pub fenced: FencedInstances,
    /// Instances the operator fenced for disk pressure and that remain fenced
    pub disk_pressure_instances: Vec<String>,
    /// Fenced for the first time this pass
    pub newly_fenced: Vec<String>,
    /// Unfenced by a user while still full, fenced again
    pub reapplied: Vec<String>,
}

impl FencingPlan {
    pub fn annotation_changed(&self) -> bool {
        !self.newly_fenced.is_empty() || !self.reapplied.is_empty()
    }
}

/// Merge observed disk pressure into the current fence set
///
/// `previous_pressure` is `status.diskPressureInstances` from the last pass.
/// An entry the user removed from the annotation is re-added while its
/// volume is still full; once the volume has room the removal sticks.
pub fn plan_fencing(
    current: &FencedInstances,
    previous_pressure: &[String],
    exhausted: &BTreeSet<String>,
) -> FencingPlan {
    let mut fenced = current.clone();
    let mut newly_fenced = Vec::new();
    let mut reapplied = Vec::new();

    for instance in exhausted {
        if fenced.fence(instance) {
            if previous_pressure.iter().any(|p| p == instance) {
                reapplied.push(instance.clone());
            } else {
                newly_fenced.push(instance.clone());
            }
        }
    }

    let mut pressure: BTreeSet<String> = previous_pressure
        .iter()
        .filter(|p| fenced.is_fenced(p))
        .cloned()
        .collect();
    pressure.extend(exhausted.iter().cloned());

    FencingPlan {
        fenced,
        disk_pressure_instances: pressure.into_iter().collect(),
        newly_fenced,
        reapplied,
    }
}
