//! Point-in-time recovery planning
//!
//! Before the first instance of a recovered cluster is created the operator
//! picks the base backup, checks that every WAL segment it needs is in the
//! archive, and computes the timeline the restored cluster will start on.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, info};

use crate::controller::error::{Error, Result};
use crate::crd::RecoveryStatus;
use crate::objectstore::catalog::{archived_history_timelines, archived_segments};
use crate::objectstore::{BackupCatalog, BackupInfo, BarmanLocation, ObjectStore};
use crate::postgres::WalSegment;

/// A verified recovery plan
#[derive(Clone, Debug, PartialEq)]
pub struct RecoveryPlan {
    pub backup: BackupInfo,
    pub begin_wal: WalSegment,
    pub end_wal: WalSegment,
    pub target_time: Option<DateTime<Utc>>,
    /// Timeline the restored cluster is promoted onto
    pub expected_timeline: u32,
}

impl RecoveryPlan {
    pub fn source_timeline(&self) -> u32 {
        self.begin_wal.timeline
    }

    pub fn to_status(&self) -> RecoveryStatus {
        RecoveryStatus {
            backup_id: self.backup.id.clone(),
            source_timeline: self.source_timeline(),
            begin_wal: self.begin_wal.to_string(),
            end_wal: self.end_wal.to_string(),
            target_time: self.target_time.map(|t| t.to_rfc3339()),
            expected_timeline: self.expected_timeline,
            verified: true,
        }
    }
}

/// Parse a recovery target in RFC 3339 or PostgreSQL timestamp format
///
/// PostgreSQL timestamps without a zone are taken as UTC.
pub fn parse_target_time(value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%#z"))
        .map(|t| t.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f").map(|t| t.and_utc())
        })
        .map_err(|_| {
            Error::ValidationError(format!(
                "targetTime '{}' is neither RFC 3339 nor a PostgreSQL timestamp",
                value
            ))
        })
}

/// Choose a backup for the target and verify its WAL range is archived
///
/// `backup_id` pins a specific backup, as when restoring from a `Backup`
/// object; otherwise the newest backup that ended before the target is used.
pub async fn resolve_recovery_plan(
    store: &dyn ObjectStore,
    location: &BarmanLocation,
    backup_id: Option<&str>,
    target_time: Option<DateTime<Utc>>,
) -> Result<RecoveryPlan> {
    let catalog = BackupCatalog::load(store, location).await?;

    let backup = match backup_id {
        Some(id) => catalog
            .find_by_id(id)
            .filter(|b| b.is_done())
            .ok_or_else(|| Error::ValidationError(format!("backup '{}' is not a completed backup", id)))?,
        None => catalog.backup_for_target(target_time).ok_or_else(|| {
            Error::ValidationError(match target_time {
                Some(t) => format!("no completed backup ended before {}", t.to_rfc3339()),
                None => format!("no completed backup found for server '{}'", location.server_name),
            })
        })?,
    };

    if let (Some(target), Some(end)) = (target_time, backup.end_time)
        && end >= target
    {
        return Err(Error::ValidationError(format!(
            "backup '{}' ended at {}, after the target {}",
            backup.id,
            end.to_rfc3339(),
            target.to_rfc3339()
        )));
    }

    let begin_wal: WalSegment = backup
        .begin_wal
        .as_deref()
        .ok_or_else(|| Error::ValidationError(format!("backup '{}' has no begin_wal", backup.id)))?
        .parse()?;
    let end_wal: WalSegment = backup
        .end_wal
        .as_deref()
        .ok_or_else(|| Error::ValidationError(format!("backup '{}' has no end_wal", backup.id)))?
        .parse()?;

    let missing = missing_segments(store, location, &begin_wal, &end_wal).await?;
    if let Some(first) = missing.first() {
        return Err(Error::ValidationError(format!(
            "WAL segment {} required by backup '{}' is not archived ({} missing)",
            first,
            backup.id,
            missing.len()
        )));
    }

    let source_timeline = backup.timeline.unwrap_or(begin_wal.timeline);
    let histories = archived_history_timelines(store, location).await?;
    let expected_timeline = expected_timeline(source_timeline, &histories);

    info!(
        backup = %backup.id,
        begin_wal = %begin_wal,
        end_wal = %end_wal,
        expected_timeline,
        "recovery plan verified"
    );

    Ok(RecoveryPlan {
        backup: backup.clone(),
        begin_wal,
        end_wal,
        target_time,
        expected_timeline,
    })
}

/// Segments in `begin..=end` absent from the archive
pub async fn missing_segments(
    store: &dyn ObjectStore,
    location: &BarmanLocation,
    begin: &WalSegment,
    end: &WalSegment,
) -> Result<Vec<WalSegment>> {
    let range = begin.range_to(end);
    if range.is_empty() {
        return Err(Error::ValidationError(format!(
            "invalid WAL range {}..{}",
            begin, end
        )));
    }

    let mut listings: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut missing = Vec::new();
    for segment in range {
        let dir = segment.archive_dir();
        if !listings.contains_key(&dir) {
            debug!(dir = %dir, "listing archived WAL");
            listings.insert(dir.clone(), archived_segments(store, location, &segment).await?);
        }
        let present = listings
            .get(&dir)
            .is_some_and(|files| files.contains(&segment.to_string()));
        if !present {
            missing.push(segment);
        }
    }
    Ok(missing)
}

/// A restore always forks a new timeline past every archived one
pub fn expected_timeline(source_timeline: u32, history_timelines: &[u32]) -> u32 {
    history_timelines
        .iter()
        .copied()
        .fold(source_timeline, u32::max)
        .saturating_add(1)
}
