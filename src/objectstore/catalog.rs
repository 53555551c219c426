//! barman-cloud catalog
//!
//! Layout under `<destinationPath>/<serverName>/`:
//!
//! ```text
//! base/<backup id>/backup.info
//! base/<backup id>/data.tar
//! wals/<timeline><log>/<segment>[.gz]
//! wals/<timeline>.history[.gz]
//! ```

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use super::{ObjectStore, parse_destination};
use crate::controller::error::Result;
use crate::crd::ObjectStoreConfiguration;
use crate::postgres::wal::{WalSegment, parse_history_file_name};

/// Where one server's backups live inside a bucket
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BarmanLocation {
    pub destination_path: String,
    pub server_name: String,
    root: String,
}

impl BarmanLocation {
    pub fn new(config: &ObjectStoreConfiguration, cluster_name: &str) -> Result<Self> {
        let (_, prefix) = parse_destination(&config.destination_path)?;
        let server_name = config
            .server_name
            .clone()
            .unwrap_or_else(|| cluster_name.to_string());
        let root = if prefix.is_empty() {
            server_name.clone()
        } else {
            format!("{}/{}", prefix, server_name)
        };
        Ok(Self {
            destination_path: config.destination_path.clone(),
            server_name,
            root,
        })
    }

    pub fn base_prefix(&self) -> String {
        format!("{}/base/", self.root)
    }

    pub fn backup_info_key(&self, backup_id: &str) -> String {
        format!("{}/base/{}/backup.info", self.root, backup_id)
    }

    pub fn data_tar_key(&self, backup_id: &str) -> String {
        format!("{}/base/{}/data.tar", self.root, backup_id)
    }

    pub fn wals_prefix(&self) -> String {
        format!("{}/wals/", self.root)
    }

    pub fn wal_dir_prefix(&self, segment: &WalSegment) -> String {
        format!("{}/wals/{}/", self.root, segment.archive_dir())
    }
}

/// Parsed `backup.info`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackupInfo {
    pub id: String,
    pub backup_name: Option<String>,
    pub status: String,
    pub begin_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub begin_wal: Option<String>,
    pub end_wal: Option<String>,
    pub begin_lsn: Option<String>,
    pub end_lsn: Option<String>,
    pub timeline: Option<u32>,
    pub error: Option<String>,
}

pub const BACKUP_STATUS_DONE: &str = "DONE";
pub const BACKUP_STATUS_FAILED: &str = "FAILED";

impl BackupInfo {
    /// Parse the `key=value` file barman writes next to each base backup
    pub fn parse(id: &str, content: &str) -> Self {
        let mut info = BackupInfo {
            id: id.to_string(),
            ..Default::default()
        };

        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() || value == "None" {
                continue;
            }
            match key.trim() {
                "backup_name" => info.backup_name = Some(value.to_string()),
                "status" => info.status = value.to_string(),
                "begin_time" => info.begin_time = parse_barman_time(value),
                "end_time" => info.end_time = parse_barman_time(value),
                "begin_wal" => info.begin_wal = Some(value.to_string()),
                "end_wal" => info.end_wal = Some(value.to_string()),
                "begin_xlog" => info.begin_lsn = Some(value.to_string()),
                "end_xlog" => info.end_lsn = Some(value.to_string()),
                "timeline" => info.timeline = value.parse().ok(),
                "error" => info.error = Some(value.to_string()),
                _ => {}
            }
        }

        info
    }

    pub fn is_done(&self) -> bool {
        self.status == BACKUP_STATUS_DONE
    }

    pub fn is_failed(&self) -> bool {
        self.status == BACKUP_STATUS_FAILED
    }
}

/// barman writes `2024-01-15 10:30:00.123456+00:00`
pub fn parse_barman_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%:z")
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Every base backup found for one server, ordered by end time
#[derive(Clone, Debug, Default)]
pub struct BackupCatalog {
    pub backups: Vec<BackupInfo>,
}

impl BackupCatalog {
    pub async fn load(store: &dyn ObjectStore, location: &BarmanLocation) -> Result<Self> {
        let prefix = location.base_prefix();
        let mut backups = Vec::new();

        for key in store.list(&prefix).await? {
            let Some(id) = key
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix("/backup.info"))
            else {
                continue;
            };
            if id.contains('/') {
                continue;
            }
            if let Some(content) = store.get(&key).await? {
                backups.push(BackupInfo::parse(id, &String::from_utf8_lossy(&content)));
            }
        }

        Ok(Self::from_backups(backups))
    }

    pub fn from_backups(mut backups: Vec<BackupInfo>) -> Self {
        backups.sort_by(|a, b| a.end_time.cmp(&b.end_time).then_with(|| a.id.cmp(&b.id)));
        Self { backups }
    }

    pub fn completed(&self) -> impl Iterator<Item = &BackupInfo> {
        self.backups
            .iter()
            .filter(|b| b.is_done() && b.end_time.is_some())
    }

    /// End time of the oldest completed backup
    pub fn first_recoverability_point(&self) -> Option<DateTime<Utc>> {
        self.completed().filter_map(|b| b.end_time).min()
    }

    pub fn latest(&self) -> Option<&BackupInfo> {
        self.completed().last()
    }

    pub fn find_by_name(&self, name: &str) -> Option<&BackupInfo> {
        self.backups
            .iter()
            .rev()
            .find(|b| b.backup_name.as_deref() == Some(name))
    }

    pub fn find_by_id(&self, id: &str) -> Option<&BackupInfo> {
        self.backups.iter().find(|b| b.id == id)
    }

    /// Newest completed backup that ended strictly before `target`, or the
    /// newest overall when there is no target
    pub fn backup_for_target(&self, target: Option<DateTime<Utc>>) -> Option<&BackupInfo> {
        match target {
            None => self.latest(),
            Some(t) => self
                .completed()
                .filter(|b| b.end_time.is_some_and(|end| end < t))
                .last(),
        }
    }
}

/// Strip the compression extension barman adds to archived files
fn strip_compression(file: &str) -> &str {
    const EXTENSIONS: [&str; 6] = [".gz", ".bz2", ".xz", ".snappy", ".lz4", ".zst"];
    EXTENSIONS
        .iter()
        .find_map(|ext| file.strip_suffix(ext))
        .unwrap_or(file)
}

/// Segment names archived in the directory holding `segment`
pub async fn archived_segments(
    store: &dyn ObjectStore,
    location: &BarmanLocation,
    segment: &WalSegment,
) -> Result<BTreeSet<String>> {
    let prefix = location.wal_dir_prefix(segment);
    Ok(store
        .list(&prefix)
        .await?
        .iter()
        .filter_map(|key| key.strip_prefix(&prefix))
        .map(|file| strip_compression(file).to_string())
        .collect())
}

/// Timelines that have an archived history file
pub async fn archived_history_timelines(
    store: &dyn ObjectStore,
    location: &BarmanLocation,
) -> Result<Vec<u32>> {
    let prefix = location.wals_prefix();
    let mut timelines: Vec<u32> = store
        .list(&prefix)
        .await?
        .iter()
        .filter_map(|key| key.strip_prefix(&prefix))
        .filter(|rest| !rest.contains('/'))
        .filter_map(|file| parse_history_file_name(strip_compression(file)))
        .collect();
    timelines.sort_unstable();
    timelines.dedup();
    Ok(timelines)
}
