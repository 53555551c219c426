//! PostgreSQL-level primitives and the seam to the instance manager

pub mod instance_client;
pub mod lsn;
pub mod wal;

pub use instance_client::{
    BackupRequest, ExecInstanceClient, InactiveSlot, InstalledExtension, InstanceClient,
    InstanceStatus, ReplicationSlot, VolumeUsage, WalHealth,
};
pub use lsn::Lsn;
pub use wal::{WAL_SEGMENT_SIZE, WalSegment};

/// Data directory inside the postgres container
pub const PGDATA_MOUNT: &str = "/var/lib/postgresql/data";
pub const PGDATA_PATH: &str = "/var/lib/postgresql/data/pgdata";
/// Mount point of the dedicated WAL volume
pub const PGWAL_MOUNT: &str = "/var/lib/postgresql/wal";

/// Name of the postgres container in instance pods
pub const POSTGRES_CONTAINER: &str = "postgres";
