mod backup;
mod postgres_cluster;
mod scheduled_backup;

pub use backup::*;
pub use postgres_cluster::*;
pub use scheduled_backup::*;
