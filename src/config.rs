//! Operator configuration
//!
//! Every flag can also be set from the environment, which is how the
//! deployment manifest configures the operator.

use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::controller::registry::DEFAULT_DRAIN_TAINTS;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

#[derive(Clone, Debug, Parser)]
#[command(name = "pgha-operator", version, about = "Highly available PostgreSQL on Kubernetes")]
pub struct OperatorConfig {
    /// Only watch this namespace; all namespaces when unset
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Leader election identity
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,

    /// Namespace holding the leader election lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    pub pod_namespace: String,

    #[arg(long, env = "LEASE_NAME", default_value = "pgha-operator-leader")]
    pub lease_name: String,

    #[arg(long, env = "LEASE_TTL_SECS", default_value_t = 15)]
    pub lease_ttl_secs: u64,

    #[arg(long, env = "HEALTH_PORT", default_value_t = 8080)]
    pub health_port: u16,

    #[arg(long, env = "WEBHOOK_CERT_PATH", default_value = "/etc/webhook/certs/tls.crt")]
    pub webhook_cert_path: String,

    #[arg(long, env = "WEBHOOK_KEY_PATH", default_value = "/etc/webhook/certs/tls.key")]
    pub webhook_key_path: String,

    /// Glob patterns of cluster annotations copied to every generated object
    #[arg(long, env = "INHERITED_ANNOTATIONS", value_delimiter = ',')]
    pub inherited_annotations: Vec<String>,

    /// Glob patterns of cluster labels copied to every generated object
    #[arg(long, env = "INHERITED_LABELS", value_delimiter = ',')]
    pub inherited_labels: Vec<String>,

    /// Node taints that mark a node as being drained
    #[arg(long, env = "DRAIN_TAINTS", value_delimiter = ',', default_values_t = DEFAULT_DRAIN_TAINTS.map(String::from))]
    pub drain_taints: Vec<String>,

    /// How long an election waits for standbys to finish receiving WAL
    #[arg(long, env = "FAILOVER_WAL_RECEIVER_TIMEOUT_SECS", default_value_t = 30)]
    pub failover_wal_receiver_timeout_secs: u64,

    /// How long a primary whose fence was lifted may take to come back
    /// before failover is considered
    #[arg(long, env = "FENCE_RECOVERY_TIMEOUT_SECS", default_value_t = 300)]
    pub fence_recovery_timeout_secs: u64,

    /// Running backups that have not finished after this long are failed
    #[arg(long, env = "BACKUP_TIMEOUT_SECS", default_value_t = 86400)]
    pub backup_timeout_secs: u64,

    #[arg(long, env = "STATUS_UPDATE_RETRIES", default_value_t = 5)]
    pub status_update_retries: u32,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Plain)]
    pub log_format: LogFormat,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            pod_name: None,
            pod_namespace: "default".to_string(),
            lease_name: "pgha-operator-leader".to_string(),
            lease_ttl_secs: 15,
            health_port: 8080,
            webhook_cert_path: "/etc/webhook/certs/tls.crt".to_string(),
            webhook_key_path: "/etc/webhook/certs/tls.key".to_string(),
            inherited_annotations: Vec::new(),
            inherited_labels: Vec::new(),
            drain_taints: DEFAULT_DRAIN_TAINTS.map(String::from).to_vec(),
            failover_wal_receiver_timeout_secs: 30,
            fence_recovery_timeout_secs: 300,
            backup_timeout_secs: 86400,
            status_update_retries: 5,
            log_format: LogFormat::Plain,
        }
    }
}

impl OperatorConfig {
    pub fn wal_receiver_timeout(&self) -> Duration {
        Duration::from_secs(self.failover_wal_receiver_timeout_secs)
    }

    pub fn fence_recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.fence_recovery_timeout_secs)
    }

    pub fn backup_timeout(&self) -> Duration {
        Duration::from_secs(self.backup_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}
