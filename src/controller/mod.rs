pub mod backup_reconciler;
pub mod context;
pub mod error;
pub mod extensions;
pub mod fencing;
pub mod instances;
pub mod operations;
pub mod reconciler;
pub mod recovery;
pub mod registry;
pub mod resize;
pub mod scheduled_backup_reconciler;
pub mod slots;
pub mod state_machine;
pub mod status;
pub mod topology;
pub mod validation;

pub use backup_reconciler::{backup_error_policy, reconcile_backup};
pub use context::Context;
pub use error::{BackoffConfig, Error, Result};
pub use fencing::FencedInstances;
pub use reconciler::{FINALIZER, error_policy, reconcile};
pub use registry::{Instance, InstanceRegistry};
pub use scheduled_backup_reconciler::{reconcile_scheduled_backup, scheduled_backup_error_policy};
pub use state_machine::{ClusterEvent, ClusterStateMachine, TransitionContext, TransitionResult};
pub use status::{ConditionBuilder, KubeStatusStore, MemoryStatusStore, StatusStore, update_status};
pub use topology::{TopologyAction, plan_topology};
pub use validation::{MAX_INSTANCES, MIN_INSTANCES, SpecDiff, validate_spec, validate_spec_change};
