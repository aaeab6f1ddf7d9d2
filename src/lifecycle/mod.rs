//! Instance records, their state machine, and the jobs that move them.

pub mod handlers;
pub mod manager;
pub mod state;

pub use handlers::{register_lifecycle_handlers, HandlerContext, LifecycleHandler};
pub use manager::{InstanceLifecycle, ReconcileReport, StartOptions};
pub use state::{
    validate_webhook_url, ActiveOperation, InstanceConfig, InstanceState, InstanceStatus,
    InstanceTimestamps, OperationKind,
};
