//! API surface consumed by route handlers.

pub mod api;

pub use api::{
    create_instance, delete_instance, get_instance, get_job, health, list_instances, list_jobs,
    queue_stats, start_instance, stop_instance, CreateInstanceBody, Health, InstanceResponse,
    JobResponse, OperationAccepted, StartInstanceBody,
};
