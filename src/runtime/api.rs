//! API-facing request/response models and the calls route handlers make.
//!
//! Every mutating call only records intent and enqueues a job; the response
//! reports the accepted operation, never the upstream outcome.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::builders::Orchestrator;
use crate::core::{
    InstanceId, Job, JobFilter, JobId, JobStatus, JobType, OperationId, OrchestratorError,
    OrchestratorResult, PoolStats, Priority, QueueStats,
};
use crate::lifecycle::{
    InstanceConfig, InstanceState, InstanceStatus, InstanceTimestamps, StartOptions,
};
use crate::resilience::CircuitBreakerState;

/// Instance creation payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceBody {
    /// Unique display name.
    pub name: String,
    /// Product (GPU SKU).
    pub product_id: String,
    /// Container image.
    pub image: String,
    /// Exposed container ports.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Container environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Preferred region.
    #[serde(default)]
    pub region: Option<String>,
    /// Receiver for this instance's notifications.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl From<CreateInstanceBody> for InstanceConfig {
    fn from(body: CreateInstanceBody) -> Self {
        Self {
            name: body.name,
            product_id: body.product_id,
            image: body.image,
            ports: body.ports,
            env: body.env,
            region: body.region,
            webhook_url: body.webhook_url,
        }
    }
}

/// Start payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartInstanceBody {
    /// Receiver for this start's notifications only.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Startup deadline in seconds.
    #[serde(default)]
    pub max_wait_secs: Option<u64>,
}

/// An accepted mutating request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationAccepted {
    /// Target instance.
    pub instance_id: InstanceId,
    /// Token for the accepted operation.
    pub operation_id: OperationId,
    /// Status at acceptance.
    pub status: InstanceStatus,
}

/// Public view of an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceResponse {
    /// Internal id.
    pub id: InstanceId,
    /// Display name.
    pub name: String,
    /// Provider id, once created upstream.
    pub provider_instance_id: Option<String>,
    /// Lifecycle status.
    pub status: InstanceStatus,
    /// Product (GPU SKU).
    pub product_id: String,
    /// Transition timestamps.
    pub timestamps: InstanceTimestamps,
    /// Last recorded use.
    pub last_used_at: Option<DateTime<Utc>>,
    /// Operation in flight.
    pub active_operation_id: Option<OperationId>,
    /// Why the last operation failed.
    pub last_error: Option<String>,
}

impl From<InstanceState> for InstanceResponse {
    fn from(state: InstanceState) -> Self {
        Self {
            id: state.id,
            name: state.name,
            provider_instance_id: state.provider_instance_id,
            status: state.status,
            product_id: state.config.product_id,
            timestamps: state.timestamps,
            last_used_at: state.last_used_at,
            active_operation_id: state.active_operation_id,
            last_error: state.last_error,
        }
    }
}

/// Public view of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    /// Job id.
    pub id: JobId,
    /// Handler selector.
    pub job_type: JobType,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Scheduling priority.
    pub priority: Priority,
    /// Targeted instance, if any.
    pub instance_id: Option<InstanceId>,
    /// Attempts consumed.
    pub attempts: u32,
    /// Attempt ceiling.
    pub max_attempts: u32,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
    /// Earliest next attempt.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Most recent failure.
    pub last_error: Option<String>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type,
            status: job.status,
            priority: job.priority,
            instance_id: job.payload.instance_id(),
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            created_at: job.created_at,
            next_retry_at: job.next_retry_at,
            last_error: job.last_error,
        }
    }
}

/// Health response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    /// Store reachable and the provider circuit not open.
    pub ok: bool,
    /// Store reachable.
    pub store_ok: bool,
    /// Provider breaker.
    pub provider_circuit: CircuitBreakerState,
    /// Queue counters.
    pub queue: QueueStats,
    /// Pool counters.
    pub pool: PoolStats,
}

/// Accept an instance creation.
///
/// # Errors
///
/// `Validation` for a bad body or a name in use.
pub async fn create_instance(
    orch: &Orchestrator,
    body: CreateInstanceBody,
) -> OrchestratorResult<OperationAccepted> {
    let state = orch.lifecycle().create_instance(body.into()).await?;
    let operation_id = state.active_operation_id.ok_or_else(|| {
        OrchestratorError::InvalidTransition(format!("instance {} has no operation", state.id))
    })?;
    Ok(OperationAccepted {
        instance_id: state.id,
        operation_id,
        status: state.status,
    })
}

/// Accept a start.
///
/// # Errors
///
/// `NotFound`, `OperationInProgress`, or `Validation`.
pub async fn start_instance(
    orch: &Orchestrator,
    id_or_name: &str,
    body: StartInstanceBody,
) -> OrchestratorResult<OperationAccepted> {
    let options = StartOptions {
        webhook_url: body.webhook_url,
        max_wait_secs: body.max_wait_secs,
    };
    let operation_id = orch.lifecycle().start_instance(id_or_name, options).await?;
    accepted(orch, id_or_name, operation_id)
}

/// Accept a stop.
///
/// # Errors
///
/// `NotFound`, `OperationInProgress`, or `Validation`.
pub async fn stop_instance(
    orch: &Orchestrator,
    id_or_name: &str,
) -> OrchestratorResult<OperationAccepted> {
    let operation_id = orch.lifecycle().stop_instance(id_or_name).await?;
    accepted(orch, id_or_name, operation_id)
}

/// Accept a delete.
///
/// # Errors
///
/// `NotFound`, `OperationInProgress`, or `Validation`.
pub async fn delete_instance(
    orch: &Orchestrator,
    id_or_name: &str,
) -> OrchestratorResult<OperationAccepted> {
    let operation_id = orch.lifecycle().delete_instance(id_or_name).await?;
    accepted(orch, id_or_name, operation_id)
}

fn accepted(
    orch: &Orchestrator,
    id_or_name: &str,
    operation_id: OperationId,
) -> OrchestratorResult<OperationAccepted> {
    let state = orch.lifecycle().find(id_or_name)?;
    Ok(OperationAccepted {
        instance_id: state.id,
        operation_id,
        status: state.status,
    })
}

/// Look up one instance by id or name.
///
/// # Errors
///
/// `NotFound`.
pub fn get_instance(orch: &Orchestrator, id_or_name: &str) -> OrchestratorResult<InstanceResponse> {
    orch.lifecycle().find(id_or_name).map(InstanceResponse::from)
}

/// Every instance, optionally filtered by status.
pub fn list_instances(
    orch: &Orchestrator,
    status: Option<InstanceStatus>,
) -> Vec<InstanceResponse> {
    orch.lifecycle()
        .list()
        .into_iter()
        .filter(|s| status.is_none_or(|wanted| s.status == wanted))
        .map(InstanceResponse::from)
        .collect()
}

/// Look up one job.
///
/// # Errors
///
/// `NotFound`.
pub fn get_job(orch: &Orchestrator, id: JobId) -> OrchestratorResult<JobResponse> {
    orch.queue()
        .get(id)
        .map(JobResponse::from)
        .ok_or_else(|| OrchestratorError::NotFound(format!("job {id}")))
}

/// Jobs matching `filter`.
pub fn list_jobs(orch: &Orchestrator, filter: &JobFilter) -> Vec<JobResponse> {
    orch.queue().list(filter).into_iter().map(JobResponse::from).collect()
}

/// Queue counters.
pub fn queue_stats(orch: &Orchestrator) -> QueueStats {
    orch.queue().stats()
}

/// Liveness of the store and the provider circuit.
pub async fn health(orch: &Orchestrator) -> Health {
    let store_ok = orch.store().ping().await.is_ok();
    let provider_circuit = orch.gate().breaker_state();
    let circuit_ok = provider_circuit.state != crate::resilience::CircuitState::Open;
    Health {
        ok: store_ok && circuit_ok,
        store_ok,
        provider_circuit,
        queue: orch.queue().stats(),
        pool: orch.pool().stats(),
    }
}
