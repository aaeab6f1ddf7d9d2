//! Tests for error types

use std::time::Duration;

use instance_orchestrator::core::{ErrorKind, HandlerOutcome, OrchestratorError};
use uuid::Uuid;

#[test]
fn test_transient_upstream_display_includes_status() {
    let err = OrchestratorError::TransientUpstream {
        status: Some(503),
        message: "maintenance".to_string(),
        retry_after: None,
    };
    assert_eq!(format!("{err}"), "transient upstream error (503): maintenance");
}

#[test]
fn test_transient_upstream_display_without_status() {
    let err = OrchestratorError::transient("connection reset");
    assert_eq!(format!("{err}"), "transient upstream error: connection reset");
}

#[test]
fn test_operation_in_progress_is_not_retryable() {
    let err = OrchestratorError::OperationInProgress {
        instance_id: Uuid::new_v4(),
        operation_id: Uuid::new_v4(),
    };
    assert_eq!(err.kind(), ErrorKind::OperationInProgress);
    assert!(!err.is_retryable());
}

#[test]
fn test_retryable_classification() {
    assert!(OrchestratorError::transient("x").is_retryable());
    assert!(OrchestratorError::Timeout("x".into()).is_retryable());
    assert!(OrchestratorError::storage("disk full").is_retryable());
    assert!(!OrchestratorError::Validation("x".into()).is_retryable());
    assert!(!OrchestratorError::PermanentUpstream {
        status: Some(400),
        message: "bad".into()
    }
    .is_retryable());
}

#[test]
fn test_outcome_from_circuit_open_defers() {
    let err = OrchestratorError::CircuitOpen {
        dependency: "provider".into(),
        retry_in: Duration::from_secs(12),
    };
    match HandlerOutcome::from_error(&err) {
        HandlerOutcome::Deferred { delay, .. } => assert_eq!(delay, Duration::from_secs(12)),
        other => panic!("expected deferral, got {other:?}"),
    }
}

#[test]
fn test_outcome_keeps_retry_after_hint() {
    let err = OrchestratorError::TransientUpstream {
        status: Some(429),
        message: "slow down".into(),
        retry_after: Some(Duration::from_secs(7)),
    };
    assert_eq!(
        HandlerOutcome::from_error(&err),
        HandlerOutcome::RetryableFailure {
            reason: err.to_string(),
            retry_after: Some(Duration::from_secs(7)),
        }
    );
}

#[test]
fn test_outcome_from_validation_is_permanent() {
    let err = OrchestratorError::Validation("name".into());
    assert!(matches!(
        HandlerOutcome::from_error(&err),
        HandlerOutcome::PermanentFailure { .. }
    ));
}
