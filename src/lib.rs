//! # Instance Orchestrator
//!
//! A control plane that provisions, monitors and retires GPU instances on a
//! third-party provider, keeping client requests decoupled from slow and
//! unreliable upstream operations.
//!
//! A request mutates an instance record and enqueues a job. The worker pool
//! picks the job up, calls the provider through a circuit breaker and rate
//! limiter, moves the record through its state machine, and queues a signed
//! webhook for the client. Periodic schedulers stop idle instances, migrate
//! reclaimed spot instances and reconcile records with the provider.
//!
//! ## Key Features
//!
//! - **Persistent priority queue**: jobs survive restarts; failed attempts
//!   retry with exponential backoff up to a ceiling
//! - **Bounded worker pool**: at most `max_concurrent_jobs` handlers in
//!   flight, each with a per-type timeout
//! - **Operation tokens**: at most one mutating operation per instance
//! - **Resilience gate**: circuit breaker plus sliding-window rate limiter in
//!   front of every provider call
//! - **Webhooks**: HMAC-signed, retried with jittered backoff
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use instance_orchestrator::builders::OrchestratorBuilder;
//! use instance_orchestrator::config::OrchestratorConfig;
//! use instance_orchestrator::runtime::api::{self, CreateInstanceBody};
//!
//! let orch = OrchestratorBuilder::new(OrchestratorConfig::from_env()?)
//!     .start()
//!     .await?;
//!
//! let accepted = api::create_instance(&orch, CreateInstanceBody {
//!     name: "gpu-1".into(),
//!     product_id: "p1".into(),
//!     image: "registry.example/llm:latest".into(),
//!     ports: vec![8000],
//!     env: Default::default(),
//!     region: None,
//!     webhook_url: Some("https://client.example/hooks".into()),
//! })
//! .await?;
//!
//! orch.shutdown().await;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Job model, queue and worker pool.
pub mod core;
/// Configuration models for every component.
pub mod config;
/// Builders that assemble a running orchestrator.
pub mod builders;
/// Persistence backends and the upstream provider client.
pub mod infra;
/// Instance records and the jobs that drive them.
pub mod lifecycle;
/// Circuit breaker and rate limiter for upstream calls.
pub mod resilience;
/// API surface for route handlers.
pub mod runtime;
/// Periodic job producers.
pub mod scheduler;
/// Shared utilities.
pub mod util;
/// Client notifications.
pub mod webhook;
