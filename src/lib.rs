//! OpenTelemetry Operator - bootstrap and orchestration layer
//!
//! Resolves the operator configuration, builds the resource type registry,
//! sequences the startup tasks that run once this replica is the active
//! instance, decides whether the admission webhooks exist, and hosts the
//! process lifecycle (probes, metrics, leader election, graceful shutdown).
//!
//! # Modules
//!
//! - [`config`] - Layered configuration (defaults, file, flags) and environment
//! - [`crd`] - Custom Resource Definitions (OpenTelemetryCollector, Instrumentation, OpAMPBridge)
//! - [`registry`] - Resource kinds known to the operator
//! - [`startup`] - Startup tasks: capability detection and instance upgrades
//! - [`webhook`] - Admission wiring, pod mutation and resource defaulting
//! - [`inject`] - Sidecar and auto-instrumentation pod mutators
//! - [`runtime`] - Listeners, leader election, controllers and shutdown
//! - [`metrics`] - Prometheus metrics
//! - [`telemetry`] - Structured logging and tracing
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod inject;
pub mod metrics;
pub mod registry;
pub mod runtime;
pub mod startup;
pub mod telemetry;
pub mod version;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
