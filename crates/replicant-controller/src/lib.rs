//! ReplicaGroup controller
//!
//! Drives the number of live pods labelled for a ReplicaGroup toward the
//! group's `spec.replicas`. Each pass re-lists the pods from the API server,
//! creates or deletes the difference, and returns; nothing is cached between
//! passes.
//!
//! - [`controller`] - store abstraction, reconcile entry points, error policy
//! - [`naming`] - unit name generation
//! - [`unit`] - unit construction and liveness
//! - [`selection`] - which units go first on scale-down

pub mod controller;
pub mod naming;
pub mod selection;
pub mod unit;

pub use controller::{
    error_policy, reconcile, reconcile_request, ControllerConfig, ReconcileOutcome,
    ReconcileRequest, ReplicaContext, ReplicaKubeClient, ReplicaKubeClientImpl,
};
