//! Replicant operator
//!
//! Process wiring for the ReplicaGroup controller: CLI, CRD installation,
//! and the kube-rs controller loop.

pub mod cli;
pub mod controller_runner;
pub mod startup;

pub use cli::Cli;
