//! Custom Resource Definitions for replicant

mod replica_group;

pub use replica_group::{ReplicaGroup, ReplicaGroupPhase, ReplicaGroupSpec, ReplicaGroupStatus};
