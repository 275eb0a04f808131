//! Common types for replicant: the ReplicaGroup CRD, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Label key carried by every unit a ReplicaGroup creates.
///
/// The value is the owning ReplicaGroup's name; listing by this label is how
/// the controller discovers a group's current units.
pub const GROUP_LABEL_KEY: &str = "replicant.dev/group";

/// Longest label value the API server accepts
///
/// The group name is used verbatim as the selector label value, so it bounds
/// the length of ReplicaGroup names.
pub const MAX_LABEL_VALUE_LEN: usize = 63;

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "replicant-controller";

/// Build the label selector that matches the units of the named ReplicaGroup
pub fn selector_for(group_name: &str) -> String {
    format!("{}={}", GROUP_LABEL_KEY, group_name)
}
