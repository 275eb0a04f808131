//! ReplicaGroup CRD types
//!
//! A `ReplicaGroup` declares how many copies of a pod template should be
//! running in its namespace. The controller keeps the number of live pods
//! labelled with the group's selector equal to `spec.replicas`.

use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Error, MAX_LABEL_VALUE_LEN};

// =============================================================================
// Phase
// =============================================================================

/// Reported phase of a ReplicaGroup
///
/// Status is written for humans and tooling only; the controller never reads
/// it back when deciding what to do.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ReplicaGroupPhase {
    /// Not reconciled yet
    #[default]
    Pending,
    /// The live unit count matched `spec.replicas` after the last pass
    Ready,
    /// The spec is invalid and needs to be fixed by its owner
    Failed,
}

impl std::fmt::Display for ReplicaGroupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Ready => write!(f, "Ready"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

// =============================================================================
// CRD
// =============================================================================

/// Desired replica count and the template every unit is stamped from
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "replicant.dev",
    version = "v1alpha1",
    kind = "ReplicaGroup",
    plural = "replicagroups",
    shortname = "rg",
    namespaced,
    status = "ReplicaGroupStatus",
    scale = r#"{"specReplicasPath":".spec.replicas","statusReplicasPath":".status.replicas","labelSelectorPath":".status.selector"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Current","type":"integer","jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaGroupSpec {
    /// Number of units that should be running
    #[serde(default)]
    pub replicas: i32,

    /// Pod template copied into every unit at creation time
    #[serde(default)]
    pub template: PodTemplateSpec,
}

impl ReplicaGroupSpec {
    /// Validate the spec
    ///
    /// `group` is the ReplicaGroup's name. It becomes the selector label
    /// value on every unit, so it must fit in a label value.
    pub fn validate(&self, group: &str) -> Result<(), Error> {
        if group.len() > MAX_LABEL_VALUE_LEN {
            return Err(Error::validation_for_field(
                group,
                "metadata.name",
                format!(
                    "name is {} characters, at most {} are allowed because it is used as a label value",
                    group.len(),
                    MAX_LABEL_VALUE_LEN
                ),
            ));
        }

        if self.replicas < 0 {
            return Err(Error::validation_for_field(
                group,
                "spec.replicas",
                format!("replica count must not be negative, got {}", self.replicas),
            ));
        }

        let pod_spec = self.template.spec.as_ref().ok_or_else(|| {
            Error::validation_for_field(group, "spec.template.spec", "pod template has no spec")
        })?;

        if pod_spec.containers.is_empty() {
            return Err(Error::validation_for_field(
                group,
                "spec.template.spec.containers",
                "pod template must declare at least one container",
            ));
        }

        Ok(())
    }

    /// Desired unit count as an unsigned value (call after `validate`)
    pub fn desired_replicas(&self) -> usize {
        usize::try_from(self.replicas).unwrap_or(0)
    }
}

/// Observed state of a ReplicaGroup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaGroupStatus {
    /// Phase after the last reconcile
    #[serde(default)]
    pub phase: ReplicaGroupPhase,

    /// Live units counted at the end of the last successful reconcile
    #[serde(default)]
    pub replicas: i32,

    /// Label selector for the group's units (used by the scale subresource)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,

    /// Generation of the spec the status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Human-readable message about the current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ReplicaGroupStatus {
    /// Create a status with the given phase
    pub fn with_phase(phase: ReplicaGroupPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the observed replica count
    pub fn replicas(mut self, replicas: i32) -> Self {
        self.replicas = replicas;
        self
    }

    /// Set the label selector
    pub fn selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    /// Set the observed generation
    pub fn observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// Set the message
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

// =============================================================================
// Tests
// =============================================================================
