//! Unit construction and liveness

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use replicant_common::crd::ReplicaGroup;
use replicant_common::kube_utils::set_owner_reference;
use replicant_common::{Error, GROUP_LABEL_KEY};

/// Pod phases after which a unit no longer runs
const TERMINAL_PHASES: [&str; 2] = ["Succeeded", "Failed"];

/// Build a new unit for `group` named `name`.
///
/// Labels are the template's labels, then the group's own labels, then the
/// selector label, later sources winning on key clashes. The pod spec is
/// copied verbatim from the template and is never touched again. The group is
/// set as the controlling owner so deleting it cascades to its units.
pub fn build_unit(group: &ReplicaGroup, name: &str) -> Result<Pod, Error> {
    let group_name = group.name_any();
    let template_meta = group.spec.template.metadata.as_ref();

    let mut labels: BTreeMap<String, String> = template_meta
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    labels.extend(group.labels().clone());
    labels.insert(GROUP_LABEL_KEY.to_string(), group_name);

    let mut metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: group.namespace(),
        labels: Some(labels),
        annotations: template_meta.and_then(|m| m.annotations.clone()),
        ..Default::default()
    };
    set_owner_reference(group, &mut metadata)?;

    Ok(Pod {
        metadata,
        spec: group.spec.template.spec.clone(),
        status: None,
    })
}

/// True if the unit counts toward the group's replicas
///
/// Units already being deleted, or whose containers have run to completion,
/// are not live. Terminal units are left in place for the cluster's pod
/// garbage collector and the owner-reference cascade.
pub fn is_live(unit: &Pod) -> bool {
    if unit.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let phase = unit.status.as_ref().and_then(|s| s.phase.as_deref());
    !matches!(phase, Some(p) if TERMINAL_PHASES.contains(&p))
}
