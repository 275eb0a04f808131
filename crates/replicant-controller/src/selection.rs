//! Scale-down victim selection
//!
//! Contract: when a group has `n` surplus units, the `n` newest are removed.
//! Newest means latest `creationTimestamp`; a unit without one (not yet
//! persisted) counts as newer than any unit that has one. Equal timestamps
//! are broken by name, highest first. The result depends only on the units'
//! metadata, never on the order the store listed them in, so the survivors of
//! a scale-down are always the oldest units.

use std::cmp::Ordering;

use k8s_openapi::api::core::v1::Pod;

/// Order units so that the first one is the first to be deleted
fn deletion_order(a: &Pod, b: &Pod) -> Ordering {
    let created = |p: &Pod| p.metadata.creation_timestamp.as_ref().map(|t| t.0);
    let name = |p: &Pod| p.metadata.name.clone().unwrap_or_default();

    match (created(a), created(b)) {
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(ta), Some(tb)) => tb.cmp(&ta),
        (None, None) => Ordering::Equal,
    }
    .then_with(|| name(b).cmp(&name(a)))
}

/// Pick `count` units to delete from `units`
///
/// Returns fewer than `count` only when `units` is shorter than that.
pub fn select_for_deletion(units: &[Pod], count: usize) -> Vec<&Pod> {
    let mut ordered: Vec<&Pod> = units.iter().collect();
    ordered.sort_by(|a, b| deletion_order(a, b));
    ordered.truncate(count);
    ordered
}
