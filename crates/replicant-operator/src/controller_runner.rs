//! Controller runner - builds the ReplicaGroup controller future
//!
//! Construction is kept separate from `main` so the watch wiring can be read
//! (and changed) in one place.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Config as ControllerRuntimeConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use replicant_common::crd::ReplicaGroup;
use replicant_common::GROUP_LABEL_KEY;
use replicant_controller::{error_policy, reconcile, ReplicaContext};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Watch configuration for ReplicaGroups
pub fn group_watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Watch configuration for owned pods: only pods carrying the group label
pub fn unit_watcher_config() -> WatcherConfig {
    WatcherConfig::default()
        .timeout(WATCH_TIMEOUT_SECS)
        .labels(GROUP_LABEL_KEY)
}

/// Build the ReplicaGroup controller future
///
/// Any change to a ReplicaGroup, or to a pod it controls, queues that group.
/// The kube-rs scheduler never runs two reconciles for the same group at
/// once; `concurrency` bounds reconciles across groups (0 = unbounded).
pub fn build_replica_controller(
    client: Client,
    namespace: Option<&str>,
    concurrency: u16,
    ctx: Arc<ReplicaContext>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let (groups, pods): (Api<ReplicaGroup>, Api<Pod>) = match namespace {
        Some(ns) => {
            tracing::info!(namespace = %ns, "- ReplicaGroup controller (namespaced)");
            (
                Api::namespaced(client.clone(), ns),
                Api::namespaced(client, ns),
            )
        }
        None => {
            tracing::info!("- ReplicaGroup controller (all namespaces)");
            (Api::all(client.clone()), Api::all(client))
        }
    };

    Box::pin(
        Controller::new(groups, group_watcher_config())
            .owns(pods, unit_watcher_config())
            .with_config(ControllerRuntimeConfig::default().concurrency(concurrency))
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("ReplicaGroup")),
    )
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(object) => tracing::trace!(?object, "{} reconciliation completed", controller_name),
            Err(e) => tracing::warn!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
