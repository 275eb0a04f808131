//! CRD installation on startup
//!
//! The operator installs its own CRD with server-side apply so the schema in
//! the cluster always matches the running binary.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use replicant_common::crd::ReplicaGroup;
use replicant_common::retry::{retry_with_backoff, RetryConfig};
use replicant_common::FIELD_MANAGER;

/// Render the ReplicaGroup CRD as YAML
pub fn crd_yaml() -> anyhow::Result<String> {
    serde_yaml::to_string(&ReplicaGroup::crd())
        .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {}", e))
}

/// Ensure the ReplicaGroup CRD is installed, retrying while the API server is unavailable
pub async fn ensure_crds_installed(client: &Client, retry: &RetryConfig) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let crd = ReplicaGroup::crd();
    let patch = Patch::Apply(&crd);
    let name = ReplicaGroup::crd_name();

    tracing::info!(crd = %name, "Installing CRD...");
    retry_with_backoff(retry, "install_crd", || {
        crds.patch(name, &params, &patch)
    })
    .await
    .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", name, e))?;
    tracing::info!(crd = %name, "CRD installed/updated");

    Ok(())
}
