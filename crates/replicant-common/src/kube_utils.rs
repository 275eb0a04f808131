//! Kubernetes client helpers shared by the controller and the operator binary

use std::path::Path;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Resource};

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from optional kubeconfig path with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };

    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// True if the error is an API response with the given HTTP status code
pub fn is_api_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == code)
}

/// True if the API server reported 404 Not Found
pub fn is_not_found(err: &kube::Error) -> bool {
    is_api_status(err, 404)
}

/// True if the API server reported 409 Conflict
///
/// Create returns this for a name collision (AlreadyExists); update and
/// delete return it when a precondition no longer holds.
pub fn is_conflict(err: &kube::Error) -> bool {
    is_api_status(err, 409)
}

/// Turn a 404 into `Ok(None)`, passing every other outcome through
pub fn ignore_not_found<T>(result: Result<T, kube::Error>) -> Result<Option<T>, kube::Error> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Attach `owner` to `child` as its controlling owner reference.
///
/// The reference lets the API server cascade-delete the child when the owner
/// is removed; nothing in-process relies on it for lifetime management.
/// Any existing controller reference on the child is replaced.
pub fn set_owner_reference<K>(owner: &K, child: &mut ObjectMeta) -> Result<(), Error>
where
    K: Resource<DynamicType = ()>,
{
    let owner_ref = owner.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context(
            "set_owner_reference",
            format!(
                "{} {} has no name or uid",
                K::kind(&()),
                owner.meta().name.as_deref().unwrap_or("<unnamed>")
            ),
        )
    })?;

    let refs = child.owner_references.get_or_insert_with(Vec::new);
    refs.retain(|r| r.controller != Some(true));
    refs.push(owner_ref);
    Ok(())
}

/// True if `meta` is controlled by an object with the given UID
pub fn is_controlled_by(meta: &ObjectMeta, owner_uid: &str) -> bool {
    meta.owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|r| r.controller == Some(true) && r.uid == owner_uid)
}
