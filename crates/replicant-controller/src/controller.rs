//! ReplicaGroup controller implementation
//!
//! Level-triggered reconciliation: every pass fetches the ReplicaGroup, lists
//! the pods carrying its selector label, and creates or deletes exactly the
//! difference between `spec.replicas` and the live count. No state survives
//! between passes, so a pass can be re-run at any time, after a crash or a
//! partially failed previous pass, and it picks up from whatever the API
//! server reports.
//!
//! The controller performs no retries of its own. The first failing store
//! call ends the pass with that call's error; the dispatcher requeues the key
//! and the next pass recomputes the remaining delta.
//!
//! Per-key serialization is the dispatcher's job. `kube::runtime::Controller`
//! never runs two reconciles for the same object at once; if some other
//! dispatcher did, a duplicate create lands on a fresh random name and a
//! duplicate delete of an already removed unit is treated as success.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use replicant_common::crd::{ReplicaGroup, ReplicaGroupPhase, ReplicaGroupStatus};
use replicant_common::kube_utils::{ignore_not_found, is_conflict, is_controlled_by, is_not_found};
use replicant_common::retry::{RequeueBackoff, RetryConfig};
use replicant_common::{selector_for, Error, FIELD_MANAGER};

use crate::naming::{generate_unique_name, RandomSuffix, SuffixSource};
use crate::selection::select_for_deletion;
use crate::unit::{build_unit, is_live};

/// Requeue delay for errors that need a spec change to clear
pub const PERMANENT_ERROR_REQUEUE: Duration = Duration::from_secs(300);

/// Default deadline for a single store call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Store operations the reconciler needs
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReplicaKubeClient: Send + Sync {
    /// Get a ReplicaGroup; `Ok(None)` if it does not exist
    async fn get_group(&self, namespace: &str, name: &str)
        -> Result<Option<ReplicaGroup>, Error>;

    /// List pods in `namespace` matching `selector`
    async fn list_units(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error>;

    /// Get a pod; `Ok(None)` if it does not exist
    async fn get_unit(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;

    /// Create a pod
    ///
    /// A name collision fails with [`Error::AlreadyExists`].
    async fn create_unit(&self, namespace: &str, unit: &Pod) -> Result<(), Error>;

    /// Delete a pod
    ///
    /// Succeeds if the pod is already gone.
    async fn delete_unit(&self, namespace: &str, unit: &Pod) -> Result<(), Error>;

    /// Patch the status of a ReplicaGroup
    async fn patch_group_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ReplicaGroupStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct ReplicaKubeClientImpl {
    client: Client,
}

impl ReplicaKubeClientImpl {
    /// Create a new ReplicaKubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn groups(&self, namespace: &str) -> Api<ReplicaGroup> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ReplicaKubeClient for ReplicaKubeClientImpl {
    async fn get_group(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ReplicaGroup>, Error> {
        Ok(ignore_not_found(self.groups(namespace).get(name).await)?)
    }

    async fn list_units(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error> {
        let list = self
            .pods(namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items)
    }

    async fn get_unit(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        Ok(ignore_not_found(self.pods(namespace).get(name).await)?)
    }

    async fn create_unit(&self, namespace: &str, unit: &Pod) -> Result<(), Error> {
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let result = self.pods(namespace).create(&params, unit).await;
        create_result(namespace, &unit.name_any(), result)
    }

    async fn delete_unit(&self, namespace: &str, unit: &Pod) -> Result<(), Error> {
        let name = unit.name_any();
        // Pin the delete to the observed object so a newer pod that reused
        // the name is never removed by mistake.
        let params = DeleteParams {
            preconditions: unit.uid().map(|uid| Preconditions {
                uid: Some(uid),
                resource_version: None,
            }),
            ..Default::default()
        };

        let result = self.pods(namespace).delete(&name, &params).await;
        delete_result(&name, params.preconditions.is_some(), result)
    }

    async fn patch_group_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ReplicaGroupStatus,
    ) -> Result<(), Error> {
        let status = serde_json::to_value(status).map_err(|e| {
            Error::serialization_for_kind("ReplicaGroupStatus", e.to_string())
        })?;
        let status_patch = serde_json::json!({ "status": status });
        self.groups(namespace)
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&status_patch),
            )
            .await?;
        Ok(())
    }
}

/// Map the API response of a unit create
///
/// A 409 means the name is taken.
fn create_result<T>(
    namespace: &str,
    name: &str,
    result: Result<T, kube::Error>,
) -> Result<(), Error> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_conflict(&e) => Err(Error::already_exists(namespace, name)),
        Err(e) => Err(e.into()),
    }
}

/// Map the API response of a unit delete
///
/// `pinned` is set when the delete carried a UID precondition.
fn delete_result<T>(name: &str, pinned: bool, result: Result<T, kube::Error>) -> Result<(), Error> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => {
            debug!(unit = %name, "unit already deleted");
            Ok(())
        }
        // A UID precondition mismatch means the observed object is gone
        Err(e) if pinned && is_conflict(&e) => {
            debug!(unit = %name, "unit replaced since listing, observed object already deleted");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// Configuration and context
// =============================================================================

/// Tunables for the controller
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Deadline for each individual store call
    pub call_timeout: Duration,
    /// Requeue successful passes after this interval (None = wait for a change)
    pub resync_interval: Option<Duration>,
    /// Backoff applied by the error policy to retryable failures
    pub retry: RetryConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            resync_interval: None,
            retry: RetryConfig::default(),
        }
    }
}

/// Controller context shared by every reconcile
pub struct ReplicaContext {
    /// Store client
    pub kube: Arc<dyn ReplicaKubeClient>,
    /// Suffix source for new unit names
    pub names: Arc<dyn SuffixSource>,
    /// Per-key requeue backoff used by the error policy
    pub backoff: RequeueBackoff,
    /// Deadline for each individual store call
    pub call_timeout: Duration,
    /// Requeue successful passes after this interval
    pub resync_interval: Option<Duration>,
    /// Cancelled on shutdown; aborts in-flight store calls
    pub shutdown: CancellationToken,
}

impl ReplicaContext {
    /// Create a new ReplicaContext with the given store client
    pub fn new(kube: Arc<dyn ReplicaKubeClient>, config: ControllerConfig) -> Self {
        Self {
            kube,
            names: Arc::new(RandomSuffix),
            backoff: RequeueBackoff::new(config.retry),
            call_timeout: config.call_timeout,
            resync_interval: config.resync_interval,
            shutdown: CancellationToken::new(),
        }
    }

    /// Create a new ReplicaContext from a Kubernetes client
    pub fn from_client(client: Client, config: ControllerConfig) -> Self {
        Self::new(Arc::new(ReplicaKubeClientImpl::new(client)), config)
    }

    /// Use a different suffix source for unit names
    pub fn with_names(mut self, names: Arc<dyn SuffixSource>) -> Self {
        self.names = names;
        self
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn ReplicaKubeClient>) -> Self {
        Self::new(kube, ControllerConfig::default())
    }
}

// =============================================================================
// Requests and outcomes
// =============================================================================

/// Identity of the ReplicaGroup a pass works on
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReconcileRequest {
    /// Namespace of the ReplicaGroup
    pub namespace: String,
    /// Name of the ReplicaGroup
    pub name: String,
}

impl ReconcileRequest {
    /// Create a request for `namespace/name`
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Build the request for a watched ReplicaGroup
    pub fn for_group(group: &ReplicaGroup) -> Result<Self, Error> {
        let name = group.name_any();
        let namespace = group.namespace().ok_or_else(|| {
            Error::validation_for_field(&name, "metadata.namespace", "ReplicaGroup must be namespaced")
        })?;
        Ok(Self::new(namespace, name))
    }

    /// Key used for backoff bookkeeping
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ReconcileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// What a successful pass did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The ReplicaGroup is gone; its units are left to the cascade
    GroupMissing,
    /// Live units already matched the desired count
    InSync {
        /// Live unit count
        replicas: usize,
    },
    /// Units were created
    ScaledUp {
        /// Units created in this pass
        created: usize,
        /// Live unit count after the pass
        replicas: usize,
    },
    /// Units were deleted
    ScaledDown {
        /// Units deleted in this pass
        deleted: usize,
        /// Live unit count after the pass
        replicas: usize,
    },
}

impl ReconcileOutcome {
    /// Live unit count after the pass, if the group exists
    pub fn replicas(&self) -> Option<usize> {
        match self {
            Self::GroupMissing => None,
            Self::InSync { replicas }
            | Self::ScaledUp { replicas, .. }
            | Self::ScaledDown { replicas, .. } => Some(*replicas),
        }
    }
}

// =============================================================================
// ReplicaGroup reconciliation
// =============================================================================

/// Reconcile a ReplicaGroup (kube-rs entry point)
///
/// The watched object only identifies the key; the pass re-reads the group
/// from the API server instead of trusting the watch cache.
#[instrument(skip(group, ctx), fields(group = %group.name_any()))]
pub async fn reconcile(group: Arc<ReplicaGroup>, ctx: Arc<ReplicaContext>) -> Result<Action, Error> {
    let request = ReconcileRequest::for_group(&group)?;
    let outcome = reconcile_request(&request, &ctx).await?;
    ctx.backoff.reset(&request.key());

    match outcome {
        ReconcileOutcome::InSync { .. } | ReconcileOutcome::GroupMissing => {
            debug!(?outcome, "reconcile completed")
        }
        _ => info!(?outcome, "reconcile completed"),
    }

    Ok(match ctx.resync_interval {
        Some(interval) => Action::requeue(interval),
        None => Action::await_change(),
    })
}

/// Run one pass for the ReplicaGroup identified by `request`
///
/// 1. Fetch the group. A missing group is a successful no-op.
/// 2. List its units by selector label.
/// 3. Create or delete the difference, stopping at the first failure.
/// 4. Record the live count in the group's status.
pub async fn reconcile_request(
    request: &ReconcileRequest,
    ctx: &ReplicaContext,
) -> Result<ReconcileOutcome, Error> {
    let ReconcileRequest { namespace, name } = request;

    let Some(group) = guarded(ctx, "get", ctx.kube.get_group(namespace, name)).await? else {
        debug!(group = %request, "replica group not found, nothing to do");
        return Ok(ReconcileOutcome::GroupMissing);
    };

    let selector = selector_for(name);

    if let Err(e) = group.spec.validate(name) {
        warn!(group = %request, error = %e, "replica group validation failed");
        let previous = group.status.as_ref().map(|s| s.replicas).unwrap_or(0);
        let status = ReplicaGroupStatus::with_phase(ReplicaGroupPhase::Failed)
            .replicas(previous)
            .selector(&selector)
            .observed_generation(group.metadata.generation)
            .message(e.to_string());
        sync_status(request, &group, status, ctx).await?;
        return Err(e);
    }

    let listed = guarded(ctx, "list", ctx.kube.list_units(namespace, &selector)).await?;
    let mut taken: HashSet<String> = listed
        .iter()
        .filter_map(|u| u.metadata.name.clone())
        .collect();
    let live: Vec<Pod> = listed.into_iter().filter(is_live).collect();

    let desired = group.spec.desired_replicas();
    let observed = live.len();
    debug!(group = %request, desired, observed, "computed replica delta");

    let outcome = match desired.cmp(&observed) {
        Ordering::Greater => {
            let created = scale_up(request, &group, desired - observed, &mut taken, ctx).await?;
            ReconcileOutcome::ScaledUp {
                created,
                replicas: observed + created,
            }
        }
        Ordering::Less => {
            let deleted = scale_down(request, &live, observed - desired, ctx).await?;
            ReconcileOutcome::ScaledDown {
                deleted,
                replicas: observed - deleted,
            }
        }
        Ordering::Equal => ReconcileOutcome::InSync { replicas: observed },
    };

    let replicas = outcome.replicas().unwrap_or(observed);
    let status = ReplicaGroupStatus::with_phase(ReplicaGroupPhase::Ready)
        .replicas(i32::try_from(replicas).unwrap_or(i32::MAX))
        .selector(selector)
        .observed_generation(group.metadata.generation);
    sync_status(request, &group, status, ctx).await?;

    Ok(outcome)
}

/// Error policy for the ReplicaGroup controller
///
/// - Retryable errors: per-key exponential backoff
/// - Permanent errors (invalid spec, rejected request): slow fixed requeue,
///   so the failure stays visible until the owner fixes the group
pub fn error_policy(group: Arc<ReplicaGroup>, error: &Error, ctx: Arc<ReplicaContext>) -> Action {
    let key = format!(
        "{}/{}",
        group.namespace().unwrap_or_default(),
        group.name_any()
    );
    let retryable = error.is_retryable();
    error!(?error, group = %key, retryable, "reconciliation failed");

    if retryable {
        Action::requeue(ctx.backoff.next_delay(&key))
    } else {
        Action::requeue(PERMANENT_ERROR_REQUEUE)
    }
}

/// Create `count` units, aborting on the first failure
async fn scale_up(
    request: &ReconcileRequest,
    group: &ReplicaGroup,
    count: usize,
    taken: &mut HashSet<String>,
    ctx: &ReplicaContext,
) -> Result<usize, Error> {
    let group_uid = group.uid().ok_or_else(|| {
        Error::internal_with_context("reconciler", format!("replica group {} has no uid", request))
    })?;
    info!(group = %request, count, "scaling up");

    for created in 0..count {
        let name = generate_unique_name(&request.name, taken, ctx.names.as_ref())?;
        taken.insert(name.clone());
        let unit = build_unit(group, &name)?;

        match guarded(ctx, "create", ctx.kube.create_unit(&request.namespace, &unit)).await {
            Ok(()) => debug!(group = %request, unit = %name, "created unit"),
            Err(err @ Error::AlreadyExists { .. }) => {
                let existing =
                    guarded(ctx, "get", ctx.kube.get_unit(&request.namespace, &name)).await?;
                match existing {
                    Some(unit) if is_controlled_by(&unit.metadata, &group_uid) => {
                        debug!(group = %request, unit = %name, "unit already exists for this group")
                    }
                    _ => {
                        warn!(group = %request, unit = %name, created, "unit name collision, aborting pass");
                        return Err(err);
                    }
                }
            }
            Err(e) => {
                warn!(
                    group = %request,
                    unit = %name,
                    created,
                    remaining = count - created,
                    error = %e,
                    "unit creation failed, aborting pass"
                );
                return Err(e);
            }
        }
    }

    Ok(count)
}

/// Delete `count` surplus units, newest first, aborting on the first failure
async fn scale_down(
    request: &ReconcileRequest,
    live: &[Pod],
    count: usize,
    ctx: &ReplicaContext,
) -> Result<usize, Error> {
    let victims = select_for_deletion(live, count);
    info!(group = %request, count = victims.len(), "scaling down");

    for (deleted, unit) in victims.iter().enumerate() {
        let name = unit.name_any();
        if let Err(e) = guarded(ctx, "delete", ctx.kube.delete_unit(&request.namespace, unit)).await
        {
            warn!(
                group = %request,
                unit = %name,
                deleted,
                remaining = victims.len() - deleted,
                error = %e,
                "unit deletion failed, aborting pass"
            );
            return Err(e);
        }
        debug!(group = %request, unit = %name, "deleted unit");
    }

    Ok(victims.len())
}

/// Patch the group's status unless it already matches
async fn sync_status(
    request: &ReconcileRequest,
    group: &ReplicaGroup,
    status: ReplicaGroupStatus,
    ctx: &ReplicaContext,
) -> Result<(), Error> {
    if group.status.as_ref() == Some(&status) {
        return Ok(());
    }
    guarded(
        ctx,
        "patch_status",
        ctx.kube
            .patch_group_status(&request.namespace, &request.name, &status),
    )
    .await
}

/// Run a store call under the per-call deadline and the shutdown token
async fn guarded<T>(
    ctx: &ReplicaContext,
    operation: &'static str,
    call: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    tokio::select! {
        biased;
        _ = ctx.shutdown.cancelled() => Err(Error::cancelled(operation)),
        result = tokio::time::timeout(ctx.call_timeout, call) => {
            result.unwrap_or_else(|_| Err(Error::timeout(operation, ctx.call_timeout)))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use kube::core::ErrorResponse;
    use replicant_common::crd::ReplicaGroupSpec;
    use replicant_common::GROUP_LABEL_KEY;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Mutex;

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    fn template() -> PodTemplateSpec {
        PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "main".to_string(),
                    image: Some("nginx:1.27".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        }
    }

    fn sample_group(replicas: i32) -> ReplicaGroup {
        let mut group = ReplicaGroup::new(
            "web",
            ReplicaGroupSpec {
                replicas,
                template: template(),
            },
        );
        group.metadata.namespace = Some("shop".to_string());
        group.metadata.uid = Some("uid-web".to_string());
        group.metadata.generation = Some(1);
        group
    }

    fn sample_unit(name: &str, created_min: u32) -> Pod {
        let mut unit = build_unit(&sample_group(1), name).unwrap();
        unit.metadata.uid = Some(format!("uid-{}", name));
        unit.metadata.creation_timestamp =
            Some(Time(Utc.with_ymd_and_hms(2024, 1, 1, 12, created_min, 0).unwrap()));
        unit
    }

    fn units(count: usize) -> Vec<Pod> {
        (0..count)
            .map(|i| sample_unit(&format!("web-unit{}", i), i as u32))
            .collect()
    }

    fn ready_status(replicas: i32) -> ReplicaGroupStatus {
        ReplicaGroupStatus::with_phase(ReplicaGroupPhase::Ready)
            .replicas(replicas)
            .selector(selector_for("web"))
            .observed_generation(Some(1))
    }

    fn server_error() -> Error {
        Error::from(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "etcdserver: request timed out".to_string(),
            reason: "InternalError".to_string(),
            code: 500,
        }))
    }

    fn request() -> ReconcileRequest {
        ReconcileRequest::new("shop", "web")
    }

    /// Hands out a fixed sequence of suffixes
    struct Sequence(Mutex<Vec<&'static str>>);

    impl SuffixSource for Sequence {
        fn suffix(&self) -> String {
            let mut remaining = self.0.lock().unwrap();
            if remaining.is_empty() {
                "zzzzzzzz".to_string()
            } else {
                remaining.remove(0).to_string()
            }
        }
    }

    // =========================================================================
    // Mock Setup
    // =========================================================================

    fn mock_with(group: Option<ReplicaGroup>, listed: Vec<Pod>) -> MockReplicaKubeClient {
        let mut mock = MockReplicaKubeClient::new();
        mock.expect_get_group()
            .returning(move |_, _| Ok(group.clone()));
        mock.expect_list_units()
            .returning(move |_, _| Ok(listed.clone()));
        mock
    }

    fn context(mock: MockReplicaKubeClient) -> ReplicaContext {
        ReplicaContext::for_testing(Arc::new(mock))
    }

    // =========================================================================
    // Reconciliation Story Tests
    // =========================================================================

    /// Story: a group deleted between trigger and fetch is a silent success
    #[tokio::test]
    async fn story_missing_group_is_a_noop() {
        let mut mock = MockReplicaKubeClient::new();
        mock.expect_get_group().times(1).returning(|_, _| Ok(None));
        mock.expect_list_units().times(0);
        mock.expect_create_unit().times(0);
        mock.expect_delete_unit().times(0);
        mock.expect_patch_group_status().times(0);

        let outcome = reconcile_request(&request(), &context(mock)).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::GroupMissing);
    }

    /// Story: fetch failures other than not-found surface unchanged
    #[tokio::test]
    async fn story_fetch_failure_is_propagated() {
        let mut mock = MockReplicaKubeClient::new();
        mock.expect_get_group().returning(|_, _| Err(server_error()));
        mock.expect_list_units().times(0);

        let err = reconcile_request(&request(), &context(mock)).await.unwrap_err();
        assert!(matches!(err, Error::Kube { .. }));
        assert!(err.is_retryable());
    }

    /// Story: scaling 2 -> 5 creates exactly 3 correctly stamped units
    #[tokio::test]
    async fn story_scale_up_creates_exact_delta() {
        let group = sample_group(5);
        let mut mock = mock_with(Some(group.clone()), units(2));

        let created = Arc::new(Mutex::new(Vec::<Pod>::new()));
        let recorder = created.clone();
        mock.expect_create_unit()
            .times(3)
            .returning(move |namespace, unit| {
                assert_eq!(namespace, "shop");
                recorder.lock().unwrap().push(unit.clone());
                Ok(())
            });
        mock.expect_delete_unit().times(0);
        mock.expect_patch_group_status()
            .times(1)
            .withf(|_, _, status| *status == ready_status(5))
            .returning(|_, _, _| Ok(()));

        let outcome = reconcile_request(&request(), &context(mock)).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::ScaledUp {
                created: 3,
                replicas: 5
            }
        );

        let created = created.lock().unwrap();
        let names: HashSet<String> = created.iter().map(|u| u.name_any()).collect();
        assert_eq!(names.len(), 3);
        for unit in created.iter() {
            let name = unit.name_any();
            assert!(name.starts_with("web-"));
            assert_eq!(name.len(), "web-".len() + crate::naming::SUFFIX_LEN);
            assert!(is_controlled_by(&unit.metadata, "uid-web"));
            assert_eq!(unit.labels()[GROUP_LABEL_KEY], "web");
            assert_eq!(unit.spec, group.spec.template.spec);
        }
    }

    /// Story: scaling 5 -> 2 deletes exactly the 3 newest units
    #[tokio::test]
    async fn story_scale_down_removes_newest() {
        let mut mock = mock_with(Some(sample_group(2)), units(5));

        let deleted = Arc::new(Mutex::new(Vec::<String>::new()));
        let recorder = deleted.clone();
        mock.expect_delete_unit()
            .times(3)
            .returning(move |_, unit| {
                recorder.lock().unwrap().push(unit.name_any());
                Ok(())
            });
        mock.expect_create_unit().times(0);
        mock.expect_patch_group_status()
            .times(1)
            .withf(|_, _, status| status.replicas == 2)
            .returning(|_, _, _| Ok(()));

        let outcome = reconcile_request(&request(), &context(mock)).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::ScaledDown {
                deleted: 3,
                replicas: 2
            }
        );
        assert_eq!(
            *deleted.lock().unwrap(),
            vec!["web-unit4", "web-unit3", "web-unit2"]
        );
    }

    /// Story: an in-sync group with current status makes zero writes
    #[tokio::test]
    async fn story_in_sync_group_makes_no_calls() {
        let mut group = sample_group(3);
        group.status = Some(ready_status(3));
        let mut mock = mock_with(Some(group), units(3));
        mock.expect_create_unit().times(0);
        mock.expect_delete_unit().times(0);
        mock.expect_patch_group_status().times(0);

        let outcome = reconcile_request(&request(), &context(mock)).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::InSync { replicas: 3 });
    }

    /// Story: an in-sync group with stale status only gets its status updated
    #[tokio::test]
    async fn story_in_sync_group_records_status() {
        let mut mock = mock_with(Some(sample_group(0)), vec![]);
        mock.expect_create_unit().times(0);
        mock.expect_delete_unit().times(0);
        mock.expect_patch_group_status()
            .times(1)
            .withf(|namespace, name, status| {
                namespace == "shop" && name == "web" && *status == ready_status(0)
            })
            .returning(|_, _, _| Ok(()));

        let outcome = reconcile_request(&request(), &context(mock)).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::InSync { replicas: 0 });
    }

    /// Story: when creation 2 of 3 fails the pass stops and reports the error
    #[tokio::test]
    async fn story_partial_create_failure_aborts_pass() {
        let mut mock = mock_with(Some(sample_group(3)), vec![]);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        mock.expect_create_unit().returning(move |_, _| {
            if counter.fetch_add(1, AtomicOrdering::SeqCst) == 1 {
                Err(server_error())
            } else {
                Ok(())
            }
        });
        mock.expect_patch_group_status().times(0);

        let err = reconcile_request(&request(), &context(mock)).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);
    }

    /// Story: the first failed delete ends the pass
    #[tokio::test]
    async fn story_delete_failure_aborts_pass() {
        let mut mock = mock_with(Some(sample_group(1)), units(4));
        mock.expect_delete_unit()
            .times(1)
            .returning(|_, _| Err(server_error()));
        mock.expect_patch_group_status().times(0);

        let err = reconcile_request(&request(), &context(mock)).await.unwrap_err();
        assert!(matches!(err, Error::Kube { .. }));
    }

    /// Story: terminating and finished units do not count as replicas
    #[tokio::test]
    async fn story_terminating_units_are_not_counted() {
        let mut listed = units(2);
        let mut terminating = sample_unit("web-leaving", 30);
        terminating.metadata.deletion_timestamp = Some(Time(Utc::now()));
        listed.push(terminating);

        let mut group = sample_group(2);
        group.status = Some(ready_status(2));
        let mut mock = mock_with(Some(group), listed);
        mock.expect_delete_unit().times(0);
        mock.expect_create_unit().times(0);

        let outcome = reconcile_request(&request(), &context(mock)).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::InSync { replicas: 2 });
    }

    /// Story: a name collision with our own unit counts as created
    #[tokio::test]
    async fn story_collision_with_own_unit_is_success() {
        let mut mock = mock_with(Some(sample_group(1)), vec![]);
        mock.expect_create_unit()
            .times(1)
            .returning(|namespace, unit| Err(Error::already_exists(namespace, unit.name_any())));
        mock.expect_get_unit()
            .times(1)
            .returning(|_, name| Ok(Some(sample_unit(name, 0))));
        mock.expect_patch_group_status().returning(|_, _, _| Ok(()));

        let outcome = reconcile_request(&request(), &context(mock)).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::ScaledUp {
                created: 1,
                replicas: 1
            }
        );
    }

    /// Story: a name collision with someone else's pod is surfaced for retry
    #[tokio::test]
    async fn story_collision_with_foreign_unit_is_retryable() {
        let mut mock = mock_with(Some(sample_group(2)), vec![]);
        mock.expect_create_unit()
            .times(1)
            .returning(|namespace, unit| Err(Error::already_exists(namespace, unit.name_any())));
        mock.expect_get_unit().returning(|_, name| {
            Ok(Some(Pod {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            }))
        });
        mock.expect_patch_group_status().times(0);

        let err = reconcile_request(&request(), &context(mock)).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
        assert!(err.is_retryable());
    }

    /// Story: generated names never reuse a name already in the listing
    #[tokio::test]
    async fn story_new_names_avoid_listed_units() {
        let mut group = sample_group(2);
        group.status = Some(ready_status(2));
        let existing = sample_unit("web-aaaaaaaa", 0);
        let mut mock = mock_with(Some(group), vec![existing]);

        let created = Arc::new(Mutex::new(Vec::<String>::new()));
        let recorder = created.clone();
        mock.expect_create_unit().times(1).returning(move |_, unit| {
            recorder.lock().unwrap().push(unit.name_any());
            Ok(())
        });

        let ctx = context(mock).with_names(Arc::new(Sequence(Mutex::new(vec![
            "aaaaaaaa", "bbbbbbbb",
        ]))));
        reconcile_request(&request(), &ctx).await.unwrap();
        assert_eq!(*created.lock().unwrap(), vec!["web-bbbbbbbb"]);
    }

    /// Story: an invalid spec is recorded on the group and reported, never fixed
    #[tokio::test]
    async fn story_invalid_spec_marks_group_failed() {
        let mut mock = MockReplicaKubeClient::new();
        mock.expect_get_group()
            .returning(|_, _| Ok(Some(sample_group(-2))));
        mock.expect_list_units().times(0);
        mock.expect_create_unit().times(0);
        mock.expect_patch_group_status()
            .times(1)
            .withf(|_, _, status| {
                status.phase == ReplicaGroupPhase::Failed
                    && status
                        .message
                        .as_deref()
                        .is_some_and(|m| m.contains("must not be negative"))
            })
            .returning(|_, _, _| Ok(()));

        let err = reconcile_request(&request(), &context(mock)).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(!err.is_retryable());
    }

    /// Story: a name too long for the selector label is reported on the group
    #[tokio::test]
    async fn story_overlong_group_name_marks_group_failed() {
        let long_name = "a".repeat(64);
        let mut group = sample_group(2);
        group.metadata.name = Some(long_name.clone());

        let mut mock = MockReplicaKubeClient::new();
        mock.expect_get_group()
            .returning(move |_, _| Ok(Some(group.clone())));
        mock.expect_list_units().times(0);
        mock.expect_create_unit().times(0);
        mock.expect_patch_group_status()
            .times(1)
            .withf(|_, _, status| {
                status.phase == ReplicaGroupPhase::Failed
                    && status
                        .message
                        .as_deref()
                        .is_some_and(|m| m.contains("label value"))
            })
            .returning(|_, _, _| Ok(()));

        let err = reconcile_request(&ReconcileRequest::new("shop", long_name), &context(mock))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field.as_deref() == Some("metadata.name")));
    }

    // =========================================================================
    // API response mapping
    // =========================================================================

    fn api_response(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {}", code),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn create_name_collision_maps_to_already_exists() {
        let err = create_result::<()>("shop", "web-bcdf2345", Err(api_response(409))).unwrap_err();
        assert!(
            matches!(err, Error::AlreadyExists { ref namespace, ref name } if namespace == "shop" && name == "web-bcdf2345")
        );
    }

    #[test]
    fn create_other_failures_propagate() {
        assert!(create_result("shop", "web-bcdf2345", Ok(())).is_ok());

        let err = create_result::<()>("shop", "web-bcdf2345", Err(api_response(500))).unwrap_err();
        assert!(matches!(err, Error::Kube { .. }));
        assert!(err.is_retryable());

        let err = create_result::<()>("shop", "web-bcdf2345", Err(api_response(422))).unwrap_err();
        assert!(matches!(err, Error::Kube { .. }));
        assert!(!err.is_retryable());
    }

    /// Story: deleting a unit that is already gone is a success
    #[test]
    fn story_delete_of_absent_unit_succeeds() {
        assert!(delete_result::<()>("web-bcdf2345", true, Err(api_response(404))).is_ok());
        assert!(delete_result::<()>("web-bcdf2345", false, Err(api_response(404))).is_ok());
        assert!(delete_result("web-bcdf2345", true, Ok(())).is_ok());
    }

    #[test]
    fn delete_precondition_conflict_means_observed_unit_is_gone() {
        assert!(delete_result::<()>("web-bcdf2345", true, Err(api_response(409))).is_ok());

        // Without a UID precondition a conflict is a real failure
        let err = delete_result::<()>("web-bcdf2345", false, Err(api_response(409))).unwrap_err();
        assert!(matches!(err, Error::Kube { .. }));
    }

    #[test]
    fn delete_other_failures_propagate() {
        let err = delete_result::<()>("web-bcdf2345", true, Err(api_response(500))).unwrap_err();
        assert!(matches!(err, Error::Kube { .. }));
        assert!(err.is_retryable());

        let err = delete_result::<()>("web-bcdf2345", true, Err(api_response(403))).unwrap_err();
        assert!(!err.is_retryable());
    }

    // =========================================================================
    // Deadline and cancellation
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn slow_store_call_times_out() {
        let ctx = context(MockReplicaKubeClient::new());
        let result: Result<(), Error> = guarded(&ctx, "list", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout { ref operation, .. }) if operation == "list"));
    }

    #[tokio::test]
    async fn shutdown_aborts_store_call() {
        let ctx = context(MockReplicaKubeClient::new());
        ctx.shutdown.cancel();
        let result: Result<(), Error> =
            guarded(&ctx, "create", std::future::pending::<Result<(), Error>>()).await;
        assert!(matches!(result, Err(Error::Cancelled { .. })));
    }

    // =========================================================================
    // kube-rs adapter and error policy
    // =========================================================================

    #[tokio::test]
    async fn successful_pass_waits_for_next_change() {
        let mut group = sample_group(1);
        group.status = Some(ready_status(1));
        let mock = mock_with(Some(group.clone()), units(1));
        let ctx = Arc::new(context(mock));
        ctx.backoff.next_delay("shop/web");

        let action = reconcile(Arc::new(group), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(ctx.backoff.failures("shop/web"), 0);
    }

    #[tokio::test]
    async fn resync_interval_requeues_successful_pass() {
        let mut group = sample_group(1);
        group.status = Some(ready_status(1));
        let mock = mock_with(Some(group.clone()), units(1));
        let config = ControllerConfig {
            resync_interval: Some(Duration::from_secs(120)),
            ..Default::default()
        };
        let ctx = Arc::new(ReplicaContext::new(Arc::new(mock), config));

        let action = reconcile(Arc::new(group), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(120)));
    }

    #[tokio::test]
    async fn cluster_scoped_object_is_rejected() {
        let mut group = sample_group(1);
        group.metadata.namespace = None;
        let ctx = Arc::new(context(MockReplicaKubeClient::new()));

        let err = reconcile(Arc::new(group), ctx).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn error_policy_backs_off_retryable_errors() {
        let ctx = Arc::new(context(MockReplicaKubeClient::new()));
        let group = Arc::new(sample_group(1));

        let action = error_policy(group.clone(), &server_error(), ctx.clone());
        assert_ne!(action, Action::await_change());
        assert_ne!(action, Action::requeue(PERMANENT_ERROR_REQUEUE));
        assert_eq!(ctx.backoff.failures("shop/web"), 1);

        let _ = error_policy(group, &Error::timeout("list", Duration::from_secs(1)), ctx.clone());
        assert_eq!(ctx.backoff.failures("shop/web"), 2);
    }

    #[test]
    fn error_policy_requeues_permanent_errors_slowly() {
        let ctx = Arc::new(context(MockReplicaKubeClient::new()));
        let action = error_policy(
            Arc::new(sample_group(-1)),
            &Error::validation_for("web", "bad replicas"),
            ctx.clone(),
        );
        assert_eq!(action, Action::requeue(PERMANENT_ERROR_REQUEUE));
        assert_eq!(ctx.backoff.failures("shop/web"), 0);
    }

    #[test]
    fn request_display_and_key() {
        let request = ReconcileRequest::for_group(&sample_group(1)).unwrap();
        assert_eq!(request, ReconcileRequest::new("shop", "web"));
        assert_eq!(request.key(), "shop/web");
    }
}
