//! Cluster lifecycle reconciler
//!
//! Orchestrates the remote API, the status poller and the manifest engine
//! into create/read/update/delete/list. Remote failures end an operation;
//! local manifest failures are reported as diagnostics next to whatever
//! remote state was obtained.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use akp_common::{Error, Tristate};

use crate::access::KubeConnector;
use crate::api::{ClusterApi, ClusterRecord, CreateClusterRequest, UpdateClusterRequest};
use crate::config::ReconcilerConfig;
use crate::diagnostics::Diagnostics;
use crate::manifests::{self, ClusterConnector, ManifestEngine, TEARDOWN_DELETE_OPTIONS};
use crate::merge::Merge;
use crate::status::{with_cancellation, StatusDimension, StatusPoller};
use crate::types::{ClusterCredentials, ClusterDesiredState, ClusterObservedState, ClusterState};

/// Result of a reconciler operation
#[derive(Debug)]
pub struct Reconciled<T> {
    /// Produced value; `None` when a remote failure ended the operation early
    pub value: Option<T>,
    /// Everything reported along the way
    pub diagnostics: Diagnostics,
}

impl<T> Reconciled<T> {
    fn done(value: T, diagnostics: Diagnostics) -> Self {
        Self {
            value: Some(value),
            diagnostics,
        }
    }

    fn failed(diagnostics: Diagnostics) -> Self {
        Self {
            value: None,
            diagnostics,
        }
    }

    /// True when no error diagnostic was recorded
    pub fn is_success(&self) -> bool {
        !self.diagnostics.has_error()
    }
}

/// Outcome of reading a cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The cluster exists; carries the refreshed state
    Found(ClusterState),
    /// The remote record is gone; the caller should forget it
    NotFound,
}

/// Replace the observed state from a record, keeping already fetched manifests
fn observe(state: &mut ClusterState, record: &ClusterRecord) {
    let manifests = std::mem::take(&mut state.observed.manifests);
    state.desired.refresh_from(record);
    state.observed = ClusterObservedState::from_record(record);
    state.observed.manifests = manifests;
}

/// Drives cluster records and their agent install
pub struct ClusterReconciler {
    api: Arc<dyn ClusterApi>,
    connector: Arc<dyn ClusterConnector>,
    poller: StatusPoller,
    config: ReconcilerConfig,
}

impl ClusterReconciler {
    /// Create a reconciler
    pub fn new(
        api: Arc<dyn ClusterApi>,
        connector: Arc<dyn ClusterConnector>,
        config: ReconcilerConfig,
    ) -> Self {
        let poller = StatusPoller::new(
            api.clone(),
            config.organization_id.clone(),
            config.poll_interval,
        );
        Self {
            api,
            connector,
            poller,
            config,
        }
    }

    /// Create a reconciler that reaches target clusters through kube-rs
    pub fn with_kube_access(api: Arc<dyn ClusterApi>, config: ReconcilerConfig) -> Self {
        let connector = Arc::new(KubeConnector::from_config(&config));
        Self::new(api, connector, config)
    }

    fn org(&self) -> &str {
        &self.config.organization_id
    }

    /// Build a manifest engine for the given credentials, or warn why not
    async fn connect(
        &self,
        credentials: &Tristate<ClusterCredentials>,
        diags: &mut Diagnostics,
    ) -> Option<ManifestEngine> {
        let Some(credentials) = credentials.as_known() else {
            warn!("cluster access not configured, skipping agent manifests");
            diags.add_warning(
                "Kubectl not configured",
                "Cannot update agent because kubectl configuration is missing",
            );
            return None;
        };

        match self.connector.connect(credentials).await {
            Ok(applier) => Some(ManifestEngine::new(applier)),
            Err(e @ Error::Config { .. }) => {
                warn!(error = %e, "cluster access unusable, skipping agent manifests");
                diags.add_warning(
                    "Kubectl not configured",
                    format!("Cannot update agent: {e}"),
                );
                None
            }
            Err(e) => {
                diags.add_error(
                    "Kubectl error",
                    format!("Cannot initialize cluster access. Check kubernetes configuration. {e}"),
                );
                None
            }
        }
    }

    /// Fetch the manifest bundle; unknown on failure so a later read retries
    async fn fetch_manifests(
        &self,
        instance_id: &str,
        id: &str,
        cancel: &CancellationToken,
        diags: &mut Diagnostics,
    ) -> Tristate<String> {
        match with_cancellation(
            cancel,
            "get_manifests",
            self.api.get_manifests(self.org(), instance_id, id),
        )
        .await
        {
            Ok(manifests) => Tristate::known(manifests),
            Err(e) => {
                diags.add_error("Client Error", format!("Unable to download manifests. {e}"));
                Tristate::Unknown
            }
        }
    }

    /// Apply the bundle, then wait for agent health even if the apply failed
    async fn install(
        &self,
        engine: &ManifestEngine,
        state: &mut ClusterState,
        record: ClusterRecord,
        cancel: &CancellationToken,
        diags: &mut Diagnostics,
    ) {
        match manifests::parse(state.observed.manifests.value_str()) {
            Ok(resources) => {
                info!(count = resources.len(), "applying agent manifests");
                if let Err(e) = engine.apply_all(&resources, cancel).await {
                    diags.add_err("Kubernetes error", &e);
                }
            }
            Err(e) => diags.add_err("YAML error", &e),
        }

        if cancel.is_cancelled() {
            debug!("cancelled, not waiting for agent health");
            return;
        }
        self.observe_health(state, record, cancel, diags).await;
    }

    /// Wait for agent health and record what it reports
    async fn observe_health(
        &self,
        state: &mut ClusterState,
        record: ClusterRecord,
        cancel: &CancellationToken,
        diags: &mut Diagnostics,
    ) {
        let instance_id = state.instance_id().to_string();
        match self
            .poller
            .wait_from(&instance_id, record, StatusDimension::Health, cancel)
            .await
        {
            Ok(record) => {
                info!(
                    health = %record.health_status.code,
                    agent_version = ?record.agent_state.as_ref().map(|s| s.version.as_str()),
                    "agent health settled"
                );
                observe(state, &record);
            }
            Err(e) => {
                diags.add_error(
                    "Client Error",
                    format!("Unable to check cluster health status. {e}"),
                );
            }
        }
    }

    /// Create a cluster record and, when credentials allow, install its agent
    #[instrument(
        skip_all,
        fields(name = %desired.name.value_str(), instance = %desired.instance_id.value_str())
    )]
    pub async fn create_cluster(
        &self,
        desired: ClusterDesiredState,
        cancel: &CancellationToken,
    ) -> Reconciled<ClusterState> {
        let mut diags = Diagnostics::new();
        let instance_id = desired.instance_id.value_str().to_string();

        let request = CreateClusterRequest {
            organization_id: self.org().to_string(),
            instance_id: instance_id.clone(),
            name: desired.name.value_str().to_string(),
            description: desired.description.value_str().to_string(),
            namespace: desired.namespace.value_str().to_string(),
            namespace_scoped: desired.namespace_scoped.value_bool(),
            data: desired.to_cluster_data(),
            upsert: false,
        };

        info!("creating cluster");
        let created = match with_cancellation(
            cancel,
            "create_cluster",
            self.api.create_cluster(request),
        )
        .await
        {
            Ok(record) => record,
            Err(e) => {
                diags.add_error("Client Error", format!("Unable to create cluster. {e}"));
                return Reconciled::failed(diags);
            }
        };

        let record = match self
            .poller
            .wait_from(
                &instance_id,
                created.clone(),
                StatusDimension::Reconciliation,
                cancel,
            )
            .await
        {
            Ok(record) => record,
            Err(e) => {
                // The remote record exists; hand back its identity so it is not orphaned
                diags.add_error(
                    "Client Error",
                    format!("Unable to check cluster reconciliation status. {e}"),
                );
                return Reconciled::done(ClusterState::from_record(desired, &created), diags);
            }
        };
        info!(cluster = %record.id, status = %record.reconciliation_status.code, "cluster created");

        let mut state = ClusterState::from_record(desired, &record);
        state.observed.manifests = self
            .fetch_manifests(&instance_id, &record.id, cancel, &mut diags)
            .await;

        if let Some(engine) = self.connect(&state.desired.kube_config, &mut diags).await {
            self.install(&engine, &mut state, record, cancel, &mut diags)
                .await;
        }

        Reconciled::done(state, diags)
    }

    /// Refresh persisted state from the remote record
    #[instrument(skip_all, fields(cluster = %prior.id()))]
    pub async fn read_cluster(
        &self,
        prior: ClusterState,
        cancel: &CancellationToken,
    ) -> Reconciled<ReadOutcome> {
        let mut diags = Diagnostics::new();
        let instance_id = prior.instance_id().to_string();
        let id = prior.id().to_string();

        let record = match with_cancellation(
            cancel,
            "get_cluster",
            self.api.get_cluster(self.org(), &instance_id, &id),
        )
        .await
        {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                info!("cluster no longer exists");
                return Reconciled::done(ReadOutcome::NotFound, diags);
            }
            Err(e) => {
                diags.add_error("Client Error", format!("Unable to read cluster. {e}"));
                return Reconciled::failed(diags);
            }
        };

        let mut state = prior;
        observe(&mut state, &record);

        if state.observed.manifests.is_null_or_unknown() {
            debug!("manifests not cached, fetching");
            state.observed.manifests = self
                .fetch_manifests(&instance_id, &record.id, cancel, &mut diags)
                .await;
        }

        Reconciled::done(ReadOutcome::Found(state), diags)
    }

    /// Merge a plan over persisted state and push it to the remote record.
    ///
    /// Manifests are reapplied only when auto-upgrade is disabled; otherwise
    /// the backend owns agent upgrades and cluster access is not touched.
    #[instrument(skip_all, fields(cluster = %prior.id()))]
    pub async fn update_cluster(
        &self,
        prior: ClusterState,
        incoming: ClusterDesiredState,
        cancel: &CancellationToken,
    ) -> Reconciled<ClusterState> {
        let mut diags = Diagnostics::new();
        let desired = prior.desired.merge(&incoming);
        let instance_id = desired.instance_id.value_str().to_string();
        let id = prior.id().to_string();

        let request = UpdateClusterRequest {
            organization_id: self.org().to_string(),
            instance_id: instance_id.clone(),
            id,
            description: desired.description.value_str().to_string(),
            data: desired.to_cluster_data(),
        };

        let record = match with_cancellation(
            cancel,
            "update_cluster",
            self.api.update_cluster(request),
        )
        .await
        {
            Ok(record) => record,
            Err(e) => {
                diags.add_error("Client Error", format!("Unable to update cluster. {e}"));
                return Reconciled::failed(diags);
            }
        };

        let mut state = ClusterState::from_record(desired, &record);
        state.observed.manifests = self
            .fetch_manifests(&instance_id, &record.id, cancel, &mut diags)
            .await;

        if !state.desired.auto_upgrade_disabled() {
            debug!("auto-upgrade enabled, leaving the agent to the backend");
            return Reconciled::done(state, diags);
        }

        if let Some(engine) = self.connect(&state.desired.kube_config, &mut diags).await {
            self.install(&engine, &mut state, record, cancel, &mut diags)
                .await;
        }

        Reconciled::done(state, diags)
    }

    /// Remove the agent install, then the remote record.
    ///
    /// The remote record is kept when any manifest fails to delete.
    #[instrument(skip_all, fields(cluster = %state.id()))]
    pub async fn delete_cluster(
        &self,
        state: &ClusterState,
        cancel: &CancellationToken,
    ) -> Diagnostics {
        let mut diags = Diagnostics::new();
        let instance_id = state.instance_id();
        let id = state.id();

        let engine = self.connect(&state.desired.kube_config, &mut diags).await;
        if diags.has_error() {
            return diags;
        }

        if let Some(engine) = engine {
            let manifests = match &state.observed.manifests {
                Tristate::Known(m) => m.clone(),
                _ => match with_cancellation(
                    cancel,
                    "get_manifests",
                    self.api.get_manifests(self.org(), instance_id, id),
                )
                .await
                {
                    Ok(manifests) => manifests,
                    Err(e) if e.is_not_found() => {
                        info!("cluster already gone");
                        return diags;
                    }
                    Err(e) => {
                        diags.add_error(
                            "Client Error",
                            format!("Unable to download manifests. {e}"),
                        );
                        return diags;
                    }
                },
            };

            let resources = match manifests::parse(&manifests) {
                Ok(resources) => resources,
                Err(e) => {
                    diags.add_err("YAML error", &e);
                    return diags;
                }
            };

            info!(count = resources.len(), "deleting agent manifests");
            if let Err(e) = engine
                .delete_all(&resources, &TEARDOWN_DELETE_OPTIONS, cancel)
                .await
            {
                diags.add_err("Kubernetes error", &e);
                return diags;
            }
        }

        match with_cancellation(
            cancel,
            "delete_cluster",
            self.api.delete_cluster(self.org(), instance_id, id),
        )
        .await
        {
            Ok(()) => info!("cluster deleted"),
            Err(e) if e.is_not_found() => {
                info!("cluster already gone");
                return diags;
            }
            Err(e) => {
                diags.add_error("Client Error", format!("Unable to delete cluster. {e}"));
                return diags;
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => debug!("settle delay cut short by cancellation"),
            _ = tokio::time::sleep(self.config.delete_settle_delay) => {}
        }

        diags
    }

    /// List the clusters of an instance with their manifests; nothing is applied
    #[instrument(skip(self, cancel))]
    pub async fn list_clusters(
        &self,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> Reconciled<Vec<ClusterState>> {
        let mut diags = Diagnostics::new();

        let records = match with_cancellation(
            cancel,
            "list_clusters",
            self.api.list_clusters(self.org(), instance_id),
        )
        .await
        {
            Ok(records) => records,
            Err(e) => {
                diags.add_error("Client Error", format!("Unable to list clusters. {e}"));
                return Reconciled::failed(diags);
            }
        };

        let mut clusters = Vec::with_capacity(records.len());
        for record in &records {
            let desired = ClusterDesiredState {
                instance_id: Tristate::known(instance_id.to_string()),
                ..Default::default()
            };
            let mut state = ClusterState::from_record(desired, record);
            state.observed.manifests = self
                .fetch_manifests(instance_id, &record.id, cancel, &mut diags)
                .await;
            clusters.push(state);
        }
        debug!(count = clusters.len(), "listed clusters");

        Reconciled::done(clusters, diags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{AgentState, MockClusterApi};
    use crate::manifests::fake::InMemoryCluster;
    use crate::manifests::{MockClusterConnector, ResourceApplier};
    use crate::types::{
        ClusterSize, HealthStatus, HealthStatusCode, ReconciliationStatus,
        ReconciliationStatusCode,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const BUNDLE: &str = "\
apiVersion: v1
kind: ServiceAccount
metadata:
  name: agent-sa
  namespace: akuity
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: agent-role
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: agent
  namespace: akuity
";

    fn record(recon: ReconciliationStatusCode, health: HealthStatusCode) -> ClusterRecord {
        ClusterRecord {
            id: "c-1".to_string(),
            name: "prod".to_string(),
            namespace: "akuity".to_string(),
            reconciliation_status: ReconciliationStatus::new(recon),
            health_status: HealthStatus::new(health),
            ..Default::default()
        }
    }

    fn healthy_record() -> ClusterRecord {
        ClusterRecord {
            agent_state: Some(AgentState {
                version: "0.5.0".to_string(),
            }),
            ..record(ReconciliationStatusCode::Successful, HealthStatusCode::Healthy)
        }
    }

    fn credentials() -> Tristate<ClusterCredentials> {
        Tristate::known(ClusterCredentials {
            host: Tristate::known("https://10.0.0.1:6443".to_string()),
            token: Tristate::known("t".to_string()),
            ..Default::default()
        })
    }

    fn desired(with_credentials: bool) -> ClusterDesiredState {
        ClusterDesiredState {
            instance_id: Tristate::known("inst-1".to_string()),
            name: Tristate::known("prod".to_string()),
            namespace: Tristate::known("akuity".to_string()),
            size: Tristate::known(ClusterSize::Small),
            kube_config: if with_credentials {
                credentials()
            } else {
                Tristate::Null
            },
            ..Default::default()
        }
    }

    fn connector_for(cluster: &InMemoryCluster) -> MockClusterConnector {
        let cluster = cluster.clone();
        let mut connector = MockClusterConnector::new();
        connector
            .expect_connect()
            .returning(move |_| Ok(Arc::new(cluster.clone()) as Arc<dyn ResourceApplier>));
        connector
    }

    fn unused_connector() -> MockClusterConnector {
        let mut connector = MockClusterConnector::new();
        connector.expect_connect().times(0);
        connector
    }

    fn reconciler(api: MockClusterApi, connector: MockClusterConnector) -> ClusterReconciler {
        ClusterReconciler::new(
            Arc::new(api),
            Arc::new(connector),
            ReconcilerConfig::new("org-1"),
        )
    }

    /// Persisted state after a successful create
    fn persisted(auto_upgrade_disabled: bool) -> ClusterState {
        let mut r = healthy_record();
        r.data.auto_upgrade_disabled = Some(auto_upgrade_disabled);
        r.data.size = Some(ClusterSize::Small);
        let mut state = ClusterState::from_record(desired(true), &r);
        state.observed.manifests = Tristate::known(BUNDLE.to_string());
        state
    }

    // ==========================================================================
    // Story Tests: Create
    // ==========================================================================

    /// Story: create waits for reconciliation, installs the agent, then waits for health
    #[tokio::test(start_paused = true)]
    async fn story_create_installs_agent_and_records_version() {
        let gets = Arc::new(AtomicUsize::new(0));
        let g = gets.clone();
        let mut api = MockClusterApi::new();
        api.expect_create_cluster()
            .withf(|req| !req.upsert && req.organization_id == "org-1" && req.name == "prod")
            .times(1)
            .returning(|_| {
                Ok(record(
                    ReconciliationStatusCode::Progressing,
                    HealthStatusCode::Unspecified,
                ))
            });
        api.expect_get_cluster().returning(move |_, _, _| {
            Ok(match g.fetch_add(1, Ordering::SeqCst) {
                0 => record(ReconciliationStatusCode::Successful, HealthStatusCode::Progressing),
                1 => record(ReconciliationStatusCode::Successful, HealthStatusCode::Progressing),
                _ => healthy_record(),
            })
        });
        api.expect_get_manifests()
            .times(1)
            .returning(|_, _, _| Ok(BUNDLE.to_string()));

        let cluster = InMemoryCluster::new();
        let result = reconciler(api, connector_for(&cluster))
            .create_cluster(desired(true), &CancellationToken::new())
            .await;

        assert!(result.is_success(), "{:?}", result.diagnostics);
        let state = result.value.unwrap();
        assert_eq!(state.observed.agent_version, Tristate::known("0.5.0".to_string()));
        assert_eq!(state.observed.health_status.code, HealthStatusCode::Healthy);
        assert_eq!(state.desired.id, Tristate::known("c-1".to_string()));
        assert!(state.desired.kube_config.is_known());
        assert_eq!(cluster.live_objects(), 3);
        assert_eq!(gets.load(Ordering::SeqCst), 3);
    }

    /// Story: without credentials the record is created but no agent is installed
    #[tokio::test(start_paused = true)]
    async fn story_create_without_credentials_warns() {
        let mut api = MockClusterApi::new();
        api.expect_create_cluster().returning(|_| {
            Ok(record(
                ReconciliationStatusCode::Successful,
                HealthStatusCode::Unspecified,
            ))
        });
        // Already reconciled, and health is never polled
        api.expect_get_cluster().times(0);
        api.expect_get_manifests()
            .returning(|_, _, _| Ok(BUNDLE.to_string()));

        let result = reconciler(api, unused_connector())
            .create_cluster(desired(false), &CancellationToken::new())
            .await;

        assert!(result.is_success());
        assert_eq!(result.diagnostics.warnings().count(), 1);
        let state = result.value.unwrap();
        assert!(state.observed.agent_version.is_null());
        assert_eq!(state.observed.manifests.value_str(), BUNDLE);
    }

    /// Story: a remote create failure ends the operation before anything else
    #[tokio::test]
    async fn story_create_remote_failure_is_terminal() {
        let mut api = MockClusterApi::new();
        api.expect_create_cluster()
            .returning(|_| Err(Error::transport("create_cluster", "unauthenticated")));
        api.expect_get_cluster().times(0);
        api.expect_get_manifests().times(0);

        let result = reconciler(api, unused_connector())
            .create_cluster(desired(true), &CancellationToken::new())
            .await;

        assert!(result.value.is_none());
        assert!(result.diagnostics.has_error());
        assert!(result
            .diagnostics
            .errors()
            .next()
            .unwrap()
            .detail
            .contains("unauthenticated"));
    }

    /// Story: a rejected manifest is reported but the created state is still returned
    #[tokio::test(start_paused = true)]
    async fn story_create_apply_failure_keeps_remote_state() {
        let mut api = MockClusterApi::new();
        api.expect_create_cluster().returning(|_| {
            Ok(record(
                ReconciliationStatusCode::Successful,
                HealthStatusCode::Progressing,
            ))
        });
        // Health is still awaited after a partial install
        api.expect_get_cluster().times(1).returning(|_, _, _| {
            Ok(ClusterRecord {
                agent_state: Some(AgentState {
                    version: "0.4.9".to_string(),
                }),
                ..record(ReconciliationStatusCode::Successful, HealthStatusCode::Degraded)
            })
        });
        api.expect_get_manifests()
            .returning(|_, _, _| Ok(BUNDLE.to_string()));

        let cluster = InMemoryCluster::failing_on("agent");
        let result = reconciler(api, connector_for(&cluster))
            .create_cluster(desired(true), &CancellationToken::new())
            .await;

        assert!(!result.is_success());
        assert_eq!(result.diagnostics.errors().count(), 1);
        let detail = &result.diagnostics.errors().next().unwrap().detail;
        assert!(detail.contains("Deployment akuity/agent"));

        let state = result.value.unwrap();
        assert_eq!(state.observed.id, "c-1");
        assert_eq!(state.observed.health_status.code, HealthStatusCode::Degraded);
        assert_eq!(state.observed.agent_version.value_str(), "0.4.9");
        assert_eq!(cluster.live_objects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_unparseable_manifests_still_waits_for_health() {
        let mut api = MockClusterApi::new();
        api.expect_create_cluster().returning(|_| {
            Ok(record(
                ReconciliationStatusCode::Successful,
                HealthStatusCode::Progressing,
            ))
        });
        api.expect_get_cluster()
            .times(1)
            .returning(|_, _, _| Ok(healthy_record()));
        api.expect_get_manifests()
            .returning(|_, _, _| Ok("kind: [broken".to_string()));

        let cluster = InMemoryCluster::new();
        let result = reconciler(api, connector_for(&cluster))
            .create_cluster(desired(true), &CancellationToken::new())
            .await;

        assert!(result.diagnostics.has_error());
        assert_eq!(result.value.unwrap().observed.agent_version.value_str(), "0.5.0");
        assert!(cluster.operations().is_empty());
    }

    /// Story: cancelling while waiting for reconciliation still returns the identity
    #[tokio::test(start_paused = true)]
    async fn story_create_cancelled_during_poll() {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let mut api = MockClusterApi::new();
        api.expect_create_cluster().returning(|_| {
            Ok(record(
                ReconciliationStatusCode::Progressing,
                HealthStatusCode::Unspecified,
            ))
        });
        api.expect_get_cluster().returning(move |_, _, _| {
            token.cancel();
            Ok(record(
                ReconciliationStatusCode::Progressing,
                HealthStatusCode::Unspecified,
            ))
        });
        api.expect_get_manifests().times(0);

        let result = reconciler(api, unused_connector())
            .create_cluster(desired(true), &cancel)
            .await;

        let detail = &result.diagnostics.errors().next().unwrap().detail;
        assert!(detail.contains("cancelled"));
        assert_eq!(result.value.unwrap().observed.id, "c-1");
    }

    // ==========================================================================
    // Story Tests: Read
    // ==========================================================================

    /// Story: a vanished record is a signal, not an error
    #[tokio::test]
    async fn story_read_not_found() {
        let mut api = MockClusterApi::new();
        api.expect_get_cluster()
            .returning(|_, _, id| Err(Error::cluster_not_found(id)));

        let result = reconciler(api, unused_connector())
            .read_cluster(persisted(false), &CancellationToken::new())
            .await;

        assert_eq!(result.value, Some(ReadOutcome::NotFound));
        assert!(result.diagnostics.is_empty());
    }

    #[tokio::test]
    async fn test_read_uses_cached_manifests() {
        let mut api = MockClusterApi::new();
        api.expect_get_cluster().returning(|_, _, _| {
            Ok(record(
                ReconciliationStatusCode::Successful,
                HealthStatusCode::Degraded,
            ))
        });
        api.expect_get_manifests().times(0);

        let result = reconciler(api, unused_connector())
            .read_cluster(persisted(false), &CancellationToken::new())
            .await;

        match result.value {
            Some(ReadOutcome::Found(state)) => {
                assert_eq!(state.observed.health_status.code, HealthStatusCode::Degraded);
                assert_eq!(state.observed.manifests.value_str(), BUNDLE);
                assert!(state.desired.kube_config.is_known());
            }
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_read_fetches_missing_manifests() {
        let mut api = MockClusterApi::new();
        api.expect_get_cluster().returning(|_, _, _| Ok(healthy_record()));
        api.expect_get_manifests()
            .times(1)
            .returning(|_, _, _| Ok("kind: Namespace".to_string()));

        let mut prior = persisted(false);
        prior.observed.manifests = Tristate::Null;
        let result = reconciler(api, unused_connector())
            .read_cluster(prior, &CancellationToken::new())
            .await;

        match result.value {
            Some(ReadOutcome::Found(state)) => {
                assert_eq!(state.observed.manifests.value_str(), "kind: Namespace")
            }
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_read_transport_error() {
        let mut api = MockClusterApi::new();
        api.expect_get_cluster()
            .returning(|_, _, _| Err(Error::transport("get_cluster", "503")));

        let result = reconciler(api, unused_connector())
            .read_cluster(persisted(false), &CancellationToken::new())
            .await;
        assert!(result.value.is_none());
        assert!(result.diagnostics.has_error());
    }

    // ==========================================================================
    // Story Tests: Update
    // ==========================================================================

    /// Story: with auto-upgrade on, the backend owns the agent and nothing is applied
    #[tokio::test]
    async fn story_update_with_auto_upgrade_leaves_agent_alone() {
        let mut api = MockClusterApi::new();
        api.expect_update_cluster()
            // Size was unknown in the plan, so the persisted size is sent
            .withf(|req| req.id == "c-1" && req.data.size == Some(ClusterSize::Small))
            .times(1)
            .returning(|req| {
                let mut r = healthy_record();
                r.data = req.data;
                Ok(r)
            });
        api.expect_get_manifests()
            .times(1)
            .returning(|_, _, _| Ok(BUNDLE.to_string()));
        api.expect_get_cluster().times(0);

        let incoming = ClusterDesiredState {
            description: Tristate::known("moved to eu".to_string()),
            ..Default::default()
        };
        let result = reconciler(api, unused_connector())
            .update_cluster(persisted(false), incoming, &CancellationToken::new())
            .await;

        assert!(result.is_success());
        assert!(result.diagnostics.is_empty());
        let state = result.value.unwrap();
        assert_eq!(state.desired.size, Tristate::known(ClusterSize::Small));
        assert!(state.desired.kube_config.is_known());
    }

    /// Story: with auto-upgrade off, update reapplies the bundle and waits for health
    #[tokio::test(start_paused = true)]
    async fn story_update_with_auto_upgrade_disabled_reapplies() {
        let mut api = MockClusterApi::new();
        api.expect_update_cluster().returning(|req| {
            let mut r = record(ReconciliationStatusCode::Progressing, HealthStatusCode::Progressing);
            r.data = req.data;
            Ok(r)
        });
        api.expect_get_manifests()
            .returning(|_, _, _| Ok(BUNDLE.to_string()));
        api.expect_get_cluster().times(1).returning(|_, _, _| {
            let mut r = healthy_record();
            r.data.auto_upgrade_disabled = Some(true);
            r.data.size = Some(ClusterSize::Small);
            Ok(r)
        });

        let cluster = InMemoryCluster::new();
        let incoming = ClusterDesiredState {
            auto_upgrade_disabled: Tristate::known(true),
            size: Tristate::Unknown,
            ..Default::default()
        };
        let result = reconciler(api, connector_for(&cluster))
            .update_cluster(persisted(false), incoming, &CancellationToken::new())
            .await;

        assert!(result.is_success(), "{:?}", result.diagnostics);
        let state = result.value.unwrap();
        assert_eq!(state.desired.auto_upgrade_disabled, Tristate::known(true));
        assert_eq!(state.desired.size, Tristate::known(ClusterSize::Small));
        assert_eq!(state.observed.agent_version.value_str(), "0.5.0");
        assert_eq!(cluster.operations().len(), 3);
    }

    #[tokio::test]
    async fn test_update_remote_failure() {
        let mut api = MockClusterApi::new();
        api.expect_update_cluster()
            .returning(|_| Err(Error::transport("update_cluster", "deadline exceeded")));
        api.expect_get_manifests().times(0);

        let result = reconciler(api, unused_connector())
            .update_cluster(
                persisted(true),
                ClusterDesiredState::default(),
                &CancellationToken::new(),
            )
            .await;
        assert!(result.value.is_none());
        assert!(result.diagnostics.has_error());
    }

    // ==========================================================================
    // Story Tests: Delete and List
    // ==========================================================================

    /// Story: delete tears down the agent in reverse, then removes the record
    #[tokio::test(start_paused = true)]
    async fn story_delete_removes_agent_then_record() {
        let mut api = MockClusterApi::new();
        api.expect_get_manifests().times(0);
        api.expect_delete_cluster()
            .withf(|org, inst, id| org == "org-1" && inst == "inst-1" && id == "c-1")
            .times(1)
            .returning(|_, _, _| Ok(()));

        let cluster = InMemoryCluster::new();
        let engine = ManifestEngine::new(Arc::new(cluster.clone()));
        engine
            .apply_all(&manifests::parse(BUNDLE).unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        let start = tokio::time::Instant::now();
        let diags = reconciler(api, connector_for(&cluster))
            .delete_cluster(&persisted(false), &CancellationToken::new())
            .await;

        assert!(diags.is_empty(), "{diags:?}");
        assert_eq!(cluster.live_objects(), 0);
        assert_eq!(
            &cluster.operations()[3..],
            &[
                "delete Deployment agent".to_string(),
                "delete ClusterRole agent-role".to_string(),
                "delete ServiceAccount agent-sa".to_string(),
            ]
        );
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    /// Story: a stuck resource keeps the remote record so delete can be retried
    #[tokio::test]
    async fn story_delete_manifest_failure_keeps_record() {
        let mut api = MockClusterApi::new();
        api.expect_delete_cluster().times(0);

        let cluster = InMemoryCluster::failing_on("agent-role");
        let diags = reconciler(api, connector_for(&cluster))
            .delete_cluster(&persisted(false), &CancellationToken::new())
            .await;

        assert!(diags.has_error());
        assert!(diags
            .errors()
            .next()
            .unwrap()
            .detail
            .contains("ClusterRole agent-role"));
    }

    /// Story: a record removed elsewhere is not an error when manifests must be fetched
    #[tokio::test]
    async fn story_delete_record_already_gone_without_cached_manifests() {
        let mut api = MockClusterApi::new();
        api.expect_get_manifests()
            .times(1)
            .returning(|_, _, id| Err(Error::cluster_not_found(id)));
        api.expect_delete_cluster().times(0);

        let cluster = InMemoryCluster::new();
        let mut state = persisted(false);
        state.observed.manifests = Tristate::Unknown;
        let diags = reconciler(api, connector_for(&cluster))
            .delete_cluster(&state, &CancellationToken::new())
            .await;

        assert!(!diags.has_error(), "{diags:?}");
        assert!(cluster.operations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_fetches_uncached_manifests() {
        let mut api = MockClusterApi::new();
        api.expect_get_manifests()
            .times(1)
            .returning(|_, _, _| Ok(BUNDLE.to_string()));
        api.expect_delete_cluster().times(1).returning(|_, _, _| Ok(()));

        let cluster = InMemoryCluster::new();
        let mut state = persisted(false);
        state.observed.manifests = Tristate::Null;
        let diags = reconciler(api, connector_for(&cluster))
            .delete_cluster(&state, &CancellationToken::new())
            .await;

        assert!(diags.is_empty(), "{diags:?}");
        assert_eq!(cluster.operations().len(), 3);
    }

    #[tokio::test]
    async fn test_delete_manifest_fetch_failure_keeps_record() {
        let mut api = MockClusterApi::new();
        api.expect_get_manifests()
            .returning(|_, _, _| Err(Error::transport("get_manifests", "503")));
        api.expect_delete_cluster().times(0);

        let mut state = persisted(false);
        state.observed.manifests = Tristate::Unknown;
        let diags = reconciler(api, connector_for(&InMemoryCluster::new()))
            .delete_cluster(&state, &CancellationToken::new())
            .await;

        assert!(diags.has_error());
    }

    #[tokio::test]
    async fn test_delete_without_credentials_still_deletes_record() {
        let mut api = MockClusterApi::new();
        api.expect_delete_cluster()
            .times(1)
            .returning(|_, _, id| Err(Error::cluster_not_found(id)));

        let mut state = persisted(false);
        state.desired.kube_config = Tristate::Null;
        let diags = reconciler(api, unused_connector())
            .delete_cluster(&state, &CancellationToken::new())
            .await;

        // Missing credentials warn; an already deleted record is fine
        assert!(!diags.has_error());
        assert_eq!(diags.warnings().count(), 1);
    }

    #[tokio::test]
    async fn test_kube_access_reconciler_skips_agent_without_credentials() {
        let mut api = MockClusterApi::new();
        api.expect_delete_cluster().times(1).returning(|_, _, _| Ok(()));

        let mut config = ReconcilerConfig::new("org-1");
        config.delete_settle_delay = Duration::ZERO;
        let mut state = persisted(false);
        state.desired.kube_config = Tristate::Null;
        let diags = ClusterReconciler::with_kube_access(Arc::new(api), config)
            .delete_cluster(&state, &CancellationToken::new())
            .await;

        assert!(!diags.has_error());
        assert_eq!(diags.warnings().count(), 1);
    }

    #[tokio::test]
    async fn test_list_fetches_manifests_per_cluster() {
        let mut api = MockClusterApi::new();
        api.expect_list_clusters().times(1).returning(|_, _| {
            let mut second = healthy_record();
            second.id = "c-2".to_string();
            Ok(vec![healthy_record(), second])
        });
        api.expect_get_manifests()
            .times(2)
            .returning(|_, _, id| Ok(format!("# manifests for {id}")));

        let result = reconciler(api, unused_connector())
            .list_clusters("inst-1", &CancellationToken::new())
            .await;

        let clusters = result.value.unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[1].observed.manifests.value_str(), "# manifests for c-2");
        assert_eq!(clusters[0].instance_id(), "inst-1");
        assert!(clusters[0].desired.kube_config.is_unknown());
    }

    #[tokio::test]
    async fn test_config_error_from_connector_is_a_warning() {
        let mut api = MockClusterApi::new();
        api.expect_delete_cluster().returning(|_, _, _| Ok(()));
        let mut connector = MockClusterConnector::new();
        connector
            .expect_connect()
            .returning(|_| Err(Error::config("no usable credentials")));

        let mut config = ReconcilerConfig::new("org-1");
        config.delete_settle_delay = Duration::ZERO;
        let reconciler = ClusterReconciler::new(Arc::new(api), Arc::new(connector), config);
        let diags = reconciler
            .delete_cluster(&persisted(false), &CancellationToken::new())
            .await;

        assert!(!diags.has_error());
        assert!(diags
            .warnings()
            .next()
            .unwrap()
            .detail
            .contains("no usable credentials"));
    }
}
