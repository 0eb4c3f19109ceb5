use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{
    ConfigMap, Endpoints, ResourceQuota, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIGroup;
use kube::runtime::events::Recorder;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{
    api::{Api, ListParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Config as ControllerConfig, Controller},
        events::{Event, EventType},
        watcher::Config,
    },
    Resource,
};
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

use super::predicates::{ensure_deletion_change, validating_webhook_predicate};
use super::reconciler::Reconciler;
use crate::cluster::KubeCluster;
use crate::controllers::{Diagnostics, OperatorConfig, State};
use crate::helm::HelmCli;
use crate::ownership::annotated_revision;
use crate::resources::envoyfilters::EnvoyFilter;
use crate::resources::istiorevisions::IstioRevision;
use crate::{telemetry, Error, Metrics, Result};

// Context for our reconciler
#[derive(Clone)]
pub(super) struct Context {
    /// Converges a single revision
    pub reconciler: Reconciler,
    /// Kubernetes event recorder
    pub recorder: Recorder,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    pub backoff: Arc<RetryBackoff>,
}

impl Context {
    pub fn new(client: Client, reconciler: Reconciler, metrics: Metrics, state: State) -> Arc<Context> {
        Arc::new(Context {
            reconciler,
            recorder: Recorder::new(client, "istio-operator".into()),
            diagnostics: state.diagnostics.clone(),
            metrics,
            backoff: Arc::new(RetryBackoff::default()),
        })
    }

    async fn publish(&self, rev: &IstioRevision, event: Event) {
        if let Err(err) = self.recorder.publish(&event, &rev.object_ref(&())).await {
            warn!("Failed to publish {} event: {err}", event.reason);
        }
    }
}

const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Per-revision exponential requeue delay. Counts consecutive failures and starts over once a
/// reconcile succeeds.
#[derive(Default)]
pub(super) struct RetryBackoff {
    failures: Mutex<HashMap<ObjectRef<IstioRevision>, u32>>,
}

impl RetryBackoff {
    pub fn next(&self, key: &ObjectRef<IstioRevision>) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let attempt = failures.entry(key.clone()).or_insert(0);
        let delay = BACKOFF_BASE
            .saturating_mul(2u32.saturating_pow(*attempt))
            .min(BACKOFF_MAX);
        *attempt = attempt.saturating_add(1);
        delay
    }

    pub fn reset(&self, key: &ObjectRef<IstioRevision>) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

#[instrument(skip(ctx, rev), fields(trace_id))]
async fn reconcile(rev: Arc<IstioRevision>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<IstioRevision>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let name = rev.name_any();
    let namespace = rev
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    info!("Reconciling IstioRevision \"{namespace}/{name}\"");

    if rev.metadata.deletion_timestamp.is_some() {
        ctx.publish(
            &rev,
            Event {
                type_: EventType::Normal,
                reason: "DeleteRequested".into(),
                note: Some(format!("Uninstalling IstioRevision `{name}`")),
                action: "Deleting".into(),
                secondary: None,
            },
        )
        .await;
    }

    match ctx.reconciler.reconcile(&namespace, &name).await {
        Ok(()) => {
            ctx.backoff.reset(&ObjectRef::from_obj(rev.as_ref()));
            Ok(Action::await_change())
        }
        Err(err) => {
            warn!("reconcile failed: {:?}", err);
            ctx.publish(
                &rev,
                Event {
                    type_: EventType::Warning,
                    reason: "FailedReconcile".into(),
                    note: Some(err.to_string()),
                    action: "Reconcile".into(),
                    secondary: None,
                },
            )
            .await;
            ctx.metrics.reconcile_failure(rev.as_ref(), &err);
            Err(err)
        }
    }
}

/// Invalid revisions wait for the user to change them; everything else is retried.
fn error_policy(rev: Arc<IstioRevision>, error: &Error, ctx: Arc<Context>) -> Action {
    match error {
        Error::InvalidSpec(_) => Action::await_change(),
        _ => Action::requeue(ctx.backoff.next(&ObjectRef::from_obj(rev.as_ref()))),
    }
}

fn group_served<R: Resource<DynamicType = ()>>(group: &APIGroup) -> bool {
    group.name == R::group(&()) && group.versions.iter().any(|v| v.version == R::version(&()))
}

// Initialize the controller and shared state (given the crd is installed)
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let api_groups = match client.list_api_groups().await {
        Ok(list) => list,
        Err(e) => {
            error!("Could not list api groups: {e:?}");
            std::process::exit(1);
        }
    };
    let envoy_filter_installed = api_groups.groups.iter().any(group_served::<EnvoyFilter>);

    let rev_api = Api::<IstioRevision>::all(client.clone());
    if let Err(e) = rev_api.list(&ListParams::default().limit(1)).await {
        error!("IstioRevision is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    let cfg = Config::default();

    // cluster-scoped resources can't carry an owner reference to a revision, they are routed
    // through the ownership annotations instead
    let cr_watcher = watcher(Api::<ClusterRole>::all(client.clone()), cfg.clone())
        .touched_objects()
        .default_backoff();
    let crb_watcher = watcher(Api::<ClusterRoleBinding>::all(client.clone()), cfg.clone())
        .touched_objects()
        .default_backoff();
    let mwc_watcher = watcher(
        Api::<MutatingWebhookConfiguration>::all(client.clone()),
        cfg.clone(),
    )
    .touched_objects()
    .default_backoff();
    let vwc_watcher = watcher(
        Api::<ValidatingWebhookConfiguration>::all(client.clone()),
        cfg.clone(),
    )
    .map(|event| ensure_deletion_change(event))
    .touched_objects()
    .default_backoff()
    // istiod rewrites its validators continuously
    .predicate_filter(validating_webhook_predicate);

    let controller = Controller::new(rev_api, cfg.clone())
        .with_config(controller_config(state.config()))
        .shutdown_on_signal()
        .owns(Api::<ConfigMap>::all(client.clone()), cfg.clone())
        .owns(Api::<Deployment>::all(client.clone()), cfg.clone())
        .owns(Api::<DaemonSet>::all(client.clone()), cfg.clone())
        .owns(Api::<Endpoints>::all(client.clone()), cfg.clone())
        .owns(Api::<ResourceQuota>::all(client.clone()), cfg.clone())
        .owns(Api::<Secret>::all(client.clone()), cfg.clone())
        .owns(Api::<Service>::all(client.clone()), cfg.clone())
        .owns(Api::<ServiceAccount>::all(client.clone()), cfg.clone())
        .owns(Api::<Role>::all(client.clone()), cfg.clone())
        .owns(Api::<RoleBinding>::all(client.clone()), cfg.clone())
        .owns(Api::<PodDisruptionBudget>::all(client.clone()), cfg.clone())
        .owns(Api::<HorizontalPodAutoscaler>::all(client.clone()), cfg.clone())
        .watches_stream(cr_watcher, |cr| annotated_revision(&cr))
        .watches_stream(crb_watcher, |crb| annotated_revision(&crb))
        .watches_stream(mwc_watcher, |mwc| annotated_revision(&mwc))
        .watches_stream(vwc_watcher, |vwc| annotated_revision(&vwc));
    let controller = if envoy_filter_installed {
        controller.owns(Api::<EnvoyFilter>::all(client.clone()), cfg.clone())
    } else {
        info!("networking.istio.io/v1alpha3 is not served, not watching EnvoyFilters");
        controller
    };

    let config = state.config();
    let installer = HelmCli::new(
        config.helm_binary.clone(),
        config.resource_directory.clone(),
        config.post_renderer.clone(),
    );
    let reconciler = Reconciler::new(
        Arc::new(KubeCluster::new(client.clone())),
        Arc::new(installer),
    );

    controller
        .run(
            reconcile,
            error_policy,
            Context::new(client, reconciler, metrics, state),
        )
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

/// Revisions reconciled at once; the same revision is never reconciled twice concurrently.
fn controller_config(config: &OperatorConfig) -> ControllerConfig {
    // zero would lift the limit entirely
    ControllerConfig::default().concurrency(config.max_concurrent_reconciles.max(1))
}
