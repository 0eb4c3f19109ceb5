use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use tracing::*;

use super::status::{derive_state, is_cni_enabled, ready_condition, reconciled_condition};
use crate::cluster::Cluster;
use crate::helm::{ChartInstaller, CNI_CHARTS, CONTROL_PLANE_CHARTS};
use crate::ownership::owner_reference;
use crate::resources::istiorevisions::{IstioRevision, ISTIO_REVISION_FINALIZER};
use crate::values::Values;
use crate::{Error, Result};

/// Converges a single IstioRevision. Each call is a full pass: the controller runtime takes care
/// of queueing, per-key serialization and retries.
#[derive(Clone)]
pub struct Reconciler {
    cluster: Arc<dyn Cluster>,
    installer: Arc<dyn ChartInstaller>,
}

fn namespace_of(rev: &IstioRevision) -> Result<String> {
    rev.namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))
}

/// `spec.values` with the revision namespace forced into `global.istioNamespace`.
pub(super) fn effective_values(rev: &IstioRevision) -> Result<Values> {
    let mut values = Values::from_value(rev.spec.values.as_ref())?;
    values.set("global.istioNamespace", namespace_of(rev)?)?;
    Ok(values)
}

impl Reconciler {
    pub fn new(cluster: Arc<dyn Cluster>, installer: Arc<dyn ChartInstaller>) -> Self {
        Self { cluster, installer }
    }

    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<()> {
        let Some(rev) = self.cluster.get_revision(namespace, name).await? else {
            debug!("IstioRevision {namespace}/{name} not found, skipping reconciliation");
            return Ok(());
        };

        if rev.metadata.deletion_timestamp.is_some() {
            return self.cleanup(&rev).await;
        }

        if rev.spec.version.is_empty() {
            let err = Error::InvalidSpec("no spec.version set".into());
            let values = Values::from_value(rev.spec.values.as_ref()).unwrap_or_default();
            // only wait for a spec change once the problem is visible in the status,
            // otherwise retry like any other failed status write
            self.update_status(&rev, &values, Some(&err)).await?;
            return Err(err);
        }

        let rev = self
            .cluster
            .add_finalizer(&rev, ISTIO_REVISION_FINALIZER)
            .await?;

        let (values, install_error) = match effective_values(&rev) {
            Ok(values) => {
                info!("Installing components for IstioRevision {namespace}/{name}");
                let result = self.install(&rev, &values).await;
                (values, result.err())
            }
            Err(err) => (Values::new(), Some(err)),
        };

        debug!("Reconciliation of IstioRevision {namespace}/{name} done, updating status");
        self.finish(&rev, &values, install_error).await
    }

    async fn install(&self, rev: &IstioRevision, values: &Values) -> Result<()> {
        let owner = owner_reference(rev)?;
        let name = rev.name_any();
        let namespace = namespace_of(rev)?;
        let version = &rev.spec.version;

        if is_cni_enabled(values)? {
            self.installer
                .install_or_upgrade(CNI_CHARTS, values, version, &name, &namespace, &owner)
                .await?;
        }
        self.installer
            .install_or_upgrade(CONTROL_PLANE_CHARTS, values, version, &name, &namespace, &owner)
            .await
    }

    /// Uninstall everything, then release the revision. The finalizer stays on any failure so
    /// that cluster-scoped leftovers are never orphaned.
    async fn cleanup(&self, rev: &IstioRevision) -> Result<()> {
        let name = rev.name_any();
        let namespace = namespace_of(rev)?;
        info!("Uninstalling components of IstioRevision {namespace}/{name}");

        // cni may never have been installed; uninstalling it anyway is a no-op
        self.installer.uninstall(CNI_CHARTS, &name, &namespace).await?;
        self.installer
            .uninstall(CONTROL_PLANE_CHARTS, &name, &namespace)
            .await?;

        self.cluster
            .remove_finalizer(rev, ISTIO_REVISION_FINALIZER)
            .await
    }

    /// Write the status and pick the error to report. An installation error always wins over a
    /// failure to evaluate or write the status.
    async fn finish(
        &self,
        rev: &IstioRevision,
        values: &Values,
        install_error: Option<Error>,
    ) -> Result<()> {
        let status_result = self.update_status(rev, values, install_error.as_ref()).await;
        match (install_error, status_result) {
            (None, result) => result,
            (Some(err), Ok(())) => Err(err),
            (Some(err), Err(status_err)) => {
                warn!(
                    "Failed to update status of IstioRevision {}: {status_err}",
                    rev.name_any()
                );
                Err(err)
            }
        }
    }

    async fn update_status(
        &self,
        rev: &IstioRevision,
        values: &Values,
        install_error: Option<&Error>,
    ) -> Result<()> {
        let reconciled = reconciled_condition(install_error);
        let ready = ready_condition(&*self.cluster, rev, values).await?;

        let mut status = rev.status.clone().unwrap_or_default();
        status.observed_generation = rev.metadata.generation.unwrap_or_default();
        status.state = Some(derive_state(&reconciled, &ready));
        let now = Time(Utc::now());
        status.set_condition(reconciled, now.clone());
        status.set_condition(ready, now);

        if rev.status.as_ref() == Some(&status) {
            debug!("Status of IstioRevision {} is up to date", rev.name_any());
            return Ok(());
        }
        self.cluster.patch_status(rev, &status).await
    }
}
