use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use kube::api::{Api, Patch, PatchParams};
use kube::client::Client;
use kube::ResourceExt;
use serde_json::json;
use tracing::debug;

use crate::resources::istiorevisions::{IstioRevision, IstioRevisionStatus};
use crate::{Error, Result};

/// The cluster API operations the IstioRevision reconciler needs.
///
/// Every write is conditional on the resourceVersion of the IstioRevision passed in, so a
/// concurrent writer surfaces as a conflict error instead of a lost update.
#[async_trait]
pub trait Cluster: Send + Sync {
    async fn get_revision(&self, namespace: &str, name: &str) -> Result<Option<IstioRevision>>;

    /// Returns the revision as stored after the update, so later writes carry its resourceVersion.
    async fn add_finalizer(&self, rev: &IstioRevision, finalizer: &str) -> Result<IstioRevision>;

    async fn remove_finalizer(&self, rev: &IstioRevision, finalizer: &str) -> Result<()>;

    async fn patch_status(&self, rev: &IstioRevision, status: &IstioRevisionStatus) -> Result<()>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>>;
}

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn revisions(&self, rev: &IstioRevision) -> Result<Api<IstioRevision>> {
        let namespace = rev
            .metadata
            .namespace
            .as_deref()
            .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
        Ok(Api::namespaced(self.client.clone(), namespace))
    }

    async fn patch_finalizers(
        &self,
        rev: &IstioRevision,
        finalizers: Vec<String>,
    ) -> Result<IstioRevision> {
        let resource_version = rev
            .resource_version()
            .ok_or(Error::MissingObjectKey("metadata.resourceVersion"))?;
        let patch = Patch::Merge(json!({
            "metadata": {
                "resourceVersion": resource_version,
                "finalizers": finalizers,
            }
        }));
        Ok(self
            .revisions(rev)?
            .patch(&rev.name_any(), &PatchParams::default(), &patch)
            .await?)
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn get_revision(&self, namespace: &str, name: &str) -> Result<Option<IstioRevision>> {
        let api: Api<IstioRevision> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn add_finalizer(&self, rev: &IstioRevision, finalizer: &str) -> Result<IstioRevision> {
        if rev.finalizers().iter().any(|f| f == finalizer) {
            return Ok(rev.clone());
        }
        debug!("Adding finalizer {finalizer} to IstioRevision {}", rev.name_any());
        let mut finalizers = rev.finalizers().to_vec();
        finalizers.push(finalizer.into());
        self.patch_finalizers(rev, finalizers).await
    }

    async fn remove_finalizer(&self, rev: &IstioRevision, finalizer: &str) -> Result<()> {
        if !rev.finalizers().iter().any(|f| f == finalizer) {
            return Ok(());
        }
        debug!(
            "Removing finalizer {finalizer} from IstioRevision {}",
            rev.name_any()
        );
        let finalizers = rev
            .finalizers()
            .iter()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect();
        self.patch_finalizers(rev, finalizers).await?;
        Ok(())
    }

    async fn patch_status(&self, rev: &IstioRevision, status: &IstioRevisionStatus) -> Result<()> {
        let resource_version = rev
            .resource_version()
            .ok_or(Error::MissingObjectKey("metadata.resourceVersion"))?;
        let patch = Patch::Merge(json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status,
        }));
        self.revisions(rev)?
            .patch_status(&rev.name_any(), &PatchParams::default(), &patch)
            .await?;
        Ok(())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use super::*;

    /// A recorded write against the [`FakeCluster`].
    #[derive(Clone, Debug, PartialEq)]
    pub enum Call {
        AddFinalizer(String),
        RemoveFinalizer(String),
        PatchStatus(IstioRevisionStatus),
    }

    #[derive(Default)]
    struct Objects {
        revisions: BTreeMap<(String, String), IstioRevision>,
        deployments: BTreeMap<(String, String), Deployment>,
        daemon_sets: BTreeMap<(String, String), DaemonSet>,
        calls: Vec<Call>,
        fail_status_patch: bool,
        fail_deployment_get: bool,
    }

    /// In-memory cluster. Writes to revisions are applied to the stored copy and recorded.
    #[derive(Clone, Default)]
    pub struct FakeCluster {
        objects: Arc<Mutex<Objects>>,
    }

    fn key(namespace: Option<&str>, name: &str) -> (String, String) {
        (namespace.unwrap_or_default().to_string(), name.to_string())
    }

    fn conflict() -> Error {
        Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "the object has been modified".into(),
            reason: "Conflict".into(),
            code: 409,
        }))
    }

    impl FakeCluster {
        pub fn put_revision(&self, rev: IstioRevision) {
            let k = key(rev.metadata.namespace.as_deref(), &rev.name_any());
            self.objects.lock().unwrap().revisions.insert(k, rev);
        }

        pub fn revision(&self, namespace: &str, name: &str) -> Option<IstioRevision> {
            let objects = self.objects.lock().unwrap();
            objects.revisions.get(&key(Some(namespace), name)).cloned()
        }

        pub fn put_deployment(&self, deployment: Deployment) {
            let k = key(deployment.metadata.namespace.as_deref(), &deployment.name_any());
            self.objects.lock().unwrap().deployments.insert(k, deployment);
        }

        pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
            let objects = self.objects.lock().unwrap();
            objects.deployments.get(&key(Some(namespace), name)).cloned()
        }

        pub fn put_daemon_set(&self, daemon_set: DaemonSet) {
            let k = key(daemon_set.metadata.namespace.as_deref(), &daemon_set.name_any());
            self.objects.lock().unwrap().daemon_sets.insert(k, daemon_set);
        }

        pub fn calls(&self) -> Vec<Call> {
            self.objects.lock().unwrap().calls.clone()
        }

        pub fn clear_calls(&self) {
            self.objects.lock().unwrap().calls.clear();
        }

        pub fn fail_status_patch(&self) {
            self.objects.lock().unwrap().fail_status_patch = true;
        }

        pub fn fail_deployment_get(&self) {
            self.objects.lock().unwrap().fail_deployment_get = true;
        }

        fn update_revision(
            &self,
            rev: &IstioRevision,
            call: Call,
            update: impl FnOnce(&mut IstioRevision),
        ) -> Result<IstioRevision> {
            let mut objects = self.objects.lock().unwrap();
            let k = key(rev.metadata.namespace.as_deref(), &rev.name_any());
            let stored = objects.revisions.get_mut(&k).ok_or_else(conflict)?;
            if stored.resource_version() != rev.resource_version() {
                return Err(conflict());
            }
            update(stored);
            let next = stored
                .resource_version()
                .and_then(|rv| rv.parse::<u64>().ok())
                .unwrap_or_default()
                + 1;
            stored.metadata.resource_version = Some(next.to_string());
            let updated = stored.clone();
            objects.calls.push(call);
            Ok(updated)
        }
    }

    #[async_trait]
    impl Cluster for FakeCluster {
        async fn get_revision(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<IstioRevision>> {
            Ok(self.revision(namespace, name))
        }

        async fn add_finalizer(
            &self,
            rev: &IstioRevision,
            finalizer: &str,
        ) -> Result<IstioRevision> {
            if rev.finalizers().iter().any(|f| f == finalizer) {
                return Ok(rev.clone());
            }
            self.update_revision(rev, Call::AddFinalizer(finalizer.into()), |stored| {
                stored
                    .metadata
                    .finalizers
                    .get_or_insert_with(Vec::new)
                    .push(finalizer.into());
            })
        }

        async fn remove_finalizer(&self, rev: &IstioRevision, finalizer: &str) -> Result<()> {
            if !rev.finalizers().iter().any(|f| f == finalizer) {
                return Ok(());
            }
            self.update_revision(rev, Call::RemoveFinalizer(finalizer.into()), |stored| {
                if let Some(finalizers) = stored.metadata.finalizers.as_mut() {
                    finalizers.retain(|f| f != finalizer);
                }
            })?;
            Ok(())
        }

        async fn patch_status(
            &self,
            rev: &IstioRevision,
            status: &IstioRevisionStatus,
        ) -> Result<()> {
            if self.objects.lock().unwrap().fail_status_patch {
                return Err(conflict());
            }
            self.update_revision(rev, Call::PatchStatus(status.clone()), |stored| {
                stored.status = Some(status.clone());
            })?;
            Ok(())
        }

        async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
            if self.objects.lock().unwrap().fail_deployment_get {
                return Err(Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
                    status: "Failure".into(),
                    message: "etcdserver: request timed out".into(),
                    reason: "InternalError".into(),
                    code: 500,
                })));
            }
            Ok(self.deployment(namespace, name))
        }

        async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>> {
            let objects = self.objects.lock().unwrap();
            Ok(objects.daemon_sets.get(&key(Some(namespace), name)).cloned())
        }
    }
}
