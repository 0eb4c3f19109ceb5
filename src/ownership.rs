use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};

use crate::resources::istiorevisions::IstioRevision;
use crate::{Error, Result};

/// Namespaced name (`<namespace>/<name>`, or `<name>` for cluster-scoped owners) of the owner of a
/// cluster-scoped object. Cluster-scoped objects may not carry an owner reference to a
/// namespaced owner, so this annotation stands in for one.
pub const OWNER_ANNOTATION: &str = "operator-sdk/primary-resource";
/// `<Kind>.<group>` of the owner named by [`OWNER_ANNOTATION`].
pub const OWNER_TYPE_ANNOTATION: &str = "operator-sdk/primary-resource-type";

/// Kinds that are not namespaced and so are linked to their revision through annotations.
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "APIService",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "IngressClass",
    "MutatingWebhookConfiguration",
    "Namespace",
    "PersistentVolume",
    "PriorityClass",
    "RuntimeClass",
    "SecurityContextConstraints",
    "StorageClass",
    "ValidatingAdmissionPolicy",
    "ValidatingAdmissionPolicyBinding",
    "ValidatingWebhookConfiguration",
];

pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// The controller owner reference stamped on every namespaced object installed for `rev`.
pub fn owner_reference(rev: &IstioRevision) -> Result<OwnerReference> {
    let mut owner = rev
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey("metadata.uid"))?;
    // the revision outlives its managed resources during foreground deletion
    owner.block_owner_deletion = Some(true);
    Ok(owner)
}

/// An owner read back from the ownership annotations of a cluster-scoped object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnnotatedOwner {
    pub namespace: Option<String>,
    pub name: String,
    pub kind: String,
    pub group: String,
}

impl AnnotatedOwner {
    /// The owner described by a controller owner reference living in `namespace`.
    pub fn from_owner_reference(owner: &OwnerReference, namespace: Option<&str>) -> Self {
        let group = match owner.api_version.rsplit_once('/') {
            Some((group, _version)) => group.to_string(),
            // core group, eg `v1`
            None => String::new(),
        };
        Self {
            namespace: namespace.map(Into::into),
            name: owner.name.clone(),
            kind: owner.kind.clone(),
            group,
        }
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        let namespaced_name = match &self.namespace {
            Some(ns) => format!("{ns}/{}", self.name),
            None => self.name.clone(),
        };
        let owner_type = if self.group.is_empty() {
            self.kind.clone()
        } else {
            format!("{}.{}", self.kind, self.group)
        };
        BTreeMap::from([
            (OWNER_ANNOTATION.to_string(), namespaced_name),
            (OWNER_TYPE_ANNOTATION.to_string(), owner_type),
        ])
    }

    /// Read the ownership annotations; `None` when either is missing or malformed.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Option<Self> {
        let namespaced_name = annotations.get(OWNER_ANNOTATION)?;
        let owner_type = annotations.get(OWNER_TYPE_ANNOTATION)?;

        let (namespace, name) = match namespaced_name.split_once('/') {
            Some((ns, name)) => (Some(ns.to_string()), name),
            None => (None, namespaced_name.as_str()),
        };
        if name.is_empty() || namespace.as_deref() == Some("") {
            return None;
        }

        let (kind, group) = match owner_type.split_once('.') {
            Some((kind, group)) => (kind, group),
            None => (owner_type.as_str(), ""),
        };
        if kind.is_empty() {
            return None;
        }

        Some(Self {
            namespace,
            name: name.to_string(),
            kind: kind.to_string(),
            group: group.to_string(),
        })
    }

    pub fn is_kind<K: Resource<DynamicType = ()>>(&self) -> bool {
        self.kind == K::kind(&()) && self.group == K::group(&())
    }
}

/// Route a change on a cluster-scoped object to the IstioRevision named in its ownership
/// annotations. The revision may no longer exist; the reconciler treats that as a no-op.
pub fn annotated_revision<K: ResourceExt>(obj: &K) -> Option<ObjectRef<IstioRevision>> {
    let owner = AnnotatedOwner::from_annotations(obj.annotations())?;
    if !owner.is_kind::<IstioRevision>() {
        return None;
    }
    let namespace = owner.namespace?;
    Some(ObjectRef::new(&owner.name).within(&namespace))
}
