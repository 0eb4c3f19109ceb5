use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Istio EnvoyFilter, only watched so that revisions owning one are reconciled when it changes.
/// The spec is kept untyped.
/// API: networking.istio.io/v1alpha3
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "networking.istio.io",
    version = "v1alpha3",
    kind = "EnvoyFilter",
    namespaced
)]
pub struct EnvoyFilterSpec {
    #[serde(flatten)]
    pub fields: BTreeMap<String, serde_json::Value>,
}
