use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub static ISTIO_REVISION_FINALIZER: &str = "operator.istio.io/istio-revision";

/// IstioRevision represents a single revision of an Istio control plane.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "IstioRevision",
    group = "operator.istio.io",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "IstioRevisionStatus", shortname = "istiorev")]
#[serde(rename_all = "camelCase")]
pub struct IstioRevisionSpec {
    /// Defines the version of Istio to install. Must be one of the versions shipped in the
    /// operator's resource directory.
    #[schemars(length(min = 1))]
    pub version: String,
    /// Values passed through to the Helm charts, for example `{"pilot": {"image": "..."}}`.
    /// `global.istioNamespace` is always overridden with the namespace of this IstioRevision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "values_schema")]
    pub values: Option<serde_json::Value>,
}

fn values_schema(_: &mut schemars::gen::SchemaGenerator) -> Schema {
    serde_json::from_value(json!({
        "type": "object",
        "nullable": true,
        "x-kubernetes-preserve-unknown-fields": true
    }))
    .unwrap()
}

/// Status of the IstioRevision.
/// This is set and managed automatically.
/// Read-only.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IstioRevisionStatus {
    /// The most recent generation observed by the controller.
    #[serde(default)]
    pub observed_generation: i64,

    /// Represents the latest available observations of the object's current state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<IstioRevisionCondition>,

    /// Summary of the Reconciled and Ready conditions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<IstioRevisionConditionReason>,
}

impl IstioRevisionStatus {
    pub fn get_condition(&self, r#type: IstioRevisionConditionType) -> Option<&IstioRevisionCondition> {
        self.conditions.iter().find(|c| c.r#type == r#type)
    }

    /// Store a condition, replacing any existing condition of the same type.
    /// The transition time only moves when the status changes.
    pub fn set_condition(&mut self, mut condition: IstioRevisionCondition, now: Time) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            Some(existing) => {
                condition.last_transition_time = if existing.status == condition.status {
                    existing.last_transition_time.clone().or(Some(now))
                } else {
                    Some(now)
                };
                *existing = condition;
            }
            None => {
                condition.last_transition_time = Some(now);
                self.conditions.push(condition);
            }
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IstioRevisionCondition {
    /// The type of this condition.
    pub r#type: IstioRevisionConditionType,

    /// The status of this condition. Can be True, False or Unknown.
    pub status: ConditionStatus,

    /// Unique, single-word, CamelCase reason for the condition's last transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<IstioRevisionConditionReason>,

    /// Human-readable message indicating details about the last transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the condition transitioned from one status to another.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

impl IstioRevisionCondition {
    pub fn new_true(r#type: IstioRevisionConditionType) -> Self {
        Self {
            r#type,
            status: ConditionStatus::True,
            reason: None,
            message: None,
            last_transition_time: None,
        }
    }

    pub fn new_false(
        r#type: IstioRevisionConditionType,
        reason: IstioRevisionConditionReason,
        message: impl Into<String>,
    ) -> Self {
        Self {
            r#type,
            status: ConditionStatus::False,
            reason: Some(reason),
            message: Some(message.into()),
            last_transition_time: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
pub enum IstioRevisionConditionType {
    /// Whether the last install or upgrade of the charts succeeded.
    Reconciled,
    /// Whether the installed control plane is running.
    Ready,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum IstioRevisionConditionReason {
    /// The charts could not be installed or upgraded.
    ReconcileError,
    /// The istiod Deployment is missing or not all of its pods are ready.
    IstiodNotReady,
    /// The istio-cni-node DaemonSet is missing or not all of its pods are ready.
    #[serde(rename = "CNINotReady")]
    CniNotReady,
    /// The revision is reconciled and ready.
    Healthy,
}

impl fmt::Display for IstioRevisionConditionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReconcileError => "ReconcileError",
            Self::IstiodNotReady => "IstiodNotReady",
            Self::CniNotReady => "CNINotReady",
            Self::Healthy => "Healthy",
        })
    }
}
