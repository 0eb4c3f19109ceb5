use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use kube::ResourceExt;

use crate::cluster::Cluster;
use crate::resources::istiorevisions::{
    ConditionStatus, IstioRevision, IstioRevisionCondition, IstioRevisionConditionReason,
    IstioRevisionConditionType,
};
use crate::values::Values;
use crate::{Error, Result};

pub(super) const ISTIOD_DEPLOYMENT_NAME: &str = "istiod";
pub(super) const CNI_DAEMON_SET_NAME: &str = "istio-cni-node";

pub(super) fn is_cni_enabled(values: &Values) -> Result<bool> {
    Ok(values.get_bool("istio_cni.enabled")?.unwrap_or(false))
}

/// The istiod Deployment is suffixed with the revision when the values set one.
pub(super) fn istiod_deployment_name(values: &Values) -> Result<String> {
    Ok(match values.get_str("revision")? {
        Some(revision) if !revision.is_empty() => format!("{ISTIOD_DEPLOYMENT_NAME}-{revision}"),
        _ => ISTIOD_DEPLOYMENT_NAME.to_string(),
    })
}

pub(super) fn reconciled_condition(install_error: Option<&Error>) -> IstioRevisionCondition {
    match install_error {
        None => IstioRevisionCondition::new_true(IstioRevisionConditionType::Reconciled),
        Some(err) => IstioRevisionCondition::new_false(
            IstioRevisionConditionType::Reconciled,
            IstioRevisionConditionReason::ReconcileError,
            format!("error reconciling resource: {err}"),
        ),
    }
}

/// A failed install outranks the readiness gap it probably caused.
pub(super) fn derive_state(
    reconciled: &IstioRevisionCondition,
    ready: &IstioRevisionCondition,
) -> IstioRevisionConditionReason {
    if reconciled.status == ConditionStatus::False {
        if let Some(reason) = reconciled.reason {
            return reason;
        }
    }
    if ready.status == ConditionStatus::False {
        if let Some(reason) = ready.reason {
            return reason;
        }
    }
    IstioRevisionConditionReason::Healthy
}

fn not_ready(reason: IstioRevisionConditionReason, message: &str) -> IstioRevisionCondition {
    IstioRevisionCondition::new_false(IstioRevisionConditionType::Ready, reason, message)
}

fn deployment_readiness(deployment: Option<&Deployment>) -> Option<IstioRevisionCondition> {
    let reason = IstioRevisionConditionReason::IstiodNotReady;
    let Some(deployment) = deployment else {
        return Some(not_ready(reason, "control-plane deployment not found"));
    };
    let status = deployment.status.clone().unwrap_or_default();
    let replicas = status.replicas.unwrap_or(0);
    let ready_replicas = status.ready_replicas.unwrap_or(0);
    if replicas == 0 {
        Some(not_ready(reason, "deployment is scaled to zero replicas"))
    } else if ready_replicas < replicas {
        Some(not_ready(reason, "not all control-plane pods are ready"))
    } else {
        None
    }
}

fn daemon_set_readiness(daemon_set: Option<&DaemonSet>) -> Option<IstioRevisionCondition> {
    let reason = IstioRevisionConditionReason::CniNotReady;
    let Some(daemon_set) = daemon_set else {
        return Some(not_ready(reason, "daemon set not found"));
    };
    let status = daemon_set.status.clone().unwrap_or_default();
    if status.current_number_scheduled == 0 {
        Some(not_ready(reason, "no pods currently scheduled"))
    } else if status.number_ready < status.current_number_scheduled {
        Some(not_ready(reason, "not all pods are ready"))
    } else {
        None
    }
}

/// Evaluate the Ready condition against the live workloads. The first failing check wins.
///
/// Missing or unready workloads are a normal `Ready=False`; failing to read them, or values of
/// the wrong type, is an error.
pub(super) async fn ready_condition(
    cluster: &dyn Cluster,
    rev: &IstioRevision,
    values: &Values,
) -> Result<IstioRevisionCondition> {
    let namespace = rev
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;

    let istiod = cluster
        .get_deployment(&namespace, &istiod_deployment_name(values)?)
        .await?;
    if let Some(condition) = deployment_readiness(istiod.as_ref()) {
        return Ok(condition);
    }

    if is_cni_enabled(values)? {
        let cni = cluster
            .get_daemon_set(&namespace, CNI_DAEMON_SET_NAME)
            .await?;
        if let Some(condition) = daemon_set_readiness(cni.as_ref()) {
            return Ok(condition);
        }
    }

    Ok(IstioRevisionCondition::new_true(
        IstioRevisionConditionType::Ready,
    ))
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::apps::v1::{DaemonSetStatus, DeploymentStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde_json::json;

    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::resources::istiorevisions::IstioRevisionSpec;

    fn revision() -> IstioRevision {
        let mut rev = IstioRevision::new("my-istio", IstioRevisionSpec::default());
        rev.metadata.namespace = Some("istio-system".into());
        rev
    }

    fn deployment(name: &str, replicas: i32, ready_replicas: i32) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("istio-system".into()),
                ..Default::default()
            },
            status: Some(DeploymentStatus {
                replicas: Some(replicas),
                ready_replicas: Some(ready_replicas),
                available_replicas: Some(ready_replicas),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn daemon_set(scheduled: i32, ready: i32) -> DaemonSet {
        DaemonSet {
            metadata: ObjectMeta {
                name: Some(CNI_DAEMON_SET_NAME.into()),
                namespace: Some("istio-system".into()),
                ..Default::default()
            },
            status: Some(DaemonSetStatus {
                current_number_scheduled: scheduled,
                number_ready: ready,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn values(v: serde_json::Value) -> Values {
        Values::from_value(Some(&v)).unwrap()
    }

    fn condition(
        reconciled: bool,
        r#type: IstioRevisionConditionType,
        reason: IstioRevisionConditionReason,
    ) -> IstioRevisionCondition {
        if reconciled {
            IstioRevisionCondition::new_true(r#type)
        } else {
            IstioRevisionCondition::new_false(r#type, reason, "")
        }
    }

    #[test]
    fn derive_state_precedence() {
        use IstioRevisionConditionReason::*;
        use IstioRevisionConditionType::*;

        let cases = [
            (true, true, Healthy),
            (false, true, ReconcileError),
            (true, false, IstiodNotReady),
            (false, false, ReconcileError),
        ];
        for (reconciled, ready, expected) in cases {
            let state = derive_state(
                &condition(reconciled, Reconciled, ReconcileError),
                &condition(ready, Ready, IstiodNotReady),
            );
            assert_eq!(state, expected, "reconciled={reconciled} ready={ready}");
        }
    }

    #[test]
    fn reconciled_condition_carries_error_text() {
        let ok = reconciled_condition(None);
        assert_eq!(ok.status, ConditionStatus::True);
        assert_eq!(ok.reason, None);
        assert_eq!(ok.message, None);

        let err = Error::ChartFailed {
            action: "install",
            chart: "istiod".into(),
            message: "timed out".into(),
        };
        let failed = reconciled_condition(Some(&err));
        assert_eq!(failed.status, ConditionStatus::False);
        assert_eq!(failed.reason, Some(IstioRevisionConditionReason::ReconcileError));
        assert!(failed.message.unwrap().contains("timed out"));
    }

    async fn evaluate(
        objects: (Vec<Deployment>, Vec<DaemonSet>),
        v: serde_json::Value,
    ) -> Result<IstioRevisionCondition> {
        let cluster = FakeCluster::default();
        for d in objects.0 {
            cluster.put_deployment(d);
        }
        for ds in objects.1 {
            cluster.put_daemon_set(ds);
        }
        ready_condition(&cluster, &revision(), &values(v)).await
    }

    fn assert_not_ready(
        condition: &IstioRevisionCondition,
        reason: IstioRevisionConditionReason,
        message: &str,
    ) {
        assert_eq!(condition.r#type, IstioRevisionConditionType::Ready);
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason, Some(reason));
        assert_eq!(condition.message.as_deref(), Some(message));
    }

    #[tokio::test]
    async fn istiod_ready() {
        let condition = evaluate((vec![deployment("istiod", 2, 2)], vec![]), json!({}))
            .await
            .unwrap();
        assert_eq!(condition.status, ConditionStatus::True);
        assert_eq!(condition.reason, None);
    }

    #[tokio::test]
    async fn istiod_not_ready() {
        let condition = evaluate((vec![deployment("istiod", 2, 1)], vec![]), json!({}))
            .await
            .unwrap();
        assert_not_ready(
            &condition,
            IstioRevisionConditionReason::IstiodNotReady,
            "not all control-plane pods are ready",
        );
    }

    #[tokio::test]
    async fn istiod_scaled_to_zero() {
        let condition = evaluate((vec![deployment("istiod", 0, 0)], vec![]), json!({}))
            .await
            .unwrap();
        assert_not_ready(
            &condition,
            IstioRevisionConditionReason::IstiodNotReady,
            "deployment is scaled to zero replicas",
        );
    }

    #[tokio::test]
    async fn istiod_not_found_regardless_of_cni() {
        for cni in [true, false] {
            let condition = evaluate(
                (vec![], vec![daemon_set(3, 3)]),
                json!({"istio_cni": {"enabled": cni}}),
            )
            .await
            .unwrap();
            assert_not_ready(
                &condition,
                IstioRevisionConditionReason::IstiodNotReady,
                "control-plane deployment not found",
            );
        }
    }

    #[tokio::test]
    async fn revisioned_istiod_deployment_is_used() {
        let condition = evaluate(
            (vec![deployment("istiod-my-revision", 2, 2)], vec![]),
            json!({"revision": "my-revision"}),
        )
        .await
        .unwrap();
        assert_eq!(condition.status, ConditionStatus::True);

        // the unrevisioned deployment does not count
        let condition = evaluate(
            (vec![deployment("istiod", 2, 2)], vec![]),
            json!({"revision": "my-revision"}),
        )
        .await
        .unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
    }

    #[tokio::test]
    async fn cni_ready() {
        let condition = evaluate(
            (vec![deployment("istiod", 2, 2)], vec![daemon_set(3, 3)]),
            json!({"istio_cni": {"enabled": true}}),
        )
        .await
        .unwrap();
        assert_eq!(condition.status, ConditionStatus::True);
    }

    #[tokio::test]
    async fn cni_not_found() {
        let condition = evaluate(
            (vec![deployment("istiod", 2, 2)], vec![]),
            json!({"istio_cni": {"enabled": true}}),
        )
        .await
        .unwrap();
        assert_not_ready(
            &condition,
            IstioRevisionConditionReason::CniNotReady,
            "daemon set not found",
        );
    }

    #[tokio::test]
    async fn cni_nothing_scheduled() {
        let condition = evaluate(
            (vec![deployment("istiod", 2, 2)], vec![daemon_set(0, 0)]),
            json!({"istio_cni": {"enabled": true}}),
        )
        .await
        .unwrap();
        assert_not_ready(
            &condition,
            IstioRevisionConditionReason::CniNotReady,
            "no pods currently scheduled",
        );
    }

    #[tokio::test]
    async fn cni_not_ready() {
        let condition = evaluate(
            (vec![deployment("istiod", 2, 2)], vec![daemon_set(1, 0)]),
            json!({"istio_cni": {"enabled": true}}),
        )
        .await
        .unwrap();
        assert_not_ready(
            &condition,
            IstioRevisionConditionReason::CniNotReady,
            "not all pods are ready",
        );
    }

    #[tokio::test]
    async fn cni_ignored_when_disabled() {
        let condition = evaluate((vec![deployment("istiod", 1, 1)], vec![]), json!({}))
            .await
            .unwrap();
        assert_eq!(condition.status, ConditionStatus::True);
    }

    #[tokio::test]
    async fn istiod_checked_before_cni() {
        let condition = evaluate(
            (vec![deployment("istiod", 2, 0)], vec![daemon_set(1, 0)]),
            json!({"istio_cni": {"enabled": true}}),
        )
        .await
        .unwrap();
        assert_eq!(
            condition.reason,
            Some(IstioRevisionConditionReason::IstiodNotReady)
        );
    }

    #[tokio::test]
    async fn mistyped_values_are_an_error() {
        let result = evaluate(
            (vec![deployment("istiod", 2, 2)], vec![]),
            json!({"istio_cni": {"enabled": "true"}}),
        )
        .await;
        assert!(matches!(result, Err(Error::InvalidValues(_))));

        let result = evaluate((vec![], vec![]), json!({"revision": 3})).await;
        assert!(matches!(result, Err(Error::InvalidValues(_))));
    }

    #[tokio::test]
    async fn failing_to_read_deployment_is_an_error() {
        let cluster = FakeCluster::default();
        cluster.fail_deployment_get();
        let result = ready_condition(&cluster, &revision(), &Values::new()).await;
        assert!(matches!(result, Err(Error::KubeError(_))));
    }
}
