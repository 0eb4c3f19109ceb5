use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::*;

use crate::values::Values;
use crate::{Error, Result};

pub mod post_render;

/// Charts installed for every revision, in install order.
pub const CONTROL_PLANE_CHARTS: &[&str] = &["base", "istiod"];
/// Charts for the optional CNI node agent.
pub const CNI_CHARTS: &[&str] = &["cni"];

/// Renders and applies named charts on behalf of an owner.
///
/// Both operations are idempotent: installing the current state again changes nothing, and
/// uninstalling charts that were never installed succeeds. Implementations stamp namespaced
/// outputs with `owner_reference` and cluster-scoped outputs with the ownership annotations.
#[async_trait]
pub trait ChartInstaller: Send + Sync {
    async fn install_or_upgrade(
        &self,
        charts: &[&str],
        values: &Values,
        version: &str,
        owner_name: &str,
        owner_namespace: &str,
        owner_reference: &OwnerReference,
    ) -> Result<()>;

    async fn uninstall(&self, charts: &[&str], owner_name: &str, owner_namespace: &str)
        -> Result<()>;
}

/// Installs charts by running the `helm` binary, one release per chart.
///
/// Charts are read from `<resource_directory>/<version>/charts/<chart>`. When a post-renderer is
/// configured, helm pipes the rendered manifests through it to stamp ownership.
#[derive(Clone, Debug)]
pub struct HelmCli {
    helm_binary: PathBuf,
    resource_directory: PathBuf,
    post_renderer: Option<PathBuf>,
}

impl HelmCli {
    pub fn new(
        helm_binary: impl Into<PathBuf>,
        resource_directory: impl Into<PathBuf>,
        post_renderer: Option<PathBuf>,
    ) -> Self {
        Self {
            helm_binary: helm_binary.into(),
            resource_directory: resource_directory.into(),
            post_renderer,
        }
    }

    fn chart_path(&self, version: &str, chart: &str) -> PathBuf {
        self.resource_directory
            .join(version)
            .join("charts")
            .join(chart)
    }

    fn install_args(
        &self,
        chart: &str,
        version: &str,
        owner_name: &str,
        owner_namespace: &str,
        owner_reference: &OwnerReference,
    ) -> Result<Vec<String>> {
        let mut args = vec![
            "upgrade".to_string(),
            "--install".to_string(),
            release_name(owner_name, chart),
            self.chart_path(version, chart).to_string_lossy().into_owned(),
            "--namespace".to_string(),
            owner_namespace.to_string(),
            // values are streamed on stdin
            "--values".to_string(),
            "-".to_string(),
        ];
        if let Some(post_renderer) = &self.post_renderer {
            args.push("--post-renderer".into());
            args.push(post_renderer.to_string_lossy().into_owned());
            args.push(format!(
                "--post-renderer-args=--owner-reference={}",
                serde_json::to_string(owner_reference)?
            ));
            args.push(format!(
                "--post-renderer-args=--owner-namespace={owner_namespace}"
            ));
        }
        Ok(args)
    }

    async fn helm(&self, args: &[String], stdin: Option<&[u8]>) -> Result<std::process::Output> {
        let mut child = Command::new(&self.helm_binary)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            match pipe.write_all(input).await {
                Ok(()) => {}
                // helm exited before reading everything; its stderr says why
                Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!("helm closed stdin early: {err}");
                }
                Err(err) => return Err(err.into()),
            }
            // closing stdin lets helm finish reading the values
            drop(pipe);
        }

        Ok(child.wait_with_output().await?)
    }
}

pub fn release_name(owner_name: &str, chart: &str) -> String {
    format!("{owner_name}-{chart}")
}

fn is_release_not_found(stderr: &str) -> bool {
    stderr.contains("release: not found")
}

#[async_trait]
impl ChartInstaller for HelmCli {
    async fn install_or_upgrade(
        &self,
        charts: &[&str],
        values: &Values,
        version: &str,
        owner_name: &str,
        owner_namespace: &str,
        owner_reference: &OwnerReference,
    ) -> Result<()> {
        let values = serde_yaml::to_string(values)?;
        for chart in charts {
            let args =
                self.install_args(chart, version, owner_name, owner_namespace, owner_reference)?;
            debug!("Installing chart {chart} version {version} in namespace {owner_namespace}");
            let output = self.helm(&args, Some(values.as_bytes())).await?;
            if !output.status.success() {
                return Err(Error::ChartFailed {
                    action: "install",
                    chart: chart.to_string(),
                    message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
        }
        Ok(())
    }

    async fn uninstall(
        &self,
        charts: &[&str],
        owner_name: &str,
        owner_namespace: &str,
    ) -> Result<()> {
        for chart in charts {
            let args = vec![
                "uninstall".to_string(),
                release_name(owner_name, chart),
                "--namespace".to_string(),
                owner_namespace.to_string(),
            ];
            debug!("Uninstalling chart {chart} from namespace {owner_namespace}");
            let output = self.helm(&args, None).await?;
            if output.status.success() {
                continue;
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_release_not_found(&stderr) {
                debug!("Chart {chart} was not installed in namespace {owner_namespace}");
                continue;
            }
            return Err(Error::ChartFailed {
                action: "uninstall",
                chart: chart.to_string(),
                message: stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn owner_reference() -> OwnerReference {
        OwnerReference {
            api_version: "operator.istio.io/v1alpha1".into(),
            kind: "IstioRevision".into(),
            name: "default".into(),
            uid: "1234".into(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    #[test]
    fn install_args_stream_values_and_use_versioned_chart() {
        let helm = HelmCli::new("helm", "/var/lib/istio-operator/resources", None);
        let args = helm
            .install_args("istiod", "v1.21.0", "default", "istio-system", &owner_reference())
            .unwrap();
        assert_eq!(
            args,
            vec![
                "upgrade",
                "--install",
                "default-istiod",
                "/var/lib/istio-operator/resources/v1.21.0/charts/istiod",
                "--namespace",
                "istio-system",
                "--values",
                "-",
            ]
        );
    }

    #[test]
    fn install_args_pass_owner_to_post_renderer() {
        let helm = HelmCli::new(
            "helm",
            "/resources",
            Some(PathBuf::from("/usr/local/bin/istio-operator-post-render")),
        );
        let args = helm
            .install_args("cni", "latest", "default", "istio-system", &owner_reference())
            .unwrap();
        assert_eq!(args[8], "--post-renderer");
        assert_eq!(args[9], "/usr/local/bin/istio-operator-post-render");
        assert!(args[10].starts_with("--post-renderer-args=--owner-reference={"));
        assert!(args[10].contains("\"uid\":\"1234\""));
        assert_eq!(
            args[11],
            "--post-renderer-args=--owner-namespace=istio-system"
        );
    }

    #[test]
    fn release_not_found_is_detected() {
        assert!(is_release_not_found(
            "Error: uninstall: Release not loaded: default-cni: release: not found"
        ));
        assert!(!is_release_not_found("Error: Kubernetes cluster unreachable"));
    }

    #[tokio::test]
    async fn missing_helm_binary_is_an_error() {
        let helm = HelmCli::new("/nonexistent/helm", "/resources", None);
        let err = helm
            .uninstall(CNI_CHARTS, "default", "istio-system")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IoError(_)));
    }

    #[tokio::test]
    async fn early_helm_exit_reports_stderr() {
        // sh fails to open the `upgrade` script and exits without reading the values
        let helm = HelmCli::new("/bin/sh", "/resources", None);
        let mut values = Values::new();
        values.set("pilot.env.PADDING", "x".repeat(1 << 20)).unwrap();

        let err = helm
            .install_or_upgrade(
                &["istiod"],
                &values,
                "latest",
                "default",
                "istio-system",
                &owner_reference(),
            )
            .await
            .unwrap_err();
        let Error::ChartFailed { action, chart, message } = err else {
            panic!("expected a chart failure");
        };
        assert_eq!(action, "install");
        assert_eq!(chart, "istiod");
        assert!(message.contains("upgrade"), "{message}");
    }
}
