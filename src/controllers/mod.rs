use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::client::Client;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::*;

use crate::Metrics;

pub mod istiorevision;

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
        }
    }
}

/// Where charts come from and how they are installed
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Charts are read from `<resource_directory>/<version>/charts/<chart>`
    pub resource_directory: PathBuf,
    /// The helm binary to run
    pub helm_binary: PathBuf,
    /// Post-renderer stamping ownership onto rendered manifests
    pub post_renderer: Option<PathBuf>,
    /// Upper bound on revisions reconciled in parallel
    pub max_concurrent_reconciles: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            resource_directory: PathBuf::from("/var/lib/istio-operator/resources"),
            helm_binary: PathBuf::from("helm"),
            post_renderer: None,
            max_concurrent_reconciles: 4,
        }
    }
}

/// State shared between the controller and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconciler
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,
    config: OperatorConfig,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(config: OperatorConfig) -> Self {
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            registry: prometheus::Registry::default(),
            config,
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }
}

/// Register metrics and run the IstioRevision controller until shutdown
pub async fn run(client: Client, state: State) {
    let metrics = match Metrics::default().register(&state.registry) {
        Ok(metrics) => metrics,
        Err(e) => {
            error!("Could not register metrics: {e:?}");
            std::process::exit(1);
        }
    };
    istiorevision::run(client, metrics, state).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn diagnostics_serialize_last_event() {
        let state = State::new(OperatorConfig::default());
        let diagnostics = state.diagnostics().await;
        let json = serde_json::to_value(&diagnostics).unwrap();
        assert!(json["last_event"].is_string());
        assert_eq!(state.config().helm_binary, PathBuf::from("helm"));
        assert_eq!(state.config().max_concurrent_reconciles, 4);
    }
}
