use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML Error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid values: {0}")]
    InvalidValues(#[from] values::ValuesError),

    #[error("Invalid IstioRevision: {0}")]
    InvalidSpec(String),

    #[error("IstioRevision is missing {0}")]
    MissingObjectKey(&'static str),

    #[error("failed to {action} chart {chart}: {message}")]
    ChartFailed {
        action: &'static str,
        chart: String,
        message: String,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::YamlError(_) => "YamlError",
            Error::KubeError(_) => "KubeError",
            Error::IoError(_) => "IoError",
            Error::InvalidValues(_) => "InvalidValues",
            Error::InvalidSpec(_) => "InvalidSpec",
            Error::MissingObjectKey(_) => "MissingObjectKey",
            Error::ChartFailed { .. } => "ChartFailed",
        }
    }
}

pub mod controllers;
pub use controllers::{run, OperatorConfig, State};

/// Access to the cluster API used by the reconciler
pub mod cluster;

/// Chart installation and manifest post-rendering
pub mod helm;

/// Ownership links between managed resources and their IstioRevision
pub mod ownership;

/// Helm values tree
pub mod values;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use metrics::Metrics;

/// CRDs
pub mod resources;
