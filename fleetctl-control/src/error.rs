use thiserror::Error;

/// Errors surfaced by the control plane core.
///
/// Step-local retries already happened inside the node-agent/DNS clients by
/// the time one of these reaches an orchestrator; the orchestrator never
/// retries a step itself, it transitions the deployment to failed.
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    #[error("node {node_id} unreachable: {0}", node_id = .node_id)]
    Transient { node_id: String, source: String },

    #[error("deploy already in progress for {service_id}/{env}")]
    LockBusy { service_id: String, env: String },

    #[error("{kind} not found: {id}")]
    NoSuchEntity { kind: &'static str, id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("health gate timed out waiting on {node_id} for {container_name}")]
    HealthGateTimeout { node_id: String, container_name: String },

    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    #[error("provider error: {0}")]
    ProviderError(String),
}

impl ControlPlaneError {
    pub fn no_such(kind: &'static str, id: impl Into<String>) -> Self {
        ControlPlaneError::NoSuchEntity { kind, id: id.into() }
    }
}

pub type Result<T> = std::result::Result<T, ControlPlaneError>;
