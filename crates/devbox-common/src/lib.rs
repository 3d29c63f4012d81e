// Re-export dependencies used in public interfaces of common types

use std::net::IpAddr;

use async_trait::async_trait;
pub use chrono;
pub use serde::{Deserialize, Serialize};
use thiserror::Error;

mod envelope;
mod events;
mod types;

pub use envelope::{ApiErrorBody, ApiResponse};
pub use events::{LiveEvent, Severity};
pub use types::*;

/// Stable, machine-readable error tag carried by every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    IdentityConflict,
    IdentitySpaceExhausted,
    InvalidTransition,
    OperationInProgress,
    CreationFailed,
    AdapterError,
    ProvisioningStepFailed,
    NotFound,
    InvalidArgument,
    ConfigError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::IdentityConflict => "identity_conflict",
            ErrorKind::IdentitySpaceExhausted => "identity_space_exhausted",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::OperationInProgress => "operation_in_progress",
            ErrorKind::CreationFailed => "creation_failed",
            ErrorKind::AdapterError => "adapter_error",
            ErrorKind::ProvisioningStepFailed => "provisioning_step_failed",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::ConfigError => "config_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterErrorKind {
    /// The external command did not finish within its bound.
    Timeout,
    /// The external command ran and reported failure.
    CommandFailed,
    /// The external command could not be launched at all.
    Spawn,
    /// The control plane does not know the container.
    NotFound,
    /// Output was present but unusable.
    Parse,
}

/// Failure at the control-plane boundary. `raw_detail` is the external
/// system's own diagnostic, passed through verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("control plane {kind:?}: {raw_detail}")]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub raw_detail: String,
}

impl AdapterError {
    pub fn new(kind: AdapterErrorKind, raw_detail: impl Into<String>) -> Self {
        Self {
            kind,
            raw_detail: raw_detail.into(),
        }
    }

    pub fn timeout(raw_detail: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Timeout, raw_detail)
    }

    pub fn command_failed(raw_detail: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::CommandFailed, raw_detail)
    }

    pub fn not_found(raw_detail: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::NotFound, raw_detail)
    }
}

#[derive(Error, Debug)]
pub enum DevboxError {
    #[error("Identity {0} is already in use")]
    IdentityConflict(ContainerId),

    #[error("No free identity in range {start}-{end}")]
    IdentitySpaceExhausted { start: ContainerId, end: ContainerId },

    #[error("Cannot {operation} container {id} while it is {state}")]
    InvalidTransition {
        id: ContainerId,
        operation: &'static str,
        state: LifecycleState,
    },

    #[error("Another operation is in progress for container {0}")]
    OperationInProgress(ContainerId),

    #[error("Creation of container {id} failed: {detail}")]
    CreationFailed { id: ContainerId, detail: String },

    #[error("Control plane error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Container {0} not found")]
    NotFound(ContainerId),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration Error: {0}")]
    Config(String),
}

impl DevboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DevboxError::IdentityConflict(_) => ErrorKind::IdentityConflict,
            DevboxError::IdentitySpaceExhausted { .. } => ErrorKind::IdentitySpaceExhausted,
            DevboxError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            DevboxError::OperationInProgress(_) => ErrorKind::OperationInProgress,
            DevboxError::CreationFailed { .. } => ErrorKind::CreationFailed,
            DevboxError::Adapter(_) => ErrorKind::AdapterError,
            DevboxError::NotFound(_) => ErrorKind::NotFound,
            DevboxError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            DevboxError::Config(_) => ErrorKind::ConfigError,
        }
    }
}

// Define the primary Result type for devbox operations
pub type Result<T> = std::result::Result<T, DevboxError>;

/// Result type at the control-plane boundary.
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// The single seam to the external virtualization control plane.
///
/// Every call is bounded in time and fails only with a typed [`AdapterError`].
/// Absent data (no address yet) is a normal `None`, not an error.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Clone the base template into `id` with hostname `name`, then start it.
    async fn clone_and_start(&self, id: ContainerId, name: &str) -> AdapterResult<()>;

    async fn start(&self, id: ContainerId) -> AdapterResult<()>;

    async fn stop(&self, id: ContainerId) -> AdapterResult<()>;

    async fn destroy(&self, id: ContainerId) -> AdapterResult<()>;

    /// Run `argv` inside the container. Any exit status is returned as output;
    /// errors are reserved for launch failures and timeouts.
    async fn exec_inside(&self, id: ContainerId, argv: &[String]) -> AdapterResult<ExecOutput>;

    async fn snapshot_backup(&self, id: ContainerId) -> AdapterResult<BackupArtifact>;

    async fn query_status(&self, id: ContainerId) -> AdapterResult<ObservedStatus>;

    /// Every container the control plane knows, templates included.
    async fn list_containers(&self) -> AdapterResult<Vec<ContainerSummary>>;

    async fn query_network_address(&self, id: ContainerId) -> AdapterResult<Option<IpAddr>>;

    async fn query_resources(&self, id: ContainerId) -> AdapterResult<ResourceSnapshot>;

    /// Key/value configuration in control-plane order.
    async fn query_config(&self, id: ContainerId) -> AdapterResult<Vec<(String, String)>>;
}
