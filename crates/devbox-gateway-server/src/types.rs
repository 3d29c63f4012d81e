use devbox_common::ContainerId;
use serde::{Deserialize, Serialize};

pub use devbox_common::{ApiErrorBody, ApiResponse};

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateContainerRequest {
    pub name: String,
    pub id: Option<ContainerId>,
    pub profile: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApplyTemplateRequest {
    pub profile: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigureAssistantRequest {
    #[serde(default)]
    pub providers: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: String,
    pub version: String,
    pub observers: usize,
}
