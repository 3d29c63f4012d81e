use serde::{Deserialize, Serialize};

use crate::ContainerView;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// Events pushed to live observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LiveEvent {
    ContainersUpdate { containers: Vec<ContainerView> },
    Notification { message: String, severity: Severity },
}

impl LiveEvent {
    pub fn notification(message: impl Into<String>, severity: Severity) -> Self {
        LiveEvent::Notification {
            message: message.into(),
            severity,
        }
    }
}
