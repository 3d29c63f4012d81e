use async_trait::async_trait;
use devbox_common::{ContainerId, ControlPlane};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

/// Outcome of configuring the coding assistant inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantReport {
    pub success: bool,
    pub version: Option<String>,
    pub error: Option<String>,
}

/// Opaque pass/fail setup of the in-container coding assistant.
#[async_trait]
pub trait AssistantSetup: Send + Sync {
    /// Log in each provider, then probe the installed version.
    async fn configure(
        &self,
        plane: &dyn ControlPlane,
        id: ContainerId,
        providers: &[String],
    ) -> AssistantReport;

    /// Installed version, if the tool answers.
    async fn version(&self, plane: &dyn ControlPlane, id: ContainerId) -> Option<String>;
}

/// `opencode`, run as the development user.
#[derive(Debug, Clone)]
pub struct OpencodeSetup {
    user: String,
}

impl OpencodeSetup {
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }

    fn argv(&self, tail: &[&str]) -> Vec<String> {
        ["runuser", "-u", self.user.as_str(), "--", "opencode"]
            .iter()
            .chain(tail)
            .map(|s| s.to_string())
            .collect()
    }
}

#[async_trait]
impl AssistantSetup for OpencodeSetup {
    #[instrument(skip(self, plane))]
    async fn configure(
        &self,
        plane: &dyn ControlPlane,
        id: ContainerId,
        providers: &[String],
    ) -> AssistantReport {
        for provider in providers {
            let argv = self.argv(&["auth", "login", "--provider", provider.as_str()]);
            let failure = match plane.exec_inside(id, &argv).await {
                Ok(output) if output.success() => continue,
                Ok(output) => output.diagnostic(),
                Err(e) => e.to_string(),
            };
            warn!(container_id = id, %provider, %failure, "Assistant login failed");
            return AssistantReport {
                success: false,
                version: None,
                error: Some(format!("Failed to configure {provider}: {failure}")),
            };
        }

        match plane.exec_inside(id, &self.argv(&["--version"])).await {
            Ok(output) if output.success() => AssistantReport {
                success: true,
                version: Some(output.stdout.trim().to_string()),
                error: None,
            },
            Ok(output) => AssistantReport {
                success: false,
                version: None,
                error: Some(output.diagnostic()),
            },
            Err(e) => AssistantReport {
                success: false,
                version: None,
                error: Some(e.to_string()),
            },
        }
    }

    async fn version(&self, plane: &dyn ControlPlane, id: ContainerId) -> Option<String> {
        let output = plane
            .exec_inside(id, &self.argv(&["--version"]))
            .await
            .ok()?;
        output
            .success()
            .then(|| output.stdout.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}
