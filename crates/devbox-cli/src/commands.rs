use crate::Commands;
use devbox_common::{ApiResponse, Result};
use devbox_orchestrator::{CreateRequest, Orchestrator};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

/// Rendered envelope plus whether the operation succeeded.
#[derive(Debug)]
pub struct Report {
    pub success: bool,
    pub body: Value,
}

fn report<T: Serialize>(result: Result<T>) -> serde_json::Result<Report> {
    let success = result.is_ok();
    let body = serde_json::to_value(ApiResponse::from(result))?;
    Ok(Report { success, body })
}

/// Synchronise the registry, then run one operation.
pub async fn execute(command: Commands, orch: &Orchestrator) -> serde_json::Result<Report> {
    // The catalog is local; no control-plane round trip needed.
    if command == Commands::Profiles {
        return report(Ok(orch.profiles()));
    }
    if let Err(e) = orch.sync().await {
        warn!(error = %e, "Sync with the control plane failed");
        return report::<()>(Err(e));
    }

    match command {
        Commands::List => report(Ok(orch.list().await)),
        Commands::Create { name, id, profile } => {
            let request = CreateRequest { name, id, profile };
            report(orch.create(request).await)
        }
        Commands::Info { id } => report(orch.info(id).await),
        Commands::Start { id } => report(orch.start(id).await),
        Commands::Stop { id } => report(orch.stop(id).await),
        Commands::Restart { id } => report(orch.restart(id).await),
        Commands::Destroy { id } => report(orch.destroy(id).await),
        Commands::Backup { id } => report(orch.backup(id).await),
        Commands::ApplyTemplate { id, profile } => report(orch.apply_template(id, &profile).await),
        Commands::Monitor { id } => report(orch.monitor_container(id).await),
        Commands::ConfigureAssistant { id, providers } => {
            report(orch.configure_assistant(id, &providers).await)
        }
        Commands::Profiles => report(Ok(orch.profiles())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devbox_common::AdapterError;
    use devbox_executor::{MockControlPlane, MockOp};
    use devbox_orchestrator::{DevboxConfig, ProfileCatalog};
    use std::sync::Arc;

    fn orchestrator(mock: &MockControlPlane) -> Orchestrator {
        Orchestrator::new(
            Arc::new(mock.clone()),
            ProfileCatalog::builtin(),
            &DevboxConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_fresh_process_sees_existing_containers() {
        let mock = MockControlPlane::new().with_container(1001, "demo", true);
        let orch = orchestrator(&mock);

        let report = execute(Commands::Stop { id: 1001 }, &orch).await.unwrap();
        assert!(report.success);
        assert_eq!(report.body["data"]["lifecycle_state"], "stopped");
        assert!(!mock.container(1001).unwrap().running);
    }

    #[tokio::test]
    async fn test_failure_renders_error_envelope() {
        let mock = MockControlPlane::new();
        let orch = orchestrator(&mock);

        let report = execute(Commands::Start { id: 4242 }, &orch).await.unwrap();
        assert!(!report.success);
        assert_eq!(report.body["success"], false);
        assert_eq!(report.body["error"]["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_sync_failure_aborts_command() {
        let mock = MockControlPlane::new();
        mock.fail_next(MockOp::List, AdapterError::timeout("pct list timed out"));
        let orch = orchestrator(&mock);

        let report = execute(
            Commands::Create {
                name: "demo".to_string(),
                id: None,
                profile: None,
            },
            &orch,
        )
        .await
        .unwrap();
        assert!(!report.success);
        assert_eq!(report.body["error"]["kind"], "adapter_error");
        assert_eq!(mock.call_count(MockOp::CloneAndStart), 0);
    }

    #[tokio::test]
    async fn test_profiles_skip_control_plane() {
        let mock = MockControlPlane::new();
        let orch = orchestrator(&mock);

        let report = execute(Commands::Profiles, &orch).await.unwrap();
        assert!(report.success);
        assert_eq!(report.body["data"].as_array().unwrap().len(), 4);
        assert!(mock.calls().is_empty());
    }
}
