//! Lifecycle scenarios against the in-memory control plane.

use devbox_common::{
    AdapterError, BackupOutcome, ControlPlane, DevboxError, ErrorKind, LifecycleState, LiveEvent,
    Severity,
};
use devbox_executor::{AddressPolicy, MockControlPlane, MockOp};
use devbox_orchestrator::{CreateRequest, DevboxConfig, Orchestrator, ProfileCatalog};
use std::sync::Arc;
use std::time::Duration;

fn orchestrator(mock: &MockControlPlane) -> Orchestrator {
    Orchestrator::new(
        Arc::new(mock.clone()),
        ProfileCatalog::builtin(),
        &DevboxConfig::default(),
    )
}

async fn ids(orch: &Orchestrator) -> Vec<u32> {
    orch.list().await.into_iter().map(|v| v.record.id).collect()
}

#[tokio::test]
async fn test_create_stop_start_destroy_scenario() -> anyhow::Result<()> {
    let mock = MockControlPlane::new();
    let orch = orchestrator(&mock);

    let created = orch.create(CreateRequest::new("demo").with_id(1001)).await?;
    assert_eq!(created.container.id, 1001);
    assert_eq!(created.container.lifecycle_state, LifecycleState::Running);
    assert_eq!(
        created.container.ip_address,
        Some(MockControlPlane::address_for(1001))
    );
    assert_eq!(created.access.console, "pct enter 1001");
    assert!(created.access.ssh.unwrap().starts_with("ssh developer@192.168.10."));
    assert!(created.provisioning.is_none());

    let stopped = orch.stop(1001).await?;
    assert_eq!(stopped.lifecycle_state, LifecycleState::Stopped);
    assert_eq!(stopped.ip_address, None);

    let started = orch.start(1001).await?;
    assert_eq!(started.lifecycle_state, LifecycleState::Running);

    let destroyed = orch.destroy(1001).await?;
    assert_eq!(destroyed.lifecycle_state, LifecycleState::Destroyed);
    assert!(ids(&orch).await.is_empty());
    assert!(mock.container(1001).is_none());
    Ok(())
}

#[tokio::test]
async fn test_create_allocates_lowest_free_id() {
    let mock = MockControlPlane::new().with_container(1001, "existing", true);
    let orch = orchestrator(&mock);

    let created = orch.create(CreateRequest::new("next")).await.unwrap();
    assert_eq!(created.container.id, 1002);
    assert_eq!(mock.container(1002).unwrap().name, "next");
}

#[tokio::test]
async fn test_start_on_running_is_invalid_and_leaves_state() {
    let mock = MockControlPlane::new();
    let orch = orchestrator(&mock);
    orch.create(CreateRequest::new("demo").with_id(1001)).await.unwrap();

    let err = orch.start(1001).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    assert_eq!(err.to_string(), "Cannot start container 1001 while it is running");
    assert_eq!(
        orch.list().await[0].record.lifecycle_state,
        LifecycleState::Running
    );
    // Rejected before reaching the control plane.
    assert_eq!(mock.call_count(MockOp::Start), 0);
}

#[tokio::test]
async fn test_preferred_id_held_by_record_conflicts_without_mutation() {
    let mock = MockControlPlane::new();
    let orch = orchestrator(&mock);
    orch.create(CreateRequest::new("first").with_id(2000)).await.unwrap();
    let before = orch.list().await;

    let err = orch
        .create(CreateRequest::new("second").with_id(2000))
        .await
        .unwrap_err();
    assert!(matches!(err, DevboxError::IdentityConflict(2000)));
    assert_eq!(orch.list().await, before);
    assert_eq!(mock.call_count(MockOp::CloneAndStart), 1);
}

#[tokio::test]
async fn test_failed_clone_releases_identity() {
    let mock = MockControlPlane::new();
    let orch = orchestrator(&mock);
    mock.fail_next(
        MockOp::CloneAndStart,
        AdapterError::command_failed("clone failed: storage 'local-lvm' full"),
    );

    let err = orch.create(CreateRequest::new("demo")).await.unwrap_err();
    match &err {
        DevboxError::CreationFailed { id, detail } => {
            assert_eq!(*id, 1001);
            assert!(detail.contains("storage 'local-lvm' full"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(orch.list().await.is_empty());
    assert!(!orch.controller().allocator().is_reserved(1001).await);

    // The same id is handed out again.
    let created = orch.create(CreateRequest::new("demo")).await.unwrap();
    assert_eq!(created.container.id, 1001);
}

#[tokio::test]
async fn test_failed_clone_leaves_foreign_container_alone() {
    let mock = MockControlPlane::new();
    let orch = orchestrator(&mock);
    let gate = mock.gate(MockOp::CloneAndStart);

    let create = tokio::spawn({
        let orch = orch.clone();
        async move { orch.create(CreateRequest::new("demo")).await }
    });
    while mock.call_count(MockOp::CloneAndStart) < 1 {
        tokio::task::yield_now().await;
    }
    // Someone else takes the id between the allocator's scan and the clone.
    let _ = mock.clone().with_container(1001, "foreign", true);
    gate.add_permits(1);

    let err = create.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CreationFailed);
    assert_eq!(mock.call_count(MockOp::Destroy), 0);
    let foreign = mock.container(1001).unwrap();
    assert_eq!(foreign.name, "foreign");
    assert!(foreign.running);
    assert!(orch.list().await.is_empty());
    assert!(!orch.controller().allocator().is_reserved(1001).await);
}

#[tokio::test]
async fn test_invalid_name_and_profile_rejected_before_allocation() {
    let mock = MockControlPlane::new();
    let orch = orchestrator(&mock);

    let err = orch.create(CreateRequest::new("my project")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = orch
        .create(CreateRequest::new("demo").with_profile("gamedev"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(err.to_string().contains("available: api, devops, ml, web"));
    assert_eq!(mock.call_count(MockOp::List), 0);
}

#[tokio::test(start_paused = true)]
async fn test_address_wait_times_out_into_ipless_success() {
    let mock = MockControlPlane::new();
    mock.set_address_policy(AddressPolicy::Never);
    let orch = orchestrator(&mock);

    let created = orch.create(CreateRequest::new("slow-net")).await.unwrap();
    assert_eq!(created.container.lifecycle_state, LifecycleState::Running);
    assert_eq!(created.container.ip_address, None);
    assert_eq!(created.access.ssh, None);
}

#[tokio::test]
async fn test_create_with_profile_reports_partial_failure() {
    let mock = MockControlPlane::new();
    mock.break_package("chromium");
    let orch = orchestrator(&mock);
    let mut events = orch.subscribe();

    let created = orch
        .create(CreateRequest::new("frontend").with_profile("web"))
        .await
        .unwrap();
    assert_eq!(created.container.template_profile.as_deref(), Some("web"));
    let provisioning = created.provisioning.unwrap();
    assert_eq!(provisioning.failures.len(), 1);
    assert_eq!(provisioning.installed.ports.len(), 3);

    let mut saw_warning = false;
    while let Ok(event) = events.try_recv() {
        if let LiveEvent::Notification { severity: Severity::Warning, message } = event {
            assert!(message.contains("packages:apt"));
            saw_warning = true;
        }
    }
    assert!(saw_warning);
}

#[tokio::test]
async fn test_apply_template_twice_is_idempotent() {
    let mock = MockControlPlane::new();
    let orch = orchestrator(&mock);
    orch.create(CreateRequest::new("demo").with_id(1001)).await.unwrap();

    let first = orch.apply_template(1001, "web").await.unwrap();
    let second = orch.apply_template(1001, "web").await.unwrap();
    assert!(first.is_complete());
    assert!(second.is_complete());
    assert_eq!(first.installed, second.installed);
    assert_eq!(
        orch.controller().record(1001).await.unwrap().template_profile.as_deref(),
        Some("web")
    );

    orch.stop(1001).await.unwrap();
    let err = orch.apply_template(1001, "web").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_backup_is_rejected_and_first_completes() {
    let mock = MockControlPlane::new();
    let orch = orchestrator(&mock);
    orch.create(CreateRequest::new("demo").with_id(1001)).await.unwrap();
    let gate = mock.gate(MockOp::Backup);

    let first = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.backup(1001).await })
    };
    while mock.call_count(MockOp::Backup) == 0 {
        tokio::task::yield_now().await;
    }

    // Reads still work and show the transient state.
    assert_eq!(
        orch.controller().record(1001).await.unwrap().lifecycle_state,
        LifecycleState::BackingUp
    );
    let err = orch.backup(1001).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationInProgress);
    let err = orch.stop(1001).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationInProgress);

    gate.add_permits(1);
    let record = first.await.unwrap().unwrap();
    assert_eq!(record.outcome, BackupOutcome::Success);
    assert!(record.backup_name.starts_with("lxc-1001-"));
    assert_eq!(orch.backups(Some(1001)).await.len(), 1);
    assert_eq!(
        orch.controller().record(1001).await.unwrap().lifecycle_state,
        LifecycleState::Running
    );
}

#[tokio::test]
async fn test_failed_backup_restores_state_and_is_recorded() {
    let mock = MockControlPlane::new();
    let orch = orchestrator(&mock);
    orch.create(CreateRequest::new("demo").with_id(1001)).await.unwrap();
    orch.stop(1001).await.unwrap();
    mock.fail_next(MockOp::Backup, AdapterError::command_failed("vzdump: no space left"));

    let err = orch.backup(1001).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AdapterError);
    assert_eq!(
        orch.controller().record(1001).await.unwrap().lifecycle_state,
        LifecycleState::Stopped
    );
    let history = orch.backups(None).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, BackupOutcome::Failure);
    assert_eq!(history[0].detail.as_deref(), Some("vzdump: no space left"));
}

#[tokio::test]
async fn test_stop_failure_keeps_pre_transition_state() {
    let mock = MockControlPlane::new();
    let orch = orchestrator(&mock);
    orch.create(CreateRequest::new("demo").with_id(1001)).await.unwrap();
    mock.fail_next(MockOp::Stop, AdapterError::timeout("pct stop 1001 timed out"));

    let err = orch.stop(1001).await.unwrap_err();
    assert!(err.to_string().contains("pct stop 1001 timed out"));
    assert_eq!(
        orch.controller().record(1001).await.unwrap().lifecycle_state,
        LifecycleState::Running
    );
}

#[tokio::test]
async fn test_restart_with_failing_start_ends_stopped() {
    let mock = MockControlPlane::new();
    let orch = orchestrator(&mock);
    orch.create(CreateRequest::new("demo").with_id(1001)).await.unwrap();

    orch.restart(1001).await.unwrap();
    assert_eq!(mock.call_count(MockOp::Stop), 1);
    assert_eq!(mock.call_count(MockOp::Start), 1);

    mock.fail_next(MockOp::Start, AdapterError::command_failed("startup for container '1001' failed"));
    let err = orch.restart(1001).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AdapterError);
    assert_eq!(
        orch.controller().record(1001).await.unwrap().lifecycle_state,
        LifecycleState::Stopped
    );
}

#[tokio::test]
async fn test_destroyed_id_is_retired_until_next_epoch() {
    let mock = MockControlPlane::new();
    let orch = orchestrator(&mock);
    orch.create(CreateRequest::new("demo")).await.unwrap();
    orch.destroy(1001).await.unwrap();

    let next = orch.create(CreateRequest::new("other")).await.unwrap();
    assert_eq!(next.container.id, 1002);

    orch.advance_epoch().await;
    let reused = orch.create(CreateRequest::new("again")).await.unwrap();
    assert_eq!(reused.container.id, 1001);
}

#[tokio::test]
async fn test_unknown_ids_are_not_found() {
    let orch = orchestrator(&MockControlPlane::new());
    for err in [
        orch.start(4242).await.unwrap_err(),
        orch.destroy(4242).await.unwrap_err(),
        orch.info(4242).await.map(|_| ()).unwrap_err(),
        orch.monitor_container(4242).await.map(|_| ()).unwrap_err(),
    ] {
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}

#[tokio::test]
async fn test_info_and_monitor_aggregate_without_mutation() {
    let mock = MockControlPlane::new();
    let orch = orchestrator(&mock);
    orch.create(CreateRequest::new("demo").with_id(1001)).await.unwrap();

    let info = orch.info(1001).await.unwrap();
    assert_eq!(info.config[2].key, "hostname");
    assert_eq!(info.config[2].value, "demo");
    assert_eq!(info.resources.unwrap().cpu_usage_percent, 12.5);
    assert_eq!(info.tooling_version.as_deref(), Some("1.1.15"));

    let report = orch.monitor_container(1001).await.unwrap();
    assert!(report.resources.is_some());

    orch.stop(1001).await.unwrap();
    let report = orch.monitor_container(1001).await.unwrap();
    assert_eq!(report.lifecycle_state, LifecycleState::Stopped);
    assert_eq!(report.message.as_deref(), Some("Container not running"));
    let info = orch.info(1001).await.unwrap();
    assert!(info.resources.is_none());
    assert!(info.tooling_version.is_none());
}

#[tokio::test]
async fn test_configure_assistant_requires_running() {
    let mock = MockControlPlane::new();
    let orch = orchestrator(&mock);
    orch.create(CreateRequest::new("demo").with_id(1001)).await.unwrap();

    let report = orch
        .configure_assistant(1001, &["anthropic".to_string()])
        .await
        .unwrap();
    assert!(report.success);
    assert_eq!(report.version.as_deref(), Some("1.1.15"));

    orch.stop(1001).await.unwrap();
    let err = orch.configure_assistant(1001, &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);
}

#[tokio::test(start_paused = true)]
async fn test_operations_on_different_ids_do_not_block() {
    let mock = MockControlPlane::new();
    let orch = orchestrator(&mock);
    orch.create(CreateRequest::new("a").with_id(1001)).await.unwrap();
    orch.create(CreateRequest::new("b").with_id(1002)).await.unwrap();
    let gate = mock.gate(MockOp::Backup);

    let backup = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.backup(1001).await })
    };
    while mock.call_count(MockOp::Backup) == 0 {
        tokio::task::yield_now().await;
    }

    let stopped = tokio::time::timeout(Duration::from_secs(1), orch.stop(1002))
        .await
        .expect("stop of another id must not wait for the backup")
        .unwrap();
    assert_eq!(stopped.lifecycle_state, LifecycleState::Stopped);

    gate.add_permits(1);
    backup.await.unwrap().unwrap();
    assert!(mock.query_status(1002).await.is_ok());
}
