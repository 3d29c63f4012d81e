//! Behaviour of the in-memory control plane that the rest of the workspace tests against.

use devbox_common::{AdapterError, AdapterErrorKind, ControlPlane, ObservedStatus};
use devbox_executor::mock::MOCK_TEMPLATE_ID;
use devbox_executor::{AddressPolicy, MockControlPlane, MockOp};
use std::sync::Arc;
use std::time::Duration;

fn argv(line: &str) -> Vec<String> {
    line.split_whitespace().map(String::from).collect()
}

#[tokio::test]
async fn test_clone_start_stop_destroy_cycle() {
    let mock = MockControlPlane::new();

    mock.clone_and_start(1001, "demo").await.unwrap();
    assert_eq!(mock.query_status(1001).await.unwrap(), ObservedStatus::Running);

    mock.stop(1001).await.unwrap();
    assert_eq!(mock.query_status(1001).await.unwrap(), ObservedStatus::Stopped);

    mock.start(1001).await.unwrap();
    mock.destroy(1001).await.unwrap();

    let err = mock.query_status(1001).await.unwrap_err();
    assert_eq!(err.kind, AdapterErrorKind::NotFound);

    let ids: Vec<u32> = mock
        .list_containers()
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(ids, vec![MOCK_TEMPLATE_ID]);
}

#[tokio::test]
async fn test_clone_onto_existing_id_fails() {
    let mock = MockControlPlane::new().with_container(1001, "taken", false);
    let err = mock.clone_and_start(1001, "demo").await.unwrap_err();
    assert_eq!(err.kind, AdapterErrorKind::CommandFailed);
    assert!(err.raw_detail.contains("already exists"));
}

#[tokio::test]
async fn test_injected_failures_are_consumed_in_order() {
    let mock = MockControlPlane::new().with_container(1001, "demo", true);
    mock.fail_next(MockOp::Stop, AdapterError::timeout("pct stop 1001 timed out"));

    let err = mock.stop(1001).await.unwrap_err();
    assert_eq!(err.kind, AdapterErrorKind::Timeout);
    // The failed call did not change state; the next one succeeds.
    assert!(mock.container(1001).unwrap().running);
    mock.stop(1001).await.unwrap();
    assert_eq!(mock.call_count(MockOp::Stop), 2);
}

#[tokio::test]
async fn test_address_policy_delays_visibility() {
    let mock = MockControlPlane::new();
    mock.set_address_policy(AddressPolicy::AfterQueries(2));
    mock.clone_and_start(1001, "demo").await.unwrap();

    assert_eq!(mock.query_network_address(1001).await.unwrap(), None);
    assert_eq!(mock.query_network_address(1001).await.unwrap(), None);
    assert_eq!(
        mock.query_network_address(1001).await.unwrap(),
        Some(MockControlPlane::address_for(1001))
    );
}

#[tokio::test(start_paused = true)]
async fn test_gate_parks_call_until_released() {
    let mock = Arc::new(MockControlPlane::new().with_container(1001, "demo", true));
    let gate = mock.gate(MockOp::Backup);

    let task = {
        let mock = mock.clone();
        tokio::spawn(async move { mock.snapshot_backup(1001).await })
    };
    while mock.call_count(MockOp::Backup) == 0 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(!task.is_finished());

    gate.add_permits(1);
    let artifact = task.await.unwrap().unwrap();
    assert!(artifact.location.starts_with("/var/lib/vz/dump/vzdump-lxc-1001-"));
}

#[tokio::test]
async fn test_concurrent_execs_are_all_recorded() {
    let mock = Arc::new(MockControlPlane::new().with_container(1001, "demo", true));

    let handles: Vec<_> = (1..=10u16)
        .map(|i| {
            let mock = mock.clone();
            tokio::spawn(async move {
                mock.exec_inside(1001, &argv(&format!("ufw allow {}/tcp", 3000 + i)))
                    .await
            })
        })
        .collect();

    let results = futures::future::join_all(handles).await;
    for result in results {
        assert!(result.unwrap().unwrap().success());
    }
    assert_eq!(mock.exec_calls("ufw allow").len(), 10);
    assert_eq!(mock.container(1001).unwrap().firewall.len(), 10);
}

#[tokio::test]
async fn test_shell_understands_provisioning_commands() {
    let mock = MockControlPlane::new().with_container(1001, "demo", true);

    let probe = mock
        .exec_inside(1001, &argv("systemctl is-active redis"))
        .await
        .unwrap();
    assert_eq!(probe.exit_code, 3);

    mock.exec_inside(1001, &argv("systemctl enable --now redis"))
        .await
        .unwrap();
    let probe = mock
        .exec_inside(1001, &argv("systemctl is-active redis"))
        .await
        .unwrap();
    assert!(probe.success());

    let version = mock
        .exec_inside(1001, &argv("opencode --version"))
        .await
        .unwrap();
    assert_eq!(version.stdout.trim(), "1.1.15");

    let unknown = mock.exec_inside(1001, &argv("htop")).await.unwrap();
    assert_eq!(unknown.exit_code, 127);
}
