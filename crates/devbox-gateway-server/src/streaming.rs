//! Live update channel.
//!
//! Each observer gets the current container list on connect, then every
//! broadcast event. Outbound frames go through a bounded per-observer queue so
//! a slow socket never holds up the broadcaster or other observers.

use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use devbox_common::{LiveEvent, Severity};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Outbound frames buffered per observer before new ones are dropped.
pub const OBSERVER_QUEUE_SIZE: usize = 64;

/// Messages an observer may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverCommand {
    RefreshContainers,
    RequestContainers,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

async fn handle_websocket(socket: WebSocket, state: AppState) {
    let observer = Uuid::new_v4();
    let observers = state.observers.fetch_add(1, Ordering::Relaxed) + 1;
    info!(%observer, observers, "Observer connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<LiveEvent>(OBSERVER_QUEUE_SIZE);

    let (mut events, snapshot) = connect(&state).await;
    enqueue(&out_tx, snapshot);

    let mut writer = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "Failed to serialize event");
                    continue;
                }
            };
            if let Err(e) = ws_tx.send(Message::Text(json)).await {
                debug!(%observer, error = %e, "WebSocket send failed");
                break;
            }
        }
    });

    let forward_tx = out_tx.clone();
    let mut forwarder = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => enqueue(&forward_tx, event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%observer, skipped, "Observer fell behind the broadcast");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let receive_state = state.clone();
    let mut receiver = tokio::spawn(async move {
        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<ObserverCommand>(&text) {
                    Ok(command) => {
                        debug!(%observer, ?command, "Observer command");
                        handle_command(command, &receive_state, &out_tx).await;
                    }
                    Err(e) => warn!(%observer, error = %e, "Invalid observer message"),
                },
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    debug!(%observer, error = %e, "WebSocket receive failed");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => {},
        _ = &mut receiver => {},
    }
    writer.abort();
    receiver.abort();
    forwarder.abort();

    let observers = state.observers.fetch_sub(1, Ordering::Relaxed) - 1;
    info!(%observer, observers, "Observer disconnected");
}

/// Subscribe a new observer and build its first frame from the cached view.
///
/// The subscription is taken before the snapshot so no update falls in between.
pub(crate) async fn connect(state: &AppState) -> (broadcast::Receiver<LiveEvent>, LiveEvent) {
    let events = state.orchestrator.subscribe();
    let snapshot = LiveEvent::ContainersUpdate {
        containers: state.orchestrator.current_view().await,
    };
    (events, snapshot)
}

/// Queue a frame for one observer, dropping it if the queue is full.
pub(crate) fn enqueue(tx: &mpsc::Sender<LiveEvent>, event: LiveEvent) {
    match tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => warn!("Observer queue full, dropping frame"),
        Err(TrySendError::Closed(_)) => {}
    }
}

/// Refresh on demand. The requester always gets the list ahead of the
/// notification. A changed list also reaches everyone else via the broadcast.
pub(crate) async fn handle_command(
    command: ObserverCommand,
    state: &AppState,
    tx: &mpsc::Sender<LiveEvent>,
) {
    match command {
        ObserverCommand::RefreshContainers | ObserverCommand::RequestContainers => {
            match state.orchestrator.refresh().await {
                Ok(outcome) => {
                    enqueue(
                        tx,
                        LiveEvent::ContainersUpdate {
                            containers: outcome.containers,
                        },
                    );
                    enqueue(
                        tx,
                        LiveEvent::notification("Container list refreshed", Severity::Success),
                    );
                }
                Err(e) => {
                    warn!(error = %e, "On-demand refresh failed");
                    enqueue(
                        tx,
                        LiveEvent::notification(format!("Refresh failed: {e}"), Severity::Error),
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devbox_common::AdapterError;
    use devbox_executor::{MockControlPlane, MockOp};
    use devbox_orchestrator::{DevboxConfig, Orchestrator, ProfileCatalog};
    use std::sync::Arc;

    fn state(mock: &MockControlPlane) -> AppState {
        AppState::new(Orchestrator::new(
            Arc::new(mock.clone()),
            ProfileCatalog::builtin(),
            &DevboxConfig::default(),
        ))
    }

    #[test]
    fn test_observer_commands_parse() {
        let cmd: ObserverCommand = serde_json::from_str(r#"{"type":"refresh_containers"}"#).unwrap();
        assert_eq!(cmd, ObserverCommand::RefreshContainers);
        let cmd: ObserverCommand = serde_json::from_str(r#"{"type":"request_containers"}"#).unwrap();
        assert_eq!(cmd, ObserverCommand::RequestContainers);
        assert!(serde_json::from_str::<ObserverCommand>(r#"{"type":"reboot"}"#).is_err());
    }

    #[test]
    fn test_full_queue_drops_frames() {
        let (tx, mut rx) = mpsc::channel(OBSERVER_QUEUE_SIZE);
        for i in 0..OBSERVER_QUEUE_SIZE + 10 {
            enqueue(&tx, LiveEvent::notification(format!("n{i}"), Severity::Info));
        }
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, OBSERVER_QUEUE_SIZE);
    }

    #[tokio::test]
    async fn test_changed_refresh_reaches_requester_before_notification() {
        let mock = MockControlPlane::new().with_container(1001, "demo", true);
        let state = state(&mock);
        let mut broadcast = state.orchestrator.subscribe();
        let (tx, mut rx) = mpsc::channel(OBSERVER_QUEUE_SIZE);

        handle_command(ObserverCommand::RefreshContainers, &state, &tx).await;

        match broadcast.try_recv().unwrap() {
            LiveEvent::ContainersUpdate { containers } => assert_eq!(containers.len(), 1),
            other => panic!("unexpected broadcast {other:?}"),
        }
        match rx.try_recv().unwrap() {
            LiveEvent::ContainersUpdate { containers } => assert_eq!(containers[0].record.id, 1001),
            other => panic!("unexpected first reply {other:?}"),
        }
        match rx.try_recv().unwrap() {
            LiveEvent::Notification { message, severity } => {
                assert_eq!(message, "Container list refreshed");
                assert_eq!(severity, Severity::Success);
            }
            other => panic!("unexpected reply {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_new_observer_gets_cached_list_first() {
        let mock = MockControlPlane::new()
            .with_container(1001, "demo", true)
            .with_container(1002, "api", false);
        let state = state(&mock);
        state.orchestrator.sync().await.unwrap();
        let lists = mock.call_count(MockOp::List);

        let (mut events, first) = connect(&state).await;
        match first {
            LiveEvent::ContainersUpdate { containers } => {
                let ids: Vec<u32> = containers.iter().map(|v| v.record.id).collect();
                assert_eq!(ids, vec![1001, 1002]);
            }
            other => panic!("unexpected first frame {other:?}"),
        }
        // Served from the cache, not a fresh poll.
        assert_eq!(mock.call_count(MockOp::List), lists);

        mock.set_running(1002, true);
        state.orchestrator.refresh().await.unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            LiveEvent::ContainersUpdate { containers } if containers.len() == 2
        ));
    }

    #[tokio::test]
    async fn test_unchanged_refresh_answers_requester_only() {
        let mock = MockControlPlane::new().with_container(1001, "demo", true);
        let state = state(&mock);
        state.orchestrator.sync().await.unwrap();
        let mut broadcast = state.orchestrator.subscribe();
        let (tx, mut rx) = mpsc::channel(OBSERVER_QUEUE_SIZE);

        handle_command(ObserverCommand::RequestContainers, &state, &tx).await;

        assert!(broadcast.try_recv().is_err());
        assert!(matches!(
            rx.try_recv().unwrap(),
            LiveEvent::ContainersUpdate { containers } if containers.len() == 1
        ));
        assert!(matches!(rx.try_recv().unwrap(), LiveEvent::Notification { .. }));
    }

    #[tokio::test]
    async fn test_failed_refresh_notifies_requester() {
        let mock = MockControlPlane::new();
        mock.fail_next(MockOp::List, AdapterError::timeout("pct list timed out"));
        let state = state(&mock);
        let (tx, mut rx) = mpsc::channel(OBSERVER_QUEUE_SIZE);

        handle_command(ObserverCommand::RefreshContainers, &state, &tx).await;

        match rx.try_recv().unwrap() {
            LiveEvent::Notification { message, severity } => {
                assert!(message.contains("pct list timed out"));
                assert_eq!(severity, Severity::Error);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }
}
