//! Periodic polling of the control plane and fan-out to live observers.

use crate::events::EventBus;
use crate::lifecycle::{LifecycleController, Observation};
use devbox_common::{
    ContainerId, ContainerView, ControlPlane, LifecycleState, LiveEvent, ObservedStatus, Result,
};
use futures::stream::{self, StreamExt};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Concurrent per-container metric queries within one poll.
const QUERY_CONCURRENCY: usize = 4;

/// What observers compare: identity, state and address.
type Fingerprint = Vec<(ContainerId, LifecycleState, Option<IpAddr>)>;

#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub containers: Vec<ContainerView>,
    /// Whether this poll produced a `containers_update` broadcast.
    pub broadcast: bool,
}

pub struct MonitoringService {
    controller: Arc<LifecycleController>,
    plane: Arc<dyn ControlPlane>,
    events: EventBus,
    template_id: ContainerId,
    interval: Duration,
    /// Held for the duration of a poll; no two polls overlap.
    poll_gate: Mutex<()>,
    last_broadcast: Mutex<Option<Fingerprint>>,
    current: RwLock<Vec<ContainerView>>,
}

impl MonitoringService {
    pub fn new(
        controller: Arc<LifecycleController>,
        plane: Arc<dyn ControlPlane>,
        events: EventBus,
        template_id: ContainerId,
        interval: Duration,
    ) -> Self {
        Self {
            controller,
            plane,
            events,
            template_id,
            interval,
            poll_gate: Mutex::new(()),
            last_broadcast: Mutex::new(None),
            current: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.events.subscribe()
    }

    /// Last polled view, for observers that just connected.
    pub async fn current(&self) -> Vec<ContainerView> {
        self.current.read().await.clone()
    }

    /// Out-of-cycle poll. Waits for a running poll to finish rather than skipping.
    pub async fn refresh(&self) -> Result<PollOutcome> {
        let _gate = self.poll_gate.lock().await;
        self.poll().await
    }

    /// Periodic poll. Skipped if another poll is still running.
    pub async fn tick(&self) -> Option<PollOutcome> {
        let Ok(_gate) = self.poll_gate.try_lock() else {
            debug!("Previous poll still running, skipping tick");
            return None;
        };
        match self.poll().await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(error = %e, "Poll cycle failed");
                None
            }
        }
    }

    /// Run `tick` every interval until the task is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval = ?self.interval, "Monitoring started");
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }

    async fn poll(&self) -> Result<PollOutcome> {
        let summaries: Vec<_> = self
            .plane
            .list_containers()
            .await?
            .into_iter()
            .filter(|c| c.id != self.template_id)
            .collect();

        let plane = &self.plane;
        let observations: Vec<Observation> = stream::iter(summaries)
            .map(|summary| async move {
                if summary.status != ObservedStatus::Running {
                    return Observation {
                        summary,
                        address: None,
                        resources: None,
                    };
                }
                let id = summary.id;
                let (address, resources) =
                    tokio::join!(plane.query_network_address(id), plane.query_resources(id));
                let address = address.unwrap_or_else(|e| {
                    warn!(container_id = id, error = %e, "Address query failed");
                    None
                });
                let resources = resources
                    .map_err(|e| warn!(container_id = id, error = %e, "Resource query failed"))
                    .ok();
                Observation {
                    summary,
                    address,
                    resources,
                }
            })
            .buffer_unordered(QUERY_CONCURRENCY)
            .collect()
            .await;

        self.controller.reconcile(observations).await;
        let containers = self.controller.views().await;
        *self.current.write().await = containers.clone();

        let fingerprint = fingerprint(&containers);
        let mut last = self.last_broadcast.lock().await;
        let changed = last.as_ref() != Some(&fingerprint);
        if changed {
            let reached = self.events.publish(LiveEvent::ContainersUpdate {
                containers: containers.clone(),
            });
            debug!(containers = containers.len(), observers = reached, "Broadcast container list");
            *last = Some(fingerprint);
        }

        Ok(PollOutcome {
            containers,
            broadcast: changed,
        })
    }
}

fn fingerprint(views: &[ContainerView]) -> Fingerprint {
    let mut fp: Fingerprint = views
        .iter()
        .map(|v| (v.record.id, v.record.lifecycle_state, v.record.ip_address))
        .collect();
    fp.sort_by_key(|(id, _, _)| *id);
    fp
}
