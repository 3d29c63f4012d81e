//! The per-container state machine.
//!
//! ```text
//! absent -> provisioning -> running <-> stopped -> destroyed
//!                           running|stopped -> backing-up -> (origin)
//! ```
//!
//! Every mutating operation takes the container's operation lock with
//! `try_lock`; a busy lock is reported as `OperationInProgress` instead of
//! queueing. Guards are checked under the lock before any external call, and an
//! external failure leaves the pre-transition state in place.

use crate::allocator::IdentityAllocator;
use crate::assistant::{AssistantReport, AssistantSetup};
use crate::catalog::ProfileCatalog;
use crate::events::EventBus;
use crate::readiness::{AddressWait, AddressWaitConfig};
use crate::provisioning::TemplateProvisioner;
use crate::registry::{Entry, Registry};
use chrono::Utc;
use dashmap::DashMap;
use devbox_common::{
    AccessDescriptor, BackupOutcome, BackupRecord, ContainerId, ContainerRecord, ContainerSummary,
    ContainerView, ControlPlane, DevboxError, LifecycleState, ProvisioningResult, ResourceSnapshot,
    Result, Severity, TemplateProfile,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateRequest {
    pub name: String,
    #[serde(default)]
    pub id: Option<ContainerId>,
    #[serde(default)]
    pub profile: Option<String>,
}

impl CreateRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: ContainerId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOutcome {
    pub container: ContainerRecord,
    pub access: AccessDescriptor,
    /// Present when a profile was requested; may carry step failures.
    pub provisioning: Option<ProvisioningResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub container: ContainerRecord,
    pub access: AccessDescriptor,
    pub config: Vec<ConfigEntry>,
    pub resources: Option<ResourceSnapshot>,
    pub tooling_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorReport {
    pub id: ContainerId,
    pub lifecycle_state: LifecycleState,
    pub resources: Option<ResourceSnapshot>,
    pub message: Option<String>,
}

/// One container as seen by a poll cycle.
#[derive(Debug, Clone)]
pub struct Observation {
    pub summary: ContainerSummary,
    /// `None` keeps the last known address of a running container.
    pub address: Option<IpAddr>,
    pub resources: Option<ResourceSnapshot>,
}

/// Collaborators and settings of the controller.
pub struct LifecycleDeps {
    pub plane: Arc<dyn ControlPlane>,
    pub allocator: Arc<IdentityAllocator>,
    pub provisioner: TemplateProvisioner,
    pub assistant: Arc<dyn AssistantSetup>,
    pub catalog: Arc<ProfileCatalog>,
    pub events: EventBus,
    pub address_wait: AddressWaitConfig,
    pub dev_user: String,
}

/// Sole writer of container lifecycle state.
pub struct LifecycleController {
    plane: Arc<dyn ControlPlane>,
    allocator: Arc<IdentityAllocator>,
    provisioner: TemplateProvisioner,
    assistant: Arc<dyn AssistantSetup>,
    catalog: Arc<ProfileCatalog>,
    events: EventBus,
    address_wait: AddressWaitConfig,
    dev_user: String,
    registry: Registry,
    op_locks: DashMap<ContainerId, Arc<Mutex<()>>>,
    backups: RwLock<Vec<BackupRecord>>,
}

const RUNNING: &[LifecycleState] = &[LifecycleState::Running];
const STOPPED: &[LifecycleState] = &[LifecycleState::Stopped];
const SETTLED: &[LifecycleState] = &[LifecycleState::Running, LifecycleState::Stopped];

impl LifecycleController {
    pub fn new(deps: LifecycleDeps) -> Self {
        Self {
            plane: deps.plane,
            allocator: deps.allocator,
            provisioner: deps.provisioner,
            assistant: deps.assistant,
            catalog: deps.catalog,
            events: deps.events,
            address_wait: deps.address_wait,
            dev_user: deps.dev_user,
            registry: Registry::default(),
            op_locks: DashMap::new(),
            backups: RwLock::new(Vec::new()),
        }
    }

    pub fn allocator(&self) -> &IdentityAllocator {
        &self.allocator
    }

    // --- Locking ---

    fn try_lock(&self, id: ContainerId) -> Result<OwnedMutexGuard<()>> {
        let lock = self.op_locks.entry(id).or_default().clone();
        lock.try_lock_owned()
            .map_err(|_| DevboxError::OperationInProgress(id))
    }

    fn is_busy(&self, id: ContainerId) -> bool {
        self.op_locks
            .get(&id)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Lock `id` and check that its state is one of `allowed`.
    async fn guard(
        &self,
        id: ContainerId,
        operation: &'static str,
        allowed: &[LifecycleState],
    ) -> Result<(OwnedMutexGuard<()>, ContainerRecord)> {
        if self.registry.record(id).await.is_none() {
            return Err(DevboxError::NotFound(id));
        }
        let guard = self.try_lock(id)?;
        let record = self
            .registry
            .record(id)
            .await
            .ok_or(DevboxError::NotFound(id))?;
        if !allowed.contains(&record.lifecycle_state) {
            return Err(DevboxError::InvalidTransition {
                id,
                operation,
                state: record.lifecycle_state,
            });
        }
        Ok((guard, record))
    }

    fn profile(&self, name: &str) -> Result<TemplateProfile> {
        self.catalog.get(name).cloned().ok_or_else(|| {
            DevboxError::InvalidArgument(format!(
                "unknown profile '{name}' (available: {})",
                self.catalog.names().join(", ")
            ))
        })
    }

    // --- Reads ---

    pub async fn record(&self, id: ContainerId) -> Option<ContainerRecord> {
        self.registry.record(id).await
    }

    pub async fn views(&self) -> Vec<ContainerView> {
        self.registry.views().await
    }

    pub async fn backups(&self, id: Option<ContainerId>) -> Vec<BackupRecord> {
        self.backups
            .read()
            .await
            .iter()
            .filter(|b| id.map_or(true, |id| b.container_id == id))
            .cloned()
            .collect()
    }

    pub fn access(&self, record: &ContainerRecord) -> AccessDescriptor {
        AccessDescriptor::new(record.id, record.ip_address, &self.dev_user)
    }

    // --- Transitions ---

    #[instrument(skip(self, request), fields(name = %request.name, preferred = ?request.id))]
    pub async fn create(&self, request: CreateRequest) -> Result<CreateOutcome> {
        validate_hostname(&request.name)?;
        let profile = request
            .profile
            .as_deref()
            .map(|name| self.profile(name))
            .transpose()?;

        let id = self.allocator.allocate(request.id).await?;
        let _guard = match self.try_lock(id) {
            Ok(guard) => guard,
            Err(e) => {
                self.allocator.release(id).await;
                return Err(e);
            }
        };

        let mut record = ContainerRecord::new(id, &request.name, LifecycleState::Provisioning);
        record.template_profile = profile.as_ref().map(|p| p.name.clone());
        self.registry.insert(record).await;
        info!(container_id = id, "Cloning template");

        if let Err(e) = self.plane.clone_and_start(id, &request.name).await {
            // The control plane removes its own partial clone; whatever holds this id now
            // may belong to someone else and is left alone.
            warn!(container_id = id, error = %e, "Clone/start failed, releasing identity");
            self.registry.remove(id).await;
            self.allocator.release(id).await;
            self.op_locks.remove(&id);
            return Err(DevboxError::CreationFailed {
                id,
                detail: e.to_string(),
            });
        }

        let wait = AddressWait::new(self.address_wait.clone())
            .wait(self.plane.as_ref(), id)
            .await;
        if wait.timed_out() {
            warn!(container_id = id, message = %wait.message, "Continuing without address");
        }
        let record = self
            .registry
            .update(id, |entry| {
                entry.set_state(LifecycleState::Running);
                entry.record.ip_address = wait.address;
                entry.record.last_observed_at = Some(Utc::now());
            })
            .await
            .ok_or(DevboxError::NotFound(id))?;
        self.allocator.commit(id).await;
        info!(container_id = id, ip = ?record.ip_address, "Container running");

        let provisioning = match &profile {
            Some(profile) => Some(self.provision(&record, profile).await),
            None => None,
        };
        self.events.notify(
            format!("Container {} ({id}) created", record.name),
            Severity::Success,
        );

        let access = self.access(&record);
        Ok(CreateOutcome {
            container: record,
            access,
            provisioning,
        })
    }

    async fn provision(&self, record: &ContainerRecord, profile: &TemplateProfile) -> ProvisioningResult {
        let result = self.provisioner.apply(record.id, profile).await;
        if !result.is_complete() {
            let steps: Vec<&str> = result.failures.iter().map(|f| f.step.as_str()).collect();
            self.events.notify(
                format!(
                    "Profile '{}' applied to {} ({}) with failures: {}",
                    profile.name,
                    record.name,
                    record.id,
                    steps.join(", ")
                ),
                Severity::Warning,
            );
        }
        result
    }

    #[instrument(skip(self))]
    pub async fn start(&self, id: ContainerId) -> Result<ContainerRecord> {
        let (_guard, _) = self.guard(id, "start", STOPPED).await?;
        self.plane.start(id).await?;
        self.mark(id, LifecycleState::Running).await
    }

    #[instrument(skip(self))]
    pub async fn stop(&self, id: ContainerId) -> Result<ContainerRecord> {
        let (_guard, _) = self.guard(id, "stop", RUNNING).await?;
        self.plane.stop(id).await?;
        self.mark(id, LifecycleState::Stopped).await
    }

    /// Stop then start. A failed start leaves the container stopped.
    #[instrument(skip(self))]
    pub async fn restart(&self, id: ContainerId) -> Result<ContainerRecord> {
        let (_guard, _) = self.guard(id, "restart", RUNNING).await?;
        self.plane.stop(id).await?;
        self.mark(id, LifecycleState::Stopped).await?;
        self.plane.start(id).await?;
        self.mark(id, LifecycleState::Running).await
    }

    async fn mark(&self, id: ContainerId, state: LifecycleState) -> Result<ContainerRecord> {
        let record = self
            .registry
            .update(id, |entry| {
                entry.set_state(state);
                if state != LifecycleState::Running {
                    entry.record.ip_address = None;
                }
            })
            .await
            .ok_or(DevboxError::NotFound(id))?;
        info!(container_id = id, state = %state, "Transition complete");
        Ok(record)
    }

    #[instrument(skip(self))]
    pub async fn destroy(&self, id: ContainerId) -> Result<ContainerRecord> {
        let (_guard, mut record) = self.guard(id, "destroy", SETTLED).await?;
        self.plane.destroy(id).await?;
        self.registry.remove(id).await;
        self.allocator.retire(id).await;
        self.op_locks.remove(&id);
        record.lifecycle_state = LifecycleState::Destroyed;
        info!(container_id = id, "Container destroyed");
        Ok(record)
    }

    /// Snapshot-mode backup. The record reads as `backing-up` meanwhile and
    /// rejects other transitions. A history entry is appended either way.
    #[instrument(skip(self))]
    pub async fn backup(&self, id: ContainerId) -> Result<BackupRecord> {
        let (_guard, record) = self.guard(id, "backup", SETTLED).await?;
        let origin = record.lifecycle_state;
        let started_at = Utc::now();
        self.registry.set_state(id, LifecycleState::BackingUp).await;
        info!(container_id = id, "Backup started");

        let result = self.plane.snapshot_backup(id).await;
        self.registry.set_state(id, origin).await;

        let backup_name = BackupRecord::backup_name(id, started_at);
        let entry = match &result {
            Ok(artifact) => BackupRecord {
                container_id: id,
                backup_name,
                location: artifact.location.clone(),
                completed_at: Utc::now(),
                outcome: BackupOutcome::Success,
                detail: None,
            },
            Err(e) => BackupRecord {
                container_id: id,
                backup_name,
                location: String::new(),
                completed_at: Utc::now(),
                outcome: BackupOutcome::Failure,
                detail: Some(e.raw_detail.clone()),
            },
        };
        self.backups.write().await.push(entry.clone());

        match result {
            Ok(_) => {
                info!(container_id = id, location = %entry.location, "Backup complete");
                Ok(entry)
            }
            Err(e) => {
                warn!(container_id = id, error = %e, "Backup failed");
                Err(e.into())
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn apply_template(&self, id: ContainerId, profile: &str) -> Result<ProvisioningResult> {
        let profile = self.profile(profile)?;
        let (_guard, record) = self.guard(id, "apply a template to", RUNNING).await?;
        let result = self.provision(&record, &profile).await;
        self.registry
            .update(id, |entry| entry.record.template_profile = Some(profile.name.clone()))
            .await;
        Ok(result)
    }

    #[instrument(skip(self))]
    pub async fn configure_assistant(
        &self,
        id: ContainerId,
        providers: &[String],
    ) -> Result<AssistantReport> {
        let (_guard, record) = self.guard(id, "configure the assistant in", RUNNING).await?;
        let report = self
            .assistant
            .configure(self.plane.as_ref(), id, providers)
            .await;
        let (message, severity) = if report.success {
            (format!("Assistant configured in {}", record.name), Severity::Success)
        } else {
            (
                format!(
                    "Assistant setup failed in {}: {}",
                    record.name,
                    report.error.as_deref().unwrap_or("unknown error")
                ),
                Severity::Error,
            )
        };
        self.events.notify(message, severity);
        Ok(report)
    }

    // --- Read-only aggregation ---

    #[instrument(skip(self))]
    pub async fn info(&self, id: ContainerId) -> Result<ContainerInfo> {
        let view = self.registry.view(id).await.ok_or(DevboxError::NotFound(id))?;
        let config = self
            .plane
            .query_config(id)
            .await?
            .into_iter()
            .map(|(key, value)| ConfigEntry { key, value })
            .collect();

        let (resources, tooling_version) =
            if view.record.lifecycle_state == LifecycleState::Running {
                let resources = match self.plane.query_resources(id).await {
                    Ok(snapshot) => Some(snapshot),
                    Err(e) => {
                        warn!(container_id = id, error = %e, "Resource query failed");
                        view.resources.clone()
                    }
                };
                let version = self.assistant.version(self.plane.as_ref(), id).await;
                (resources, version)
            } else {
                (None, None)
            };

        Ok(ContainerInfo {
            access: self.access(&view.record),
            container: view.record,
            config,
            resources,
            tooling_version,
        })
    }

    #[instrument(skip(self))]
    pub async fn monitor(&self, id: ContainerId) -> Result<MonitorReport> {
        let record = self.registry.record(id).await.ok_or(DevboxError::NotFound(id))?;
        if record.lifecycle_state != LifecycleState::Running {
            return Ok(MonitorReport {
                id,
                lifecycle_state: record.lifecycle_state,
                resources: None,
                message: Some("Container not running".to_string()),
            });
        }
        let snapshot = self.plane.query_resources(id).await?;
        self.registry
            .update(id, |entry| {
                if entry.record.lifecycle_state == LifecycleState::Running {
                    entry.resources = Some(snapshot.clone());
                }
            })
            .await;
        Ok(MonitorReport {
            id,
            lifecycle_state: record.lifecycle_state,
            resources: Some(snapshot),
            message: None,
        })
    }

    // --- Poll-result merge ---

    /// Fold one poll cycle into the registry. Records with an operation in
    /// flight, or in a transient state, are left alone.
    pub async fn reconcile(&self, observations: Vec<Observation>) {
        let now = Utc::now();
        // Taken before the write guard: nothing else is awaited while it is held.
        let reserved = self.allocator.reserved().await;
        let mut entries = self.registry.write().await;
        let seen: BTreeSet<ContainerId> = observations.iter().map(|o| o.summary.id).collect();

        for obs in observations {
            let id = obs.summary.id;
            let observed_state = obs.summary.status.lifecycle_state();
            match entries.get_mut(&id) {
                Some(entry) => {
                    if self.is_busy(id) || !entry.record.lifecycle_state.is_settled() {
                        continue;
                    }
                    if let Some(state) = observed_state {
                        if state != entry.record.lifecycle_state {
                            info!(
                                container_id = id,
                                from = %entry.record.lifecycle_state,
                                to = %state,
                                "State changed externally"
                            );
                            entry.set_state(state);
                        }
                    }
                    apply_observation(entry, obs, now);
                }
                None => {
                    let Some(state) = observed_state else {
                        debug!(container_id = id, status = ?obs.summary.status, "Skipping unknown state");
                        continue;
                    };
                    // An allocation for this id is still settling.
                    if self.is_busy(id) || reserved.contains(&id) {
                        continue;
                    }
                    info!(container_id = id, name = %obs.summary.name, "Adopting external container");
                    let mut entry = Entry::new(ContainerRecord::new(id, &obs.summary.name, state));
                    apply_observation(&mut entry, obs, now);
                    entries.insert(id, entry);
                }
            }
        }

        let vanished: Vec<ContainerId> = entries
            .iter()
            .filter(|(id, entry)| {
                !seen.contains(*id)
                    && entry.record.lifecycle_state.is_settled()
                    && !self.is_busy(**id)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in vanished {
            info!(container_id = id, "Container disappeared externally");
            entries.remove(&id);
            self.op_locks.remove(&id);
        }
    }
}

fn apply_observation(entry: &mut Entry, obs: Observation, now: chrono::DateTime<Utc>) {
    entry.record.last_observed_at = Some(now);
    if entry.record.lifecycle_state == LifecycleState::Running {
        if obs.address.is_some() {
            entry.record.ip_address = obs.address;
        }
        if obs.resources.is_some() {
            entry.resources = obs.resources;
        }
    } else {
        entry.record.ip_address = None;
        entry.resources = None;
    }
}

/// Container names become hostnames: 1-63 of `[A-Za-z0-9-]`, no leading or
/// trailing hyphen.
fn validate_hostname(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(DevboxError::InvalidArgument(format!(
            "'{name}' is not a valid container name (letters, digits and '-', at most 63 characters)"
        )))
    }
}
