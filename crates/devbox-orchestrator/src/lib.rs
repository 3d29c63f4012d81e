//! Container orchestration and monitoring core.
//!
//! [`Orchestrator`] wires the identity allocator, the lifecycle controller,
//! the provisioning engine and the monitoring service around one
//! [`ControlPlane`] and exposes the management operations.

use devbox_common::{
    BackupRecord, ContainerId, ContainerView, ControlPlane, LiveEvent, ProvisioningResult, Result,
    TemplateProfile,
};
use devbox_executor::PctControlPlane;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

pub mod allocator;
pub mod assistant;
pub mod catalog;
pub mod config;
pub mod events;
pub mod lifecycle;
pub mod monitor;
pub mod provisioning;
pub mod readiness;
mod registry;

pub use devbox_common as common;

pub use allocator::IdentityAllocator;
pub use assistant::{AssistantReport, AssistantSetup, OpencodeSetup};
pub use catalog::ProfileCatalog;
pub use config::{ConfigError, DevboxConfig};
pub use events::EventBus;
pub use lifecycle::{
    ConfigEntry, ContainerInfo, CreateOutcome, CreateRequest, LifecycleController, LifecycleDeps,
    MonitorReport, Observation,
};
pub use monitor::{MonitoringService, PollOutcome};
pub use provisioning::TemplateProvisioner;
pub use readiness::AddressWaitConfig;

/// The management surface shared by the gateway and the CLI.
#[derive(Clone)]
pub struct Orchestrator {
    controller: Arc<LifecycleController>,
    monitor: Arc<MonitoringService>,
    catalog: Arc<ProfileCatalog>,
    events: EventBus,
}

impl Orchestrator {
    pub fn new(plane: Arc<dyn ControlPlane>, catalog: ProfileCatalog, config: &DevboxConfig) -> Self {
        let assistant = Arc::new(OpencodeSetup::new(config.dev_user.clone()));
        Self::with_assistant(plane, catalog, config, assistant)
    }

    pub fn with_assistant(
        plane: Arc<dyn ControlPlane>,
        catalog: ProfileCatalog,
        config: &DevboxConfig,
        assistant: Arc<dyn AssistantSetup>,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let events = EventBus::default();
        let allocator = Arc::new(IdentityAllocator::new(
            plane.clone(),
            config.id_start..=config.id_end,
        ));
        let controller = Arc::new(LifecycleController::new(LifecycleDeps {
            plane: plane.clone(),
            allocator,
            provisioner: TemplateProvisioner::new(plane.clone(), config.dev_user.clone()),
            assistant,
            catalog: catalog.clone(),
            events: events.clone(),
            address_wait: AddressWaitConfig {
                timeout: config.address_wait,
                ..AddressWaitConfig::default()
            },
            dev_user: config.dev_user.clone(),
        }));
        let monitor = Arc::new(MonitoringService::new(
            controller.clone(),
            plane,
            events.clone(),
            config.pct.template_id,
            config.poll_interval,
        ));
        Self {
            controller,
            monitor,
            catalog,
            events,
        }
    }

    /// Orchestrator over the host's `pct` with the configured catalog.
    pub fn from_config(config: &DevboxConfig) -> Result<Self> {
        let catalog = ProfileCatalog::load_or_builtin(config.catalog_path.as_deref())?;
        let plane = Arc::new(PctControlPlane::new(config.pct.clone()));
        info!(
            template_id = config.pct.template_id,
            profiles = catalog.len(),
            "Orchestrator configured"
        );
        Ok(Self::new(plane, catalog, config))
    }

    pub fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    pub fn monitor(&self) -> &Arc<MonitoringService> {
        &self.monitor
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Start periodic monitoring in the background.
    pub fn spawn_monitor(&self) -> JoinHandle<()> {
        self.monitor.clone().spawn()
    }

    /// Bring the registry in line with the control plane (one poll).
    pub async fn sync(&self) -> Result<Vec<ContainerView>> {
        Ok(self.monitor.refresh().await?.containers)
    }

    pub async fn list(&self) -> Vec<ContainerView> {
        self.controller.views().await
    }

    pub async fn create(&self, request: CreateRequest) -> Result<CreateOutcome> {
        self.controller.create(request).await
    }

    pub async fn info(&self, id: ContainerId) -> Result<ContainerInfo> {
        self.controller.info(id).await
    }

    pub async fn start(&self, id: ContainerId) -> Result<devbox_common::ContainerRecord> {
        self.controller.start(id).await
    }

    pub async fn stop(&self, id: ContainerId) -> Result<devbox_common::ContainerRecord> {
        self.controller.stop(id).await
    }

    pub async fn restart(&self, id: ContainerId) -> Result<devbox_common::ContainerRecord> {
        self.controller.restart(id).await
    }

    pub async fn destroy(&self, id: ContainerId) -> Result<devbox_common::ContainerRecord> {
        self.controller.destroy(id).await
    }

    pub async fn backup(&self, id: ContainerId) -> Result<BackupRecord> {
        self.controller.backup(id).await
    }

    pub async fn backups(&self, id: Option<ContainerId>) -> Vec<BackupRecord> {
        self.controller.backups(id).await
    }

    pub async fn apply_template(&self, id: ContainerId, profile: &str) -> Result<ProvisioningResult> {
        self.controller.apply_template(id, profile).await
    }

    pub async fn monitor_container(&self, id: ContainerId) -> Result<MonitorReport> {
        self.controller.monitor(id).await
    }

    pub async fn configure_assistant(
        &self,
        id: ContainerId,
        providers: &[String],
    ) -> Result<AssistantReport> {
        self.controller.configure_assistant(id, providers).await
    }

    pub fn profiles(&self) -> Vec<TemplateProfile> {
        self.catalog.profiles().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.events.subscribe()
    }

    pub async fn refresh(&self) -> Result<PollOutcome> {
        self.monitor.refresh().await
    }

    pub async fn current_view(&self) -> Vec<ContainerView> {
        self.monitor.current().await
    }

    pub async fn advance_epoch(&self) -> u64 {
        self.controller.allocator().advance_epoch().await
    }
}
