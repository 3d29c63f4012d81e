use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

/// Numeric container identity (the control plane's VMID).
pub type ContainerId = u32;

/// Coarse phase of a container's existence.
///
/// `absent` is not represented: a container without a record is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleState {
    Provisioning,
    Running,
    Stopped,
    BackingUp,
    Destroyed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Provisioning => "provisioning",
            LifecycleState::Running => "running",
            LifecycleState::Stopped => "stopped",
            LifecycleState::BackingUp => "backing-up",
            LifecycleState::Destroyed => "destroyed",
        }
    }

    /// Whether a structural transition may start from this state.
    pub fn is_settled(&self) -> bool {
        matches!(self, LifecycleState::Running | LifecycleState::Stopped)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status string as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservedStatus {
    Running,
    Stopped,
    Unknown(String),
}

impl ObservedStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "running" => ObservedStatus::Running,
            "stopped" => ObservedStatus::Stopped,
            other => ObservedStatus::Unknown(other.to_string()),
        }
    }

    /// Lifecycle state implied by an externally observed status, if any.
    pub fn lifecycle_state(&self) -> Option<LifecycleState> {
        match self {
            ObservedStatus::Running => Some(LifecycleState::Running),
            ObservedStatus::Stopped => Some(LifecycleState::Stopped),
            ObservedStatus::Unknown(_) => None,
        }
    }
}

/// One row of the control plane's container listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: ContainerId,
    pub status: ObservedStatus,
    pub name: String,
    pub lock: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: ContainerId,
    pub name: String,
    pub lifecycle_state: LifecycleState,
    pub ip_address: Option<IpAddr>,
    pub template_profile: Option<String>,
    pub last_observed_at: Option<DateTime<Utc>>,
}

impl ContainerRecord {
    pub fn new(id: ContainerId, name: impl Into<String>, state: LifecycleState) -> Self {
        Self {
            id,
            name: name.into(),
            lifecycle_state: state,
            ip_address: None,
            template_profile: None,
            last_observed_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub container_id: ContainerId,
    pub cpu_usage_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub disk_used_bytes: u64,
    pub disk_total_bytes: u64,
    pub sampled_at: DateTime<Utc>,
}

/// Record plus the most recent resource sample, as pushed to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerView {
    #[serde(flatten)]
    pub record: ContainerRecord,
    pub resources: Option<ResourceSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub container_id: ContainerId,
    pub backup_name: String,
    pub location: String,
    pub completed_at: DateTime<Utc>,
    pub outcome: BackupOutcome,
    pub detail: Option<String>,
}

impl BackupRecord {
    /// `lxc-<id>-<YYYYmmdd-HHMMSS>`
    pub fn backup_name(container_id: ContainerId, at: DateTime<Utc>) -> String {
        format!("lxc-{}-{}", container_id, at.format("%Y%m%d-%H%M%S"))
    }
}

/// Archive produced by the control plane's snapshot-mode backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stderr if present, otherwise stdout, trimmed. Used for failure causes.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("exit code {}: {}", self.exit_code, self.stdout.trim())
        } else {
            format!("exit code {}: {}", self.exit_code, stderr)
        }
    }
}

/// Console and SSH entry points for a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDescriptor {
    pub console: String,
    pub ssh: Option<String>,
    pub user: String,
}

impl AccessDescriptor {
    pub fn new(id: ContainerId, ip: Option<IpAddr>, user: &str) -> Self {
        Self {
            console: format!("pct enter {id}"),
            ssh: ip.map(|ip| format!("ssh {user}@{ip}")),
            user: user.to_string(),
        }
    }
}

// --- Template profiles ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Npm,
    Pip,
}

impl PackageManager {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageManager::Apt => "apt",
            PackageManager::Npm => "npm",
            PackageManager::Pip => "pip",
        }
    }
}

/// A catalog package entry split into manager and package name.
///
/// `npm:typescript` and `pip:pandas` select a manager; bare names are apt packages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageRef<'a> {
    pub manager: PackageManager,
    pub name: &'a str,
}

impl<'a> PackageRef<'a> {
    pub fn parse(entry: &'a str) -> Self {
        match entry.split_once(':') {
            Some(("npm", name)) => PackageRef {
                manager: PackageManager::Npm,
                name,
            },
            Some(("pip", name)) => PackageRef {
                manager: PackageManager::Pip,
                name,
            },
            Some(("apt", name)) => PackageRef {
                manager: PackageManager::Apt,
                name,
            },
            _ => PackageRef {
                manager: PackageManager::Apt,
                name: entry,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceRuntime {
    #[default]
    Systemd,
    Docker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub host: u16,
    pub container: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxService {
    pub name: String,
    #[serde(default)]
    pub runtime: ServiceRuntime,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub ports: Vec<PortBinding>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateProfile {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub packages: BTreeSet<String>,
    #[serde(default)]
    pub aux_services: Vec<AuxService>,
    #[serde(default)]
    pub exposed_ports: BTreeSet<u16>,
}

// --- Provisioning results ---

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledArtifacts {
    pub packages: BTreeSet<String>,
    pub aux_services: Vec<String>,
    pub ports: BTreeSet<u16>,
}

/// A provisioning step that failed; collected, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: crate::ErrorKind,
    pub step: String,
    pub cause: String,
}

impl StepFailure {
    pub fn new(step: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            kind: crate::ErrorKind::ProvisioningStepFailed,
            step: step.into(),
            cause: cause.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningResult {
    pub profile: String,
    pub installed: InstalledArtifacts,
    pub failures: Vec<StepFailure>,
}

impl ProvisioningResult {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}
