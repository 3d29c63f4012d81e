//! In-memory control plane used by every test suite in the workspace.
//!
//! Containers, their installed packages, firewall rules and services live in a
//! single `MockState`. Each call is recorded, and tests can inject failures,
//! latency, or a gate that parks a call until the test releases it.

use async_trait::async_trait;
use chrono::Utc;
use devbox_common::{
    AdapterError, AdapterResult, BackupArtifact, ContainerId, ContainerSummary, ControlPlane,
    ExecOutput, ObservedStatus, ResourceSnapshot,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

/// Operations of the [`ControlPlane`] trait, used to target injected behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    CloneAndStart,
    Start,
    Stop,
    Destroy,
    Exec,
    Backup,
    Status,
    List,
    Address,
    Resources,
    Config,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub op: MockOp,
    pub id: Option<ContainerId>,
    /// Joined argv for `Exec`, hostname for `CloneAndStart`, empty otherwise.
    pub detail: String,
}

/// When a running container reports its network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressPolicy {
    Immediate,
    /// `None` for the first n queries after start.
    AfterQueries(u32),
    Never,
}

/// Observable state of one mock container.
#[derive(Debug, Clone, Default)]
pub struct MockContainer {
    pub name: String,
    pub running: bool,
    pub address_queries: u32,
    pub apt: BTreeSet<String>,
    pub npm: BTreeSet<String>,
    pub pip: BTreeSet<String>,
    pub firewall: BTreeSet<u16>,
    pub active_units: BTreeSet<String>,
    /// docker container name -> running
    pub docker: BTreeMap<String, bool>,
    pub assistant_logins: Vec<String>,
}

impl MockContainer {
    fn new(name: &str, running: bool) -> Self {
        Self {
            name: name.to_string(),
            running,
            ..Default::default()
        }
    }
}

struct MockState {
    containers: BTreeMap<ContainerId, MockContainer>,
    calls: Vec<MockCall>,
    failures: HashMap<MockOp, VecDeque<AdapterError>>,
    latency: HashMap<MockOp, Duration>,
    gates: HashMap<MockOp, Arc<Semaphore>>,
    address_policy: AddressPolicy,
    broken_packages: BTreeSet<String>,
    broken_units: BTreeSet<String>,
    assistant_installed: bool,
    dump_dir: String,
}

pub const MOCK_TEMPLATE_ID: ContainerId = 9000;
pub const MOCK_ASSISTANT_VERSION: &str = "1.1.15";

#[derive(Clone)]
pub struct MockControlPlane {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl MockControlPlane {
    /// A control plane holding only the stopped base template.
    pub fn new() -> Self {
        let mut containers = BTreeMap::new();
        containers.insert(MOCK_TEMPLATE_ID, MockContainer::new("template", false));
        Self {
            state: Arc::new(Mutex::new(MockState {
                containers,
                calls: Vec::new(),
                failures: HashMap::new(),
                latency: HashMap::new(),
                gates: HashMap::new(),
                address_policy: AddressPolicy::Immediate,
                broken_packages: BTreeSet::new(),
                broken_units: BTreeSet::new(),
                assistant_installed: true,
                dump_dir: "/var/lib/vz/dump".to_string(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // Poisoning only happens if a test panicked mid-call.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a container that exists outside any orchestrator.
    pub fn with_container(self, id: ContainerId, name: &str, running: bool) -> Self {
        self.state()
            .containers
            .insert(id, MockContainer::new(name, running));
        self
    }

    pub fn set_address_policy(&self, policy: AddressPolicy) {
        self.state().address_policy = policy;
    }

    /// The next call of `op` fails with `err`. Queued failures are consumed in order.
    pub fn fail_next(&self, op: MockOp, err: AdapterError) {
        self.state().failures.entry(op).or_default().push_back(err);
    }

    pub fn set_latency(&self, op: MockOp, latency: Duration) {
        self.state().latency.insert(op, latency);
    }

    /// Park every future call of `op` until a permit is added to the returned semaphore.
    pub fn gate(&self, op: MockOp) -> Arc<Semaphore> {
        self.state()
            .gates
            .entry(op)
            .or_insert_with(|| Arc::new(Semaphore::new(0)))
            .clone()
    }

    pub fn ungate(&self, op: MockOp) {
        if let Some(gate) = self.state().gates.remove(&op) {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    /// Installing this package (any manager) fails.
    pub fn break_package(&self, name: &str) {
        self.state().broken_packages.insert(name.to_string());
    }

    /// Starting this systemd unit or docker service fails.
    pub fn break_unit(&self, name: &str) {
        self.state().broken_units.insert(name.to_string());
    }

    pub fn set_assistant_installed(&self, installed: bool) {
        self.state().assistant_installed = installed;
    }

    /// Change a container's status behind the orchestrator's back.
    pub fn set_running(&self, id: ContainerId, running: bool) {
        if let Some(container) = self.state().containers.get_mut(&id) {
            container.running = running;
            container.address_queries = 0;
        }
    }

    /// Remove a container behind the orchestrator's back.
    pub fn remove(&self, id: ContainerId) {
        self.state().containers.remove(&id);
    }

    pub fn container(&self, id: ContainerId) -> Option<MockContainer> {
        self.state().containers.get(&id).cloned()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, op: MockOp) -> usize {
        self.state().calls.iter().filter(|c| c.op == op).count()
    }

    /// Exec calls whose argv starts with `prefix`.
    pub fn exec_calls(&self, prefix: &str) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.op == MockOp::Exec && c.detail.starts_with(prefix))
            .map(|c| c.detail.clone())
            .collect()
    }

    pub fn address_for(id: ContainerId) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 10, (id % 250 + 2) as u8))
    }

    /// Record the call, honour gate and latency, then pop any injected failure.
    async fn enter(&self, op: MockOp, id: Option<ContainerId>, detail: String) -> AdapterResult<()> {
        let (gate, latency) = {
            let mut state = self.state();
            state.calls.push(MockCall { op, id, detail });
            (state.gates.get(&op).cloned(), state.latency.get(&op).copied())
        };
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match self.state().failures.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(err) => {
                debug!(?op, ?id, "injected failure");
                Err(err)
            }
            None => Ok(()),
        }
    }
}

fn missing(id: ContainerId) -> AdapterError {
    AdapterError::not_found(format!(
        "Configuration file 'nodes/pve/lxc/{id}.conf' does not exist"
    ))
}

fn out(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> ExecOutput {
    ExecOutput {
        exit_code,
        stdout: stdout.into(),
        stderr: stderr.into(),
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn clone_and_start(&self, id: ContainerId, name: &str) -> AdapterResult<()> {
        self.enter(MockOp::CloneAndStart, Some(id), name.to_string())
            .await?;
        let mut state = self.state();
        if !state.containers.contains_key(&MOCK_TEMPLATE_ID) {
            return Err(missing(MOCK_TEMPLATE_ID));
        }
        if state.containers.contains_key(&id) {
            return Err(AdapterError::command_failed(format!(
                "unable to create CT {id} - CT {id} already exists on node 'pve'"
            )));
        }
        state.containers.insert(id, MockContainer::new(name, true));
        Ok(())
    }

    async fn start(&self, id: ContainerId) -> AdapterResult<()> {
        self.enter(MockOp::Start, Some(id), String::new()).await?;
        let mut state = self.state();
        let container = state.containers.get_mut(&id).ok_or_else(|| missing(id))?;
        if container.running {
            return Err(AdapterError::command_failed(format!("CT {id} already running")));
        }
        container.running = true;
        container.address_queries = 0;
        Ok(())
    }

    async fn stop(&self, id: ContainerId) -> AdapterResult<()> {
        self.enter(MockOp::Stop, Some(id), String::new()).await?;
        let mut state = self.state();
        let container = state.containers.get_mut(&id).ok_or_else(|| missing(id))?;
        if !container.running {
            return Err(AdapterError::command_failed(format!("CT {id} not running")));
        }
        container.running = false;
        Ok(())
    }

    async fn destroy(&self, id: ContainerId) -> AdapterResult<()> {
        self.enter(MockOp::Destroy, Some(id), String::new()).await?;
        self.state()
            .containers
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| missing(id))
    }

    async fn exec_inside(&self, id: ContainerId, argv: &[String]) -> AdapterResult<ExecOutput> {
        self.enter(MockOp::Exec, Some(id), argv.join(" ")).await?;
        let mut state = self.state();
        let state = &mut *state;
        let container = state.containers.get_mut(&id).ok_or_else(|| missing(id))?;
        if !container.running {
            return Err(AdapterError::command_failed(format!("CT {id} not running")));
        }
        Ok(interpret(
            container,
            strip_wrappers(argv),
            &state.broken_packages,
            &state.broken_units,
            state.assistant_installed,
        ))
    }

    async fn snapshot_backup(&self, id: ContainerId) -> AdapterResult<BackupArtifact> {
        self.enter(MockOp::Backup, Some(id), String::new()).await?;
        let state = self.state();
        if !state.containers.contains_key(&id) {
            return Err(missing(id));
        }
        let stamp = Utc::now().format("%Y_%m_%d-%H_%M_%S");
        Ok(BackupArtifact {
            location: format!("{}/vzdump-lxc-{id}-{stamp}.tar.zst", state.dump_dir),
        })
    }

    async fn query_status(&self, id: ContainerId) -> AdapterResult<ObservedStatus> {
        self.enter(MockOp::Status, Some(id), String::new()).await?;
        let state = self.state();
        let container = state.containers.get(&id).ok_or_else(|| missing(id))?;
        Ok(if container.running {
            ObservedStatus::Running
        } else {
            ObservedStatus::Stopped
        })
    }

    async fn list_containers(&self) -> AdapterResult<Vec<ContainerSummary>> {
        self.enter(MockOp::List, None, String::new()).await?;
        Ok(self
            .state()
            .containers
            .iter()
            .map(|(id, c)| ContainerSummary {
                id: *id,
                status: if c.running {
                    ObservedStatus::Running
                } else {
                    ObservedStatus::Stopped
                },
                name: c.name.clone(),
                lock: None,
            })
            .collect())
    }

    async fn query_network_address(&self, id: ContainerId) -> AdapterResult<Option<IpAddr>> {
        self.enter(MockOp::Address, Some(id), String::new()).await?;
        let mut state = self.state();
        let policy = state.address_policy;
        let container = state.containers.get_mut(&id).ok_or_else(|| missing(id))?;
        if !container.running {
            return Ok(None);
        }
        container.address_queries += 1;
        let visible = match policy {
            AddressPolicy::Immediate => true,
            AddressPolicy::AfterQueries(n) => container.address_queries > n,
            AddressPolicy::Never => false,
        };
        Ok(visible.then(|| Self::address_for(id)))
    }

    async fn query_resources(&self, id: ContainerId) -> AdapterResult<ResourceSnapshot> {
        self.enter(MockOp::Resources, Some(id), String::new()).await?;
        let state = self.state();
        let container = state.containers.get(&id).ok_or_else(|| missing(id))?;
        if !container.running {
            return Err(AdapterError::command_failed(format!("CT {id} not running")));
        }
        Ok(ResourceSnapshot {
            container_id: id,
            cpu_usage_percent: 12.5,
            memory_used_bytes: 1 << 30,
            memory_total_bytes: 8 << 30,
            disk_used_bytes: 4 << 30,
            disk_total_bytes: 32 << 30,
            sampled_at: Utc::now(),
        })
    }

    async fn query_config(&self, id: ContainerId) -> AdapterResult<Vec<(String, String)>> {
        self.enter(MockOp::Config, Some(id), String::new()).await?;
        let state = self.state();
        let container = state.containers.get(&id).ok_or_else(|| missing(id))?;
        Ok(vec![
            ("arch".to_string(), "amd64".to_string()),
            ("cores".to_string(), "2".to_string()),
            ("hostname".to_string(), container.name.clone()),
            ("memory".to_string(), "2048".to_string()),
            (
                "net0".to_string(),
                "name=eth0,bridge=vmbr0,ip=dhcp".to_string(),
            ),
        ])
    }
}

/// Drop `runuser -u <user> --` and `env K=V…` prefixes.
fn strip_wrappers(argv: &[String]) -> Vec<&str> {
    let mut args: Vec<&str> = argv.iter().map(String::as_str).collect();
    loop {
        match args.as_slice() {
            ["runuser", "-u", _, "--", ..] => {
                args.drain(..4);
            }
            ["env", ..] => {
                args.remove(0);
                while args.first().is_some_and(|a| a.contains('=')) {
                    args.remove(0);
                }
            }
            _ => return args,
        }
    }
}

fn operands<'a>(args: &[&'a str]) -> Vec<&'a str> {
    args.iter()
        .copied()
        .filter(|a| !a.starts_with('-'))
        .collect()
}

fn install(
    installed: &mut BTreeSet<String>,
    packages: &[&str],
    broken: &BTreeSet<String>,
    failure: impl Fn(&str) -> ExecOutput,
) -> ExecOutput {
    if let Some(bad) = packages.iter().find(|p| broken.contains(**p)) {
        return failure(*bad);
    }
    installed.extend(packages.iter().map(|p| p.to_string()));
    out(0, "", "")
}

/// Minimal shell for the commands provisioning and assistant setup issue.
fn interpret(
    c: &mut MockContainer,
    args: Vec<&str>,
    broken_packages: &BTreeSet<String>,
    broken_units: &BTreeSet<String>,
    assistant_installed: bool,
) -> ExecOutput {
    match args.as_slice() {
        ["dpkg-query", "-W", _format, packages @ ..] => {
            let mut stdout = String::new();
            let mut stderr = String::new();
            for pkg in packages {
                if c.apt.contains(*pkg) {
                    stdout.push_str(&format!("{pkg}\tii \n"));
                } else {
                    stderr.push_str(&format!("dpkg-query: no packages found matching {pkg}\n"));
                }
            }
            out(if stderr.is_empty() { 0 } else { 1 }, stdout, stderr)
        }
        ["apt-get", "install", rest @ ..] => {
            let packages = operands(rest);
            install(&mut c.apt, &packages, broken_packages, |bad| {
                out(100, "", format!("E: Unable to locate package {bad}"))
            })
        }
        ["npm", "ls", "-g", ..] => {
            let stdout: String = c
                .npm
                .iter()
                .map(|p| format!("/usr/lib/node_modules/{p}\n"))
                .collect();
            out(0, format!("/usr/lib\n{stdout}"), "")
        }
        ["npm", "install", "-g", rest @ ..] => {
            let packages = operands(rest);
            install(&mut c.npm, &packages, broken_packages, |bad| {
                out(1, "", format!("npm ERR! 404 Not Found - GET https://registry.npmjs.org/{bad}"))
            })
        }
        ["pip", "show", packages @ ..] => {
            let found: Vec<&&str> = packages.iter().filter(|p| c.pip.contains(**p)).collect();
            let stdout = found
                .iter()
                .map(|p| format!("Name: {p}\nVersion: 1.0.0\n"))
                .collect::<Vec<_>>()
                .join("---\n");
            let code = if found.len() == packages.len() { 0 } else { 1 };
            out(code, stdout, "")
        }
        ["pip", "install", rest @ ..] => {
            let packages = operands(rest);
            install(&mut c.pip, &packages, broken_packages, |bad| {
                out(
                    1,
                    "",
                    format!("ERROR: No matching distribution found for {bad}"),
                )
            })
        }
        ["ufw", "status"] => {
            let mut stdout = String::from(
                "Status: active\n\nTo                         Action      From\n--                         ------      ----\n",
            );
            for port in &c.firewall {
                stdout.push_str(&format!("{port}/tcp                   ALLOW       Anywhere\n"));
            }
            out(0, stdout, "")
        }
        ["ufw", "allow", rule] => match rule.trim_end_matches("/tcp").parse::<u16>() {
            Ok(port) => {
                c.firewall.insert(port);
                out(0, "Rule added\n", "")
            }
            Err(_) => out(1, "", format!("ERROR: Bad port '{rule}'")),
        },
        ["systemctl", "is-active", unit] => {
            if c.active_units.contains(*unit) {
                out(0, "active\n", "")
            } else {
                out(3, "inactive\n", "")
            }
        }
        ["systemctl", "enable", "--now", unit] => {
            if broken_units.contains(*unit) {
                out(5, "", format!("Failed to enable unit: Unit {unit}.service not found."))
            } else {
                c.active_units.insert(unit.to_string());
                out(0, "", "")
            }
        }
        ["docker", "ps", "-a", "--filter", filter, ..] => {
            let name = filter
                .trim_start_matches("name=")
                .trim_start_matches('^')
                .trim_end_matches('$');
            match c.docker.get(name) {
                Some(true) => out(0, format!("{name}\trunning\n"), ""),
                Some(false) => out(0, format!("{name}\texited\n"), ""),
                None => out(0, "", ""),
            }
        }
        ["docker", "start", name] => match c.docker.get_mut(*name) {
            Some(running) => {
                *running = true;
                out(0, format!("{name}\n"), "")
            }
            None => out(1, "", format!("Error response from daemon: No such container: {name}")),
        },
        ["docker", "run", rest @ ..] => {
            let name = rest
                .windows(2)
                .find(|w| w[0] == "--name")
                .map(|w| w[1])
                .unwrap_or_default();
            let service = name.trim_start_matches("devbox-");
            if broken_units.contains(service) {
                return out(125, "", format!("docker: Error response from daemon: pull access denied for {service}"));
            }
            if c.docker.contains_key(name) {
                return out(
                    125,
                    "",
                    format!("docker: Error response from daemon: Conflict. The container name \"/{name}\" is already in use."),
                );
            }
            c.docker.insert(name.to_string(), true);
            out(0, "4f1c0ffee\n", "")
        }
        ["opencode", ..] if !assistant_installed => {
            out(127, "", "opencode: command not found")
        }
        ["opencode", "--version"] => out(0, format!("{MOCK_ASSISTANT_VERSION}\n"), ""),
        ["opencode", "auth", "login", "--provider", provider] => {
            c.assistant_logins.push(provider.to_string());
            out(0, format!("Logged in to {provider}\n"), "")
        }
        [program, ..] => out(127, "", format!("{program}: command not found")),
        [] => out(127, "", "empty command"),
    }
}
