//! Applies a [`TemplateProfile`] to a running container.
//!
//! Every step probes current state first and only acts on what is missing,
//! so re-applying a profile is a no-op that reports the same artifacts.
//! Step failures are collected; later steps still run.

use devbox_common::{
    AdapterResult, AuxService, ContainerId, ControlPlane, ExecOutput, InstalledArtifacts,
    PackageManager, PackageRef, ProvisioningResult, ServiceRuntime, StepFailure, TemplateProfile,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub struct TemplateProvisioner {
    plane: Arc<dyn ControlPlane>,
    dev_user: String,
}

impl TemplateProvisioner {
    pub fn new(plane: Arc<dyn ControlPlane>, dev_user: impl Into<String>) -> Self {
        Self {
            plane,
            dev_user: dev_user.into(),
        }
    }

    #[instrument(skip(self, profile), fields(profile = %profile.name))]
    pub async fn apply(&self, id: ContainerId, profile: &TemplateProfile) -> ProvisioningResult {
        let mut installed = InstalledArtifacts::default();
        let mut failures = Vec::new();

        // 1. packages, one step per manager
        let mut groups: BTreeMap<PackageManager, Vec<(&str, &str)>> = BTreeMap::new();
        for entry in &profile.packages {
            let package = PackageRef::parse(entry);
            groups
                .entry(package.manager)
                .or_default()
                .push((entry.as_str(), package.name));
        }
        for (manager, packages) in groups {
            let step = format!("packages:{}", manager.as_str());
            match self.ensure_packages(id, manager, &packages).await {
                Ok(present) => installed.packages.extend(present),
                Err(cause) => failures.push(StepFailure::new(step, cause)),
            }
        }

        // 2. ports
        if !profile.exposed_ports.is_empty() {
            let (open, errors) = self.ensure_ports(id, &profile.exposed_ports).await;
            installed.ports.extend(open);
            if !errors.is_empty() {
                failures.push(StepFailure::new("ports", errors.join("; ")));
            }
        }

        // 3. auxiliary services
        for service in &profile.aux_services {
            let step = format!("service:{}", service.name);
            match self.ensure_service(id, service).await {
                Ok(()) => installed.aux_services.push(service.name.clone()),
                Err(cause) => failures.push(StepFailure::new(step, cause)),
            }
        }

        if failures.is_empty() {
            info!(container_id = id, "Profile applied");
        } else {
            warn!(container_id = id, failed_steps = failures.len(), "Profile applied partially");
        }
        ProvisioningResult {
            profile: profile.name.clone(),
            installed,
            failures,
        }
    }

    async fn exec(&self, id: ContainerId, argv: Vec<String>) -> AdapterResult<ExecOutput> {
        self.plane.exec_inside(id, &argv).await
    }

    fn as_dev_user(&self, mut argv: Vec<String>) -> Vec<String> {
        let mut wrapped = args(&["runuser", "-u", self.dev_user.as_str(), "--"]);
        wrapped.append(&mut argv);
        wrapped
    }

    /// Returns the catalog entries that are present afterwards.
    async fn ensure_packages(
        &self,
        id: ContainerId,
        manager: PackageManager,
        packages: &[(&str, &str)],
    ) -> Result<Vec<String>, String> {
        let names: Vec<&str> = packages.iter().map(|(_, name)| *name).collect();
        let probe = self
            .exec(id, self.probe_command(manager, &names))
            .await
            .map_err(|e| e.to_string())?;
        // dpkg-query, npm ls and pip show exit 1 when something is missing.
        if probe.exit_code > 1 {
            return Err(format!("probe failed: {}", probe.diagnostic()));
        }
        let present = parse_installed(manager, &probe.stdout);

        let missing: Vec<&str> = names
            .iter()
            .copied()
            .filter(|name| !present.contains(&normalize(manager, name)))
            .collect();
        if !missing.is_empty() {
            info!(container_id = id, manager = manager.as_str(), ?missing, "Installing packages");
            let output = self
                .exec(id, self.install_command(manager, &missing))
                .await
                .map_err(|e| e.to_string())?;
            if !output.success() {
                return Err(output.diagnostic());
            }
        }
        Ok(packages.iter().map(|(entry, _)| entry.to_string()).collect())
    }

    fn probe_command(&self, manager: PackageManager, names: &[&str]) -> Vec<String> {
        match manager {
            PackageManager::Apt => {
                let mut argv = args(&["dpkg-query", "-W", "--showformat=${Package}\\t${db:Status-Abbrev}\\n"]);
                argv.extend(names.iter().map(|n| n.to_string()));
                argv
            }
            PackageManager::Npm => args(&["npm", "ls", "-g", "--depth=0", "--parseable"]),
            PackageManager::Pip => {
                let mut argv = args(&["pip", "show"]);
                argv.extend(names.iter().map(|n| n.to_string()));
                self.as_dev_user(argv)
            }
        }
    }

    fn install_command(&self, manager: PackageManager, names: &[&str]) -> Vec<String> {
        let mut argv = match manager {
            PackageManager::Apt => args(&[
                "env",
                "DEBIAN_FRONTEND=noninteractive",
                "apt-get",
                "install",
                "-y",
                "--no-install-recommends",
            ]),
            PackageManager::Npm => args(&["npm", "install", "-g"]),
            PackageManager::Pip => args(&["pip", "install", "--user"]),
        };
        argv.extend(names.iter().map(|n| n.to_string()));
        match manager {
            PackageManager::Pip => self.as_dev_user(argv),
            _ => argv,
        }
    }

    /// Returns the ports open afterwards and one message per failed rule.
    async fn ensure_ports(
        &self,
        id: ContainerId,
        ports: &BTreeSet<u16>,
    ) -> (BTreeSet<u16>, Vec<String>) {
        let status = match self.exec(id, args(&["ufw", "status"])).await {
            Ok(output) if output.success() => output,
            Ok(output) => return (BTreeSet::new(), vec![format!("ufw status: {}", output.diagnostic())]),
            Err(e) => return (BTreeSet::new(), vec![e.to_string()]),
        };
        let allowed = parse_ufw_ports(&status.stdout);

        let mut open = BTreeSet::new();
        let mut errors = Vec::new();
        for &port in ports {
            if allowed.contains(&port) {
                open.insert(port);
                continue;
            }
            match self.exec(id, args(&["ufw", "allow", &format!("{port}/tcp")])).await {
                Ok(output) if output.success() => {
                    open.insert(port);
                }
                Ok(output) => errors.push(format!("port {port}: {}", output.diagnostic())),
                Err(e) => errors.push(format!("port {port}: {e}")),
            }
        }
        (open, errors)
    }

    async fn ensure_service(&self, id: ContainerId, service: &AuxService) -> Result<(), String> {
        match service.runtime {
            ServiceRuntime::Systemd => self.ensure_systemd_unit(id, &service.name).await,
            ServiceRuntime::Docker => self.ensure_docker_service(id, service).await,
        }
    }

    async fn ensure_systemd_unit(&self, id: ContainerId, unit: &str) -> Result<(), String> {
        let probe = self
            .exec(id, args(&["systemctl", "is-active", unit]))
            .await
            .map_err(|e| e.to_string())?;
        if probe.success() {
            return Ok(());
        }
        let output = self
            .exec(id, args(&["systemctl", "enable", "--now", unit]))
            .await
            .map_err(|e| e.to_string())?;
        if output.success() {
            Ok(())
        } else {
            Err(output.diagnostic())
        }
    }

    async fn ensure_docker_service(&self, id: ContainerId, service: &AuxService) -> Result<(), String> {
        let name = format!("devbox-{}", service.name);
        let probe = self
            .exec(
                id,
                args(&[
                    "docker",
                    "ps",
                    "-a",
                    "--filter",
                    &format!("name=^{name}$"),
                    "--format",
                    "{{.Names}}\t{{.State}}",
                ]),
            )
            .await
            .map_err(|e| e.to_string())?;
        if !probe.success() {
            return Err(format!("docker ps: {}", probe.diagnostic()));
        }

        let argv = match parse_docker_state(&probe.stdout, &name) {
            Some(state) if state == "running" => return Ok(()),
            Some(_) => args(&["docker", "start", &name]),
            None => {
                let image = service
                    .image
                    .as_deref()
                    .ok_or_else(|| format!("no image configured for {}", service.name))?;
                let mut argv = args(&["docker", "run", "-d", "--name", &name]);
                for binding in &service.ports {
                    argv.push("-p".to_string());
                    argv.push(format!("{}:{}", binding.host, binding.container));
                }
                argv.push(image.to_string());
                argv.extend(service.command.iter().cloned());
                argv
            }
        };
        let output = self.exec(id, argv).await.map_err(|e| e.to_string())?;
        if output.success() {
            Ok(())
        } else {
            Err(output.diagnostic())
        }
    }
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// pip treats `-`/`_` and case as equivalent.
fn normalize(manager: PackageManager, name: &str) -> String {
    match manager {
        PackageManager::Pip => name.to_ascii_lowercase().replace('_', "-"),
        _ => name.to_string(),
    }
}

fn parse_installed(manager: PackageManager, stdout: &str) -> BTreeSet<String> {
    match manager {
        PackageManager::Apt => stdout
            .lines()
            .filter_map(|line| line.split_once('\t'))
            .filter(|(_, status)| status.starts_with("ii"))
            .map(|(name, _)| name.trim().to_string())
            .collect(),
        PackageManager::Npm => stdout
            .lines()
            .filter_map(|line| line.rsplit_once("/node_modules/"))
            .map(|(_, name)| name.trim().to_string())
            .collect(),
        PackageManager::Pip => stdout
            .lines()
            .filter_map(|line| line.strip_prefix("Name:"))
            .map(|name| normalize(manager, name.trim()))
            .collect(),
    }
}

fn parse_ufw_ports(stdout: &str) -> BTreeSet<u16> {
    stdout
        .lines()
        .filter(|line| line.contains("ALLOW"))
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|rule| rule.trim_end_matches("/tcp").parse().ok())
        .collect()
}

fn parse_docker_state<'a>(stdout: &'a str, name: &str) -> Option<&'a str> {
    stdout.lines().find_map(|line| {
        let (found, state) = line.split_once('\t')?;
        (found.trim() == name).then(|| state.trim())
    })
}
