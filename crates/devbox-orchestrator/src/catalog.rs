//! Template profile catalog, loaded once at startup.

use crate::config::ConfigError;
use devbox_common::{AuxService, PortBinding, ServiceRuntime, TemplateProfile};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProfileEntry {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    packages: BTreeSet<String>,
    #[serde(default)]
    aux_services: Vec<AuxService>,
    #[serde(default)]
    exposed_ports: BTreeSet<u16>,
}

/// Immutable name -> profile map.
#[derive(Debug, Clone, Default)]
pub struct ProfileCatalog {
    profiles: BTreeMap<String, TemplateProfile>,
}

impl ProfileCatalog {
    /// YAML keyed by profile name.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let entries: BTreeMap<String, ProfileEntry> =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Catalog(e.to_string()))?;
        let profiles = entries
            .into_iter()
            .map(|(name, entry)| {
                let profile = TemplateProfile {
                    name: name.clone(),
                    description: entry.description,
                    packages: entry.packages,
                    aux_services: entry.aux_services,
                    exposed_ports: entry.exposed_ports,
                };
                (name, profile)
            })
            .collect();
        let catalog = Self { profiles };
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::CatalogRead {
            path: path.to_path_buf(),
            source,
        })?;
        let catalog = Self::from_yaml_str(&yaml)?;
        info!(path = %path.display(), profiles = catalog.len(), "Loaded profile catalog");
        Ok(catalog)
    }

    /// The `path` catalog if given, otherwise the built-in one.
    pub fn load_or_builtin(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::builtin()),
        }
    }

    pub fn get(&self, name: &str) -> Option<&TemplateProfile> {
        self.profiles.get(name)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &TemplateProfile> {
        self.profiles.values()
    }

    pub fn names(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, profile) in &self.profiles {
            if name.trim().is_empty() {
                return Err(ConfigError::Catalog("profile with empty name".to_string()));
            }
            if profile.exposed_ports.contains(&0) {
                return Err(ConfigError::Catalog(format!("{name}: port 0 is not allowed")));
            }
            if let Some(pkg) = profile.packages.iter().find(|p| p.trim().is_empty()) {
                return Err(ConfigError::Catalog(format!("{name}: empty package entry {pkg:?}")));
            }
            let mut seen = HashSet::new();
            for service in &profile.aux_services {
                if service.name.trim().is_empty() {
                    return Err(ConfigError::Catalog(format!("{name}: service with empty name")));
                }
                if !seen.insert(service.name.as_str()) {
                    return Err(ConfigError::Catalog(format!(
                        "{name}: duplicate service {}",
                        service.name
                    )));
                }
                if service.runtime == ServiceRuntime::Docker && service.image.is_none() {
                    return Err(ConfigError::Catalog(format!(
                        "{name}: docker service {} has no image",
                        service.name
                    )));
                }
                if service.ports.iter().any(|p| p.host == 0 || p.container == 0) {
                    return Err(ConfigError::Catalog(format!(
                        "{name}: service {} binds port 0",
                        service.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// The four stock profiles: web, api, ml, devops.
    pub fn builtin() -> Self {
        let profiles = [
            profile(
                "web",
                "Frontend development",
                &["chromium", "lighttpd", "npm:postman-cli"],
                vec![],
                &[3000, 5173, 4173],
            ),
            profile(
                "api",
                "Backend API development",
                &["postgresql-client", "redis-tools", "npm:nodemon", "npm:typescript"],
                vec![systemd("postgres"), systemd("redis")],
                &[3000, 8080, 9229],
            ),
            profile(
                "ml",
                "Machine learning notebooks",
                &[
                    "python3-torch",
                    "python3-jupyter",
                    "pip:scikit-learn",
                    "pip:pandas",
                    "pip:matplotlib",
                ],
                vec![],
                &[8888],
            ),
            profile(
                "devops",
                "Infrastructure tooling",
                &["terraform", "ansible", "kubectl"],
                vec![AuxService {
                    name: "docker-registry".to_string(),
                    runtime: ServiceRuntime::Docker,
                    image: Some("registry:2".to_string()),
                    command: vec![],
                    ports: vec![PortBinding {
                        host: 5000,
                        container: 5000,
                    }],
                }],
                &[6443, 8080],
            ),
        ];
        Self {
            profiles: profiles
                .into_iter()
                .map(|p| (p.name.clone(), p))
                .collect(),
        }
    }
}

fn systemd(name: &str) -> AuxService {
    AuxService {
        name: name.to_string(),
        runtime: ServiceRuntime::Systemd,
        image: None,
        command: vec![],
        ports: vec![],
    }
}

fn profile(
    name: &str,
    description: &str,
    packages: &[&str],
    aux_services: Vec<AuxService>,
    ports: &[u16],
) -> TemplateProfile {
    TemplateProfile {
        name: name.to_string(),
        description: Some(description.to_string()),
        packages: packages.iter().map(|p| p.to_string()).collect(),
        aux_services,
        exposed_ports: ports.iter().copied().collect(),
    }
}
