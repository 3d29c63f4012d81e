use devbox_common::{ContainerId, DevboxError};
use devbox_executor::PctConfig;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("Failed to read catalog {path}: {source}")]
    CatalogRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid catalog: {0}")]
    Catalog(String),
}

impl From<ConfigError> for DevboxError {
    fn from(err: ConfigError) -> Self {
        DevboxError::Config(err.to_string())
    }
}

/// Process-wide settings, read once at startup.
#[derive(Debug, Clone)]
pub struct DevboxConfig {
    pub pct: PctConfig,
    pub id_start: ContainerId,
    pub id_end: ContainerId,
    pub address_wait: Duration,
    pub poll_interval: Duration,
    pub dev_user: String,
    pub catalog_path: Option<PathBuf>,
    pub host: String,
    pub port: u16,
}

impl Default for DevboxConfig {
    fn default() -> Self {
        Self {
            pct: PctConfig::default(),
            id_start: 1001,
            id_end: 9999,
            address_wait: Duration::from_secs(15),
            poll_interval: Duration::from_secs(5),
            dev_user: "developer".to_string(),
            catalog_path: None,
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl DevboxConfig {
    /// Load `.env` if present, then read the environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let get = |var: &'static str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("DEVBOX_PCT_BIN") {
            config.pct.pct_bin = v;
        }
        if let Some(v) = get("DEVBOX_VZDUMP_BIN") {
            config.pct.vzdump_bin = v;
        }
        if let Some(v) = get("DEVBOX_TEMPLATE_ID") {
            config.pct.template_id = parse_number("DEVBOX_TEMPLATE_ID", &v)?;
        }
        if let Some(v) = get("DEVBOX_ID_RANGE") {
            let (start, end) = parse_range("DEVBOX_ID_RANGE", &v)?;
            config.id_start = start;
            config.id_end = end;
        }
        if let Some(v) = get("DEVBOX_COMMAND_TIMEOUT_SECS") {
            config.pct.command_timeout = parse_secs("DEVBOX_COMMAND_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("DEVBOX_CLONE_TIMEOUT_SECS") {
            config.pct.clone_timeout = parse_secs("DEVBOX_CLONE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("DEVBOX_BACKUP_TIMEOUT_SECS") {
            config.pct.backup_timeout = parse_secs("DEVBOX_BACKUP_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("DEVBOX_BACKUP_STORAGE") {
            config.pct.backup_storage = v;
        }
        if let Some(v) = get("DEVBOX_DUMP_DIR") {
            config.pct.dump_dir = PathBuf::from(v);
        }
        if let Some(v) = get("DEVBOX_NET_INTERFACE") {
            config.pct.net_interface = v;
        }
        if let Some(v) = get("DEVBOX_ADDRESS_WAIT_SECS") {
            config.address_wait = parse_secs("DEVBOX_ADDRESS_WAIT_SECS", &v)?;
        }
        if let Some(v) = get("DEVBOX_POLL_INTERVAL_SECS") {
            config.poll_interval = parse_secs("DEVBOX_POLL_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("DEVBOX_DEV_USER") {
            config.dev_user = v;
        }
        if let Some(v) = get("DEVBOX_CATALOG") {
            config.catalog_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("DEVBOX_HOST") {
            config.host = v;
        }
        if let Some(v) = get("DEVBOX_PORT") {
            config.port = parse_number("DEVBOX_PORT", &v)?;
        }
        Ok(config)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_number<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(var, value, e.to_string()))
}

fn parse_secs(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let secs: u64 = parse_number(var, value)?;
    if secs == 0 {
        return Err(invalid(var, value, "must be at least 1 second"));
    }
    Ok(Duration::from_secs(secs))
}

/// `start-end`, inclusive, `0 < start <= end`.
fn parse_range(var: &'static str, value: &str) -> Result<(ContainerId, ContainerId), ConfigError> {
    let (start, end) = value
        .split_once('-')
        .ok_or_else(|| invalid(var, value, "expected <start>-<end>"))?;
    let start: ContainerId = parse_number(var, start)?;
    let end: ContainerId = parse_number(var, end)?;
    if start == 0 || start > end {
        return Err(invalid(var, value, "range must satisfy 0 < start <= end"));
    }
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = DevboxConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.pct.template_id, 9000);
        assert_eq!((config.id_start, config.id_end), (1001, 9999));
        assert_eq!(config.address_wait, Duration::from_secs(15));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert!(config.catalog_path.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = DevboxConfig::from_lookup(lookup(&[
            ("DEVBOX_ID_RANGE", "2000-2010"),
            ("DEVBOX_TEMPLATE_ID", "8000"),
            ("DEVBOX_BACKUP_STORAGE", "local-lvm"),
            ("DEVBOX_PORT", "9090"),
        ]))
        .unwrap();
        assert_eq!((config.id_start, config.id_end), (2000, 2010));
        assert_eq!(config.pct.template_id, 8000);
        assert_eq!(config.pct.backup_storage, "local-lvm");
        assert_eq!(config.port, 9090);
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = DevboxConfig::from_lookup(lookup(&[("DEVBOX_ID_RANGE", "9999-1001")]))
            .unwrap_err();
        assert!(err.to_string().contains("DEVBOX_ID_RANGE"));

        let err = DevboxConfig::from_lookup(lookup(&[("DEVBOX_POLL_INTERVAL_SECS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("DEVBOX_POLL_INTERVAL_SECS"));

        let err: DevboxError =
            DevboxConfig::from_lookup(lookup(&[("DEVBOX_PORT", "70000")]))
                .unwrap_err()
                .into();
        assert_eq!(err.kind(), devbox_common::ErrorKind::ConfigError);
    }

    #[test]
    #[serial]
    fn reads_process_environment() {
        std::env::set_var("DEVBOX_DEV_USER", "alice");
        std::env::set_var("DEVBOX_NET_INTERFACE", "eth1");
        let config = DevboxConfig::from_env();
        std::env::remove_var("DEVBOX_DEV_USER");
        std::env::remove_var("DEVBOX_NET_INTERFACE");

        let config = config.unwrap();
        assert_eq!(config.dev_user, "alice");
        assert_eq!(config.pct.net_interface, "eth1");
    }
}
