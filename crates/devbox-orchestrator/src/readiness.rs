use chrono::{DateTime, Utc};
use devbox_common::{ContainerId, ControlPlane};
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::debug;

/// Bounds of the network-address wait that follows a fresh clone.
#[derive(Debug, Clone)]
pub struct AddressWaitConfig {
    pub check_interval: Duration,
    pub timeout: Duration,
}

impl Default for AddressWaitConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AddressWaitStatus {
    pub address: Option<IpAddr>,
    pub checks_performed: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub message: String,
}

impl AddressWaitStatus {
    pub fn timed_out(&self) -> bool {
        self.address.is_none()
    }
}

impl Default for AddressWaitStatus {
    fn default() -> Self {
        Self {
            address: None,
            checks_performed: 0,
            last_check: None,
            message: "Not checked yet".to_string(),
        }
    }
}

/// Polls the control plane until the container reports an address or the
/// bound elapses. Query errors count as "no address yet".
pub struct AddressWait {
    config: AddressWaitConfig,
    status: AddressWaitStatus,
}

impl AddressWait {
    pub fn new(config: AddressWaitConfig) -> Self {
        Self {
            config,
            status: AddressWaitStatus::default(),
        }
    }

    pub async fn wait(&mut self, plane: &dyn ControlPlane, id: ContainerId) -> AddressWaitStatus {
        let result = timeout(self.config.timeout, async {
            loop {
                let observed = match plane.query_network_address(id).await {
                    Ok(address) => address,
                    Err(e) => {
                        debug!(container_id = id, error = %e, "address query failed");
                        None
                    }
                };
                self.update_status(observed);

                if self.status.address.is_some() {
                    return;
                }
                sleep(self.config.check_interval).await;
            }
        })
        .await;

        if result.is_err() {
            self.status.message = format!(
                "No address after {:?} ({} checks)",
                self.config.timeout, self.status.checks_performed
            );
        }
        self.status.clone()
    }

    fn update_status(&mut self, observed: Option<IpAddr>) {
        self.status.checks_performed += 1;
        self.status.last_check = Some(Utc::now());
        self.status.address = observed;
        self.status.message = match observed {
            Some(ip) => format!("Address {ip} observed"),
            None => format!("Waiting for address (check {})", self.status.checks_performed),
        };
    }
}
