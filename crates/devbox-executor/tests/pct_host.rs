//! Read-only checks against a real Proxmox host. Skipped elsewhere.

use devbox_common::ControlPlane;
use devbox_executor::{require_pct, PctConfig, PctControlPlane};

#[tokio::test]
async fn test_list_parses_on_real_host() {
    require_pct!();

    let plane = PctControlPlane::new(PctConfig::default());
    let containers = plane.list_containers().await.unwrap();
    for container in &containers {
        assert!(container.id > 0);
        assert!(!container.name.is_empty());
    }
}
