/// Test utilities for conditional test execution
use std::process::Command;

/// Whether this host has a working `pct` (i.e. is a Proxmox node).
pub fn has_pct() -> bool {
    if !cfg!(target_os = "linux") {
        return false;
    }

    Command::new("pct")
        .arg("list")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Macro to skip tests when requirements aren't met
#[macro_export]
macro_rules! require_pct {
    () => {
        if !$crate::test_utils::has_pct() {
            eprintln!("Test ignored: pct not available (Proxmox host required)");
            return;
        }
    };
}
