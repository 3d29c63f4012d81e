use async_trait::async_trait;
use chrono::Utc;
use devbox_common::{
    AdapterError, AdapterErrorKind, AdapterResult, BackupArtifact, ContainerId, ContainerSummary,
    ControlPlane, ExecOutput, ObservedStatus, ResourceSnapshot,
};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::command::{self, render};
use crate::parse;

/// Settings for the `pct`/`vzdump` driver.
#[derive(Debug, Clone)]
pub struct PctConfig {
    pub pct_bin: String,
    pub vzdump_bin: String,
    /// Template cloned by `clone_and_start`.
    pub template_id: ContainerId,
    pub backup_storage: String,
    pub dump_dir: PathBuf,
    pub net_interface: String,
    pub command_timeout: Duration,
    pub clone_timeout: Duration,
    pub backup_timeout: Duration,
}

impl Default for PctConfig {
    fn default() -> Self {
        Self {
            pct_bin: "pct".to_string(),
            vzdump_bin: "vzdump".to_string(),
            template_id: 9000,
            backup_storage: "local".to_string(),
            dump_dir: PathBuf::from("/var/lib/vz/dump"),
            net_interface: "eth0".to_string(),
            command_timeout: Duration::from_secs(30),
            clone_timeout: Duration::from_secs(300),
            backup_timeout: Duration::from_secs(3600),
        }
    }
}

/// Proxmox control plane driven through the `pct` and `vzdump` CLIs.
#[derive(Debug, Clone)]
pub struct PctControlPlane {
    config: PctConfig,
}

impl PctControlPlane {
    pub fn new(config: PctConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PctConfig {
        &self.config
    }

    /// Run `pct <args>` and require a zero exit status.
    async fn pct(&self, args: Vec<String>, limit: Duration) -> AdapterResult<ExecOutput> {
        let output = command::run(&self.config.pct_bin, &args, limit).await?;
        check_exit(&self.config.pct_bin, &args, output)
    }

    async fn exec_checked(&self, id: ContainerId, argv: &[&str]) -> AdapterResult<String> {
        let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
        let output = self.exec_inside(id, &argv).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(AdapterError::command_failed(format!(
                "`{}` in container {id}: {}",
                argv.join(" "),
                output.diagnostic()
            )))
        }
    }
}

fn check_exit(program: &str, args: &[String], output: ExecOutput) -> AdapterResult<ExecOutput> {
    if output.success() {
        return Ok(output);
    }
    let detail = format!("`{}` failed with {}", render(program, args), output.diagnostic());
    if output.stderr.contains("does not exist") {
        Err(AdapterError::not_found(detail))
    } else {
        Err(AdapterError::command_failed(detail))
    }
}

fn id_args(verb: &str, id: ContainerId) -> Vec<String> {
    vec![verb.to_string(), id.to_string()]
}

#[async_trait]
impl ControlPlane for PctControlPlane {
    #[instrument(skip(self))]
    async fn clone_and_start(&self, id: ContainerId, name: &str) -> AdapterResult<()> {
        let clone_args = vec![
            "clone".to_string(),
            self.config.template_id.to_string(),
            id.to_string(),
            "--hostname".to_string(),
            name.to_string(),
        ];
        self.pct(clone_args, self.config.clone_timeout).await?;
        info!(container_id = id, "Template cloned, starting container");
        if let Err(err) = self.pct(id_args("start", id), self.config.clone_timeout).await {
            // Only the clone made above is removed; a failed clone leaves nothing of ours.
            if let Err(cleanup) = self.destroy(id).await {
                warn!(container_id = id, error = %cleanup, "Removing the unstarted clone failed");
            }
            return Err(err);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn start(&self, id: ContainerId) -> AdapterResult<()> {
        self.pct(id_args("start", id), self.config.command_timeout)
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn stop(&self, id: ContainerId) -> AdapterResult<()> {
        self.pct(id_args("stop", id), self.config.command_timeout)
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn destroy(&self, id: ContainerId) -> AdapterResult<()> {
        let mut args = id_args("destroy", id);
        args.extend(["--force", "1", "--purge", "1"].map(String::from));
        self.pct(args, self.config.command_timeout).await.map(|_| ())
    }

    #[instrument(skip(self, argv), fields(command = %argv.join(" ")))]
    async fn exec_inside(&self, id: ContainerId, argv: &[String]) -> AdapterResult<ExecOutput> {
        let mut args = id_args("exec", id);
        args.push("--".to_string());
        args.extend(argv.iter().cloned());
        let output = command::run(&self.config.pct_bin, &args, self.config.command_timeout).await?;
        debug!(exit_code = output.exit_code, "exec finished");
        Ok(output)
    }

    #[instrument(skip(self))]
    async fn snapshot_backup(&self, id: ContainerId) -> AdapterResult<BackupArtifact> {
        let args: Vec<String> = vec![
            id.to_string(),
            "--compress".to_string(),
            "zstd".to_string(),
            "--storage".to_string(),
            self.config.backup_storage.clone(),
            "--mode".to_string(),
            "snapshot".to_string(),
        ];
        let output =
            command::run(&self.config.vzdump_bin, &args, self.config.backup_timeout).await?;
        let output = check_exit(&self.config.vzdump_bin, &args, output)?;

        // vzdump logs to stderr on most setups.
        let location = parse::parse_vzdump_archive(&output.stderr)
            .or_else(|| parse::parse_vzdump_archive(&output.stdout))
            .unwrap_or_else(|| {
                warn!(container_id = id, "vzdump did not report an archive path");
                self.config.dump_dir.display().to_string()
            });
        Ok(BackupArtifact { location })
    }

    #[instrument(skip(self))]
    async fn query_status(&self, id: ContainerId) -> AdapterResult<ObservedStatus> {
        let output = self
            .pct(id_args("status", id), self.config.command_timeout)
            .await?;
        parse::parse_pct_status(&output.stdout)
    }

    #[instrument(skip(self))]
    async fn list_containers(&self) -> AdapterResult<Vec<ContainerSummary>> {
        let output = self
            .pct(vec!["list".to_string()], self.config.command_timeout)
            .await?;
        parse::parse_pct_list(&output.stdout)
    }

    #[instrument(skip(self))]
    async fn query_network_address(&self, id: ContainerId) -> AdapterResult<Option<IpAddr>> {
        let argv = ["ip", "-4", "-o", "addr", "show", self.config.net_interface.as_str()];
        let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
        let output = self.exec_inside(id, &argv).await?;
        // A missing interface is "no address yet".
        if !output.success() {
            debug!(container_id = id, detail = %output.diagnostic(), "address probe failed");
            return Ok(None);
        }
        Ok(parse::parse_inet_address(&output.stdout))
    }

    #[instrument(skip(self))]
    async fn query_resources(&self, id: ContainerId) -> AdapterResult<ResourceSnapshot> {
        let top = self.exec_checked(id, &["top", "-bn1"]).await?;
        let free = self.exec_checked(id, &["free", "-b"]).await?;
        let df = self.exec_checked(id, &["df", "-B1", "/"]).await?;

        let cpu_usage_percent = parse::parse_cpu_usage(&top).ok_or_else(|| {
            AdapterError::new(AdapterErrorKind::Parse, "no CPU summary in top output")
        })?;
        let (memory_used_bytes, memory_total_bytes) = parse::parse_free_bytes(&free)
            .ok_or_else(|| AdapterError::new(AdapterErrorKind::Parse, "no Mem: row in free output"))?;
        let (disk_used_bytes, disk_total_bytes) = parse::parse_df_bytes(&df)
            .ok_or_else(|| AdapterError::new(AdapterErrorKind::Parse, "unreadable df output"))?;

        Ok(ResourceSnapshot {
            container_id: id,
            cpu_usage_percent,
            memory_used_bytes,
            memory_total_bytes,
            disk_used_bytes,
            disk_total_bytes,
            sampled_at: Utc::now(),
        })
    }

    #[instrument(skip(self))]
    async fn query_config(&self, id: ContainerId) -> AdapterResult<Vec<(String, String)>> {
        let output = self
            .pct(id_args("config", id), self.config.command_timeout)
            .await?;
        Ok(parse::parse_pct_config(&output.stdout))
    }
}
