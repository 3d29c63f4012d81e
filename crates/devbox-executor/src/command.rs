//! Bounded execution of host commands.

use devbox_common::{AdapterError, AdapterErrorKind, AdapterResult, ExecOutput};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// Run `program args…` and collect its output, killing it once `limit` elapses.
///
/// A non-zero exit status is *not* an error here; callers decide what a
/// failing exit code means for their operation.
pub async fn run(program: &str, args: &[String], limit: Duration) -> AdapterResult<ExecOutput> {
    let cmdline = render(program, args);
    debug!(%cmdline, ?limit, "running control-plane command");

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            AdapterError::new(
                AdapterErrorKind::Spawn,
                format!("failed to launch `{cmdline}`: {e}"),
            )
        })?;

    // Dropping the wait future on timeout kills the child.
    let output = match timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(AdapterError::new(
                AdapterErrorKind::Spawn,
                format!("failed to collect output of `{cmdline}`: {e}"),
            ))
        }
        Err(_) => {
            return Err(AdapterError::timeout(format!(
                "`{cmdline}` did not finish within {}s",
                limit.as_secs_f32()
            )))
        }
    };

    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

pub(crate) fn render(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}
