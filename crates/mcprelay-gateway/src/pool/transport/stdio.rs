//! Stdio transport for containerized backends
//!
//! The backend runs as a child process (the container runtime CLI) and
//! speaks MCP over stdin/stdout.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rmcp::transport::{ConfigureCommandExt, TokioChildProcess};
use rmcp::ServiceExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::super::handle::{RelayClientHandler, UpstreamClient};
use crate::runtime::LaunchPlan;

/// Apply platform-specific flags to a child process command.
///
/// - **Windows**: `CREATE_NO_WINDOW` so the child does not allocate a
///   console window.
/// - **Unix**: `process_group(0)` so terminal signals sent to the gateway
///   do not propagate to backend processes.
pub fn configure_child_process_platform(cmd: &mut Command) {
    #[cfg(windows)]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }
}

/// Spawn the launch plan and perform the MCP initialize handshake.
pub async fn connect_stdio(
    server: &str,
    plan: &LaunchPlan,
    handler: RelayClientHandler,
    timeout: Duration,
) -> Result<UpstreamClient> {
    info!(
        server = %server,
        command = %plan.command.display(),
        "[Pool] Launching stdio backend"
    );
    debug!(server = %server, args = ?plan.args, "[Pool] Launch arguments");

    let args = plan.args.clone();
    let env = plan.env.clone();
    let transport = TokioChildProcess::new(Command::new(&plan.command).configure(move |cmd| {
        cmd.args(&args)
            .envs(&env)
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        configure_child_process_platform(cmd);
    }))
    .with_context(|| format!("failed to spawn backend '{server}'"))?;

    let client = tokio::time::timeout(timeout, handler.serve(transport))
        .await
        .map_err(|_| anyhow!("initialize timeout after {timeout:?} for backend '{server}'"))?
        .with_context(|| format!("MCP handshake failed for backend '{server}'"))?;

    info!(server = %server, "[Pool] Stdio backend connected");
    Ok(client)
}
