//! Container runtime client
//!
//! Collaborator contract for launching containerized backends: pull and
//! verify images, materialize launch arguments, and discover the networks
//! the gateway itself is attached to (so backends can reach mutually when
//! the gateway runs inside a container).
//!
//! The default implementation shells out to the `docker` binary; the MCP
//! handshake itself happens over the launched container's stdio.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use mcprelay_core::{SecretMap, ServerRuntime, ServerSpec};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Everything needed to spawn a backend as a stdio child process.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    /// Resolved runtime binary.
    pub command: PathBuf,
    pub args: Vec<String>,
    /// Extra process environment. Secret values travel here and are
    /// forwarded into the container via bare `-e NAME` flags, keeping them
    /// out of the argument list.
    pub env: HashMap<String, String>,
}

/// Container runtime operations the gateway depends on.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull an image. No-op when it is already present locally.
    async fn pull(&self, image: &str) -> Result<()>;

    /// Verify an image signature.
    async fn verify(&self, image: &str) -> Result<()>;

    /// Networks the gateway's own container is attached to; empty when the
    /// gateway runs on the host.
    async fn gateway_networks(&self) -> Result<Vec<String>>;

    /// Build the launch invocation for a container backend.
    fn launch_plan(
        &self,
        spec: &ServerSpec,
        secrets: &SecretMap,
        networks: &[String],
    ) -> Result<LaunchPlan>;
}

/// `docker`-CLI-backed runtime.
pub struct DockerCli {
    binary: PathBuf,
    in_container: bool,
}

impl DockerCli {
    /// Resolve the docker binary from PATH.
    pub fn new(in_container: bool) -> Result<Self> {
        let binary = which::which("docker")
            .or_else(|_| which::which("docker.exe"))
            .context("docker not found in PATH. Ensure Docker is installed and running.")?;
        debug!(binary = %binary.display(), "[Runtime] Resolved container runtime");
        Ok(Self {
            binary,
            in_container,
        })
    }

    async fn run_docker(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run docker {}", args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "docker {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn pull(&self, image: &str) -> Result<()> {
        info!(image = %image, "[Runtime] Pulling image");
        self.run_docker(&["pull", "--quiet", image]).await?;
        Ok(())
    }

    async fn verify(&self, image: &str) -> Result<()> {
        self.run_docker(&["trust", "inspect", image])
            .await
            .with_context(|| format!("signature verification failed for {image}"))?;
        Ok(())
    }

    async fn gateway_networks(&self) -> Result<Vec<String>> {
        if !self.in_container {
            return Ok(vec![]);
        }
        // Inside a container the hostname is the container id.
        let hostname = std::env::var("HOSTNAME").unwrap_or_default();
        if hostname.is_empty() {
            warn!("[Runtime] In-container mode but HOSTNAME is unset, skipping network join");
            return Ok(vec![]);
        }
        let raw = self
            .run_docker(&[
                "inspect",
                "--format",
                "{{json .NetworkSettings.Networks}}",
                &hostname,
            ])
            .await?;
        let networks: HashMap<String, serde_json::Value> =
            serde_json::from_str(raw.trim()).context("unexpected docker inspect output")?;
        Ok(networks.into_keys().collect())
    }

    fn launch_plan(
        &self,
        spec: &ServerSpec,
        secrets: &SecretMap,
        networks: &[String],
    ) -> Result<LaunchPlan> {
        let ServerRuntime::Container {
            image,
            command,
            env,
            cpus,
            memory,
            volumes,
            ..
        } = &spec.runtime
        else {
            bail!("server '{}' is not a container backend", spec.name);
        };

        let mut args = vec![
            "run".to_string(),
            "-i".to_string(),
            "--rm".to_string(),
            "--init".to_string(),
        ];
        if let Some(cpus) = cpus {
            args.push("--cpus".to_string());
            args.push(cpus.to_string());
        }
        if let Some(memory) = memory {
            args.push("--memory".to_string());
            args.push(memory.clone());
        }
        for volume in volumes {
            args.push("-v".to_string());
            args.push(volume.clone());
        }
        for network in networks {
            args.push("--network".to_string());
            args.push(network.clone());
        }

        // Plain (non-secret) environment goes inline
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }

        // Secrets are exported on the docker process and forwarded with
        // bare -e flags so values never appear in the argument list
        let mut child_env = HashMap::new();
        for secret in &spec.secrets {
            let value = secrets.get(&secret.name).ok_or_else(|| {
                anyhow::anyhow!("secret '{}' missing for server '{}'", secret.name, spec.name)
            })?;
            match (&secret.env, &secret.file) {
                (Some(var), _) => {
                    args.push("-e".to_string());
                    args.push(var.clone());
                    child_env.insert(var.clone(), value.clone());
                }
                (None, Some(path)) => {
                    let host_path = materialize_secret_file(&spec.name, &secret.name, value)?;
                    args.push("-v".to_string());
                    args.push(format!("{}:{}:ro", host_path.display(), path));
                }
                (None, None) => {
                    // Default materialization: env var named after the secret
                    let var = secret.name.to_ascii_uppercase();
                    args.push("-e".to_string());
                    args.push(var.clone());
                    child_env.insert(var, value.clone());
                }
            }
        }

        args.push(image.clone());
        args.extend(command.iter().cloned());

        Ok(LaunchPlan {
            command: self.binary.clone(),
            args,
            env: child_env,
        })
    }
}

/// Write a secret value to a private per-server file for volume mounting.
fn materialize_secret_file(server: &str, name: &str, value: &str) -> Result<PathBuf> {
    let dir = std::env::temp_dir().join("mcprelay-secrets");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{server}.{name}"));
    std::fs::write(&path, value)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(path)
}
