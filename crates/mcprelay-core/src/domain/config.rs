//! Configuration snapshots
//!
//! A `Configuration` is the immutable result of one configuration read:
//! enabled servers in stable order, their specs, the resolved secret values,
//! and global options. The runtime replaces the current snapshot atomically;
//! a failed reload keeps the previous one.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::server::ServerSpec;

/// Resolved secret values for one server, keyed by secret name.
pub type SecretMap = HashMap<String, String>;

/// How exposed tool names are derived from upstream tool names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolNamePolicy {
    /// Exposed name equals the upstream name; collisions resolved by
    /// snapshot order.
    #[default]
    Upstream,
    /// Exposed name is `{server}_{upstream}`.
    ServerPrefix,
}

/// Global gateway options carried by every snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalOptions {
    pub tool_names: ToolNamePolicy,
    /// OAuth orchestration (refresh loops + event monitor) enabled.
    pub oauth_enabled: bool,
    /// Skip image pull and signature verification at startup.
    pub static_mode: bool,
    /// Verify image signatures when pulling.
    pub verify_signatures: bool,
}

/// An immutable configuration snapshot.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    order: Vec<String>,
    servers: HashMap<String, ServerSpec>,
    secrets: HashMap<String, SecretMap>,
    options: GlobalOptions,
    /// Returned by `find` for servers without secrets.
    empty_secrets: SecretMap,
}

impl Configuration {
    /// Assemble a snapshot. Specs are indexed by name; `order` preserves the
    /// enabled-server order used for collision tie-breaking.
    pub fn new(specs: Vec<ServerSpec>, secrets: HashMap<String, SecretMap>, options: GlobalOptions) -> Self {
        let order: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();
        let servers = specs.into_iter().map(|s| (s.name.clone(), s)).collect();
        Self {
            order,
            servers,
            secrets,
            options,
            empty_secrets: SecretMap::new(),
        }
    }

    /// Enabled server names in stable configuration order.
    pub fn server_names(&self) -> &[String] {
        &self.order
    }

    /// Look up a server spec and its resolved secrets.
    pub fn find(&self, name: &str) -> Option<(&ServerSpec, &SecretMap)> {
        let spec = self.servers.get(name)?;
        let secrets = self.secrets.get(name).unwrap_or(&self.empty_secrets);
        Some((spec, secrets))
    }

    pub fn options(&self) -> &GlobalOptions {
        &self.options
    }

    /// Snapshot-order index of a server, used for collision tie-breaking.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.order.iter().position(|n| n == name)
    }

    /// Every literal secret value in the snapshot. Consumed by the
    /// secret-blocking interceptor; never logged.
    pub fn secret_values(&self) -> Vec<&str> {
        self.secrets
            .values()
            .flat_map(|m| m.values().map(String::as_str))
            .collect()
    }

    /// Servers bound to an OAuth provider, in snapshot order.
    pub fn oauth_servers(&self) -> Vec<&ServerSpec> {
        self.order
            .iter()
            .filter_map(|n| self.servers.get(n))
            .filter(|s| s.requires_oauth())
            .collect()
    }
}

/// Shared snapshot handle; replaced atomically on reload.
pub type SharedConfiguration = Arc<Configuration>;
