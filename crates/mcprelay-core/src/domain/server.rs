//! Backend server definitions
//!
//! A `ServerSpec` describes one configured upstream MCP server: how it is
//! launched or reached, which capability kinds it declares, which secrets it
//! needs, and whether it is bound to an OAuth provider.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The capability kinds an MCP server may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CapabilityKind {
    Tools,
    Prompts,
    Resources,
    ResourceTemplates,
}

impl CapabilityKind {
    /// All kinds, in listing order.
    pub const ALL: [CapabilityKind; 4] = [
        CapabilityKind::Tools,
        CapabilityKind::Prompts,
        CapabilityKind::Resources,
        CapabilityKind::ResourceTemplates,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::Tools => "tools",
            CapabilityKind::Prompts => "prompts",
            CapabilityKind::Resources => "resources",
            CapabilityKind::ResourceTemplates => "resourceTemplates",
        }
    }
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared capability kinds for a backend.
///
/// Listing is only attempted for declared kinds; everything else is skipped
/// without contacting the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CapabilitySet {
    pub tools: bool,
    pub prompts: bool,
    pub resources: bool,
    pub resource_templates: bool,
}

impl Default for CapabilitySet {
    fn default() -> Self {
        // Tools-only is the common case for registry entries that omit the block
        Self {
            tools: true,
            prompts: false,
            resources: false,
            resource_templates: false,
        }
    }
}

impl CapabilitySet {
    pub fn all() -> Self {
        Self {
            tools: true,
            prompts: true,
            resources: true,
            resource_templates: true,
        }
    }

    pub fn contains(&self, kind: CapabilityKind) -> bool {
        match kind {
            CapabilityKind::Tools => self.tools,
            CapabilityKind::Prompts => self.prompts,
            CapabilityKind::Resources => self.resources,
            CapabilityKind::ResourceTemplates => self.resource_templates,
        }
    }
}

/// How a secret value is materialized for a container backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Secret name, looked up in the snapshot's secret map for this server.
    pub name: String,
    /// Environment variable to export the value under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
    /// In-container file path to mount the value at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// How a backend is launched or reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerRuntime {
    /// A containerized server launched through the container runtime and
    /// spoken to over stdio.
    Container {
        /// Image reference (e.g. `mcp/github:latest`).
        image: String,
        /// Command override; empty means the image entrypoint.
        #[serde(default)]
        command: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        /// CPU limit passed to the runtime (`--cpus`).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cpus: Option<f64>,
        /// Memory limit passed to the runtime (`--memory`).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        memory: Option<String>,
        /// Volume mounts in `host:container` form.
        #[serde(default)]
        volumes: Vec<String>,
        /// Keep the container hot across idle periods instead of launching
        /// per demand.
        #[serde(default)]
        long_lived: bool,
    },
    /// A remote MCP endpoint reached over streamable HTTP.
    RemoteHttp {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl ServerRuntime {
    pub fn is_long_lived(&self) -> bool {
        matches!(self, ServerRuntime::Container { long_lived: true, .. })
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, ServerRuntime::RemoteHttp { .. })
    }
}

/// One configured upstream MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSpec {
    /// Stable lowercase identifier, unique within a snapshot.
    pub name: String,
    #[serde(flatten)]
    pub runtime: ServerRuntime,
    /// Capability kinds this server declares.
    #[serde(default)]
    pub capabilities: CapabilitySet,
    /// Secrets this server needs at launch.
    #[serde(default)]
    pub secrets: Vec<SecretRef>,
    /// OAuth provider this server is bound to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_provider: Option<String>,
    /// When present, only these tools are exposed from the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
}

impl ServerSpec {
    /// Validate the naming and shape rules a snapshot relies on.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("server name must not be empty".to_string());
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(format!(
                "server name '{}' must be lowercase [a-z0-9-_]",
                self.name
            ));
        }
        if let ServerRuntime::RemoteHttp { url, .. } = &self.runtime {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(format!("server '{}' has a non-http url: {}", self.name, url));
            }
        }
        Ok(())
    }

    /// Whether a tool survives this spec's allow-list.
    pub fn tool_allowed(&self, tool: &str) -> bool {
        match &self.allowed_tools {
            Some(allowed) => allowed.iter().any(|t| t == tool),
            None => true,
        }
    }

    pub fn requires_oauth(&self) -> bool {
        self.oauth_provider.is_some()
    }
}
