//! Capability reconciliation
//!
//! Brings the exposed capability set into agreement with the union of the
//! backends' current listings. Passes are serialized; collision tie-breaks
//! follow snapshot order; a failed listing for one kind retains that kind's
//! prior registrations for that backend.

mod table;

pub use table::{Registration, RegistrationTable};

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use mcprelay_core::{
    CapabilityKind, DomainEvent, EventSender, ServerSpec, SharedConfiguration, ToolNamePolicy,
};
use tracing::{debug, info, warn};

use crate::pool::ClientPool;

/// One capability touched by a reconcile pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangedCapability {
    pub exposed_name: String,
    pub kind: CapabilityKind,
}

/// Net change of one reconcile pass.
#[derive(Debug, Default, Clone)]
pub struct CapabilityDiff {
    pub added: Vec<ChangedCapability>,
    pub removed: Vec<ChangedCapability>,
}

impl CapabilityDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Capability kinds touched by this diff.
    pub fn kinds(&self) -> Vec<CapabilityKind> {
        let mut kinds = Vec::new();
        for change in self.added.iter().chain(self.removed.iter()) {
            if !kinds.contains(&change.kind) {
                kinds.push(change.kind);
            }
        }
        kinds
    }
}

/// Listings obtained from one backend. `None` means the listing failed and
/// prior registrations of that kind must be retained.
#[derive(Debug, Default)]
struct ServerListings {
    tools: Option<Vec<(String, serde_json::Value)>>,
    prompts: Option<Vec<(String, serde_json::Value)>>,
    resources: Option<Vec<(String, serde_json::Value)>>,
    resource_templates: Option<Vec<(String, serde_json::Value)>>,
}

impl ServerListings {
    fn get(&self, kind: CapabilityKind) -> &Option<Vec<(String, serde_json::Value)>> {
        match kind {
            CapabilityKind::Tools => &self.tools,
            CapabilityKind::Prompts => &self.prompts,
            CapabilityKind::Resources => &self.resources,
            CapabilityKind::ResourceTemplates => &self.resource_templates,
        }
    }
}

/// Computes and applies capability diffs against the registration table.
pub struct Reconciler {
    table: Arc<RegistrationTable>,
    pool: Arc<ClientPool>,
    events: EventSender,
    /// Serializes passes; list/register/notify never interleave.
    pass_lock: tokio::sync::Mutex<()>,
}

impl Reconciler {
    pub fn new(table: Arc<RegistrationTable>, pool: Arc<ClientPool>, events: EventSender) -> Self {
        Self {
            table,
            pool,
            events,
            pass_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn table(&self) -> Arc<RegistrationTable> {
        Arc::clone(&self.table)
    }

    /// Run one reconcile pass.
    ///
    /// With `only_server` set, only that backend's listings are reconsidered
    /// and existing tie-breaks for other backends stand.
    pub async fn reconcile(
        &self,
        snapshot: &SharedConfiguration,
        only_server: Option<&str>,
    ) -> Result<CapabilityDiff> {
        let _pass = self.pass_lock.lock().await;

        let previous = self.table.snapshot();
        let mut desired: HashMap<String, Registration> = match only_server {
            // Single-server mode starts from the current table minus the
            // target server; everything else is untouched.
            Some(server) => previous
                .iter()
                .filter(|(_, reg)| reg.server != server)
                .map(|(name, reg)| (name.clone(), reg.clone()))
                .collect(),
            None => HashMap::new(),
        };

        let servers: Vec<&String> = snapshot
            .server_names()
            .iter()
            .filter(|name| only_server.map_or(true, |s| s == name.as_str()))
            .collect();

        for name in servers {
            let Some((spec, _)) = snapshot.find(name) else {
                continue;
            };
            let listings = self.list_server(spec).await;
            self.merge_server(&previous, &mut desired, spec, &listings, snapshot);
        }

        // Symmetric difference against the previous table
        let mut added = Vec::new();
        let mut added_pairs = Vec::new();
        for (name, reg) in &desired {
            if previous.get(name) != Some(reg) {
                added.push(ChangedCapability {
                    exposed_name: name.clone(),
                    kind: reg.kind,
                });
                added_pairs.push((name.clone(), reg.clone()));
            }
        }
        let removed: Vec<ChangedCapability> = previous
            .iter()
            .filter(|(name, _)| !desired.contains_key(*name))
            .map(|(name, reg)| ChangedCapability {
                exposed_name: name.clone(),
                kind: reg.kind,
            })
            .collect();

        let diff = CapabilityDiff { added, removed };
        if diff.is_empty() {
            debug!("[Reconcile] No capability changes");
            return Ok(diff);
        }

        // Additions first, then removals
        let removed_names: Vec<String> = diff
            .removed
            .iter()
            .map(|c| c.exposed_name.clone())
            .collect();
        self.table.apply(&added_pairs, &removed_names);
        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            total = self.table.len(),
            "[Reconcile] Applied capability diff"
        );

        self.emit_changes(&diff, &previous);
        Ok(diff)
    }

    /// Remove every registration for a backend (configuration removal or
    /// OAuth logout).
    pub async fn remove_server(&self, server: &str) -> CapabilityDiff {
        let _pass = self.pass_lock.lock().await;
        let previous = self.table.snapshot();
        let removed = self
            .table
            .remove_server(server)
            .into_iter()
            .map(|(exposed_name, kind)| ChangedCapability { exposed_name, kind })
            .collect();
        let diff = CapabilityDiff {
            added: vec![],
            removed,
        };
        if !diff.is_empty() {
            info!(server = %server, removed = diff.removed.len(), "[Reconcile] Backend registrations removed");
            self.emit_changes(&diff, &previous);
        }
        diff
    }

    fn emit_changes(&self, diff: &CapabilityDiff, previous: &HashMap<String, Registration>) {
        // One event per affected backend keeps single-server reloads cheap
        let mut by_server: HashMap<String, (Vec<CapabilityKind>, usize, usize)> = HashMap::new();
        for change in &diff.added {
            // Server attribution comes from the new table
            if let Some(reg) = self.table.lookup(&change.exposed_name) {
                let entry = by_server.entry(reg.server).or_default();
                if !entry.0.contains(&change.kind) {
                    entry.0.push(change.kind);
                }
                entry.1 += 1;
            }
        }
        for change in &diff.removed {
            let Some(reg) = previous.get(&change.exposed_name) else {
                continue;
            };
            let entry = by_server.entry(reg.server.clone()).or_default();
            if !entry.0.contains(&change.kind) {
                entry.0.push(change.kind);
            }
            entry.2 += 1;
        }
        for (server, (kinds, added, removed)) in by_server {
            self.events.emit(DomainEvent::CapabilitiesChanged {
                server,
                kinds,
                added,
                removed,
            });
        }
    }

    /// List every declared kind from one backend through the pool.
    async fn list_server(&self, spec: &ServerSpec) -> ServerListings {
        let handle = match self.pool.get(&spec.name).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(server = %spec.name, error = %e, "[Reconcile] Backend unavailable, retaining registrations");
                return ServerListings::default();
            }
        };
        let Some(peer) = handle.peer().await else {
            self.pool.release(&handle);
            return ServerListings::default();
        };

        let mut listings = ServerListings::default();

        if spec.capabilities.tools {
            listings.tools = match peer.list_all_tools().await {
                Ok(tools) => Some(
                    tools
                        .into_iter()
                        .filter_map(|t| identity_and_value(t, "name"))
                        .filter(|(name, _)| {
                            let allowed = spec.tool_allowed(name);
                            if !allowed {
                                debug!(server = %spec.name, tool = %name, "[Reconcile] Tool filtered by allow-list");
                            }
                            allowed
                        })
                        .collect(),
                ),
                Err(e) => {
                    warn!(server = %spec.name, error = %e, "[Reconcile] tools/list failed, retaining prior");
                    None
                }
            };
        } else {
            listings.tools = Some(vec![]);
        }

        if spec.capabilities.prompts {
            listings.prompts = match peer.list_all_prompts().await {
                Ok(prompts) => Some(
                    prompts
                        .into_iter()
                        .filter_map(|p| identity_and_value(p, "name"))
                        .collect(),
                ),
                Err(e) => {
                    warn!(server = %spec.name, error = %e, "[Reconcile] prompts/list failed, retaining prior");
                    None
                }
            };
        } else {
            listings.prompts = Some(vec![]);
        }

        if spec.capabilities.resources {
            listings.resources = match peer.list_all_resources().await {
                Ok(resources) => Some(
                    resources
                        .into_iter()
                        .filter_map(|r| identity_and_value(r, "uri"))
                        .collect(),
                ),
                Err(e) => {
                    warn!(server = %spec.name, error = %e, "[Reconcile] resources/list failed, retaining prior");
                    None
                }
            };
        } else {
            listings.resources = Some(vec![]);
        }

        if spec.capabilities.resource_templates {
            listings.resource_templates = match peer.list_all_resource_templates().await {
                Ok(templates) => Some(
                    templates
                        .into_iter()
                        .filter_map(|t| identity_and_value(t, "uriTemplate"))
                        .collect(),
                ),
                Err(e) => {
                    warn!(server = %spec.name, error = %e, "[Reconcile] resources/templates/list failed, retaining prior");
                    None
                }
            };
        } else {
            listings.resource_templates = Some(vec![]);
        }

        self.pool.release(&handle);
        listings
    }

    /// Merge one backend's listings into the desired table, applying the
    /// exposed-name policy and collision tie-breaks.
    ///
    /// Exposed names are unique across the whole mapping: a capability of
    /// any kind collides with any earlier registration under the same name.
    fn merge_server(
        &self,
        previous: &HashMap<String, Registration>,
        desired: &mut HashMap<String, Registration>,
        spec: &ServerSpec,
        listings: &ServerListings,
        snapshot: &SharedConfiguration,
    ) {
        for kind in CapabilityKind::ALL {
            match listings.get(kind) {
                // Listing failed: the previous registrations of this kind
                // stay authoritative
                None => {
                    for (name, reg) in self.retained(previous, &spec.name, kind) {
                        desired.entry(name).or_insert(reg);
                    }
                }
                Some(items) => {
                    for (upstream_name, value) in items {
                        let exposed = exposed_name(kind, spec, upstream_name, snapshot);
                        if let Some(existing) = desired.get(&exposed) {
                            if existing.server != spec.name || existing.kind != kind {
                                warn!(
                                    name = %exposed,
                                    kept = %existing.server,
                                    kept_kind = %existing.kind,
                                    dropped = %spec.name,
                                    dropped_kind = %kind,
                                    "[Reconcile] Capability name collision, earlier registration wins"
                                );
                                continue;
                            }
                        }
                        let mut descriptor = value.clone();
                        if matches!(kind, CapabilityKind::Tools | CapabilityKind::Prompts) {
                            if let Some(obj) = descriptor.as_object_mut() {
                                obj.insert(
                                    "name".to_string(),
                                    serde_json::Value::String(exposed.clone()),
                                );
                            }
                        }
                        desired.insert(
                            exposed,
                            Registration {
                                server: spec.name.clone(),
                                kind,
                                upstream_name: upstream_name.clone(),
                                descriptor,
                            },
                        );
                    }
                }
            }
        }
    }

    fn retained(
        &self,
        previous: &HashMap<String, Registration>,
        server: &str,
        kind: CapabilityKind,
    ) -> Vec<(String, Registration)> {
        previous
            .iter()
            .filter(|(_, reg)| reg.kind == kind && reg.server == server)
            .map(|(name, reg)| (name.clone(), reg.clone()))
            .collect()
    }
}

/// Client-visible name for a capability.
fn exposed_name(
    kind: CapabilityKind,
    spec: &ServerSpec,
    upstream_name: &str,
    snapshot: &SharedConfiguration,
) -> String {
    match (kind, snapshot.options().tool_names) {
        (CapabilityKind::Tools, ToolNamePolicy::ServerPrefix) => {
            format!("{}_{}", spec.name, upstream_name)
        }
        _ => upstream_name.to_string(),
    }
}

/// Serialize a listed item and pull its identity field out of the JSON.
fn identity_and_value<T: serde::Serialize>(
    item: T,
    field: &str,
) -> Option<(String, serde_json::Value)> {
    let value = serde_json::to_value(item).ok()?;
    let identity = value.get(field)?.as_str()?.to_string();
    Some((identity, value))
}
