//! The registration table
//!
//! Maps client-visible capability names to their backing upstreams. Shared
//! between concurrent request handlers (readers) and the reconciler (single
//! writer); readers observe either the pre- or post-pass view, never a torn
//! intermediate.
//!
//! Exposed names are unique across the whole mapping, regardless of
//! capability kind; collisions are resolved by the reconciler before
//! anything reaches the table.

use std::collections::HashMap;

use mcprelay_core::CapabilityKind;
use parking_lot::RwLock;

/// One registered capability.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub server: String,
    pub kind: CapabilityKind,
    /// Name to use when forwarding to the upstream.
    pub upstream_name: String,
    /// Raw descriptor as advertised upstream, with the exposed name already
    /// substituted for listing.
    pub descriptor: serde_json::Value,
}

/// Reader-writer table of exposed capabilities, keyed by exposed name.
#[derive(Default)]
pub struct RegistrationTable {
    inner: RwLock<HashMap<String, Registration>>,
}

impl RegistrationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve an exposed name for forwarding.
    pub fn lookup(&self, exposed_name: &str) -> Option<Registration> {
        self.inner.read().get(exposed_name).cloned()
    }

    /// Descriptors of one kind, for list responses. Order is unspecified.
    pub fn list(&self, kind: CapabilityKind) -> Vec<serde_json::Value> {
        self.inner
            .read()
            .values()
            .filter(|reg| reg.kind == kind)
            .map(|reg| reg.descriptor.clone())
            .collect()
    }

    /// Full copy of the table for diffing.
    pub fn snapshot(&self) -> HashMap<String, Registration> {
        self.inner.read().clone()
    }

    /// Apply a computed diff under one write lock: additions first, then
    /// removals.
    pub fn apply(&self, added: &[(String, Registration)], removed: &[String]) {
        let mut inner = self.inner.write();
        for (name, reg) in added {
            inner.insert(name.clone(), reg.clone());
        }
        for name in removed {
            inner.remove(name);
        }
    }

    /// Drop every registration for a backend; returns what was removed.
    pub fn remove_server(&self, server: &str) -> Vec<(String, CapabilityKind)> {
        let mut inner = self.inner.write();
        let removed: Vec<(String, CapabilityKind)> = inner
            .iter()
            .filter(|(_, reg)| reg.server == server)
            .map(|(name, reg)| (name.clone(), reg.kind))
            .collect();
        for (name, _) in &removed {
            inner.remove(name);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(server: &str, kind: CapabilityKind, name: &str) -> (String, Registration) {
        (
            name.to_string(),
            Registration {
                server: server.to_string(),
                kind,
                upstream_name: name.to_string(),
                descriptor: serde_json::json!({ "name": name }),
            },
        )
    }

    #[test]
    fn test_lookup_and_list() {
        let table = RegistrationTable::new();
        let (k1, r1) = reg("s1", CapabilityKind::Tools, "lookup");
        let (k2, r2) = reg("s1", CapabilityKind::Prompts, "greet");
        table.apply(&[(k1, r1), (k2, r2)], &[]);

        assert_eq!(table.len(), 2);
        assert_eq!(
            table.lookup("lookup").unwrap().kind,
            CapabilityKind::Tools
        );
        assert_eq!(table.list(CapabilityKind::Tools).len(), 1);
        assert_eq!(table.list(CapabilityKind::Prompts).len(), 1);
    }

    #[test]
    fn test_exposed_names_unique_across_kinds() {
        let table = RegistrationTable::new();
        let (k1, r1) = reg("s1", CapabilityKind::Tools, "notes");
        table.apply(&[(k1, r1)], &[]);

        // Same exposed name under another kind replaces: the map holds one
        // entry per name, whatever the kind
        let (k2, r2) = reg("s2", CapabilityKind::Resources, "notes");
        table.apply(&[(k2, r2)], &[]);

        assert_eq!(table.len(), 1);
        let registration = table.lookup("notes").unwrap();
        assert_eq!(registration.server, "s2");
        assert_eq!(registration.kind, CapabilityKind::Resources);
        assert!(table.list(CapabilityKind::Tools).is_empty());
    }

    #[test]
    fn test_remove_server() {
        let table = RegistrationTable::new();
        let (k1, r1) = reg("s1", CapabilityKind::Tools, "a");
        let (k2, r2) = reg("s2", CapabilityKind::Tools, "b");
        table.apply(&[(k1, r1), (k2, r2)], &[]);

        let removed = table.remove_server("s1");
        assert_eq!(removed, vec![("a".to_string(), CapabilityKind::Tools)]);
        assert_eq!(table.len(), 1);
        assert!(table.lookup("b").is_some());
    }

    #[test]
    fn test_apply_adds_before_removes() {
        let table = RegistrationTable::new();
        let (k1, r1) = reg("s1", CapabilityKind::Tools, "a");
        table.apply(&[(k1.clone(), r1)], &[]);

        // Replacing a registration in one pass: the add wins because the
        // remove only targets names absent from the new view
        let (k2, r2) = reg("s2", CapabilityKind::Tools, "b");
        table.apply(&[(k2, r2)], &[k1]);
        assert!(table.lookup("a").is_none());
        assert!(table.lookup("b").is_some());
    }
}
