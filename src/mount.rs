//! Service mount table: several registries and backends behind one name
//! space.
//!
//! Each mount owns a flat, one-level prefix. A qualified tool name is
//! `prefix + separator + local_name` (`add_add` with the default `_`
//! separator, `add.add` with `.`). Resolution splits on the first separator
//! and does a single hash lookup, which is only unambiguous because prefixes
//! may not contain the separator and may not overlap each other.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::info;

use crate::auth::AuthPolicy;
use crate::proxy::ProxyBackend;
use crate::registry::{RegistryEvent, ToolDescriptor, ToolRegistry};
use crate::{Error, Result};

/// Default separator between prefix and local tool name
pub const DEFAULT_SEPARATOR: &str = "_";

/// What a prefix points at
#[derive(Clone)]
pub enum MountTarget {
    /// In-process registry
    Local(Arc<ToolRegistry>),
    /// Remote backend reached through the proxy forwarder
    Remote(Arc<ProxyBackend>),
}

impl MountTarget {
    /// Tools this target advertises (unqualified)
    #[must_use]
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        match self {
            Self::Local(registry) => registry.list(),
            Self::Remote(backend) => backend.tools(),
        }
    }

    /// Descriptor of one local tool, if advertised
    #[must_use]
    pub fn descriptor(&self, local_name: &str) -> Option<ToolDescriptor> {
        match self {
            Self::Local(registry) => registry.descriptor(local_name),
            Self::Remote(backend) => backend.descriptor(local_name),
        }
    }

    /// Auth policy for calls into this target, read fresh on every call
    #[must_use]
    pub fn policy(&self) -> Option<Arc<AuthPolicy>> {
        match self {
            Self::Local(registry) => registry.policy(),
            Self::Remote(backend) => backend.policy(),
        }
    }

    /// Changes to this target's tool list
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        match self {
            Self::Local(registry) => registry.subscribe(),
            Self::Remote(backend) => backend.subscribe(),
        }
    }

    /// "local" or "remote"
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Remote(_) => "remote",
        }
    }
}

impl std::fmt::Debug for MountTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(r) => f.debug_tuple("Local").field(&r.name()).finish(),
            Self::Remote(b) => f.debug_tuple("Remote").field(&b.name()).finish(),
        }
    }
}

/// Result of resolving a qualified name
#[derive(Debug, Clone)]
pub struct Resolved {
    /// Matched prefix
    pub prefix: String,
    /// Name within the target
    pub local_name: String,
    /// The mounted target
    pub target: MountTarget,
}

/// Prefix → target table
pub struct MountTable {
    separator: String,
    mounts: RwLock<HashMap<String, MountTarget>>,
}

impl MountTable {
    /// Empty table using `separator`
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
            mounts: RwLock::new(HashMap::new()),
        }
    }

    /// Separator between prefix and local name
    #[must_use]
    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Qualified name for `local_name` under `prefix`
    #[must_use]
    pub fn qualify(&self, prefix: &str, local_name: &str) -> String {
        format!("{prefix}{}{local_name}", self.separator)
    }

    /// Attach `target` under `prefix`.
    ///
    /// A prefix conflicts with an existing one when it is equal to it, or
    /// when either is a prefix or suffix of the other.
    pub fn mount(&self, prefix: impl Into<String>, target: MountTarget) -> Result<()> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(Error::InvalidPrefix {
                prefix,
                reason: "prefix must not be empty".into(),
            });
        }
        if prefix.contains(self.separator.as_str()) {
            return Err(Error::InvalidPrefix {
                reason: format!("prefix must not contain the separator '{}'", self.separator),
                prefix,
            });
        }

        let mut mounts = self.mounts.write();
        if let Some(existing) = mounts.keys().find(|existing| overlaps(&prefix, existing)) {
            return Err(Error::PrefixConflict {
                prefix,
                existing: existing.clone(),
            });
        }
        info!(prefix = %prefix, target = ?target, "Mounted");
        mounts.insert(prefix, target);
        Ok(())
    }

    /// Detach a prefix, returning what was mounted there
    pub fn unmount(&self, prefix: &str) -> Result<MountTarget> {
        self.mounts
            .write()
            .remove(prefix)
            .ok_or_else(|| Error::UnresolvedPrefix(prefix.to_string()))
    }

    /// Target mounted at `prefix`
    #[must_use]
    pub fn get(&self, prefix: &str) -> Option<MountTarget> {
        self.mounts.read().get(prefix).cloned()
    }

    /// Mounted prefixes, sorted
    #[must_use]
    pub fn prefixes(&self) -> Vec<String> {
        let mut prefixes: Vec<_> = self.mounts.read().keys().cloned().collect();
        prefixes.sort();
        prefixes
    }

    /// Every mounted target
    #[must_use]
    pub fn targets(&self) -> Vec<(String, MountTarget)> {
        let mut all: Vec<_> = self
            .mounts
            .read()
            .iter()
            .map(|(p, t)| (p.clone(), t.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Split a qualified name and find its target
    pub fn resolve(&self, qualified: &str) -> Result<Resolved> {
        let (prefix, local_name) = qualified
            .split_once(self.separator.as_str())
            .ok_or_else(|| Error::UnresolvedPrefix(qualified.to_string()))?;
        let target = self
            .get(prefix)
            .ok_or_else(|| Error::UnresolvedPrefix(qualified.to_string()))?;
        Ok(Resolved {
            prefix: prefix.to_string(),
            local_name: local_name.to_string(),
            target,
        })
    }

    /// Every tool across every mount, qualified.
    ///
    /// The mount list is captured when this is called; each target's tools
    /// are read when iteration reaches it. Nothing is cached, so the next
    /// call sees registrations made in the meantime.
    pub fn list_all(&self) -> impl Iterator<Item = ToolDescriptor> + use<> {
        let separator = self.separator.clone();
        self.targets().into_iter().flat_map(move |(prefix, target)| {
            let separator = separator.clone();
            target.tools().into_iter().map(move |d| {
                let name = format!("{prefix}{separator}{}", d.name);
                d.renamed(name)
            })
        })
    }
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new(DEFAULT_SEPARATOR)
    }
}

impl std::fmt::Debug for MountTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountTable")
            .field("separator", &self.separator)
            .field("prefixes", &self.prefixes())
            .finish()
    }
}

fn overlaps(a: &str, b: &str) -> bool {
    a.starts_with(b) || b.starts_with(a) || a.ends_with(b) || b.ends_with(a)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::{Map, Value, json};

    use super::*;
    use crate::registry::ToolContext;

    async fn echo(args: Map<String, Value>, _ctx: ToolContext) -> anyhow::Result<Value> {
        Ok(Value::Object(args))
    }

    fn registry(name: &str, tools: &[&str]) -> Arc<ToolRegistry> {
        let r = ToolRegistry::new(name);
        for t in tools {
            r.register(
                ToolDescriptor::new(*t, "").with_schema(
                    json!({"type": "object", "additionalProperties": true}),
                ),
                echo,
            )
            .unwrap();
        }
        Arc::new(r)
    }

    #[test]
    fn resolve_splits_on_first_separator() {
        let table = MountTable::default();
        table
            .mount("deleter", MountTarget::Local(registry("d", &["delete_item"])))
            .unwrap();

        let resolved = table.resolve("deleter_delete_item").unwrap();
        assert_eq!(resolved.prefix, "deleter");
        assert_eq!(resolved.local_name, "delete_item");
    }

    #[test]
    fn unmounted_prefix_is_unresolved() {
        let table = MountTable::new(".");
        table
            .mount("add", MountTarget::Local(registry("a", &["add"])))
            .unwrap();

        assert!(matches!(
            table.resolve("mul.mul"),
            Err(Error::UnresolvedPrefix(_))
        ));
        assert!(matches!(
            table.resolve("noseparator"),
            Err(Error::UnresolvedPrefix(_))
        ));
    }

    #[test]
    fn overlapping_prefixes_conflict() {
        let table = MountTable::new(".");
        table
            .mount("add", MountTarget::Local(registry("a", &[])))
            .unwrap();

        for bad in ["add", "adder", "ad", "subadd", "dd"] {
            let err = table
                .mount(bad, MountTarget::Local(registry("x", &[])))
                .unwrap_err();
            assert!(
                matches!(err, Error::PrefixConflict { ref existing, .. } if existing == "add"),
                "{bad} should conflict"
            );
        }
        table
            .mount("subtract", MountTarget::Local(registry("s", &[])))
            .unwrap();
        assert_eq!(table.prefixes(), vec!["add", "subtract"]);
    }

    #[test]
    fn prefix_may_not_contain_separator() {
        let table = MountTable::new(".");
        let err = table
            .mount("a.b", MountTarget::Local(registry("x", &[])))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPrefix { .. }));
        assert!(matches!(
            table.mount("", MountTarget::Local(registry("x", &[]))),
            Err(Error::InvalidPrefix { .. })
        ));
    }

    #[test]
    fn list_all_is_exactly_the_renamed_tools() {
        let table = MountTable::new(".");
        let math = registry("math", &["add", "sub"]);
        table.mount("math", MountTarget::Local(math)).unwrap();

        let names: Vec<String> = table.list_all().map(|d| d.name).collect();
        assert_eq!(names, vec!["math.add", "math.sub"]);
    }

    #[test]
    fn list_all_reflects_later_registrations() {
        let table = MountTable::new(".");
        let reg = registry("r", &["a"]);
        table.mount("r", MountTarget::Local(Arc::clone(&reg))).unwrap();
        assert_eq!(table.list_all().count(), 1);

        reg.register(
            ToolDescriptor::new("dynamic_tool_on_the_fly", ""),
            echo,
        )
        .unwrap();
        let names: Vec<String> = table.list_all().map(|d| d.name).collect();
        assert_eq!(names, vec!["r.a", "r.dynamic_tool_on_the_fly"]);
    }

    #[test]
    fn unmount_frees_prefix() {
        let table = MountTable::default();
        table
            .mount("add", MountTarget::Local(registry("a", &[])))
            .unwrap();
        table.unmount("add").unwrap();
        assert!(table.unmount("add").is_err());
        table
            .mount("adder", MountTarget::Local(registry("a", &[])))
            .unwrap();
    }
}
