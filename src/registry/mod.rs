//! Tool registry: named tools, their schemas, and their handlers.
//!
//! A [`ToolRegistry`] is an ordinary value. Whoever builds it owns it and
//! passes it (as `Arc<ToolRegistry>`) to the mount table or server that
//! exposes it; there is no process-wide instance.
//!
//! Reads are copy-on-read: [`ToolRegistry::list`] hands out an immutable
//! snapshot, and writers install a fresh map instead of editing the shared
//! one, so an enumeration in progress never observes a half-applied change.

mod context;
pub mod schema;

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::{Map, Value, json};
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub use context::{NotificationSender, ToolContext};

use crate::auth::AuthPolicy;
use crate::protocol::Tool;
use crate::{Error, Result};

/// Capacity of the change-notification channel; slow subscribers lag, they
/// never block registration.
const EVENT_CAPACITY: usize = 64;

// ============================================================================
// Descriptor
// ============================================================================

/// Immutable description of a tool
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    /// Name, unique within its registry
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// JSON Schema of the arguments object
    pub input_schema: Value,
    /// Scopes a caller must hold, on top of the registry's policy
    pub required_scopes: BTreeSet<String>,
}

impl ToolDescriptor {
    /// Descriptor with an empty argument list
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: json!({"type": "object", "properties": {}}),
            required_scopes: BTreeSet::new(),
        }
    }

    /// Add a parameter of a plain JSON type (`"integer"`, `"string"`, ...)
    #[must_use]
    pub fn param(self, name: &str, ty: &str, required: bool) -> Self {
        self.param_schema(name, json!({"type": ty}), required)
    }

    /// Add a parameter with a full property schema
    #[must_use]
    pub fn param_schema(mut self, name: &str, schema: Value, required: bool) -> Self {
        if let Some(props) = self
            .input_schema
            .get_mut("properties")
            .and_then(Value::as_object_mut)
        {
            props.insert(name.to_string(), schema);
        }
        if required {
            if let Some(obj) = self.input_schema.as_object_mut() {
                let list = obj.entry("required").or_insert_with(|| json!([]));
                if let Some(list) = list.as_array_mut() {
                    list.push(json!(name));
                }
            }
        }
        self
    }

    /// Replace the whole input schema
    #[must_use]
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Require a scope for this tool
    #[must_use]
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.required_scopes.insert(scope.into());
        self
    }

    /// Copy of this descriptor under another name
    #[must_use]
    pub fn renamed(&self, name: String) -> Self {
        Self {
            name,
            ..self.clone()
        }
    }

    /// Wire form for `tools/list`
    #[must_use]
    pub fn to_tool(&self) -> Tool {
        Tool {
            name: self.name.clone(),
            title: None,
            description: (!self.description.is_empty()).then(|| self.description.clone()),
            input_schema: self.input_schema.clone(),
            annotations: None,
        }
    }

    /// Descriptor for a tool advertised by a remote backend
    #[must_use]
    pub fn from_tool(tool: &Tool) -> Self {
        Self {
            name: tool.name.clone(),
            description: tool.description.clone().unwrap_or_default(),
            input_schema: tool.input_schema.clone(),
            required_scopes: BTreeSet::new(),
        }
    }

    fn check(&self) -> Result<()> {
        let invalid = |message: String| Error::Validation {
            tool: self.name.clone(),
            message,
        };
        if self.name.is_empty() {
            return Err(invalid("tool name must not be empty".into()));
        }
        if self.name.chars().any(char::is_whitespace) {
            return Err(invalid("tool name must not contain whitespace".into()));
        }
        schema::check_schema(&self.input_schema).map_err(invalid)
    }
}

// ============================================================================
// Handler
// ============================================================================

/// Tool implementation
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run the tool with already-validated arguments
    async fn call(&self, args: Map<String, Value>, ctx: ToolContext) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(Map<String, Value>, ToolContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn call(&self, args: Map<String, Value>, ctx: ToolContext) -> anyhow::Result<Value> {
        self(args, ctx).await
    }
}

struct Entry {
    descriptor: ToolDescriptor,
    handler: Arc<dyn ToolHandler>,
}

// ============================================================================
// Registry
// ============================================================================

/// Change notification emitted after every successful mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A tool was registered
    Added(String),
    /// A tool was removed
    Removed(String),
}

type ToolMap = BTreeMap<String, Arc<Entry>>;

/// A service's tools
pub struct ToolRegistry {
    name: String,
    tools: RwLock<Arc<ToolMap>>,
    policy: RwLock<Option<Arc<AuthPolicy>>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl ToolRegistry {
    /// Empty registry
    pub fn new(name: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            name: name.into(),
            tools: RwLock::new(Arc::new(BTreeMap::new())),
            policy: RwLock::new(None),
            events,
        }
    }

    /// Service name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a tool.
    ///
    /// Fails with [`Error::DuplicateName`] when the name is taken and with
    /// [`Error::Validation`] when the descriptor is malformed; the registry
    /// is untouched in both cases.
    pub fn register(
        &self,
        descriptor: ToolDescriptor,
        handler: impl ToolHandler + 'static,
    ) -> Result<()> {
        self.register_arc(descriptor, Arc::new(handler))
    }

    /// [`register`](Self::register) with a shared handler
    pub fn register_arc(
        &self,
        descriptor: ToolDescriptor,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<()> {
        descriptor.check()?;
        let name = descriptor.name.clone();
        {
            let mut tools = self.tools.write();
            if tools.contains_key(&name) {
                return Err(Error::DuplicateName(name));
            }
            let mut next = ToolMap::clone(&tools);
            next.insert(
                name.clone(),
                Arc::new(Entry {
                    descriptor,
                    handler,
                }),
            );
            *tools = Arc::new(next);
        }
        debug!(registry = %self.name, tool = %name, "Tool registered");
        let _ = self.events.send(RegistryEvent::Added(name));
        Ok(())
    }

    /// Remove a tool; [`Error::NotFound`] if it is not registered
    pub fn remove(&self, name: &str) -> Result<()> {
        {
            let mut tools = self.tools.write();
            if !tools.contains_key(name) {
                return Err(Error::NotFound(name.to_string()));
            }
            let mut next = ToolMap::clone(&tools);
            next.remove(name);
            *tools = Arc::new(next);
        }
        debug!(registry = %self.name, tool = %name, "Tool removed");
        let _ = self.events.send(RegistryEvent::Removed(name.to_string()));
        Ok(())
    }

    /// Snapshot of every descriptor, sorted by name
    #[must_use]
    pub fn list(&self) -> Vec<ToolDescriptor> {
        let snapshot = Arc::clone(&self.tools.read());
        snapshot.values().map(|e| e.descriptor.clone()).collect()
    }

    /// Descriptor for one tool
    #[must_use]
    pub fn descriptor(&self, name: &str) -> Option<ToolDescriptor> {
        self.tools.read().get(name).map(|e| e.descriptor.clone())
    }

    /// Whether a tool is registered
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    /// Number of registered tools
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    /// Policy applied to calls into this registry
    #[must_use]
    pub fn policy(&self) -> Option<Arc<AuthPolicy>> {
        self.policy.read().clone()
    }

    /// Replace the policy; the next call sees the new one
    pub fn set_policy(&self, policy: Option<AuthPolicy>) {
        *self.policy.write() = policy.map(Arc::new);
    }

    /// Subscribe to change notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Invoke a tool.
    ///
    /// Arguments are validated (and losslessly coerced) against the tool's
    /// schema before the handler runs. A handler error or panic comes back
    /// as [`Error::ToolExecution`].
    pub async fn invoke(&self, name: &str, args: Value, mut ctx: ToolContext) -> Result<Value> {
        let entry = self
            .tools
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownTool(name.to_string()))?;

        let args = schema::validate(&args, &entry.descriptor.input_schema).map_err(|v| {
            Error::Validation {
                tool: name.to_string(),
                message: schema::describe(&v),
            }
        })?;

        ctx.rename(name);
        let call = AssertUnwindSafe(entry.handler.call(args, ctx)).catch_unwind();
        match call.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                debug!(registry = %self.name, tool = %name, error = %e, "Tool failed");
                Err(Error::tool_execution(name, e))
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                warn!(registry = %self.name, tool = %name, panic = %message, "Tool panicked");
                Err(Error::tool_execution(name, anyhow::anyhow!(message)))
            }
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("name", &self.name)
            .field("tools", &self.tools.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn add_descriptor() -> ToolDescriptor {
        ToolDescriptor::new("add", "Add two integers")
            .param("a", "integer", true)
            .param("b", "integer", true)
    }

    async fn add(args: Map<String, Value>, _ctx: ToolContext) -> anyhow::Result<Value> {
        let a = args["a"].as_i64().unwrap_or_default();
        let b = args["b"].as_i64().unwrap_or_default();
        Ok(json!(a + b))
    }

    fn registry() -> ToolRegistry {
        let r = ToolRegistry::new("math");
        r.register(add_descriptor(), add).unwrap();
        r
    }

    #[tokio::test]
    async fn invoke_runs_handler() {
        let r = registry();
        let out = r
            .invoke("add", json!({"a": 10, "b": 20}), ToolContext::detached("add"))
            .await
            .unwrap();
        assert_eq!(out, json!(30));
    }

    #[test]
    fn duplicate_registration_leaves_registry_unchanged() {
        let r = registry();
        let before = r.list();

        let err = r
            .register(ToolDescriptor::new("add", "another add"), add)
            .unwrap_err();

        assert!(matches!(err, Error::DuplicateName(ref n) if n == "add"));
        assert_eq!(r.list(), before);
    }

    #[test]
    fn removing_twice_fails_with_not_found() {
        let r = registry();
        r.remove("add").unwrap();
        let err = r.remove("add").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(r.is_empty());
    }

    #[tokio::test]
    async fn unknown_tool_and_bad_arguments() {
        let r = registry();
        let err = r
            .invoke("mul", json!({}), ToolContext::detached("mul"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTool(_)));

        let err = r
            .invoke("add", json!({"a": 1}), ToolContext::detached("add"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn handler_failure_is_wrapped() {
        let r = ToolRegistry::new("broken");
        r.register(
            ToolDescriptor::new("fail", "always fails"),
            |_args: Map<String, Value>, _ctx: ToolContext| async move {
                Err::<Value, _>(anyhow::anyhow!("disk on fire"))
            },
        )
        .unwrap();

        let err = r
            .invoke("fail", Value::Null, ToolContext::detached("fail"))
            .await
            .unwrap_err();
        match err {
            Error::ToolExecution { tool, source } => {
                assert_eq!(tool, "fail");
                assert_eq!(source.to_string(), "disk on fire");
            }
            other => panic!("expected ToolExecution, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handler_panic_is_contained() {
        let r = ToolRegistry::new("panicky");
        r.register(
            ToolDescriptor::new("boom", "panics"),
            |_args: Map<String, Value>, _ctx: ToolContext| async move {
                if true {
                    panic!("kaboom");
                }
                Ok::<_, anyhow::Error>(Value::Null)
            },
        )
        .unwrap();

        let err = r
            .invoke("boom", Value::Null, ToolContext::detached("boom"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("kaboom"));
    }

    #[test]
    fn mutations_emit_events() {
        let r = ToolRegistry::new("dyn");
        let mut rx = r.subscribe();

        r.register(ToolDescriptor::new("dynamic_tool_on_the_fly", "temp"), add)
            .unwrap();
        r.remove("dynamic_tool_on_the_fly").unwrap();
        let _ = r.remove("dynamic_tool_on_the_fly");

        assert_eq!(
            rx.try_recv().unwrap(),
            RegistryEvent::Added("dynamic_tool_on_the_fly".into())
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            RegistryEvent::Removed("dynamic_tool_on_the_fly".into())
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn snapshot_survives_concurrent_mutation() {
        let r = registry();
        r.register(ToolDescriptor::new("sub", "subtract"), add).unwrap();

        let snapshot = r.list();
        r.remove("sub").unwrap();
        r.register(ToolDescriptor::new("mul", "multiply"), add).unwrap();

        let names: Vec<_> = snapshot.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["add", "sub"]);
        let names: Vec<_> = r.list().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["add", "mul"]);
    }

    #[test]
    fn malformed_descriptor_is_rejected() {
        let r = ToolRegistry::new("x");
        let err = r
            .register(ToolDescriptor::new("has space", ""), add)
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        let err = r
            .register(
                ToolDescriptor::new("bad", "").with_schema(json!({"type": "string"})),
                add,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(r.is_empty());
    }

    #[test]
    fn descriptor_builder_keeps_parameter_order() {
        let d = ToolDescriptor::new("t", "")
            .param("zeta", "string", true)
            .param("alpha", "integer", false)
            .scope("read:t");
        let keys: Vec<_> = d.input_schema["properties"]
            .as_object()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        assert_eq!(keys, vec!["zeta", "alpha"]);
        assert_eq!(d.input_schema["required"], json!(["zeta"]));
        assert!(d.required_scopes.contains("read:t"));
    }
}
