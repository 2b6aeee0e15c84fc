//! Built-in demo services: integer arithmetic, a scoped delete, and a
//! long-running discovery tool that reports progress and grows its own
//! registry while it runs.

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::registry::{ToolContext, ToolDescriptor, ToolRegistry};
use crate::{Error, Result};

/// Name of the tool `process_items` adds and later removes
pub const DYNAMIC_TOOL: &str = "dynamic_tool_on_the_fly";

/// Scope `delete_item` demands
pub const DELETE_SCOPE: &str = "admin:delete";

const ITEM_DELAY: Duration = Duration::from_millis(500);
const SETTLE_DELAY: Duration = Duration::from_secs(1);
const DYNAMIC_TOOL_LIFETIME: Duration = Duration::from_secs(3);

/// Which built-in service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// `add(a, b)`
    Add,
    /// `subtract(a, b)`
    Subtract,
    /// `delete_item(item_id)`, needs `admin:delete`
    Deleter,
    /// `process_items(items)`
    Discovery,
}

impl ServiceKind {
    /// Every built-in service
    pub const ALL: [Self; 4] = [Self::Add, Self::Subtract, Self::Deleter, Self::Discovery];

    /// Config / CLI name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Subtract => "subtract",
            Self::Deleter => "deleter",
            Self::Discovery => "discovery",
        }
    }

    /// Build a fresh registry holding this service's tools
    pub fn build(self) -> Result<Arc<ToolRegistry>> {
        match self {
            Self::Add => arithmetic("AddServer", "add", "Add two integers", i64::checked_add),
            Self::Subtract => arithmetic(
                "SubtractServer",
                "subtract",
                "Subtract two integers",
                i64::checked_sub,
            ),
            Self::Deleter => deleter(),
            Self::Discovery => discovery(),
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServiceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::Config(format!("unknown service '{s}'")))
    }
}

fn int_arg(args: &Map<String, Value>, name: &str) -> anyhow::Result<i64> {
    args.get(name)
        .and_then(Value::as_i64)
        .with_context(|| format!("'{name}' must be an integer"))
}

fn arithmetic(
    service: &str,
    tool: &'static str,
    description: &str,
    op: fn(i64, i64) -> Option<i64>,
) -> Result<Arc<ToolRegistry>> {
    let registry = ToolRegistry::new(service);
    registry.register(
        ToolDescriptor::new(tool, description)
            .param("a", "integer", true)
            .param("b", "integer", true),
        move |args: Map<String, Value>, _ctx: ToolContext| async move {
            let a = int_arg(&args, "a")?;
            let b = int_arg(&args, "b")?;
            let result = op(a, b).with_context(|| format!("{tool}({a}, {b}) overflows"))?;
            tracing::debug!(tool, a, b, result, "Arithmetic tool");
            Ok::<_, anyhow::Error>(json!(result))
        },
    )?;
    Ok(Arc::new(registry))
}

fn deleter() -> Result<Arc<ToolRegistry>> {
    let registry = ToolRegistry::new("DeleteServer");
    registry.register(
        ToolDescriptor::new("delete_item", "Delete an item by id")
            .param("item_id", "string", true)
            .scope(DELETE_SCOPE),
        |args: Map<String, Value>, _ctx: ToolContext| async move {
            let id = args
                .get("item_id")
                .and_then(Value::as_str)
                .context("'item_id' must be a string")?;
            tracing::info!(item_id = %id, "Deleting item");
            Ok::<_, anyhow::Error>(json!(format!("Item {id} deleted")))
        },
    )?;
    Ok(Arc::new(registry))
}

fn discovery() -> Result<Arc<ToolRegistry>> {
    let registry = Arc::new(ToolRegistry::new("ProgressDemoServer"));
    let handle = Arc::downgrade(&registry);
    registry.register(
        ToolDescriptor::new(
            "process_items",
            "Process a list of items with progress reporting and a temporary extra tool",
        )
        .param_schema(
            "items",
            json!({"type": "array", "items": {"type": "string"}}),
            true,
        ),
        move |args: Map<String, Value>, ctx: ToolContext| {
            let handle = handle.clone();
            async move { process_items(&args, &ctx, &handle).await }
        },
    )?;
    Ok(registry)
}

async fn process_items(
    args: &Map<String, Value>,
    ctx: &ToolContext,
    registry: &Weak<ToolRegistry>,
) -> anyhow::Result<Value> {
    let items: Vec<String> = serde_json::from_value(
        args.get("items").cloned().unwrap_or_else(|| json!([])),
    )
    .context("'items' must be a list of strings")?;
    let total = items.len();

    ctx.info(format!("Starting to process {total} items."));
    let mut results = Vec::with_capacity(total);
    for (i, item) in items.iter().enumerate() {
        let n = i + 1;
        ctx.info(format!("Processing item {n}/{total}: {item}"));
        ctx.progress(n as u64, Some(total as u64));
        ctx.sleep(ITEM_DELAY).await?;
        results.push(item.to_uppercase());
    }
    ctx.info("Item processing complete.");
    ctx.sleep(SETTLE_DELAY).await?;

    let registry = registry
        .upgrade()
        .context("service registry was dropped mid-call")?;

    ctx.info(format!("Adding dynamic tool '{DYNAMIC_TOOL}'"));
    registry.register(
        ToolDescriptor::new(DYNAMIC_TOOL, "A tool added while process_items runs")
            .param("text", "string", true),
        |args: Map<String, Value>, _ctx: ToolContext| async move {
            let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
            Ok::<_, anyhow::Error>(json!(format!(
                "Dynamic tool processed: {}",
                text.to_uppercase()
            )))
        },
    )?;

    let waited = ctx.sleep(DYNAMIC_TOOL_LIFETIME).await;

    ctx.info(format!("Removing dynamic tool '{DYNAMIC_TOOL}'"));
    match registry.remove(DYNAMIC_TOOL) {
        Ok(()) => ctx.info(format!("Dynamic tool '{DYNAMIC_TOOL}' removed.")),
        Err(e) => ctx.error(format!("Could not remove '{DYNAMIC_TOOL}': {e}")),
    }
    waited?;

    Ok(json!(results))
}
