use super::error::{ToolError, ToolResult};
use super::traits::Tool;
use crate::mcp::ToolDescriptor;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Owner label used in logs for tools executed in-process
pub const BUILTIN_OWNER: &str = "builtin";

/// Make a tool name safe for function-calling schemas.
///
/// ASCII letters, digits and `_` are kept; everything else becomes `_`.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Where a registered tool executes
#[derive(Clone)]
pub enum ToolTarget {
    BuiltIn(Arc<dyn Tool>),
    Provider {
        provider: String,
        native_name: String,
    },
}

impl std::fmt::Debug for ToolTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolTarget::BuiltIn(tool) => f.debug_tuple("BuiltIn").field(&tool.name()).finish(),
            ToolTarget::Provider {
                provider,
                native_name,
            } => f
                .debug_struct("Provider")
                .field("provider", provider)
                .field("native_name", native_name)
                .finish(),
        }
    }
}

/// One model-facing tool
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// Descriptor as shown to the model (sanitized name)
    pub descriptor: ToolDescriptor,
    pub target: ToolTarget,
}

impl RegistryEntry {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn owner(&self) -> &str {
        match &self.target {
            ToolTarget::BuiltIn(_) => BUILTIN_OWNER,
            ToolTarget::Provider { provider, .. } => provider,
        }
    }

    /// Name the owner knows the tool by
    pub fn native_name(&self) -> String {
        match &self.target {
            ToolTarget::BuiltIn(tool) => tool.name(),
            ToolTarget::Provider { native_name, .. } => native_name.clone(),
        }
    }
}

#[derive(Default)]
struct Entries {
    order: Vec<String>,
    by_name: HashMap<String, RegistryEntry>,
}

/// Sanitized tool name -> owner mapping.
///
/// Built during startup, read-only afterwards. On a name collision the last
/// registration wins and the replacement is logged.
#[derive(Default)]
pub struct ToolRegistry {
    entries: RwLock<Entries>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-process tool under its (sanitized) name
    pub fn register_builtin(&self, tool: Arc<dyn Tool>) {
        let descriptor = ToolDescriptor::new(sanitize(&tool.name()), tool.description(), tool.parameters());
        self.insert(RegistryEntry {
            descriptor,
            target: ToolTarget::BuiltIn(tool),
        });
    }

    /// Register every tool a provider reported
    pub fn register_provider_tools(&self, provider: &str, tools: &[ToolDescriptor]) {
        for tool in tools {
            let mut descriptor = tool.clone();
            descriptor.name = sanitize(&tool.name);
            self.insert(RegistryEntry {
                descriptor,
                target: ToolTarget::Provider {
                    provider: provider.to_string(),
                    native_name: tool.name.clone(),
                },
            });
        }

        info!(target: "tool_registry", provider = %provider, count = tools.len(), "Registered provider tools");
    }

    fn insert(&self, entry: RegistryEntry) {
        let name = entry.name().to_string();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        match entries.by_name.get(&name) {
            Some(previous) => {
                warn!(
                    target: "tool_registry",
                    tool = %name,
                    previous_owner = %previous.owner(),
                    previous_native = %previous.native_name(),
                    new_owner = %entry.owner(),
                    new_native = %entry.native_name(),
                    "Tool name collision, last registration wins"
                );
            }
            None => {
                debug!(target: "tool_registry", tool = %name, owner = %entry.owner(), "Registering tool");
                entries.order.push(name.clone());
            }
        }

        entries.by_name.insert(name, entry);
    }

    /// Look up a sanitized name
    pub fn resolve(&self, name: &str) -> ToolResult<RegistryEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::NotFound(name.to_string()))
    }

    /// Model-facing descriptors in registration order
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .order
            .iter()
            .filter_map(|name| entries.by_name.get(name))
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
