//! Namespaced tool registry.
//!
//! A [`Registry`] is an immutable snapshot built from the live Cores. It is
//! replaced wholesale through [`SharedRegistry::store`]; readers hold an
//! `Arc` to whichever snapshot they loaded, so no reader ever sees a
//! half-built view.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::kernel::core_process::CoreProcess;

/// A tool as advertised by a Core.
///
/// Fields the Hub does not interpret (`annotations`, `outputSchema`, ...)
/// are kept in `extra` and passed through to clients unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Split `namespace.tool` at the first dot.
pub fn split_namespaced(full: &str) -> Option<(&str, &str)> {
    full.split_once('.')
}

/// Routing target for one namespaced tool.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub core: Arc<CoreProcess>,
    pub tool: ToolDescriptor,
}

impl RegistryEntry {
    /// Namespace of the owning Core.
    pub fn namespace(&self) -> &str {
        self.core.namespace()
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    entries: BTreeMap<String, RegistryEntry>,
    core_names: Vec<String>,
}

impl Registry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Project the tool lists of `cores` into a fresh snapshot.
    pub fn build<'a>(cores: impl IntoIterator<Item = &'a Arc<CoreProcess>>) -> Self {
        let mut entries = BTreeMap::new();
        let mut core_names = Vec::new();
        for core in cores {
            core_names.push(core.name().to_string());
            for tool in core.tools() {
                let key = format!("{}.{}", core.namespace(), tool.name);
                if entries.contains_key(&key) {
                    tracing::warn!(core = core.name(), tool = %key, "Duplicate registry key ignored");
                    continue;
                }
                entries.insert(
                    key,
                    RegistryEntry {
                        core: Arc::clone(core),
                        tool: tool.clone(),
                    },
                );
            }
        }
        Self {
            entries,
            core_names,
        }
    }

    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of the Cores this snapshot was built from.
    pub fn core_names(&self) -> &[String] {
        &self.core_names
    }

    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Every tool, renamed to its namespaced form.
    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.entries
            .iter()
            .map(|(name, entry)| ToolDescriptor {
                name: name.clone(),
                ..entry.tool.clone()
            })
            .collect()
    }
}

/// Atomically swappable registry snapshot.
#[derive(Debug, Default)]
pub struct SharedRegistry {
    current: RwLock<Arc<Registry>>,
}

impl SharedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> Arc<Registry> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    pub fn store(&self, registry: Registry) {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(registry);
    }
}
