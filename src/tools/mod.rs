//! Tool servers and the capability registry
//!
//! A tool server exposes a set of capabilities; the registry maps each
//! capability id to its declaration and owning server. Agents reference
//! capabilities by id through their allow-list.

use crate::agents::AgentDefinition;
use crate::models::{ToolDeclaration, UpstreamFailure};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

pub mod catalog;
pub mod http;
pub mod scripted;
pub mod static_data;

pub use http::HttpToolServer;
pub use scripted::ScriptedToolServer;
pub use static_data::StaticToolServer;

/// Capability the model calls to ask the human for input
pub const HUMAN_INPUT_CAPABILITY: &str = "request_human_input";

pub fn human_input_declaration() -> ToolDeclaration {
    ToolDeclaration {
        name: HUMAN_INPUT_CAPABILITY.to_string(),
        description: "Ask the user for confirmation or missing information before continuing"
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "prompt": { "type": "string", "description": "Question shown to the user" }
            },
            "required": ["prompt"]
        }),
    }
}

/// An external tool server
///
/// Retries are issued by the caller; idempotency of `invoke` is the
/// server's responsibility.
#[async_trait::async_trait]
pub trait ToolServer: Send + Sync {
    fn id(&self) -> &str;

    async fn invoke(&self, capability: &str, arguments: &Value)
        -> Result<Value, UpstreamFailure>;

    /// Liveness signal; a dead server is reported as `Unavailable`
    async fn is_available(&self) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct CapabilityEntry {
    pub declaration: ToolDeclaration,
    pub server: Arc<dyn ToolServer>,
}

/// Capability id → declaration + owning server. Read-only once built.
pub struct CapabilityRegistry {
    capabilities: HashMap<String, CapabilityEntry>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            capabilities: HashMap::new(),
        }
    }

    /// Register a server together with the capabilities it exposes
    pub fn register(&mut self, server: Arc<dyn ToolServer>, declarations: Vec<ToolDeclaration>) {
        for declaration in declarations {
            if let Some(previous) = self.capabilities.get(&declaration.name) {
                warn!(
                    capability = %declaration.name,
                    previous_server = %previous.server.id(),
                    server = %server.id(),
                    "Capability registered twice, replacing"
                );
            }

            self.capabilities.insert(
                declaration.name.clone(),
                CapabilityEntry {
                    declaration,
                    server: server.clone(),
                },
            );
        }
    }

    /// Register a server with every capability the catalog lists for its id
    pub fn register_catalog_server(&mut self, server: Arc<dyn ToolServer>) {
        let declarations = catalog::server_capabilities(server.id());
        self.register(server, declarations);
    }

    pub fn get(&self, capability: &str) -> Option<&CapabilityEntry> {
        self.capabilities.get(capability)
    }

    pub fn contains(&self, capability: &str) -> bool {
        self.capabilities.contains_key(capability)
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.capabilities.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Declarations for an agent, in allow-list order. Capabilities with no
    /// registered server are skipped.
    pub fn declarations_for(&self, agent: &AgentDefinition) -> Vec<ToolDeclaration> {
        let mut declarations: Vec<ToolDeclaration> = agent
            .capabilities
            .iter()
            .filter_map(|id| self.capabilities.get(id))
            .map(|entry| entry.declaration.clone())
            .collect();

        if agent.human_input {
            declarations.push(human_input_declaration());
        }

        declarations
    }

    /// Allow-listed capabilities that no registered server provides
    pub fn missing_for(&self, agent: &AgentDefinition) -> Vec<String> {
        agent
            .capabilities
            .iter()
            .filter(|id| !self.capabilities.contains_key(*id))
            .cloned()
            .collect()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry with one HTTP server per catalog server whose base URL is set
/// (`TOOL_SERVER_<ID>_URL`), falling back to static demo data otherwise.
pub fn create_default_registry() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();

    for server_id in catalog::known_servers() {
        match HttpToolServer::from_env(server_id) {
            Some(server) => registry.register_catalog_server(Arc::new(server)),
            None => registry.register_catalog_server(Arc::new(StaticToolServer::new(server_id))),
        }
    }

    registry
}
