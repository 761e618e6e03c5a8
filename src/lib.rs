//! Financial Agent Router
//!
//! Routing-and-resilience core of a multi-agent financial analysis system:
//! - Routes each request to exactly one specialist agent
//! - Runs agent turns against a model provider and allow-listed tool servers
//! - Retries transient upstream failures with bounded backoff
//! - Keeps sessions inside the model's context window by summarizing
//! - Parks turns that need human input until the answer arrives
//!
//! SUBMIT → ROUTE → COMPACT → MODEL ⇄ TOOLS / ELICIT → ANSWER

pub mod agent;
pub mod agents;
pub mod api;
pub mod audit;
pub mod classifier;
pub mod config;
pub mod error;
pub mod execution;
pub mod memory;
pub mod models;
pub mod provider;
pub mod retry;
pub mod router;
pub mod state;
pub mod tools;

pub use error::{OrchestrationError, Result};

// Re-export common types
pub use agent::Orchestrator;
pub use agents::{AgentDefinition, AgentSet};
pub use models::*;
pub use router::{RouteReason, Router, RouterState, RoutingDecision};
