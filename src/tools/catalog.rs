//! Capability catalog of the financial tool servers
//!
//! Declarations only; the servers themselves run out of process.

use crate::models::ToolDeclaration;
use serde_json::{json, Value};
use std::collections::HashMap;

pub const IBKR: &str = "ibkr";
pub const BRAVE_SEARCH: &str = "brave_search";
pub const DUCKDUCKGO: &str = "duckduckgo";
pub const NEO4J_CYPHER: &str = "neo4j-cypher";
pub const PYTHON_INTERPRETER: &str = "mcp-python-interpreter";
pub const QUANT_OPTIMIZATION: &str = "quant_optimization";

fn declaration(name: &str, description: &str, parameters: Value) -> ToolDeclaration {
    ToolDeclaration {
        name: name.to_string(),
        description: description.to_string(),
        parameters,
    }
}

fn no_parameters() -> Value {
    json!({ "type": "object", "properties": {} })
}

fn symbol_parameters() -> Value {
    json!({
        "type": "object",
        "properties": {
            "symbol": { "type": "string", "description": "Ticker symbol, e.g. TSLA" },
            "exchange": { "type": "string", "default": "SMART" },
            "sec_type": { "type": "string", "default": "STK" }
        },
        "required": ["symbol"]
    })
}

fn order_id_parameters() -> Value {
    json!({
        "type": "object",
        "properties": { "order_id": { "type": "integer" } },
        "required": ["order_id"]
    })
}

fn query_parameters() -> Value {
    json!({
        "type": "object",
        "properties": {
            "query": { "type": "string" },
            "count": { "type": "integer", "default": 10 }
        },
        "required": ["query"]
    })
}

lazy_static::lazy_static! {
    /// Server id → capabilities it exposes
    static ref SERVER_CATALOG: HashMap<&'static str, Vec<ToolDeclaration>> = {
        let mut catalog = HashMap::new();

        catalog.insert(IBKR, vec![
            declaration("get_connection_status", "Check the brokerage gateway connection", no_parameters()),
            declaration("get_account_summary", "Account balances and margin summary", no_parameters()),
            declaration("get_positions", "Current portfolio positions", no_parameters()),
            declaration("get_market_data", "Real-time market data for a symbol", symbol_parameters()),
            declaration(
                "get_historical_data",
                "Historical bars for a symbol",
                json!({
                    "type": "object",
                    "properties": {
                        "symbol": { "type": "string" },
                        "duration": { "type": "string", "default": "1 D" },
                        "bar_size": { "type": "string", "default": "1 min" },
                        "what_to_show": { "type": "string", "default": "TRADES" }
                    },
                    "required": ["symbol"]
                }),
            ),
            declaration(
                "place_order",
                "Place a trading order (BUY or SELL)",
                json!({
                    "type": "object",
                    "properties": {
                        "symbol": { "type": "string" },
                        "action": { "type": "string", "enum": ["BUY", "SELL"] },
                        "quantity": { "type": "integer" },
                        "order_type": { "type": "string", "default": "MKT" },
                        "limit_price": { "type": "number" }
                    },
                    "required": ["symbol", "action", "quantity"]
                }),
            ),
            declaration("cancel_order", "Cancel an open order", order_id_parameters()),
            declaration("get_order_status", "Status of a previously placed order", order_id_parameters()),
            declaration("get_open_orders", "All open orders", no_parameters()),
            declaration("get_all_orders", "All orders, completed and pending", no_parameters()),
            declaration("connect_to_ibkr", "Open the brokerage gateway connection", no_parameters()),
            declaration("calculate_portfolio_metrics", "Portfolio value, P&L and allocation metrics", no_parameters()),
        ]);

        catalog.insert(BRAVE_SEARCH, vec![
            declaration("brave_web_search", "Search the web for market news and research", query_parameters()),
        ]);

        catalog.insert(DUCKDUCKGO, vec![
            declaration("duckduckgo_search", "Web search via DuckDuckGo", query_parameters()),
        ]);

        catalog.insert(NEO4J_CYPHER, vec![
            declaration("get_neo4j_schema", "Describe labels and relationship types in the graph", no_parameters()),
            declaration(
                "read_neo4j_cypher",
                "Run a read-only Cypher query",
                json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string" },
                        "params": { "type": "object" }
                    },
                    "required": ["query"]
                }),
            ),
            declaration(
                "write_neo4j_cypher",
                "Run a Cypher write query",
                json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string" },
                        "params": { "type": "object" }
                    },
                    "required": ["query"]
                }),
            ),
        ]);

        catalog.insert(PYTHON_INTERPRETER, vec![
            declaration(
                "run_python_code",
                "Execute Python code in a sandbox and return stdout",
                json!({
                    "type": "object",
                    "properties": { "code": { "type": "string" } },
                    "required": ["code"]
                }),
            ),
        ]);

        catalog.insert(QUANT_OPTIMIZATION, vec![
            declaration("check_quantum_status", "Whether the quantum backend is available", no_parameters()),
            declaration(
                "quantum_random_numbers",
                "Random numbers sampled from a superposition circuit",
                json!({
                    "type": "object",
                    "properties": {
                        "num_bits": { "type": "integer", "default": 4 },
                        "num_samples": { "type": "integer", "default": 10 }
                    }
                }),
            ),
            declaration(
                "simple_portfolio_optimization",
                "Risk-adjusted weight optimization over a set of symbols",
                json!({
                    "type": "object",
                    "properties": {
                        "symbols": { "type": "array", "items": { "type": "string" } },
                        "expected_returns": { "type": "array", "items": { "type": "number" } },
                        "risk_weights": { "type": "array", "items": { "type": "number" } }
                    },
                    "required": ["symbols", "expected_returns"]
                }),
            ),
            declaration(
                "monte_carlo_portfolio_simulation",
                "Monte Carlo simulation of portfolio value",
                json!({
                    "type": "object",
                    "properties": {
                        "initial_value": { "type": "number" },
                        "num_scenarios": { "type": "integer", "default": 100 },
                        "time_horizon_days": { "type": "integer", "default": 30 }
                    },
                    "required": ["initial_value"]
                }),
            ),
        ]);

        catalog
    };
}

/// Declarations exposed by a known server (empty for unknown ids)
pub fn server_capabilities(server: &str) -> Vec<ToolDeclaration> {
    SERVER_CATALOG.get(server).cloned().unwrap_or_default()
}

/// Capability ids of several servers, in server order
pub fn capability_ids(servers: &[&str]) -> Vec<String> {
    servers
        .iter()
        .flat_map(|s| server_capabilities(s))
        .map(|d| d.name)
        .collect()
}

pub fn known_servers() -> Vec<&'static str> {
    let mut servers: Vec<&'static str> = SERVER_CATALOG.keys().copied().collect();
    servers.sort_unstable();
    servers
}
