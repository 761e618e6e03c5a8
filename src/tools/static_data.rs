//! Offline demo server returning canned payloads

use super::ToolServer;
use crate::models::{FailureKind, UpstreamFailure};
use serde_json::{json, Value};

/// Stand-in for a catalog server when no gateway is configured
pub struct StaticToolServer {
    id: String,
}

impl StaticToolServer {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

fn symbol_of(arguments: &Value) -> String {
    arguments
        .get("symbol")
        .and_then(Value::as_str)
        .unwrap_or("UNKNOWN")
        .to_uppercase()
}

#[async_trait::async_trait]
impl ToolServer for StaticToolServer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, capability: &str, arguments: &Value) -> Result<Value, UpstreamFailure> {
        let data = match capability {
            "get_connection_status" => json!({ "connected": true, "source": "static" }),
            "get_market_data" => json!({
                "symbol": symbol_of(arguments),
                "price": 150.50,
                "change": 2.5,
                "volume": 1000000,
            }),
            "get_historical_data" => json!({
                "symbol": symbol_of(arguments),
                "bars": [
                    { "date": "2024-01-02", "close": 148.1 },
                    { "date": "2024-01-03", "close": 150.5 }
                ],
            }),
            "get_positions" => json!({
                "positions": [
                    { "symbol": "AAPL", "quantity": 50 },
                    { "symbol": "MSFT", "quantity": 30 },
                    { "symbol": "GOOGL", "quantity": 20 }
                ]
            }),
            "get_account_summary" => json!({ "net_liquidation": 100000.0, "currency": "USD" }),
            "calculate_portfolio_metrics" => json!({
                "total_value": 100000.0,
                "diversification_score": 0.75,
                "risk_level": "medium",
            }),
            "get_open_orders" => json!({ "orders": [] }),
            "get_all_orders" => json!({ "all_orders": [], "total_orders": 0 }),
            "connect_to_ibkr" => json!({ "success": false, "message": "offline mode" }),
            "brave_web_search" | "duckduckgo_search" => json!({
                "query": arguments.get("query").cloned().unwrap_or(Value::Null),
                "results": [],
            }),
            "get_neo4j_schema" => json!({ "labels": ["Company", "Sector"], "relationships": ["BELONGS_TO"] }),
            "read_neo4j_cypher" => json!({ "rows": [] }),
            "run_python_code" => json!({ "stdout": "", "note": "static sandbox does not execute code" }),
            "simple_portfolio_optimization" => json!({ "weights": {} }),
            "monte_carlo_portfolio_simulation" => json!({ "scenarios": 0 }),
            "check_quantum_status" => json!({ "quantum_available": false }),
            other => {
                return Err(UpstreamFailure::new(
                    FailureKind::Fatal,
                    format!("{} is not available in offline mode ({})", other, self.id),
                ))
            }
        };

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_market_data_echoes_symbol() {
        let server = StaticToolServer::new("ibkr");
        let data = server
            .invoke("get_market_data", &json!({"symbol": "tsla"}))
            .await
            .unwrap();
        assert_eq!(data["symbol"], "TSLA");
    }

    #[tokio::test]
    async fn test_order_placement_is_refused_offline() {
        let server = StaticToolServer::new("ibkr");
        let err = server
            .invoke("place_order", &json!({"symbol": "TSLA", "action": "BUY", "quantity": 1}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, Some(FailureKind::Fatal));
    }
}
