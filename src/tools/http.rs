//! HTTP-backed tool server
//!
//! Talks to a tool-server gateway exposing
//! `POST {base}/tools/{capability}` and `GET {base}/health`.

use super::ToolServer;
use crate::models::UpstreamFailure;
use reqwest::Client;
use serde_json::Value;
use std::env;
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct HttpToolServer {
    id: String,
    client: Client,
    base_url: String,
}

impl HttpToolServer {
    pub fn new(id: impl Into<String>, base_url: &str) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            id: id.into(),
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Environment key holding the base URL of a server,
    /// e.g. `neo4j-cypher` → `TOOL_SERVER_NEO4J_CYPHER_URL`
    pub fn env_key(server_id: &str) -> String {
        let normalized: String = server_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("TOOL_SERVER_{}_URL", normalized)
    }

    pub fn from_env(server_id: &str) -> Option<Self> {
        let base_url = env::var(Self::env_key(server_id)).ok()?;
        Self::new(server_id, &base_url).ok()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// The tool servers report business errors as `{"error": "..."}` bodies
fn embedded_error(body: &Value) -> Option<String> {
    body.get("error")
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

#[async_trait::async_trait]
impl ToolServer for HttpToolServer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, capability: &str, arguments: &Value) -> Result<Value, UpstreamFailure> {
        let url = format!("{}/tools/{}", self.base_url, capability);
        debug!(server = %self.id, capability, "Invoking tool server");

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(arguments)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(UpstreamFailure::from_status(
                status.as_u16(),
                format!("{} returned {} for {}: {}", self.id, status, capability, body),
            ));
        }

        let value: Value = serde_json::from_str(&body).map_err(|e| {
            UpstreamFailure::unclassified(format!("Invalid JSON response from {}: {}", self.id, e))
        })?;

        if let Some(error) = embedded_error(&value) {
            return Err(UpstreamFailure::unclassified(format!(
                "{} reported error for {}: {}",
                self.id, capability, error
            )));
        }

        Ok(value)
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .client
            .get(url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(server = %self.id, error = %e, "Health check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_env_key_normalization() {
        assert_eq!(HttpToolServer::env_key("ibkr"), "TOOL_SERVER_IBKR_URL");
        assert_eq!(
            HttpToolServer::env_key("neo4j-cypher"),
            "TOOL_SERVER_NEO4J_CYPHER_URL"
        );
    }

    #[test]
    fn test_embedded_error_detection() {
        assert_eq!(
            embedded_error(&json!({"error": "Not connected to IBKR"})),
            Some("Not connected to IBKR".to_string())
        );
        assert_eq!(embedded_error(&json!({"symbol": "TSLA"})), None);
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let server = HttpToolServer::new("ibkr", "http://localhost:9000/").unwrap();
        assert_eq!(server.base_url(), "http://localhost:9000");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_not_available() {
        let server = HttpToolServer::new("ibkr", "http://127.0.0.1:9").unwrap();
        assert!(!server.is_available().await);
    }
}
