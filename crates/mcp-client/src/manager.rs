//! MCP manager — holds server connections and answers the two questions
//! the engine asks: what tools do these equipped servers provide, and
//! run this tool with this input.

use std::collections::HashMap;

use serde_json::Value;

use sk_domain::error::{Error, Result};

use crate::config::McpServerConfig;
use crate::protocol::{self, McpToolDef, ToolCallResult, ToolsListResult};
use crate::transport::StdioTransport;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// McpServer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One connected MCP server with its discovered tools.
pub struct McpServer {
    pub name: String,
    pub tools: Vec<McpToolDef>,
    transport: StdioTransport,
}

impl McpServer {
    /// Spawn the server, perform the MCP handshake, and discover tools.
    pub async fn connect(config: &McpServerConfig) -> Result<Self> {
        let transport = StdioTransport::spawn(config)
            .map_err(|e| Error::Mcp(format!("spawning '{}': {e}", config.name)))?;

        let init = transport
            .request("initialize", Some(protocol::initialize_params()))
            .await
            .map_err(|e| Error::Mcp(format!("initialize failed for '{}': {e}", config.name)))?;
        init.into_result()
            .map_err(|e| Error::Mcp(format!("initialize rejected by '{}': {e}", config.name)))?;

        transport
            .notify("notifications/initialized")
            .await
            .map_err(|e| Error::Mcp(format!("initialized notification failed: {e}")))?;

        let tools = match transport.request("tools/list", None).await {
            Ok(resp) => match resp.into_result() {
                Ok(value) => serde_json::from_value::<ToolsListResult>(value)
                    .map(|r| r.tools)
                    .unwrap_or_else(|e| {
                        tracing::warn!(
                            server = %config.name,
                            error = %e,
                            "failed to parse tools/list result"
                        );
                        Vec::new()
                    }),
                Err(e) => {
                    tracing::warn!(server = %config.name, error = %e, "tools/list returned error");
                    Vec::new()
                }
            },
            Err(e) => {
                tracing::warn!(server = %config.name, error = %e, "tools/list request failed");
                Vec::new()
            }
        };

        tracing::info!(
            server = %config.name,
            tool_count = tools.len(),
            "MCP server connected"
        );

        Ok(Self {
            name: config.name.clone(),
            tools,
            transport,
        })
    }

    /// Invoke one of this server's tools; returns the joined text content.
    pub async fn call_tool(&self, tool_name: &str, input: &Value) -> Result<String> {
        let params = serde_json::json!({
            "name": tool_name,
            "arguments": input,
        });
        let resp = self
            .transport
            .request("tools/call", Some(params))
            .await
            .map_err(|e| Error::Mcp(format!("tools/call failed: {e}")))?;
        let value = resp
            .into_result()
            .map_err(|e| Error::Mcp(format!("tools/call rejected: {e}")))?;
        let result: ToolCallResult = serde_json::from_value(value)
            .map_err(|e| Error::Mcp(format!("unparseable tools/call result: {e}")))?;
        if result.is_error {
            return Err(Error::Mcp(result.text()));
        }
        Ok(result.text())
    }

    pub async fn shutdown(&self) {
        self.transport.shutdown().await;
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// McpManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// All connected MCP servers, keyed by name.
#[derive(Default)]
pub struct McpManager {
    servers: HashMap<String, McpServer>,
}

impl McpManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect every configured server; failures are logged and skipped
    /// so one broken server never blocks the rest.
    pub async fn connect_all(configs: &[McpServerConfig]) -> Self {
        let mut servers = HashMap::new();
        for config in configs {
            match McpServer::connect(config).await {
                Ok(server) => {
                    servers.insert(config.name.clone(), server);
                }
                Err(e) => {
                    tracing::warn!(server = %config.name, error = %e, "MCP server unavailable");
                }
            }
        }
        Self { servers }
    }

    pub fn get(&self, name: &str) -> Option<&McpServer> {
        self.servers.get(name)
    }

    /// Tools contributed by the named equipped servers, in order.
    pub fn tools_for(&self, equipped: &[String]) -> Vec<(String, McpToolDef)> {
        let mut out = Vec::new();
        for server_name in equipped {
            let Some(server) = self.servers.get(server_name) else {
                tracing::warn!(server = %server_name, "equipped MCP server is not connected");
                continue;
            };
            for tool in &server.tools {
                out.push((server_name.clone(), tool.clone()));
            }
        }
        out
    }

    /// Find which equipped server provides `tool_name` and invoke it.
    pub async fn call_tool(
        &self,
        equipped: &[String],
        tool_name: &str,
        input: &Value,
    ) -> Result<String> {
        for server_name in equipped {
            if let Some(server) = self.servers.get(server_name) {
                if server.tools.iter().any(|t| t.name == tool_name) {
                    return server.call_tool(tool_name, input).await;
                }
            }
        }
        Err(Error::Mcp(format!(
            "no equipped MCP server provides tool '{tool_name}'"
        )))
    }

    pub async fn shutdown(&self) {
        for server in self.servers.values() {
            server.shutdown().await;
        }
    }
}
