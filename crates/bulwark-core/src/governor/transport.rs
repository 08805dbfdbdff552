//! Transport to MCP tool servers
//!
//! The governor never talks to a server directly. It goes through a
//! [`ToolTransport`] and bounds every call with a timeout; a timeout is a
//! failed call, never a silent retry.

use async_trait::async_trait;
use serde_json::Value;
use std::time::{Duration, Instant};

use crate::error::{GovernanceError, Result};

/// Something that can invoke a tool on a named server
#[async_trait]
pub trait ToolTransport: Send + Sync {
    async fn invoke(&self, server: &str, tool: &str, args: &Value) -> anyhow::Result<Value>;
}

/// Returned payload of a completed call
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResponse {
    pub payload: Value,
    pub bytes: u64,
    pub latency_ms: u64,
}

/// Invoke `tool` with a bounded wait
pub async fn invoke_with_timeout(
    transport: &dyn ToolTransport,
    server: &str,
    tool: &str,
    args: &Value,
    timeout_ms: u64,
) -> Result<ToolResponse> {
    let started = Instant::now();
    let outcome =
        tokio::time::timeout(Duration::from_millis(timeout_ms), transport.invoke(server, tool, args)).await;
    let latency_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Err(_) => Err(GovernanceError::ToolTimeout {
            server: server.to_string(),
            tool: tool.to_string(),
            timeout_ms,
        }),
        Ok(Err(e)) => Err(GovernanceError::ToolFailed {
            server: server.to_string(),
            tool: tool.to_string(),
            message: format!("{e:#}"),
        }),
        Ok(Ok(payload)) => {
            let bytes = serde_json::to_vec(&payload)?.len() as u64;
            Ok(ToolResponse {
                payload,
                bytes,
                latency_ms,
            })
        }
    }
}
