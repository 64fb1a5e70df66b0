//! Device-control surface exposed to the backend.
//!
//! The orchestrator routes incoming `iot` messages to a [`ThingRegistry`]
//! and `mcp` payloads to an [`McpBridge`]; concrete tool implementations are
//! external collaborators behind these traits.

use crate::error::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Mutex;

#[async_trait]
pub trait ThingRegistry: Send + Sync {
    /// Descriptor document announced to the backend on channel open.
    async fn descriptors_json(&self) -> Result<String>;

    /// Current state document. Pushed on channel open and when entering
    /// the listening phase.
    async fn states_json(&self) -> Result<String>;

    /// Apply a backend-issued command batch.
    async fn invoke(&self, commands: &Value) -> Result<()>;
}

#[async_trait]
pub trait McpBridge: Send + Sync {
    /// Handle one MCP payload; a returned value is sent back over the
    /// transport as the reply.
    async fn handle(&self, payload: Value) -> Result<Option<Value>>;
}

/// Fixed descriptor set with an in-memory state document. Enough for demos
/// and tests; real device integrations implement [`ThingRegistry`] directly.
pub struct StaticThings {
    descriptors: Value,
    states: Mutex<Value>,
}

impl StaticThings {
    pub fn new(descriptors: Value, initial_states: Value) -> Self {
        StaticThings {
            descriptors,
            states: Mutex::new(initial_states),
        }
    }

    pub fn speaker() -> Self {
        StaticThings::new(
            json!([{
                "name": "Speaker",
                "description": "Playback volume control",
                "properties": { "volume": { "type": "number" } },
            }]),
            json!([{ "name": "Speaker", "state": { "volume": 80 } }]),
        )
    }

    fn with_states<R>(&self, f: impl FnOnce(&mut Value) -> R) -> R {
        match self.states.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[async_trait]
impl ThingRegistry for StaticThings {
    async fn descriptors_json(&self) -> Result<String> {
        Ok(self.descriptors.to_string())
    }

    async fn states_json(&self) -> Result<String> {
        Ok(self.with_states(|states| states.to_string()))
    }

    async fn invoke(&self, commands: &Value) -> Result<()> {
        log::info!("thing command batch: {commands}");
        if let Some(volume) = commands
            .get("commands")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .find(|cmd| cmd["name"] == "Speaker" && cmd["method"] == "SetVolume")
            .and_then(|cmd| cmd["parameters"]["volume"].as_i64())
        {
            self.with_states(|states| {
                if let Some(entry) = states
                    .as_array_mut()
                    .into_iter()
                    .flatten()
                    .find(|entry| entry["name"] == "Speaker")
                {
                    entry["state"]["volume"] = json!(volume);
                }
            });
        }
        Ok(())
    }
}

/// MCP bridge that acknowledges nothing. Tool servers are out of scope; this
/// keeps the routing path exercised.
pub struct NullMcp;

#[async_trait]
impl McpBridge for NullMcp {
    async fn handle(&self, payload: Value) -> Result<Option<Value>> {
        log::debug!("mcp payload ignored: {payload}");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_things_documents() {
        let things = StaticThings::speaker();
        let descriptors: Value =
            serde_json::from_str(&things.descriptors_json().await.unwrap()).unwrap();
        assert_eq!(descriptors[0]["name"], "Speaker");
        let states: Value = serde_json::from_str(&things.states_json().await.unwrap()).unwrap();
        assert_eq!(states[0]["state"]["volume"], 80);
    }

    #[tokio::test]
    async fn test_invoke_updates_state() {
        let things = StaticThings::speaker();
        things
            .invoke(&json!({
                "commands": [{
                    "name": "Speaker",
                    "method": "SetVolume",
                    "parameters": { "volume": 35 },
                }]
            }))
            .await
            .unwrap();
        let states: Value = serde_json::from_str(&things.states_json().await.unwrap()).unwrap();
        assert_eq!(states[0]["state"]["volume"], 35);
    }

    #[tokio::test]
    async fn test_null_mcp_returns_no_reply() {
        let bridge = NullMcp;
        assert!(bridge.handle(json!({"method": "ping"})).await.unwrap().is_none());
    }
}
