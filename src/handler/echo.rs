//! Default handler: echoes the request's routing fields back with a result
//! line naming the host that processed it.
//!
//! Request: `{"path": "/x", "method": "GET", "query": "a=1", "body": ...}`
//!
//! The body is optional and may be anything. A string body that parses as
//! JSON is returned structured; any other string is returned as text.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{encode_response, error_response, RequestHandler};
use crate::constants::env;

/// Task request as produced by the HTTP gateway
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TaskRequest {
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub body: Option<Value>,
}

/// Request body after best-effort decoding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskBody {
    Structured(Value),
    Text(String),
}

impl TaskBody {
    /// Decode a raw body. Strings are tried as embedded JSON first.
    pub fn decode(raw: Value) -> Self {
        match raw {
            Value::String(text) => match serde_json::from_str::<Value>(&text) {
                Ok(parsed) => TaskBody::Structured(parsed),
                Err(_) => TaskBody::Text(text),
            },
            other => TaskBody::Structured(other),
        }
    }
}

/// Response published back to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub result: String,
    pub path: String,
    pub method: String,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<TaskBody>,
}

/// Echo handler identifying itself by hostname
#[derive(Debug, Clone)]
pub struct EchoTaskHandler {
    hostname: String,
}

impl EchoTaskHandler {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }

    /// Use `HOSTNAME` (set by container runtimes), or `unknown`
    pub fn from_env() -> Self {
        Self::new(std::env::var(env::HOSTNAME).unwrap_or_else(|_| "unknown".to_string()))
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Decode and answer one request
    pub fn process(&self, payload: &[u8]) -> Result<TaskResponse, serde_json::Error> {
        let request: TaskRequest = serde_json::from_slice(payload)?;
        Ok(TaskResponse {
            result: format!("Done from rust {}", self.hostname),
            path: request.path,
            method: request.method,
            query: request.query,
            body: request.body.map(TaskBody::decode),
        })
    }
}

#[async_trait]
impl RequestHandler for EchoTaskHandler {
    async fn handle(&self, payload: &[u8]) -> Vec<u8> {
        match self.process(payload) {
            Ok(response) => {
                debug!(path = %response.path, method = %response.method, "Task processed");
                encode_response(&response)
            }
            Err(e) => {
                warn!(error = %e, "Rejecting malformed task payload");
                error_response(&format!("invalid task payload: {e}"))
            }
        }
    }

    fn name(&self) -> &str {
        "echo_task_handler"
    }
}
