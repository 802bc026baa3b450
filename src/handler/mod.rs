//! # Request Handlers
//!
//! The pluggable business logic of the worker. A [`RequestHandler`] turns one
//! task payload into one response payload and **never fails**: any fault is
//! encoded into the returned bytes, because a handler that bails out leaves
//! the caller waiting on a correlation id that will never be answered.
//!
//! Deliveries can be redelivered after a connection loss, so handlers must be
//! safe to run more than once for the same task.
//!
//! ## Usage
//!
//! ```rust
//! use scalable_worker::handler::{FnHandler, RequestHandler};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let upper = FnHandler::new(|payload: &[u8]| payload.to_ascii_uppercase());
//! assert_eq!(upper.handle(b"ping").await, b"PING".to_vec());
//! # }
//! ```

pub mod echo;

use async_trait::async_trait;
use serde::Serialize;

pub use echo::{EchoTaskHandler, TaskBody, TaskRequest, TaskResponse};

/// Payload used when even the error response cannot be encoded
const FALLBACK_ERROR_PAYLOAD: &[u8] = br#"{"error":"response serialization failed"}"#;

/// Turns a raw task payload into a raw response payload
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one task. Must always produce a response.
    async fn handle(&self, payload: &[u8]) -> Vec<u8>;

    /// Name used in logs
    fn name(&self) -> &str {
        "request_handler"
    }
}

/// Adapts a plain function or closure into a [`RequestHandler`]
pub struct FnHandler<F> {
    func: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&[u8]) -> Vec<u8> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> std::fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> RequestHandler for FnHandler<F>
where
    F: Fn(&[u8]) -> Vec<u8> + Send + Sync,
{
    async fn handle(&self, payload: &[u8]) -> Vec<u8> {
        (self.func)(payload)
    }

    fn name(&self) -> &str {
        "fn_handler"
    }
}

#[derive(Serialize)]
struct ErrorResponse<'a> {
    error: &'a str,
}

/// Encode a response as UTF-8 JSON, falling back to a fixed error payload
pub fn encode_response<T: Serialize>(response: &T) -> Vec<u8> {
    serde_json::to_vec(response).unwrap_or_else(|_| FALLBACK_ERROR_PAYLOAD.to_vec())
}

/// Error-shaped response payload: `{"error": "<message>"}`
pub fn error_response(message: &str) -> Vec<u8> {
    encode_response(&ErrorResponse { error: message })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fn_handler_delegates() {
        let handler = FnHandler::new(|payload: &[u8]| {
            let mut out = payload.to_vec();
            out.reverse();
            out
        });
        assert_eq!(handler.handle(b"abc").await, b"cba".to_vec());
        assert_eq!(handler.name(), "fn_handler");
    }

    #[test]
    fn test_error_response_shape() {
        let payload = error_response("invalid task payload");
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["error"], "invalid task payload");
    }

    #[test]
    fn test_error_response_preserves_non_ascii() {
        let payload = error_response("données invalides");
        let text = String::from_utf8(payload).unwrap();
        assert!(text.contains("données"));
    }
}
