//! Proptest strategies for task payloads

use proptest::prelude::*;
use serde_json::{json, Value};

/// Request paths, including non-ASCII segments
pub fn path_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z0-9éü日本_-]{1,8}", 0..4).prop_map(|segments| {
        format!("/{}", segments.join("/"))
    })
}

pub fn method_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("GET".to_string()),
        Just("POST".to_string()),
        Just("PUT".to_string()),
        Just("DELETE".to_string()),
        "[A-Z]{3,7}",
    ]
}

pub fn query_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(("[a-z]{1,5}", "\\PC{0,6}"), 0..3).prop_map(|pairs| {
        pairs
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    })
}

/// Bodies as a gateway would forward them: absent, JSON, JSON-in-a-string
/// or plain text
pub fn body_strategy() -> impl Strategy<Value = Option<Value>> {
    prop_oneof![
        Just(None),
        any::<i64>().prop_map(|n| Some(json!({ "n": n }))),
        any::<i64>().prop_map(|n| Some(Value::String(format!("{{\"n\": {n}}}")))),
        "\\PC{0,24}".prop_map(|text| Some(Value::String(text))),
    ]
}

/// A complete, well-formed task request payload
pub fn task_request_strategy() -> impl Strategy<Value = Value> {
    (
        path_strategy(),
        method_strategy(),
        query_strategy(),
        body_strategy(),
    )
        .prop_map(|(path, method, query, body)| {
            let mut request = json!({ "path": path, "method": method, "query": query });
            if let Some(body) = body {
                request["body"] = body;
            }
            request
        })
}
