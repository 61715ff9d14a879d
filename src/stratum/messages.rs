//! Stratum wire envelope and client event/command types.
//!
//! Stratum is a line-delimited JSON-RPC variant that predates JSON-RPC 2.0,
//! and pool servers bend it further: notifications arrive with `id: null`
//! or no id at all, error replies to subscribe/authorize sometimes come
//! back with id 999, and nrg-proxy pushes jobs as bare `result` arrays with
//! no method. A strict JSON-RPC library rejects half of that traffic, so
//! incoming frames are parsed into the permissive [`RpcEnvelope`] and
//! outgoing frames are built ad hoc with `serde_json::json!`.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::endpoint::Endpoint;
use crate::work::{Solution, Work};

/// Events emitted by the Stratum client.
///
/// Delivered over a channel to the pool manager, which couples them to the
/// mining engine.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Login completed on a confirmed dialect. At most once per connection.
    Connected,

    /// A connection terminated. Exactly once per terminated connection.
    ///
    /// `retrying` is true while the client is still autodetecting the
    /// dialect and will reconnect on its own; the manager only drives its
    /// reconnect policy when `retrying` is false.
    Disconnected {
        /// Client reconnects internally; manager should stand by
        retrying: bool,
    },

    /// The current job is about to be superseded; abandon in-flight work.
    ResetWork,

    /// A new job replaced the current one.
    WorkReceived(Work),

    /// The pool accepted a submitted solution.
    SolutionAccepted {
        /// Solution was stale when submitted
        stale: bool,
        /// Time between submission and the pool's reply
        round_trip: Duration,
    },

    /// The pool rejected a submitted solution, or the client rejected it
    /// locally (stale work, not logged in, throttled).
    SolutionRejected {
        /// Solution was stale when submitted
        stale: bool,
        /// Time between submission and the pool's reply; zero for local
        /// rejections
        round_trip: Duration,
    },
}

/// Commands sent to the Stratum client by the pool manager.
#[derive(Debug)]
pub enum ClientCommand {
    /// Install the endpoint to use for subsequent connects.
    SetEndpoint(Arc<Endpoint>),

    /// Start a connection cycle against the installed endpoint.
    Connect,

    /// Tear down the active connection.
    Disconnect,

    /// Submit a solved share to the pool.
    SubmitSolution(Box<Solution>),

    /// Forward a hashrate figure to the pool, when enabled.
    SubmitHashrate(String),
}

/// A single parsed Stratum frame, request or response.
///
/// Every field is optional; the accessors reconstruct the semantics the
/// protocol state machine needs. Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcEnvelope {
    #[serde(default)]
    pub id: Option<u64>,

    #[serde(default)]
    pub jsonrpc: Option<String>,

    #[serde(default)]
    pub method: Option<String>,

    #[serde(default)]
    pub params: Value,

    #[serde(default)]
    pub result: Value,

    #[serde(default)]
    pub error: Value,
}

impl RpcEnvelope {
    /// The message id; absent and null both read as 0, the id pools use
    /// for notifications.
    pub fn id(&self) -> u64 {
        self.id.unwrap_or(0)
    }

    /// JSON-RPC version: 2 when a `jsonrpc` member is present, else 1.
    pub fn rpc_version(&self) -> u8 {
        if self.jsonrpc.is_some() {
            2
        } else {
            1
        }
    }

    pub fn method(&self) -> &str {
        self.method.as_deref().unwrap_or("")
    }

    /// A broadcast from the pool rather than a reply to one of our
    /// requests: it names a method, or carries the id 0.
    pub fn is_notification(&self) -> bool {
        !self.method().is_empty() || self.id() == 0
    }

    /// Success means no error content: null or an empty array/object.
    pub fn is_success(&self) -> bool {
        value_empty(&self.error)
    }

    /// Flatten the error member into a printable reason.
    pub fn error_reason(&self) -> String {
        match &self.error {
            Value::String(s) => s.clone(),
            Value::Array(items) => items
                .iter()
                .map(value_to_plain_string)
                .collect::<Vec<_>>()
                .join(" "),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| format!("{}:{}", k, value_to_plain_string(v)))
                .collect::<Vec<_>>()
                .join(" "),
            Value::Null => "Unknown error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Null, `[]` and `{}` all count as "nothing there" on this wire.
pub fn value_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn value_to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> RpcEnvelope {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_parse_notification_with_null_id() {
        let msg = parse(json!({
            "id": null,
            "method": "mining.notify",
            "params": ["job1"]
        }));
        assert!(msg.is_notification());
        assert_eq!(msg.id(), 0);
        assert_eq!(msg.method(), "mining.notify");
    }

    #[test]
    fn test_parse_notification_without_id() {
        let msg = parse(json!({
            "method": "mining.set_difficulty",
            "params": [2048]
        }));
        assert!(msg.is_notification());
    }

    #[test]
    fn test_parse_response() {
        let msg = parse(json!({"id": 3, "result": true, "error": null}));
        assert!(!msg.is_notification());
        assert_eq!(msg.id(), 3);
        assert!(msg.is_success());
        assert_eq!(msg.result, json!(true));
    }

    #[test]
    fn test_rpc_version() {
        assert_eq!(parse(json!({"id": 1, "result": true})).rpc_version(), 1);
        assert_eq!(
            parse(json!({"id": 1, "jsonrpc": "2.0", "result": true})).rpc_version(),
            2
        );
    }

    #[test]
    fn test_error_detection() {
        assert!(parse(json!({"id": 1, "error": null})).is_success());
        assert!(parse(json!({"id": 1, "error": []})).is_success());
        assert!(!parse(json!({"id": 1, "error": true})).is_success());
        assert!(!parse(json!({"id": 1, "error": "boom"})).is_success());
    }

    #[test]
    fn test_error_reason_forms() {
        let msg = parse(json!({"id": 1, "error": "low difficulty"}));
        assert_eq!(msg.error_reason(), "low difficulty");

        let msg = parse(json!({"id": 1, "error": [23, "stale share", null]}));
        assert_eq!(msg.error_reason(), "23 stale share null");

        let msg = parse(json!({"id": 1, "error": {"code": -3, "message": "no"}}));
        assert_eq!(msg.error_reason(), "code:-3 message:no");

        let msg = parse(json!({"id": 1, "error": true}));
        assert_eq!(msg.error_reason(), "true");
    }

    #[test]
    fn test_bare_result_push_is_notification() {
        // nrg-proxy job push: no method, id 0, result array
        let msg = parse(json!({"id": 0, "result": ["job", "data"]}));
        assert!(msg.is_notification());
        assert!(msg.result.is_array());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let msg = parse(json!({
            "id": 4,
            "result": true,
            "error": null,
            "worker": "rig1",
            "extra": {"x": 1}
        }));
        assert_eq!(msg.id(), 4);
        assert!(msg.is_success());
    }
}
