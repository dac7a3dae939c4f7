//! JSON wire messages exchanged between peers.
//!
//! Both directions carry a single JSON object as the signed message body:
//! requests are `{"version": <int>, "method": <string>, "data": <any>}` and
//! responses are `{"success": <bool>, "data": <any>}`. On failure the
//! response `data` is a human-readable reason string.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version stamped on outgoing requests.
pub const PROTOCOL_VERSION: i64 = 1;

/// Method name of the liveness probe.
pub const PING_METHOD: &str = "ping";

/// Response data returned by the liveness probe.
pub const PONG_RESPONSE: &str = "pong";

/// Method name of the closest-node query.
pub const FIND_NODE_METHOD: &str = "find_node";

/// An RPC request: method name plus a method-specific data payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    pub version: i64,
    pub method: String,
    pub data: Value,
}

/// An RPC response. When `success` is false, `data` holds the reason string.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub success: bool,
    pub data: Value,
}
