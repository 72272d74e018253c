//! JSON-RPC 2.0 message types and bridge method parameters

use crate::gdb::config::RemoteTargetConfig;
use crate::gdb::types::{Breakpoint, SessionEvent};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ============================================================================
// JSON-RPC 2.0 Base Types
// ============================================================================

/// JSON-RPC 2.0 Request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// JSON-RPC 2.0 Response (success)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    pub result: serde_json::Value,
}

impl JsonRpcResponse {
    pub fn new(id: RequestId, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result,
        }
    }
}

/// JSON-RPC 2.0 Error Response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorResponse {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    pub error: JsonRpcError,
}

impl JsonRpcErrorResponse {
    pub fn new(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            error,
        }
    }
}

/// JSON-RPC 2.0 Error Object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    pub fn parse_error() -> Self {
        Self {
            code: -32700,
            message: "Parse error".to_string(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {}", method),
            data: None,
        }
    }

    pub fn invalid_params(message: &str) -> Self {
        Self {
            code: -32602,
            message: message.to_string(),
            data: None,
        }
    }

    pub fn internal_error(message: &str) -> Self {
        Self {
            code: -32603,
            message: message.to_string(),
            data: None,
        }
    }

    /// Server-defined: the method needs a started session
    pub fn no_session() -> Self {
        Self {
            code: -32000,
            message: "No GDB session is running".to_string(),
            data: None,
        }
    }

    /// Server-defined: the session failed to start
    pub fn start_failed(message: &str) -> Self {
        Self {
            code: -32001,
            message: message.to_string(),
            data: None,
        }
    }
}

/// Request ID type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

/// Message pushed to the host without a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Notification {
    fn new(method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params: Some(params),
        }
    }

    pub fn session_event(event: &SessionEvent) -> Self {
        Self::new(
            "session/event",
            serde_json::to_value(event).unwrap_or(serde_json::Value::Null),
        )
    }

    pub fn navigate(path: &Path, line: u32) -> Self {
        Self::new(
            "editor/navigate",
            serde_json::json!({
                "path": path,
                "line": line
            }),
        )
    }
}

// ============================================================================
// Method Parameters
// ============================================================================

/// `session/start`
#[derive(Debug, Clone, Deserialize)]
pub struct StartParams {
    pub elf_file: PathBuf,
    #[serde(default)]
    pub gdb_path: Option<String>,
    #[serde(default)]
    pub async_mode: Option<bool>,
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub command_timeout_ms: Option<u64>,
    #[serde(default)]
    pub remote: Option<RemoteTargetConfig>,
    #[serde(default)]
    pub extended_remote: bool,
}

/// `break/insert` and `break/remove`
#[derive(Debug, Clone, Deserialize)]
pub struct BreakpointParams {
    pub file: PathBuf,
    pub line: u32,
}

impl From<BreakpointParams> for Breakpoint {
    fn from(params: BreakpointParams) -> Self {
        Breakpoint::new(params.file, params.line)
    }
}

/// `data/print`
#[derive(Debug, Clone, Deserialize)]
pub struct SymbolParams {
    pub symbol: String,
}

/// `data/evaluate`
#[derive(Debug, Clone, Deserialize)]
pub struct ExpressionParams {
    pub expression: String,
}

/// `gdb/settings`
#[derive(Debug, Clone, Deserialize)]
pub struct SettingsParams {
    pub settings: Vec<String>,
}

/// `gdb/command`
#[derive(Debug, Clone, Deserialize)]
pub struct CommandParams {
    pub command: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_variants() {
        let req: JsonRpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":7,"method":"exec/next"}"#).unwrap();
        assert_eq!(req.id, Some(RequestId::Number(7)));
        assert!(req.params.is_none());

        let req: JsonRpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"a","method":"exec/next"}"#).unwrap();
        assert_eq!(req.id, Some(RequestId::String("a".to_string())));
    }

    #[test]
    fn test_start_params_with_remote_target() {
        let params: StartParams = serde_json::from_value(serde_json::json!({
            "elf_file": "/work/fw.elf",
            "remote": {"type": "tcp", "host": "localhost", "port": 3333}
        }))
        .unwrap();
        assert_eq!(
            params.remote,
            Some(RemoteTargetConfig::Tcp {
                host: "localhost".to_string(),
                port: 3333
            })
        );
        assert!(!params.extended_remote);
    }

    #[test]
    fn test_session_event_notification_shape() {
        let n = Notification::session_event(&SessionEvent::Console("hi".to_string()));
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["method"], "session/event");
        assert_eq!(json["params"]["kind"], "console");
        assert_eq!(json["params"]["data"], "hi");

        let n = Notification::navigate(Path::new("/p/m.vhd"), 12);
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["params"]["line"], 12);
    }
}
