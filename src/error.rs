//! Error types for toolgate
//!
//! Every failure a caller can observe maps to a JSON-RPC error object whose
//! `data.kind` names the failure precisely and whose `data.category` groups
//! it (auth, registry, mount, handshake, tool execution). Callers branch on
//! those strings, never on message text.

use std::io;

use serde_json::{Value, json};
use thiserror::Error;

use crate::protocol::JsonRpcError;

/// Result type alias for toolgate
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed cause carried by [`Error::ToolExecution`]
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// toolgate errors
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid configuration; fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// A mount prefix that can never resolve (empty, or contains the separator)
    #[error("Invalid mount prefix '{prefix}': {reason}")]
    InvalidPrefix {
        /// Offending prefix
        prefix: String,
        /// Why it was rejected
        reason: String,
    },

    /// Malformed or out-of-order protocol exchange
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// A method that needs a completed handshake arrived before it
    #[error("Handshake required before '{0}'")]
    HandshakeRequired(String),

    /// Credential missing, malformed, or failing verification
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Credential verified but lacks required scopes
    #[error("Insufficient scope: missing {}", .missing.join(" "))]
    InsufficientScope {
        /// Scopes the policy requires that the token does not grant
        missing: Vec<String>,
    },

    /// A tool with this name is already registered
    #[error("Tool already registered: {0}")]
    DuplicateName(String),

    /// Removal of a tool that is not registered
    #[error("Tool not registered: {0}")]
    NotFound(String),

    /// Invocation of a tool that is not registered
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// Request params that do not have the method's shape
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// Arguments do not satisfy the tool's input schema
    #[error("Invalid arguments for '{tool}': {message}")]
    Validation {
        /// Tool name
        tool: String,
        /// Violations, human readable
        message: String,
    },

    /// Mount prefix overlaps an existing one
    #[error("Prefix '{prefix}' conflicts with mounted prefix '{existing}'")]
    PrefixConflict {
        /// Prefix being mounted
        prefix: String,
        /// Already-mounted prefix it overlaps
        existing: String,
    },

    /// Qualified name whose prefix is not mounted
    #[error("No mount for '{0}'")]
    UnresolvedPrefix(String),

    /// The tool handler itself failed
    #[error("Tool '{tool}' failed: {source}")]
    ToolExecution {
        /// Tool name
        tool: String,
        /// Handler's error
        #[source]
        source: BoxError,
    },

    /// The proxy could not reach its backend
    #[error("Backend '{backend}' unavailable: {reason}")]
    BackendUnavailable {
        /// Backend name
        backend: String,
        /// Connection failure summary
        reason: String,
    },

    /// Backend request exceeded its deadline
    #[error("Backend timeout: {0}")]
    BackendTimeout(String),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON-RPC error returned by a backend, relayed verbatim
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        /// Error code
        code: i32,
        /// Error message
        message: String,
        /// Optional data
        data: Option<Value>,
    },

    /// The call was abandoned because its session closed or it was cancelled
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a JSON-RPC error
    pub fn json_rpc(code: i32, message: impl Into<String>) -> Self {
        Self::JsonRpc {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Wrap a handler failure
    pub fn tool_execution(tool: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::ToolExecution {
            tool: tool.into(),
            source: source.into(),
        }
    }

    /// Stable machine-readable name of this failure
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::InvalidPrefix { .. } => "configuration",
            Self::Handshake(_) => "handshake",
            Self::InvalidParams(_) => "invalid_params",
            Self::HandshakeRequired(_) => "handshake_required",
            Self::InvalidToken(_) => "invalid_token",
            Self::InsufficientScope { .. } => "insufficient_scope",
            Self::DuplicateName(_) => "duplicate_name",
            Self::NotFound(_) => "not_found",
            Self::UnknownTool(_) => "unknown_tool",
            Self::Validation { .. } => "validation",
            Self::PrefixConflict { .. } => "prefix_conflict",
            Self::UnresolvedPrefix(_) => "unresolved_prefix",
            Self::ToolExecution { .. } => "tool_execution",
            Self::BackendUnavailable { .. } | Self::BackendTimeout(_) | Self::Transport(_) => {
                "backend_unavailable"
            }
            Self::JsonRpc { .. } => "backend_error",
            Self::Cancelled(_) => "cancelled",
            Self::Protocol(_) | Self::Json(_) => "protocol",
            Self::Io(_) | Self::Http(_) | Self::Internal(_) => "internal",
        }
    }

    /// Coarse grouping of [`Error::kind`]
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::InvalidPrefix { .. } => "configuration",
            Self::Handshake(_)
            | Self::HandshakeRequired(_)
            | Self::InvalidParams(_)
            | Self::Protocol(_)
            | Self::Json(_) => "handshake",
            Self::InvalidToken(_) | Self::InsufficientScope { .. } => "auth",
            Self::DuplicateName(_)
            | Self::NotFound(_)
            | Self::UnknownTool(_)
            | Self::Validation { .. } => "registry",
            Self::PrefixConflict { .. } | Self::UnresolvedPrefix(_) => "mount",
            Self::ToolExecution { .. }
            | Self::BackendUnavailable { .. }
            | Self::BackendTimeout(_)
            | Self::Transport(_)
            | Self::JsonRpc { .. }
            | Self::Cancelled(_) => "tool_execution",
            Self::Io(_) | Self::Http(_) | Self::Internal(_) => "internal",
        }
    }

    /// Convert to JSON-RPC error code
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::JsonRpc { code, .. } => *code,
            Self::Json(_) => rpc_codes::PARSE_ERROR,
            Self::Protocol(_) | Self::Handshake(_) => rpc_codes::INVALID_REQUEST,
            Self::HandshakeRequired(_) => rpc_codes::HANDSHAKE_REQUIRED,
            Self::UnknownTool(_) | Self::UnresolvedPrefix(_) => rpc_codes::METHOD_NOT_FOUND,
            Self::Validation { .. } | Self::InvalidParams(_) => rpc_codes::INVALID_PARAMS,
            Self::InvalidToken(_) => rpc_codes::INVALID_TOKEN,
            Self::InsufficientScope { .. } => rpc_codes::INSUFFICIENT_SCOPE,
            Self::DuplicateName(_) => rpc_codes::DUPLICATE_NAME,
            Self::NotFound(_) => rpc_codes::NOT_FOUND,
            Self::PrefixConflict { .. } => rpc_codes::PREFIX_CONFLICT,
            Self::ToolExecution { .. } => rpc_codes::TOOL_EXECUTION,
            Self::BackendUnavailable { .. } | Self::BackendTimeout(_) | Self::Transport(_) => {
                rpc_codes::BACKEND_UNAVAILABLE
            }
            Self::Cancelled(_) => rpc_codes::REQUEST_CANCELLED,
            _ => rpc_codes::INTERNAL_ERROR,
        }
    }

    /// Render as a wire error object.
    ///
    /// Backend errors keep their original code, message and data; everything
    /// else gets `data: {"kind", "category"}` (plus `missing` for scope
    /// failures).
    #[must_use]
    pub fn to_rpc_error(&self) -> JsonRpcError {
        if let Self::JsonRpc {
            code,
            message,
            data,
        } = self
        {
            return JsonRpcError {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            };
        }

        let mut data = json!({
            "kind": self.kind(),
            "category": self.category(),
        });
        if let Self::InsufficientScope { missing } = self {
            data["missing"] = json!(missing);
        }

        JsonRpcError {
            code: self.to_rpc_code(),
            message: self.to_string(),
            data: Some(data),
        }
    }

    /// Whether retrying the same request against a fresh connection may help
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::BackendTimeout(_) | Self::Http(_) | Self::Io(_)
        )
    }
}

impl From<JsonRpcError> for Error {
    fn from(e: JsonRpcError) -> Self {
        Self::JsonRpc {
            code: e.code,
            message: e.message,
            data: e.data,
        }
    }
}

/// JSON-RPC error codes
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found (also: unknown tool, unresolved prefix)
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Handler failure
    pub const TOOL_EXECUTION: i32 = -32000;
    /// Backend unreachable or timed out
    pub const BACKEND_UNAVAILABLE: i32 = -32001;
    /// Session has not completed `initialize`
    pub const HANDSHAKE_REQUIRED: i32 = -32002;
    /// Credential rejected
    pub const INVALID_TOKEN: i32 = -32010;
    /// Credential lacks scopes
    pub const INSUFFICIENT_SCOPE: i32 = -32011;
    /// Registration of an existing name
    pub const DUPLICATE_NAME: i32 = -32020;
    /// Removal of an unknown name
    pub const NOT_FOUND: i32 = -32021;
    /// Overlapping mount prefix
    pub const PREFIX_CONFLICT: i32 = -32022;
    /// Request cancelled
    pub const REQUEST_CANCELLED: i32 = -32800;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_and_lookup_failures_are_distinguishable() {
        let scope = Error::InsufficientScope {
            missing: vec!["admin:delete".into()],
        }
        .to_rpc_error();
        let unknown = Error::UnknownTool("nope".into()).to_rpc_error();
        let down = Error::BackendUnavailable {
            backend: "add".into(),
            reason: "connection refused".into(),
        }
        .to_rpc_error();

        assert_eq!(scope.data.as_ref().unwrap()["kind"], "insufficient_scope");
        assert_eq!(scope.data.as_ref().unwrap()["missing"][0], "admin:delete");
        assert_eq!(unknown.data.as_ref().unwrap()["kind"], "unknown_tool");
        assert_eq!(down.data.as_ref().unwrap()["kind"], "backend_unavailable");
        assert_eq!(down.data.as_ref().unwrap()["category"], "tool_execution");
        assert_ne!(scope.code, unknown.code);
        assert_ne!(unknown.code, down.code);
    }

    #[test]
    fn relayed_backend_error_is_unchanged() {
        let original = JsonRpcError {
            code: -32099,
            message: "backend says no".into(),
            data: Some(json!({"detail": 1})),
        };
        let relayed = Error::from(original.clone()).to_rpc_error();
        assert_eq!(relayed, original);
    }

    #[test]
    fn tool_execution_keeps_cause() {
        let err = Error::tool_execution("add", anyhow::anyhow!("overflow"));
        assert_eq!(err.kind(), "tool_execution");
        assert!(err.to_string().contains("overflow"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn malformed_params_have_their_own_kind() {
        let err = Error::InvalidParams("arguments must be an object".into()).to_rpc_error();
        assert_eq!(err.code, rpc_codes::INVALID_PARAMS);
        let data = err.data.unwrap();
        assert_eq!(data["kind"], "invalid_params");
        assert_eq!(data["category"], "handshake");
    }

    #[test]
    fn retryable_covers_transport_failures_only() {
        assert!(Error::Transport("reset".into()).is_retryable());
        assert!(Error::BackendTimeout("30s".into()).is_retryable());
        assert!(!Error::UnknownTool("x".into()).is_retryable());
        assert!(!Error::InvalidToken("expired".into()).is_retryable());
    }
}
