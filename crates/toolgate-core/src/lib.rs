//! Wire types shared by the toolgate server and client halves.
//!
//! Everything here is plain serde data: JSON-RPC 2.0 envelopes, the
//! tool-calling method payloads, and the notification bodies the gateway
//! pushes to connected sessions. No I/O lives in this crate.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod messages;
mod types;

pub use messages::*;
pub use types::*;

/// Latest protocol revision spoken by the gateway.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Protocol revisions accepted during `initialize`, newest first.
pub const SUPPORTED_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Pick the revision to answer an `initialize` with.
///
/// A client asking for a revision we speak gets it echoed back; anything
/// else (including no version at all) gets [`PROTOCOL_VERSION`].
#[must_use]
pub fn negotiate_version(requested: Option<&str>) -> &'static str {
    requested
        .and_then(|v| SUPPORTED_VERSIONS.iter().find(|s| **s == v).copied())
        .unwrap_or(PROTOCOL_VERSION)
}

/// Method names used on the wire.
pub mod methods {
    /// Handshake request.
    pub const INITIALIZE: &str = "initialize";
    /// Handshake completion notification.
    pub const INITIALIZED: &str = "notifications/initialized";
    /// Liveness probe.
    pub const PING: &str = "ping";
    /// Tool enumeration.
    pub const TOOLS_LIST: &str = "tools/list";
    /// Tool invocation.
    pub const TOOLS_CALL: &str = "tools/call";
    /// Resource enumeration.
    pub const RESOURCES_LIST: &str = "resources/list";
    /// Resource read.
    pub const RESOURCES_READ: &str = "resources/read";
    /// Server push: the advertised tool list changed.
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    /// Server push: progress for a running call.
    pub const PROGRESS: &str = "notifications/progress";
    /// Server push: log message.
    pub const MESSAGE: &str = "notifications/message";
    /// Either direction: abandon an in-flight request.
    pub const CANCELLED: &str = "notifications/cancelled";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_echoes_supported_version() {
        assert_eq!(negotiate_version(Some("2025-03-26")), "2025-03-26");
        assert_eq!(negotiate_version(Some("2024-11-05")), "2024-11-05");
    }

    #[test]
    fn negotiate_falls_back_to_latest() {
        assert_eq!(negotiate_version(Some("1999-01-01")), PROTOCOL_VERSION);
        assert_eq!(negotiate_version(None), PROTOCOL_VERSION);
    }
}
