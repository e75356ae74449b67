//! Diagnostic classification of transport error codes
//!
//! Codes follow the numbering emitted by the bundled transport adapter. A
//! category only decides what gets logged and which hint is shown; it never
//! changes retry behaviour.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

/// Transport error codes
pub mod codes {
    pub const OK: i32 = 0;
    pub const CONNECT_TIMEOUT: i32 = 1;
    pub const SUBSCRIBE_TIMEOUT: i32 = 2;
    pub const UNSUBSCRIBE_TIMEOUT: i32 = 3;
    pub const PING_TIMEOUT: i32 = 4;
    pub const INTERNAL_ERROR: i32 = 5;
    pub const CONNACK_RETURNCODE: i32 = 6;
    pub const SOCKET_ERROR: i32 = 7;
    pub const SOCKET_CLOSE: i32 = 8;
    pub const MALFORMED_UTF: i32 = 9;
    pub const UNSUPPORTED: i32 = 10;
    pub const INVALID_STATE: i32 = 11;
}

/// Coarse failure category used for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticCategory {
    /// Normal closure
    Ok,
    Timeout,
    /// Broker rejected the handshake
    Refused,
    SocketError,
    SocketClosed,
    Protocol,
    Internal,
    Unknown,
}

impl DiagnosticCategory {
    pub fn from_code(code: i32) -> Self {
        match code {
            codes::OK => DiagnosticCategory::Ok,
            codes::CONNECT_TIMEOUT
            | codes::SUBSCRIBE_TIMEOUT
            | codes::UNSUBSCRIBE_TIMEOUT
            | codes::PING_TIMEOUT => DiagnosticCategory::Timeout,
            codes::CONNACK_RETURNCODE => DiagnosticCategory::Refused,
            codes::SOCKET_ERROR => DiagnosticCategory::SocketError,
            codes::SOCKET_CLOSE => DiagnosticCategory::SocketClosed,
            codes::MALFORMED_UTF | codes::UNSUPPORTED | codes::INVALID_STATE => {
                DiagnosticCategory::Protocol
            }
            codes::INTERNAL_ERROR => DiagnosticCategory::Internal,
            _ => DiagnosticCategory::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticCategory::Ok => "ok",
            DiagnosticCategory::Timeout => "timeout",
            DiagnosticCategory::Refused => "refused",
            DiagnosticCategory::SocketError => "socket_error",
            DiagnosticCategory::SocketClosed => "socket_closed",
            DiagnosticCategory::Protocol => "protocol",
            DiagnosticCategory::Internal => "internal",
            DiagnosticCategory::Unknown => "unknown",
        }
    }

    /// Operator-facing remediation hint
    pub fn remediation_hint(&self) -> &'static str {
        match self {
            DiagnosticCategory::Ok => "connection closed normally",
            DiagnosticCategory::Timeout => {
                "broker did not answer in time; check network reachability and the session timeout"
            }
            DiagnosticCategory::Refused => {
                "broker refused the handshake; check credentials and that the client id is not already in use"
            }
            DiagnosticCategory::SocketError => {
                "could not open the socket; check host, port, path and that the broker exposes a WebSocket listener"
            }
            DiagnosticCategory::SocketClosed => {
                "socket closed by the peer; the broker may have restarted or dropped an idle client"
            }
            DiagnosticCategory::Protocol => {
                "protocol violation; check the broker speaks MQTT over WebSocket on this path"
            }
            DiagnosticCategory::Internal => "internal transport error; see the message for details",
            DiagnosticCategory::Unknown => "unrecognised error code",
        }
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|token|secret)[=:]\s*\S+").expect("valid secret regex")
});

static URL_USERINFO_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(wss?|mqtts?)://[^/@\s]+@").expect("valid userinfo regex"));

const MAX_MESSAGE_LEN: usize = 500;

/// Redact credentials and bound the length of transport error text before logging
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();
    sanitized = URL_USERINFO_PATTERN
        .replace_all(&sanitized, "${1}://***@")
        .to_string();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Log a handshake failure or connection loss with its category and hint
pub fn log_transport_failure(kind: &str, code: i32, message: &str) {
    let category = DiagnosticCategory::from_code(code);
    warn!(
        kind = kind,
        code = code,
        category = category.as_str(),
        hint = category.remediation_hint(),
        "MQTT {}: {}",
        kind,
        sanitize_error_message(message)
    );
}
