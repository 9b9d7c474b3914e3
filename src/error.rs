//! Error types for the Shoal worker
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - Error context and chaining
//! - Exit codes for CLI

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::peer::WorkerId;

/// Result type alias for worker operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Transport / tunnel errors (3xx)
    TransportFailed = 300,
    InterfaceNotFound = 301,
    TunnelClosed = 302,
    PeerUnreachable = 303,

    // Handshake errors (4xx)
    HandshakeRejected = 400,
    HandshakeStage = 401,
    ProtocolMalformed = 402,
    ProtocolVersion = 403,
    AuthenticationRejected = 404,
    DuplicateClaim = 405,
    NotAuthenticated = 406,

    // Call / streaming errors (5xx)
    CallError = 500,
    FunctionNotDefined = 501,
    YieldPending = 502,

    // Group errors (6xx)
    ChannelNotFound = 600,
    GroupRequestFailed = 601,

    // Commission errors (7xx)
    QuorumFailure = 700,
    InvalidCommission = 701,
    RecordNotFound = 702,

    // Directory errors (8xx)
    PeerNotFound = 800,
    SeedNotImported = 801,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10,
            200..=299 => 20,
            300..=399 => 30,
            400..=499 => 40,
            500..=599 => 50,
            600..=699 => 60,
            700..=799 => 70,
            800..=899 => 80,
            900..=999 => 90,
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for the worker
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    /// Generic configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File read error
    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    /// JSON (de)serialization error on a wire frame
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Transport Errors
    // ─────────────────────────────────────────────────────────────

    /// The transport could not open or serve a tunnel
    #[error("Transport error on interface '{interface}': {message}")]
    Transport { interface: String, message: String },

    /// No interface with this name was registered
    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),

    /// The tunnel closed while a session was pending on it
    #[error("Tunnel closed")]
    TunnelClosed,

    /// Every connector of a peer failed
    #[error("Worker {worker_id} is unreachable: {message}")]
    PeerUnreachable { worker_id: WorkerId, message: String },

    // ─────────────────────────────────────────────────────────────
    // Handshake Errors
    // ─────────────────────────────────────────────────────────────

    /// No module claimed the tunnel, or the remote refused it
    #[error("Handshake rejected: {reason}")]
    HandshakeRejected { reason: String },

    /// A tunnel event arrived in a stage where it is not valid
    #[error("Handshake event '{event}' not valid in stage {stage}")]
    HandshakeStage { stage: String, event: String },

    /// A frame could not be understood
    #[error("Malformed protocol message: {message}")]
    ProtocolMalformed { message: String },

    /// Protocol version mismatch
    #[error("Protocol version mismatch: local {local}, remote {remote}")]
    ProtocolVersion { local: String, remote: String },

    /// Peer authenticity check failed
    #[error("Authentication rejected for worker {worker_id}: {reason}")]
    AuthenticationRejected { worker_id: WorkerId, reason: String },

    /// More than one protocol module claimed the same tunnel
    #[error("Protocols {codes:?} all claimed the same tunnel")]
    DuplicateClaim { codes: Vec<u8> },

    /// This worker has no identity yet
    #[error("Worker authenticity data has not been imported")]
    NotAuthenticated,

    // ─────────────────────────────────────────────────────────────
    // Call Errors
    // ─────────────────────────────────────────────────────────────

    /// The remote handler reported an application error
    #[error("Call error: {message}")]
    CallError { message: String },

    /// The remote side has no handler for this function or field
    #[error("Function not defined: {0}")]
    FunctionNotDefined(String),

    /// A yield was attempted while the previous one still awaits its acknowledgment
    #[error("Previous yield on '{session}' is still awaiting acknowledgment")]
    YieldPending { session: String },

    // ─────────────────────────────────────────────────────────────
    // Group Errors
    // ─────────────────────────────────────────────────────────────

    /// Unknown channel
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    /// A peer answered a group request with an error
    #[error("Group request to worker {worker_id} failed: {message}")]
    GroupRequestFailed { worker_id: WorkerId, message: String },

    // ─────────────────────────────────────────────────────────────
    // Commission Errors
    // ─────────────────────────────────────────────────────────────

    /// Not enough commission peers acknowledged an update in time
    #[error(
        "Quorum failure on record '{key}': {acknowledged}/{total} acknowledged, {required_percent}% required"
    )]
    QuorumFailure {
        key: String,
        acknowledged: usize,
        total: usize,
        required_percent: u8,
    },

    /// Commission configuration is unusable
    #[error("Invalid commission '{purpose}': {message}")]
    InvalidCommission { purpose: String, message: String },

    /// Unknown record key
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    // ─────────────────────────────────────────────────────────────
    // Directory Errors
    // ─────────────────────────────────────────────────────────────

    /// Unknown worker
    #[error("Worker peer not found: {0}")]
    PeerNotFound(WorkerId),

    /// Deterministic selection was requested before a seed was imported
    #[error("Static global random seed has not been imported")]
    SeedNotImported,

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,
            Error::Config(_) => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,
            Error::Json(_) => ErrorCode::ProtocolMalformed,

            Error::Transport { .. } => ErrorCode::TransportFailed,
            Error::InterfaceNotFound(_) => ErrorCode::InterfaceNotFound,
            Error::TunnelClosed => ErrorCode::TunnelClosed,
            Error::PeerUnreachable { .. } => ErrorCode::PeerUnreachable,

            Error::HandshakeRejected { .. } => ErrorCode::HandshakeRejected,
            Error::HandshakeStage { .. } => ErrorCode::HandshakeStage,
            Error::ProtocolMalformed { .. } => ErrorCode::ProtocolMalformed,
            Error::ProtocolVersion { .. } => ErrorCode::ProtocolVersion,
            Error::AuthenticationRejected { .. } => ErrorCode::AuthenticationRejected,
            Error::DuplicateClaim { .. } => ErrorCode::DuplicateClaim,
            Error::NotAuthenticated => ErrorCode::NotAuthenticated,

            Error::CallError { .. } => ErrorCode::CallError,
            Error::FunctionNotDefined(_) => ErrorCode::FunctionNotDefined,
            Error::YieldPending { .. } => ErrorCode::YieldPending,

            Error::ChannelNotFound(_) => ErrorCode::ChannelNotFound,
            Error::GroupRequestFailed { .. } => ErrorCode::GroupRequestFailed,

            Error::QuorumFailure { .. } => ErrorCode::QuorumFailure,
            Error::InvalidCommission { .. } => ErrorCode::InvalidCommission,
            Error::RecordNotFound(_) => ErrorCode::RecordNotFound,

            Error::PeerNotFound(_) => ErrorCode::PeerNotFound,
            Error::SeedNotImported => ErrorCode::SeedNotImported,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the caller may reasonably retry the operation.
    ///
    /// The core never retries on its own; this is advice for callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. }
                | Error::TunnelClosed
                | Error::PeerUnreachable { .. }
                | Error::QuorumFailure { .. }
                | Error::GroupRequestFailed { .. }
                | Error::Io(_)
        )
    }

    /// Check if the error is fatal (worker should exit)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::Config(_)
                | Error::Internal(_)
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'shoal-worker config init' to create a default configuration file.",
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'shoal-worker config validate' to see details.",
            ),
            Error::ConfigValidation { .. } | Error::Config(_) => Some(
                "Review the configuration file and fix the invalid values.",
            ),
            Error::InterfaceNotFound(_) => Some(
                "Declare the interface under [[interfaces]] or fix the connector's interface name.",
            ),
            Error::PeerUnreachable { .. } => Some(
                "Check that the peer is running and that its connector settings are current.",
            ),
            Error::AuthenticationRejected { .. } => Some(
                "The peer settings and authenticity data disagree. Re-import the peer settings.",
            ),
            Error::ProtocolVersion { .. } => Some(
                "Both workers must run a compatible shoal-worker version.",
            ),
            Error::SeedNotImported => Some(
                "Run 'shoal-worker seed generate' once and share the file with every worker.",
            ),
            Error::NotAuthenticated => Some(
                "Set [worker] id and authenticity_data, or join an existing shoal first.",
            ),
            Error::QuorumFailure { .. } => Some(
                "Too many commission peers are absent. Retry once more peers are reachable.",
            ),
            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let code = self.code();
        let suggestion = self.suggestion();

        let mut output = format!("\x1b[31mError [{}]\x1b[0m: {}\n", code.as_str(), self);

        if let Some(hint) = suggestion {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a transport error
    pub fn transport(interface: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Transport {
            interface: interface.into(),
            message: message.into(),
        }
    }

    /// Create a handshake rejection
    pub fn handshake_rejected(reason: impl Into<String>) -> Self {
        Error::HandshakeRejected {
            reason: reason.into(),
        }
    }

    /// Create a malformed-frame error
    pub fn malformed(message: impl Into<String>) -> Self {
        Error::ProtocolMalformed {
            message: message.into(),
        }
    }

    /// Create an authentication rejection
    pub fn auth_rejected(worker_id: WorkerId, reason: impl Into<String>) -> Self {
        Error::AuthenticationRejected {
            worker_id,
            reason: reason.into(),
        }
    }

    /// Create a remote call error
    pub fn call_error(message: impl Into<String>) -> Self {
        Error::CallError {
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::ConfigNotFound.as_str(), "E100");
        assert_eq!(ErrorCode::TunnelClosed.as_str(), "E302");
        assert_eq!(ErrorCode::QuorumFailure.as_str(), "E700");
    }

    #[test]
    fn test_error_exit_codes() {
        assert_eq!(ErrorCode::ConfigNotFound.exit_code(), 10);
        assert_eq!(ErrorCode::IoRead.exit_code(), 20);
        assert_eq!(ErrorCode::TunnelClosed.exit_code(), 30);
        assert_eq!(ErrorCode::HandshakeRejected.exit_code(), 40);
        assert_eq!(ErrorCode::CallError.exit_code(), 50);
        assert_eq!(ErrorCode::QuorumFailure.exit_code(), 70);
        assert_eq!(ErrorCode::InternalError.exit_code(), 90);
    }

    #[test]
    fn test_spec_error_kinds_have_codes() {
        assert_eq!(
            Error::handshake_rejected("nobody claimed").code(),
            ErrorCode::HandshakeRejected
        );
        assert_eq!(
            Error::auth_rejected(3, "bad proof").code(),
            ErrorCode::AuthenticationRejected
        );
        assert_eq!(Error::TunnelClosed.code(), ErrorCode::TunnelClosed);
        assert_eq!(Error::call_error("boom").code(), ErrorCode::CallError);
        assert_eq!(
            Error::DuplicateClaim { codes: vec![1, 2] }.code(),
            ErrorCode::DuplicateClaim
        );
        let quorum = Error::QuorumFailure {
            key: "leader".into(),
            acknowledged: 1,
            total: 3,
            required_percent: 60,
        };
        assert_eq!(quorum.code(), ErrorCode::QuorumFailure);
        assert!(quorum.to_string().contains("1/3"));
    }

    #[test]
    fn test_error_retryable() {
        assert!(Error::TunnelClosed.is_retryable());
        assert!(Error::transport("tcp", "refused").is_retryable());
        assert!(!Error::auth_rejected(2, "bad").is_retryable());
        assert!(!Error::ConfigNotFound { path: "/x".into() }.is_retryable());
    }

    #[test]
    fn test_error_fatal() {
        assert!(Error::ConfigNotFound { path: "/x".into() }.is_fatal());
        assert!(!Error::TunnelClosed.is_fatal());
    }

    #[test]
    fn test_format_for_terminal() {
        let err = Error::ConfigNotFound {
            path: "/test/config.toml".into(),
        };
        let formatted = err.format_for_terminal();

        assert!(formatted.contains("E100"));
        assert!(formatted.contains("\x1b[31m"));
        assert!(formatted.contains("Hint"));
    }

    #[test]
    fn test_format_for_log() {
        let formatted = Error::SeedNotImported.format_for_log();
        assert!(formatted.contains("[E801]"));
        assert!(!formatted.contains("\x1b["));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert_eq!(err.code(), ErrorCode::IoNotFound);
    }
}
