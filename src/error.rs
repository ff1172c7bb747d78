//! Error types for the otter node
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - Exit codes for the CLI

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::wire::WireError;

/// Result type alias for node operations
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
    IoAddressInUse = 204,

    // Connection and registry errors (3xx)
    ConnectionFailed = 300,
    ConnectionTimeout = 301,
    RegistryUnavailable = 310,
    RegistryRejected = 311,

    // Protocol errors (4xx)
    ProtocolMalformed = 401,
    FrameTooLarge = 402,
    ReservedKey = 403,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10, // Config errors
            200..=299 => 20, // IO errors
            300..=399 => 30, // Connection errors
            400..=499 => 40, // Protocol errors
            900..=999 => 90, // Internal errors
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for the node
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

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

    /// Listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    // ─────────────────────────────────────────────────────────────
    // Connection / Registry Errors
    // ─────────────────────────────────────────────────────────────

    /// Connection failed
    #[error("Failed to connect to {endpoint}: {message}")]
    ConnectionFailed { endpoint: String, message: String },

    /// Connection timeout
    #[error("Connection to {endpoint} timed out after {timeout_ms}ms")]
    ConnectionTimeout { endpoint: String, timeout_ms: u64 },

    /// Registry could not be reached
    #[error("Registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Registry answered with a non-success status
    #[error("Registry rejected {url} with status {status}: {body}")]
    RegistryRejected {
        url: String,
        status: u16,
        body: String,
    },

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Frame or payload could not be encoded or decoded
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    /// Payload JSON could not be parsed
    #[error("Invalid payload JSON: {0}")]
    Json(#[from] serde_json::Error),

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

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Bind { .. } => ErrorCode::IoAddressInUse,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,

            Error::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            Error::ConnectionTimeout { .. } => ErrorCode::ConnectionTimeout,
            Error::Http(_) => ErrorCode::RegistryUnavailable,
            Error::RegistryRejected { .. } => ErrorCode::RegistryRejected,

            Error::Wire(WireError::FrameTooLarge { .. }) => ErrorCode::FrameTooLarge,
            Error::Wire(WireError::ReservedKey(_)) => ErrorCode::ReservedKey,
            Error::Wire(_) => ErrorCode::ProtocolMalformed,
            Error::Json(_) => ErrorCode::ProtocolMalformed,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout { .. }
                | Error::Http(_)
                | Error::Io(_)
        )
    }

    /// Check if the error is fatal (node should exit)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::Bind { .. }
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
                "Run 'otter-node config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'otter-node config validate' to see details."
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values, or set them via OTTER_* environment variables."
            ),

            Error::Bind { .. } => Some(
                "Another process may be using the port. Change 'listen_port' or use 0 for an ephemeral port."
            ),

            Error::ConnectionFailed { .. } | Error::ConnectionTimeout { .. } => Some(
                "The peer may not be listening yet. Delivery is retried automatically."
            ),
            Error::Http(_) => Some(
                "Check that the registry agent is running and 'registry.url' points at it."
            ),
            Error::RegistryRejected { .. } => Some(
                "The registry refused the request. Check the health-check settings in [registry]."
            ),

            Error::Wire(WireError::ReservedKey(_)) => Some(
                "Rename the variable; '__sender__' carries the sender credentials."
            ),
            Error::Wire(WireError::FrameTooLarge { .. }) => Some(
                "Raise 'receiver.max_frame_bytes' or set it to 0 to accept frames of any size."
            ),
            Error::Json(_) => Some(
                "The payload file must hold a JSON object of strings, numbers, booleans or numeric arrays."
            ),

            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            self.code().as_str(),
            self
        );

        if let Some(hint) = self.suggestion() {
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
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound {
            path: path.into(),
            source: None,
        }
    }

    pub fn config_parse(message: impl Into<String>) -> Self {
        Error::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_validation(message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn connection_failed(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConnectionFailed {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub fn connection_timeout(endpoint: impl Into<String>, timeout_ms: u64) -> Self {
        Error::ConnectionTimeout {
            endpoint: endpoint.into(),
            timeout_ms,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
