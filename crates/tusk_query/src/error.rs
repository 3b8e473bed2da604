//! Error types for the Tusk query core.
//!
//! Every failure an execution can hit surfaces as one of these variants, delivered to the
//! consumer inside the terminal `QueryEvent::Error`.

use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Why an execution was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller asked for the execution to stop.
    Requested,
    /// The configured statement timeout elapsed.
    StatementTimeout,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("cancelled by user"),
            Self::StatementTimeout => f.write_str("statement timeout exceeded"),
        }
    }
}

/// Main error type for the query core.
#[derive(Debug, Error)]
pub enum TuskError {
    /// Connection could not be established, or was lost mid-execution.
    #[error("Connection error: {message}")]
    Connection {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Credential resolution or server authentication failed.
    #[error("Authentication error: {message}")]
    Authentication {
        /// Human-readable error message. Never contains secret material.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
    },

    /// SSL/TLS setup error.
    #[error("SSL error: {message}")]
    Ssl {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Server-reported SQL error with PostgreSQL-specific details.
    #[error("{message}")]
    Query {
        /// PostgreSQL error message.
        message: String,
        /// Additional detail from PostgreSQL.
        detail: Option<String>,
        /// PostgreSQL hint.
        hint: Option<String>,
        /// Position in the statement (1-indexed).
        position: Option<usize>,
        /// SQLSTATE code (e.g., "42P01").
        code: Option<String>,
    },

    /// Execution was terminated by a cancellation request.
    #[error("Query cancelled: {reason}")]
    QueryCancelled {
        /// ID of the cancelled execution.
        query_id: Uuid,
        /// What triggered the cancellation.
        reason: CancelReason,
    },

    /// No pooled connection became available within the wait bound.
    #[error("Pool timeout: {message}")]
    PoolTimeout {
        /// Human-readable error message.
        message: String,
        /// Number of tasks waiting for connections when the wait expired.
        waiting: usize,
    },

    /// OS keychain error.
    #[error("Keyring error: {message}")]
    Keyring {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
    },

    /// Local file error (credentials file, config file, log directory).
    #[error("Storage error: {message}")]
    Storage {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Invalid configuration.
    #[error("Config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
    },

    /// Unexpected internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl TuskError {
    // ========== Constructors ==========

    /// Create a new connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Create a new connection error with source.
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
            hint: Some("Check username and password".to_string()),
        }
    }

    /// Create a new authentication error with custom hint.
    pub fn authentication_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Authentication { message: message.into(), hint: Some(hint.into()) }
    }

    /// Create a new SSL error with source.
    pub fn ssl_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Ssl { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new query error with full PostgreSQL details.
    pub fn query(
        message: impl Into<String>,
        detail: Option<String>,
        hint: Option<String>,
        position: Option<usize>,
        code: Option<String>,
    ) -> Self {
        Self::Query { message: message.into(), detail, hint, position, code }
    }

    /// Create a query cancelled error.
    pub fn query_cancelled(query_id: Uuid, reason: CancelReason) -> Self {
        Self::QueryCancelled { query_id, reason }
    }

    /// Create a new pool timeout error.
    pub fn pool_timeout(message: impl Into<String>, waiting: usize) -> Self {
        Self::PoolTimeout { message: message.into(), waiting }
    }

    /// Create a new storage error.
    pub fn storage(message: impl Into<String>, hint: Option<&str>) -> Self {
        Self::Storage { message: message.into(), hint: hint.map(String::from), source: None }
    }

    /// Create a new keyring error.
    pub fn keyring(message: impl Into<String>, hint: Option<&str>) -> Self {
        Self::Keyring { message: message.into(), hint: hint.map(String::from) }
    }

    /// Create a new config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    // ========== Methods ==========

    /// Check if this error represents a cancelled execution.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::QueryCancelled { .. })
    }

    /// Check if this error means the server session can no longer be trusted.
    ///
    /// A connection that produced such an error is discarded instead of returned to the pool.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Ssl { .. })
    }

    /// Get the cancellation reason, if this is a cancellation.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        match self {
            Self::QueryCancelled { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "Connection",
            Self::Authentication { .. } => "Authentication",
            Self::Ssl { .. } => "SSL",
            Self::Query { .. } => "Query",
            Self::QueryCancelled { .. } => "Query Cancelled",
            Self::PoolTimeout { .. } => "Pool",
            Self::Keyring { .. } => "Keyring",
            Self::Storage { .. } => "Storage",
            Self::Config { .. } => "Config",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Get actionable hint for the user.
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::Connection { .. } => {
                Some("Check that the database server is running and reachable".to_string())
            }
            Self::Authentication { hint, .. } => hint.clone(),
            Self::Ssl { .. } => Some("Verify SSL certificate configuration".to_string()),
            Self::Query { hint: Some(hint), .. } => Some(hint.clone()),
            Self::Query { code: Some(code), .. } => hint_for_pg_code(code).map(String::from),
            Self::Query { .. } => None,
            Self::QueryCancelled { .. } => None,
            Self::PoolTimeout { waiting, .. } => Some(format!(
                "{waiting} queries waiting for a connection. \
                 Wait for running queries to finish or close unused tabs"
            )),
            Self::Keyring { hint, .. } => hint.clone(),
            Self::Storage { hint, .. } => hint.clone(),
            Self::Config { .. } => {
                Some("Check the configuration file and TUSK_* variables".to_string())
            }
            Self::Internal { .. } => Some("Please report this issue".to_string()),
        }
    }

    /// Get PostgreSQL error code (if applicable).
    pub fn pg_code(&self) -> Option<&str> {
        match self {
            Self::Query { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Get position in the statement (if applicable).
    pub fn position(&self) -> Option<usize> {
        match self {
            Self::Query { position, .. } => *position,
            _ => None,
        }
    }

    /// Whether retrying (by the caller) can reasonably succeed.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Storage { .. } | Self::Config { .. } | Self::Internal { .. })
    }

    /// Convert to user-displayable error info.
    pub fn to_error_info(&self) -> ErrorInfo {
        let error_type = match self {
            Self::QueryCancelled { .. } => self.category().to_string(),
            _ => format!("{} Error", self.category()),
        };

        let technical_detail = match self {
            Self::Query { detail, code, position, .. } => {
                let mut parts = Vec::new();
                if let Some(code) = code {
                    parts.push(format!("Code: {code}"));
                }
                if let Some(pos) = position {
                    parts.push(format!("Position: {pos}"));
                }
                if let Some(detail) = detail {
                    parts.push(format!("Detail: {detail}"));
                }
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join("\n"))
                }
            }
            Self::PoolTimeout { waiting, .. } => {
                Some(format!("{waiting} tasks waiting for connections"))
            }
            Self::Connection { source: Some(source), .. } => Some(source.to_string()),
            _ => None,
        };

        ErrorInfo {
            error_type,
            message: self.to_string(),
            hint: self.hint(),
            technical_detail,
            code: self.pg_code().map(String::from),
            position: self.position(),
            recoverable: self.is_recoverable(),
        }
    }
}

/// User-displayable error information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Category name (e.g., "Connection Error").
    pub error_type: String,
    /// User-friendly message.
    pub message: String,
    /// Actionable suggestion.
    pub hint: Option<String>,
    /// Technical detail for "Show Details" expansion.
    pub technical_detail: Option<String>,
    /// SQLSTATE code, for server errors.
    pub code: Option<String>,
    /// 1-based position in the statement, for server errors.
    pub position: Option<usize>,
    /// Whether the caller may retry.
    pub recoverable: bool,
}

/// Actionable hint for common PostgreSQL error codes.
///
/// See <https://www.postgresql.org/docs/current/errcodes-appendix.html>.
pub fn hint_for_pg_code(code: &str) -> Option<&'static str> {
    match code {
        "28P01" => Some("Password authentication failed. Verify your password is correct"),
        "28000" => Some("Authentication failed. Check username and permissions"),
        "3D000" => Some("Database does not exist. Check the database name"),
        "3F000" => Some("Schema does not exist. Check the schema name"),
        "42601" => Some("SQL syntax error. Check your query syntax near the reported position"),
        "42501" => Some("Permission denied. You may not have the required privileges"),
        "42P01" => Some("Table does not exist. Check the table name and schema"),
        "42703" => Some("Column does not exist. Check column names in your query"),
        "42883" => Some("Function does not exist. Check the function name and argument types"),
        "53300" => Some("Too many connections. The server reached its connection limit"),
        "57014" => Some("Query was cancelled before it finished"),
        "57P01" => Some("Server is shutting down. Try reconnecting later"),
        "25006" => Some("The connection is read-only. Disable read-only mode to modify data"),
        _ => None,
    }
}

// ========== Error Conversions ==========

/// Convert from tokio_postgres::Error to TuskError.
impl From<tokio_postgres::Error> for TuskError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let message = db_err.message().to_string();
            let detail = db_err.detail().map(String::from);
            let hint = db_err.hint().map(String::from);
            let position = db_err.position().and_then(|p| match p {
                tokio_postgres::error::ErrorPosition::Original(pos) => Some(*pos as usize),
                tokio_postgres::error::ErrorPosition::Internal { .. } => None,
            });
            let code = db_err.code().code().to_string();

            return match code.as_str() {
                "28P01" | "28000" => TuskError::Authentication {
                    message,
                    hint: hint_for_pg_code(&code).map(String::from),
                },
                // Connection exceptions and operator-initiated session termination
                _ if code.starts_with("08") || code.starts_with("57P0") => {
                    TuskError::Connection { message, source: Some(Box::new(err)) }
                }
                _ => TuskError::Query {
                    message,
                    detail,
                    hint,
                    position,
                    code: Some(code),
                },
            };
        }

        if err.is_closed() {
            return TuskError::Connection {
                message: "Connection to server lost".to_string(),
                source: Some(Box::new(err)),
            };
        }

        TuskError::Connection { message: err.to_string(), source: Some(Box::new(err)) }
    }
}

/// Convert from std::io::Error to TuskError.
impl From<std::io::Error> for TuskError {
    fn from(err: std::io::Error) -> Self {
        TuskError::Storage {
            message: err.to_string(),
            hint: Some("Check file permissions and disk space".to_string()),
            source: Some(Box::new(err)),
        }
    }
}

/// Convert from serde_json::Error to TuskError.
impl From<serde_json::Error> for TuskError {
    fn from(err: serde_json::Error) -> Self {
        TuskError::Storage {
            message: format!("JSON error: {err}"),
            hint: Some("Data may be corrupted".to_string()),
            source: Some(Box::new(err)),
        }
    }
}

/// Convert from keyring::Error to TuskError.
impl From<keyring::Error> for TuskError {
    fn from(err: keyring::Error) -> Self {
        let hint = match &err {
            keyring::Error::NoStorageAccess(_) => {
                "Grant Tusk access to your keychain in system settings"
            }
            keyring::Error::PlatformFailure(_) => {
                "Your system keychain is unavailable. \
                 Check that the keychain service is running in this session"
            }
            _ => "Try deleting and re-saving the credential",
        };
        TuskError::Keyring { message: err.to_string(), hint: Some(hint.to_string()) }
    }
}
