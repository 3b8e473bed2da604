//! Connection profile and pool status models.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// SSL mode for database connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    /// No SSL
    Disable,
    /// Use SSL if available (default)
    #[default]
    Prefer,
    /// Require SSL, accept any certificate
    Require,
    /// Require SSL, verify CA
    VerifyCa,
    /// Require SSL, verify CA and hostname
    VerifyFull,
}

impl SslMode {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Prefer => "prefer",
            Self::Require => "require",
            Self::VerifyCa => "verify-ca",
            Self::VerifyFull => "verify-full",
        }
    }

    /// Parse from string representation.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "disable" => Self::Disable,
            "require" => Self::Require,
            "verify-ca" | "verify_ca" => Self::VerifyCa,
            "verify-full" | "verify_full" => Self::VerifyFull,
            _ => Self::Prefer,
        }
    }
}

/// SSH authentication method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SshAuthMethod {
    /// Private key authentication
    Key,
    /// Password authentication
    Password,
    /// SSH agent authentication
    #[default]
    Agent,
}

/// SSH tunnel descriptor.
///
/// The tunnel itself is established outside the query core; a profile that carries one is
/// expected to be routed through the forwarded local endpoint
/// (see `PgConnectorFactory::route_through`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshTunnelConfig {
    /// SSH server hostname
    pub host: String,
    /// SSH server port (default 22)
    pub port: u16,
    /// SSH username
    pub username: String,
    /// Authentication method
    pub auth_method: SshAuthMethod,
    /// Path to private key (required if auth_method = Key)
    pub key_path: Option<PathBuf>,
}

impl SshTunnelConfig {
    /// Create a new SSH tunnel descriptor using agent authentication.
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            auth_method: SshAuthMethod::Agent,
            key_path: None,
        }
    }

    /// Set key-based authentication.
    pub fn with_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.auth_method = SshAuthMethod::Key;
        self.key_path = Some(key_path.into());
        self
    }
}

/// Additional per-profile options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Connection timeout in seconds
    pub connect_timeout_secs: u32,
    /// Statement timeout in seconds (None = engine default)
    pub statement_timeout_secs: Option<u32>,
    /// Open sessions with `default_transaction_read_only`
    pub read_only: bool,
    /// Application name sent to PostgreSQL
    pub application_name: String,
    /// Pool capacity for this profile (None = engine default)
    pub pool_size: Option<usize>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            statement_timeout_secs: None,
            read_only: false,
            application_name: "Tusk".to_string(),
            pool_size: None,
        }
    }
}

/// Immutable identity of a database server to connect to.
///
/// Passwords are never part of a profile; they are resolved through the
/// `CredentialService` when a pool is first created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    /// Unique identifier
    pub id: Uuid,
    /// Display name (1-255 chars)
    pub name: String,
    /// Server hostname or IP
    pub host: String,
    /// Server port (default 5432)
    pub port: u16,
    /// Database name (1-63 chars)
    pub database: String,
    /// Login username
    pub username: String,
    /// SSL configuration
    pub ssl_mode: SslMode,
    /// Optional SSH tunnel descriptor
    pub ssh_tunnel: Option<SshTunnelConfig>,
    /// Additional options
    pub options: ConnectionOptions,
}

impl ConnectionProfile {
    /// Create a new profile with required fields.
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        database: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            host: host.into(),
            port: 5432,
            database: database.into(),
            username: username.into(),
            ssl_mode: SslMode::default(),
            ssh_tunnel: None,
            options: ConnectionOptions::default(),
        }
    }

    /// Create a builder for complex profiles.
    pub fn builder() -> ConnectionProfileBuilder {
        ConnectionProfileBuilder::default()
    }

    /// Validate the profile.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() || self.name.len() > 255 {
            return Err("Name must be 1-255 characters".to_string());
        }
        if self.host.is_empty() {
            return Err("Host is required".to_string());
        }
        if self.database.is_empty() || self.database.len() > 63 {
            return Err("Database name must be 1-63 characters".to_string());
        }
        if self.username.is_empty() {
            return Err("Username is required".to_string());
        }
        if self.options.pool_size == Some(0) {
            return Err("Pool size must be at least 1".to_string());
        }
        if let Some(ref tunnel) = self.ssh_tunnel {
            if tunnel.auth_method == SshAuthMethod::Key && tunnel.key_path.is_none() {
                return Err("Key path is required for key-based SSH authentication".to_string());
            }
        }
        Ok(())
    }

    /// Get the display connection string (without password).
    pub fn display_url(&self) -> String {
        format!("postgresql://{}@{}:{}/{}", self.username, self.host, self.port, self.database)
    }
}

/// Builder for ConnectionProfile.
#[derive(Debug, Default)]
pub struct ConnectionProfileBuilder {
    name: Option<String>,
    host: Option<String>,
    port: u16,
    database: Option<String>,
    username: Option<String>,
    ssl_mode: SslMode,
    ssh_tunnel: Option<SshTunnelConfig>,
    options: ConnectionOptions,
}

impl ConnectionProfileBuilder {
    /// Set the profile name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the database name.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the username.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the SSL mode.
    pub fn ssl_mode(mut self, ssl_mode: SslMode) -> Self {
        self.ssl_mode = ssl_mode;
        self
    }

    /// Set the SSH tunnel descriptor.
    pub fn ssh_tunnel(mut self, tunnel: SshTunnelConfig) -> Self {
        self.ssh_tunnel = Some(tunnel);
        self
    }

    /// Set the statement timeout.
    pub fn statement_timeout_secs(mut self, secs: u32) -> Self {
        self.options.statement_timeout_secs = Some(secs);
        self
    }

    /// Set read-only mode.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.options.read_only = read_only;
        self
    }

    /// Set the pool capacity for this profile.
    pub fn pool_size(mut self, size: usize) -> Self {
        self.options.pool_size = Some(size);
        self
    }

    /// Build the profile.
    pub fn build(self) -> Result<ConnectionProfile, String> {
        let profile = ConnectionProfile {
            id: Uuid::new_v4(),
            name: self.name.ok_or("Name is required")?,
            host: self.host.ok_or("Host is required")?,
            port: if self.port == 0 { 5432 } else { self.port },
            database: self.database.ok_or("Database is required")?,
            username: self.username.ok_or("Username is required")?,
            ssl_mode: self.ssl_mode,
            ssh_tunnel: self.ssh_tunnel,
            options: self.options,
        };
        profile.validate()?;
        Ok(profile)
    }
}

/// Connection pool status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Maximum pool capacity
    pub max_size: usize,
    /// Current connections (idle + leased)
    pub size: usize,
    /// Idle connections
    pub available: usize,
    /// Tasks waiting for connections
    pub waiting: usize,
}

impl PoolStatus {
    /// Check if the pool is healthy.
    pub fn is_healthy(&self) -> bool {
        self.waiting == 0
    }

    /// Get the number of leased connections.
    pub fn leased(&self) -> usize {
        self.size.saturating_sub(self.available)
    }

    /// Get pool utilization as a percentage.
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            (self.leased() as f64 / self.max_size as f64) * 100.0
        }
    }
}
