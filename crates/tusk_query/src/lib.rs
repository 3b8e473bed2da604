//! Query execution core for the Tusk PostgreSQL client.
//!
//! This crate runs SQL on behalf of the UI without ever blocking it:
//!
//! - **engine**: `QueryEngine`, the entry point for executing, cancelling and observing pools
//! - **services**: Session pooling, the execution coordinator, credentials and the PostgreSQL
//!   backend
//! - **models**: Connection profiles, query handles and the event protocol
//! - **config**: Pool and execution tuning, from defaults, a JSON file and the environment
//! - **error**: Error handling with PostgreSQL-specific details
//! - **logging**: Structured logging setup

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;

#[cfg(test)]
mod testing;

pub use config::{EngineConfig, ExecutionSettings, PoolSettings};
pub use engine::QueryEngine;
pub use error::{CancelReason, ErrorInfo, TuskError};
pub use models::{
    ColumnInfo, ConnectionOptions, ConnectionProfile, PoolStatus, QueryEvent, QueryHandle,
    QueryType, Row, SshAuthMethod, SshTunnelConfig, SslMode,
};
pub use services::{
    CredentialBackend, CredentialService, InMemoryProfileStore, PgConnectorFactory, ProfileStore,
    QueryStream,
};
