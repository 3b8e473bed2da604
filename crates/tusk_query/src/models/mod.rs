//! Data models for the Tusk query core.
//!
//! - `profile` - ConnectionProfile, SslMode, SshTunnelConfig, PoolStatus
//! - `query` - QueryHandle, QueryEvent, QueryType, ColumnInfo

pub mod profile;
pub mod query;

pub use profile::{
    ConnectionOptions, ConnectionProfile, ConnectionProfileBuilder, PoolStatus, SshAuthMethod,
    SshTunnelConfig, SslMode,
};
pub use query::{ColumnInfo, QueryEvent, QueryHandle, QueryType, Row};
