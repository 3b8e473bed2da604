//! Service layer of the query engine.
//!
//! - `session` - seams between the engine and a database backend
//! - `postgres` - the PostgreSQL backend on tokio-postgres
//! - `connection` - per-profile session pooling on deadpool
//! - `query` - the execution coordinator
//! - `channel` - bounded event delivery to the consumer
//! - `cancellation` - registry of in-flight executions
//! - `credentials` - password resolution from keychain, file or memory
//! - `profiles` - lookup of connection profiles

pub mod cancellation;
pub mod channel;
pub mod connection;
pub mod credentials;
pub mod postgres;
pub mod profiles;
pub mod query;
pub mod session;

pub use cancellation::ExecutionRegistry;
pub use channel::{event_channel, EventSink, QueryStream};
pub use connection::{ConnectionPool, PoolLimits, PooledConnection, ReleaseHealth};
pub use credentials::{CredentialBackend, CredentialService, Credentials, CredentialsProvider};
pub use postgres::{PgConnector, PgConnectorFactory};
pub use profiles::{InMemoryProfileStore, ProfileStore};
pub use query::QueryService;
pub use session::{Connector, ConnectorFactory, Session};
