//! PostgreSQL backend for the session seams, built on deadpool-postgres and tokio-postgres.

use crate::error::TuskError;
use crate::models::{ColumnInfo, ConnectionProfile, Row, SslMode};
use crate::services::credentials::Credentials;
use crate::services::session::{
    Connector, ConnectorFactory, ResultStream, ServerCancel, ServerMessage, Session,
};

use async_trait::async_trait;
use chrono::Utc;
use deadpool_postgres::{ClientWrapper, ManagerConfig, RecyclingMethod};
use futures_util::{stream, StreamExt};
use native_tls::TlsConnector;
use parking_lot::RwLock;
use postgres_native_tls::MakeTlsConnector;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::{FromSql, Kind, ToSql, Type};
use tokio_postgres::{CancelToken, NoTls};
use uuid::Uuid;

/// TLS setup shared by a connector and the cancel requests of its sessions.
#[derive(Clone)]
enum TlsMode {
    Plain,
    Native(MakeTlsConnector),
}

impl TlsMode {
    fn for_ssl_mode(ssl_mode: SslMode) -> Result<Self, TuskError> {
        let mut builder = TlsConnector::builder();
        match ssl_mode {
            SslMode::Disable => return Ok(Self::Plain),
            // Prefer and Require encrypt without verifying the certificate chain
            SslMode::Prefer | SslMode::Require => {
                builder.danger_accept_invalid_certs(true);
            }
            SslMode::VerifyCa => {
                builder.danger_accept_invalid_hostnames(true);
            }
            SslMode::VerifyFull => {}
        }
        let connector = builder
            .build()
            .map_err(|e| TuskError::ssl_with_source("Failed to create TLS connector", e))?;
        Ok(Self::Native(MakeTlsConnector::new(connector)))
    }
}

/// Opens sessions for one profile through a deadpool-postgres manager.
pub struct PgConnector {
    manager: deadpool_postgres::Manager,
    tls: TlsMode,
    profile_id: Uuid,
}

impl PgConnector {
    /// Build a connector for `profile`, optionally routed through a forwarded endpoint.
    pub fn new(
        profile: &ConnectionProfile,
        credentials: &Credentials,
        endpoint: Option<(&str, u16)>,
    ) -> Result<Self, TuskError> {
        let pg_config = Self::pg_config(profile, credentials, endpoint);
        let tls = TlsMode::for_ssl_mode(profile.ssl_mode)?;
        let manager_config = ManagerConfig { recycling_method: RecyclingMethod::Fast };

        let manager = match &tls {
            TlsMode::Plain => {
                deadpool_postgres::Manager::from_config(pg_config, NoTls, manager_config)
            }
            TlsMode::Native(connector) => deadpool_postgres::Manager::from_config(
                pg_config,
                connector.clone(),
                manager_config,
            ),
        };

        Ok(Self { manager, tls, profile_id: profile.id })
    }

    fn pg_config(
        profile: &ConnectionProfile,
        credentials: &Credentials,
        endpoint: Option<(&str, u16)>,
    ) -> tokio_postgres::Config {
        let (host, port) = endpoint.unwrap_or((&profile.host, profile.port));

        let mut pg_config = tokio_postgres::Config::new();
        pg_config.host(host);
        pg_config.port(port);
        pg_config.dbname(&profile.database);
        pg_config.user(&credentials.username);
        if let Some(password) = credentials.password.as_deref() {
            pg_config.password(password);
        }
        pg_config.application_name(&profile.options.application_name);
        let connect_timeout = u64::from(profile.options.connect_timeout_secs);
        pg_config.connect_timeout(Duration::from_secs(connect_timeout));
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(60));
        pg_config.ssl_mode(match profile.ssl_mode {
            SslMode::Disable => tokio_postgres::config::SslMode::Disable,
            SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
            SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => {
                tokio_postgres::config::SslMode::Require
            }
        });
        if profile.options.read_only {
            pg_config.options("-c default_transaction_read_only=on");
        }
        pg_config
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self) -> Result<Box<dyn Session>, TuskError> {
        let client = deadpool::managed::Manager::create(&self.manager).await?;
        tracing::debug!(profile_id = %self.profile_id, "Opened PostgreSQL session");
        Ok(Box::new(PgSession { client, tls: self.tls.clone() }))
    }
}

/// A tokio-postgres client leased through the pool.
pub struct PgSession {
    client: ClientWrapper,
    tls: TlsMode,
}

#[async_trait]
impl Session for PgSession {
    async fn execute<'a>(&'a mut self, sql: &'a str) -> Result<ResultStream<'a>, TuskError> {
        let statement = self.client.prepare(sql).await?;
        let columns = statement
            .columns()
            .iter()
            .map(|col| ColumnInfo {
                name: col.name().to_string(),
                type_oid: col.type_().oid(),
                type_name: col.type_().name().to_string(),
            })
            .collect();

        let rows = self
            .client
            .query_raw(&statement, std::iter::empty::<&(dyn ToSql + Sync)>())
            .await?;

        let messages = stream::unfold(Some(Box::pin(rows)), |state| async move {
            let mut rows = state?;
            match rows.next().await {
                Some(Ok(row)) => Some((Ok(ServerMessage::Row(row_to_json(&row))), Some(rows))),
                Some(Err(e)) => Some((Err(TuskError::from(e)), None)),
                None => {
                    let done = ServerMessage::Done { rows_affected: rows.rows_affected() };
                    Some((Ok(done), None))
                }
            }
        })
        .boxed();

        Ok(ResultStream { columns, messages })
    }

    async fn ping(&mut self) -> Result<(), TuskError> {
        self.client.simple_query("").await?;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    fn cancel_handle(&self) -> Box<dyn ServerCancel> {
        Box::new(PgCancel { token: self.client.cancel_token(), tls: self.tls.clone() })
    }
}

struct PgCancel {
    token: CancelToken,
    tls: TlsMode,
}

#[async_trait]
impl ServerCancel for PgCancel {
    async fn cancel(&self) -> Result<(), TuskError> {
        match &self.tls {
            TlsMode::Plain => self.token.cancel_query(NoTls).await?,
            TlsMode::Native(connector) => self.token.cancel_query(connector.clone()).await?,
        }
        Ok(())
    }
}

/// Creates `PgConnector`s, honoring endpoint overrides registered by the application.
///
/// An SSH tunnel is established outside the query core; once its local port is known, call
/// [`route_through`](Self::route_through) before the profile's first execution.
#[derive(Default)]
pub struct PgConnectorFactory {
    routes: RwLock<HashMap<Uuid, (String, u16)>>,
}

impl PgConnectorFactory {
    /// Create a factory with no endpoint overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect `profile_id` through `host:port` instead of the profile's own endpoint.
    pub fn route_through(&self, profile_id: Uuid, host: impl Into<String>, port: u16) {
        self.routes.write().insert(profile_id, (host.into(), port));
    }

    /// Remove an endpoint override. Returns whether one existed.
    pub fn clear_route(&self, profile_id: &Uuid) -> bool {
        self.routes.write().remove(profile_id).is_some()
    }

    /// Current override for a profile.
    pub fn route(&self, profile_id: &Uuid) -> Option<(String, u16)> {
        self.routes.read().get(profile_id).cloned()
    }
}

impl ConnectorFactory for PgConnectorFactory {
    fn connector(
        &self,
        profile: &ConnectionProfile,
        credentials: &Credentials,
    ) -> Result<Arc<dyn Connector>, TuskError> {
        let route = self.route(&profile.id);
        if let Some((host, port)) = &route {
            tracing::debug!(
                profile_id = %profile.id,
                %host,
                port,
                "Routing through forwarded endpoint"
            );
        } else if profile.ssh_tunnel.is_some() {
            tracing::warn!(
                profile_id = %profile.id,
                "Profile has an SSH tunnel but no forwarded endpoint; connecting directly"
            );
        }

        let endpoint = route.as_ref().map(|(host, port)| (host.as_str(), *port));
        Ok(Arc::new(PgConnector::new(profile, credentials, endpoint)?))
    }
}

/// NUMERIC in its exact decimal text form.
struct NumericText(String);

impl<'a> FromSql<'a> for NumericText {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        decode_numeric(raw).map(NumericText).ok_or_else(|| "invalid numeric value".into())
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Raw bytes of any value, for types without a dedicated conversion.
struct RawValue(Vec<u8>);

impl<'a> FromSql<'a> for RawValue {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(RawValue(raw.to_vec()))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// Decode the binary NUMERIC representation: ndigits, weight, sign, dscale, then base-10000
/// digit groups.
fn decode_numeric(raw: &[u8]) -> Option<String> {
    let word = |i: usize| raw.get(i..i + 2).map(|b| u16::from_be_bytes([b[0], b[1]]));

    let ndigits = usize::from(word(0)?);
    let weight = word(2)? as i16 as i32;
    let sign = word(4)?;
    let dscale = usize::from(word(6)?);

    match sign {
        0xC000 => return Some("NaN".to_string()),
        0xD000 => return Some("Infinity".to_string()),
        0xF000 => return Some("-Infinity".to_string()),
        _ => {}
    }

    let digits = (0..ndigits).map(|i| word(8 + i * 2)).collect::<Option<Vec<u16>>>()?;
    let digit = |i: i32| if i < 0 { 0 } else { digits.get(i as usize).copied().unwrap_or(0) };

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&digit(0).to_string());
        for i in 1..=weight {
            out.push_str(&format!("{:04}", digit(i)));
        }
    }

    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut i = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", digit(i)));
            i += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }

    Some(out)
}

/// Convert a row into JSON values, one per column.
pub(crate) fn row_to_json(row: &tokio_postgres::Row) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| {
            let ty = col.type_();
            match *ty {
                Type::BOOL => json_or_null(row.try_get::<_, Option<bool>>(i), JsonValue::Bool),
                Type::INT2 => json_or_null(row.try_get::<_, Option<i16>>(i), |v| v.into()),
                Type::INT4 => json_or_null(row.try_get::<_, Option<i32>>(i), |v| v.into()),
                Type::INT8 => json_or_null(row.try_get::<_, Option<i64>>(i), |v| v.into()),
                Type::OID => json_or_null(row.try_get::<_, Option<u32>>(i), |v| v.into()),
                Type::FLOAT4 => json_or_null(row.try_get::<_, Option<f32>>(i), |v| {
                    serde_json::Number::from_f64(f64::from(v))
                        .map(JsonValue::Number)
                        .unwrap_or_else(|| JsonValue::String(v.to_string()))
                }),
                Type::FLOAT8 => json_or_null(row.try_get::<_, Option<f64>>(i), |v| {
                    serde_json::Number::from_f64(v)
                        .map(JsonValue::Number)
                        .unwrap_or_else(|| JsonValue::String(v.to_string()))
                }),
                Type::NUMERIC => json_or_null(row.try_get::<_, Option<NumericText>>(i), |v| {
                    JsonValue::String(v.0)
                }),
                Type::UUID => json_or_null(row.try_get::<_, Option<Uuid>>(i), |v| {
                    JsonValue::String(v.to_string())
                }),
                Type::JSON | Type::JSONB => {
                    json_or_null(row.try_get::<_, Option<JsonValue>>(i), |v| v)
                }
                Type::TIMESTAMPTZ => {
                    json_or_null(row.try_get::<_, Option<chrono::DateTime<Utc>>>(i), |v| {
                        JsonValue::String(v.to_rfc3339())
                    })
                }
                Type::TIMESTAMP => {
                    json_or_null(row.try_get::<_, Option<chrono::NaiveDateTime>>(i), |v| {
                        JsonValue::String(v.to_string())
                    })
                }
                Type::DATE => json_or_null(row.try_get::<_, Option<chrono::NaiveDate>>(i), |v| {
                    JsonValue::String(v.to_string())
                }),
                Type::TIME => json_or_null(row.try_get::<_, Option<chrono::NaiveTime>>(i), |v| {
                    JsonValue::String(v.to_string())
                }),
                Type::INT4_ARRAY => {
                    json_or_null(row.try_get::<_, Option<Vec<Option<i32>>>>(i), json_array)
                }
                Type::INT8_ARRAY => {
                    json_or_null(row.try_get::<_, Option<Vec<Option<i64>>>>(i), json_array)
                }
                Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => {
                    json_or_null(row.try_get::<_, Option<Vec<Option<String>>>>(i), json_array)
                }
                Type::BYTEA => json_or_null(row.try_get::<_, Option<Vec<u8>>>(i), |v| {
                    let hex: String = v.iter().map(|b| format!("{b:02x}")).collect();
                    JsonValue::String(format!("\\x{hex}"))
                }),
                _ if <String as FromSql<'_>>::accepts(ty) => {
                    json_or_null(row.try_get::<_, Option<String>>(i), JsonValue::String)
                }
                _ => json_or_null(row.try_get::<_, Option<RawValue>>(i), |v| match ty.kind() {
                    Kind::Enum(_) => JsonValue::String(String::from_utf8_lossy(&v.0).into_owned()),
                    _ => JsonValue::String(format!("<{}>", ty.name())),
                }),
            }
        })
        .collect()
}

fn json_array<T: Into<JsonValue>>(values: Vec<Option<T>>) -> JsonValue {
    JsonValue::Array(values.into_iter().map(|v| v.map_or(JsonValue::Null, Into::into)).collect())
}

fn json_or_null<T>(
    value: Result<Option<T>, tokio_postgres::Error>,
    convert: impl FnOnce(T) -> JsonValue,
) -> JsonValue {
    match value {
        Ok(Some(v)) => convert(v),
        Ok(None) => JsonValue::Null,
        Err(e) => {
            tracing::trace!(error = %e, "Column conversion failed");
            JsonValue::Null
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(ndigits: u16, weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut raw = Vec::new();
        let header = [ndigits, weight as u16, sign, dscale];
        for word in header.into_iter().chain(digits.iter().copied()) {
            raw.extend_from_slice(&word.to_be_bytes());
        }
        raw
    }

    #[test]
    fn test_decode_numeric() {
        // 12345.678
        let raw = numeric(3, 1, 0x0000, 3, &[1, 2345, 6780]);
        assert_eq!(decode_numeric(&raw).as_deref(), Some("12345.678"));

        // -0.05
        let raw = numeric(1, -1, 0x4000, 2, &[500]);
        assert_eq!(decode_numeric(&raw).as_deref(), Some("-0.05"));

        // 0.00005
        let raw = numeric(1, -2, 0x0000, 5, &[5000]);
        assert_eq!(decode_numeric(&raw).as_deref(), Some("0.00005"));

        // 20000 (trailing zero groups are not stored)
        let raw = numeric(1, 1, 0x0000, 0, &[2]);
        assert_eq!(decode_numeric(&raw).as_deref(), Some("20000"));

        let raw = numeric(0, 0, 0xC000, 0, &[]);
        assert_eq!(decode_numeric(&raw).as_deref(), Some("NaN"));

        assert_eq!(decode_numeric(&[0, 1]), None);
    }

    #[test]
    fn test_route_through_overrides_endpoint() {
        let factory = PgConnectorFactory::new();
        let id = Uuid::new_v4();
        assert!(factory.route(&id).is_none());

        factory.route_through(id, "127.0.0.1", 54_321);
        assert_eq!(factory.route(&id), Some(("127.0.0.1".to_string(), 54_321)));
        assert!(factory.clear_route(&id));
        assert!(!factory.clear_route(&id));
    }

    #[test]
    fn test_read_only_profile_sets_session_option() {
        let mut profile = ConnectionProfile::new("ro", "db.local", "app", "reader");
        profile.options.read_only = true;
        let credentials = Credentials::new("reader", None);

        let config = PgConnector::pg_config(&profile, &credentials, Some(("127.0.0.1", 6000)));
        assert_eq!(config.get_options(), Some("-c default_transaction_read_only=on"));
        assert_eq!(config.get_ports(), &[6000]);
        assert_eq!(config.get_user(), Some("reader"));
        assert!(config.get_password().is_none());
    }
}
