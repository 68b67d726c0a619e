//! MySQL connection management
//!
//! Owns the pooled connection handle built from a [`ConnectionProfile`] and
//! exposes it to the query executor through the [`QueryRunner`] trait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Opts, OptsBuilder, Pool, PoolConstraints, PoolOpts, Row, SslOpts, Value};
use secrecy::ExposeSecret;
use tracing::{debug, error, info};

use crate::credentials::{ConnectionProfile, Transport};
use crate::error::{Error, Result};

pub const DEFAULT_CONN_MAX_LIFETIME: Duration = Duration::from_secs(3 * 60);
pub const DEFAULT_MAX_OPEN_CONNS: usize = 5;
pub const DEFAULT_MAX_IDLE_CONNS: usize = 5;

/// Lifecycle limits for the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    /// Connections older than this are closed when returned to the pool
    pub conn_max_lifetime: Duration,
    pub max_open_conns: usize,
    pub max_idle_conns: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            conn_max_lifetime: DEFAULT_CONN_MAX_LIFETIME,
            max_open_conns: DEFAULT_MAX_OPEN_CONNS,
            max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
        }
    }
}

impl PoolLimits {
    /// Build limits from raw configuration; each zero or negative value
    /// independently falls back to its default.
    pub fn new(conn_max_lifetime: Duration, max_open_conns: i64, max_idle_conns: i64) -> Self {
        let defaults = Self::default();
        Self {
            conn_max_lifetime: if conn_max_lifetime.is_zero() {
                defaults.conn_max_lifetime
            } else {
                conn_max_lifetime
            },
            max_open_conns: usize::try_from(max_open_conns)
                .ok()
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_open_conns),
            max_idle_conns: usize::try_from(max_idle_conns)
                .ok()
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_idle_conns),
        }
    }
}

/// Column names and raw row values of one result set.
///
/// `None` is SQL NULL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<Vec<u8>>>>,
}

/// Executes SQL text and returns the complete result set.
///
/// Implementations must not keep a connection checked out after `fetch`
/// returns.
#[async_trait]
pub trait QueryRunner: Send + Sync {
    async fn fetch(&self, query_id: &str, sql: &str) -> Result<RawResultSet>;

    /// Release pooled resources. Called once when the receiver stops.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Pooled MySQL connections for one receiver.
pub struct ConnectionManager {
    pool: Pool,
    endpoint: String,
    closed: AtomicBool,
    token_expires_at: Option<SystemTime>,
    expiry_reported: AtomicBool,
}

impl ConnectionManager {
    /// Build the pool. No connection is opened until first use.
    pub fn new(profile: &ConnectionProfile, limits: PoolLimits) -> Result<Self> {
        let opts = build_opts(profile, limits)?;
        info!(
            "Created MySQL pool for {} (max_open={}, max_idle={}, max_lifetime={:?})",
            profile.endpoint(),
            limits.max_open_conns,
            limits.max_idle_conns,
            limits.conn_max_lifetime
        );
        Ok(Self {
            pool: Pool::new(opts),
            endpoint: profile.endpoint(),
            closed: AtomicBool::new(false),
            token_expires_at: profile.token_expires_at,
            expiry_reported: AtomicBool::new(false),
        })
    }

    /// Check that a connection can be opened.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| self.connection_error(e))?;
        conn.ping().await.map_err(|e| self.connection_error(e))?;
        debug!("MySQL at {} answered ping", self.endpoint);
        Ok(())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether the IAM token in the profile is no longer accepted at `now`.
    fn token_expired(&self, now: SystemTime) -> bool {
        self.token_expires_at.is_some_and(|at| now >= at)
    }

    /// Wrap a connection failure. Once the startup IAM token has expired no
    /// new connection can authenticate, so that is reported once as fatal.
    fn connection_error(&self, source: mysql_async::Error) -> Error {
        if self.token_expired(SystemTime::now())
            && !self.expiry_reported.swap(true, Ordering::SeqCst)
        {
            error!(
                "IAM authentication token for {} has expired; new connections will be \
                 rejected until the receiver is restarted",
                self.endpoint
            );
        }
        Error::Connection(source)
    }
}

#[async_trait]
impl QueryRunner for ConnectionManager {
    async fn fetch(&self, query_id: &str, sql: &str) -> Result<RawResultSet> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| self.connection_error(e))?;
        let query_error = |source: mysql_async::Error| Error::Query {
            query_id: query_id.to_string(),
            source,
        };

        let mut result = conn.query_iter(sql).await.map_err(query_error)?;
        let columns: Vec<String> = result
            .columns_ref()
            .iter()
            .map(|column| column.name_str().into_owned())
            .collect();
        let rows: Vec<Row> = result.collect().await.map_err(query_error)?;

        let rows = rows
            .iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| row.as_ref(i).and_then(raw_bytes))
                    .collect()
            })
            .collect();

        Ok(RawResultSet { columns, rows })
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pool
            .clone()
            .disconnect()
            .await
            .map_err(Error::Connection)?;
        info!("Closed MySQL pool for {}", self.endpoint);
        Ok(())
    }
}

/// Text-protocol values arrive as bytes; anything else is rendered the way
/// the server would print it.
fn raw_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::NULL => None,
        Value::Bytes(bytes) => Some(bytes.clone()),
        other => Some(other.as_sql(true).trim_matches('\'').as_bytes().to_vec()),
    }
}

fn build_opts(profile: &ConnectionProfile, limits: PoolLimits) -> Result<Opts> {
    let max = limits.max_open_conns;
    let min = limits.max_idle_conns.min(max);
    let constraints = PoolConstraints::new(min, max).ok_or_else(|| {
        Error::Config(format!("invalid pool constraints: idle={min}, open={max}"))
    })?;
    let pool_opts = PoolOpts::default()
        .with_constraints(constraints)
        .with_abs_conn_ttl(Some(limits.conn_max_lifetime));

    let mut builder = OptsBuilder::default()
        .user(Some(profile.username.clone()))
        .pass(Some(profile.secret().expose_secret().to_string()))
        .db_name(Some(profile.database.clone()))
        .pool_opts(pool_opts);

    builder = match profile.transport {
        Transport::Tcp => builder
            .ip_or_hostname(profile.host.clone())
            .tcp_port(profile.port),
        Transport::Unix => builder.socket(Some(profile.host.clone())),
    };

    if let Some(tls) = &profile.tls {
        let ssl_opts = SslOpts::default().with_root_certs(vec![tls.root_pem.clone().into()]);
        builder = builder
            .ssl_opts(Some(ssl_opts))
            .enable_cleartext_plugin(true);
    }

    Ok(builder.into())
}
