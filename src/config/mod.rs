//! Receiver configuration
//!
//! Loaded from a TOML document:
//!
//! ```toml
//! host = "db.internal"
//! username = "reader"
//! password = "secret"
//! database = "employees"
//! collection_interval = "10s"
//!
//! [[db_queries]]
//! query_id = "Q1"
//! query = "Select * from departments"
//!
//! [[db_queries]]
//! query_id = "Q2"
//! query = "Select * from dept_manager"
//! index_column_name = "emp_no"
//! index_column_type = "NUMBER"
//! initial_index_column_start_value = 3
//! ```

pub mod duration;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use checkpoint::CheckpointStorage;
use mysql_records_source::{
    AuthMode, CredentialOpts, CursorType, PoolLimits, QuerySpec, Transport,
};
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::delivery::RetryPolicy;

pub const DEFAULT_COLLECTION_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_DB_WORKERS: usize = 4;
pub const DEFAULT_CONSUME_RETRY_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_CONSUME_MAX_RETRIES: u32 = 20;
pub const DEFAULT_SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Fatal configuration problems, reported at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("invalid query '{query_id}': {reason}")]
    Query { query_id: String, reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Unix,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PasswordType {
    #[default]
    Plaintext,
    Encrypted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationMode {
    #[default]
    Basic,
    IamRdsAuth,
}

/// One entry of `db_queries`, as written in the file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DbQueryConfig {
    #[serde(default)]
    pub query_id: String,
    #[serde(default)]
    pub query: String,
    pub index_column_name: Option<String>,
    pub index_column_type: Option<String>,
    #[serde(default, deserialize_with = "deserialize_cursor_value")]
    pub initial_index_column_start_value: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReceiverConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub username: String,
    pub password: Option<SecretString>,
    #[serde(default)]
    pub password_type: PasswordType,
    pub encrypt_secret_path: Option<PathBuf>,
    #[serde(default)]
    pub authentication_mode: AuthenticationMode,
    pub region: Option<String>,
    pub aws_certificate_path: Option<PathBuf>,
    #[serde(default)]
    pub database: String,

    #[serde(default, deserialize_with = "duration::deserialize")]
    pub conn_max_lifetime: Duration,
    #[serde(default)]
    pub max_open_conns: i64,
    #[serde(default)]
    pub max_idle_conns: i64,

    #[serde(
        default = "default_collection_interval",
        deserialize_with = "duration::deserialize"
    )]
    pub collection_interval: Duration,
    #[serde(default)]
    pub max_db_workers: usize,
    #[serde(
        default = "default_consume_retry_delay",
        deserialize_with = "duration::deserialize"
    )]
    pub consume_retry_delay: Duration,
    #[serde(default = "default_consume_max_retries")]
    pub consume_max_retries: u32,
    #[serde(
        default = "default_shutdown_grace_period",
        deserialize_with = "duration::deserialize"
    )]
    pub shutdown_grace_period: Duration,

    #[serde(default)]
    pub checkpoint_storage: CheckpointStorage,

    #[serde(default)]
    pub db_queries: Vec<DbQueryConfig>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    3306
}

fn default_collection_interval() -> Duration {
    DEFAULT_COLLECTION_INTERVAL
}

fn default_consume_retry_delay() -> Duration {
    DEFAULT_CONSUME_RETRY_DELAY
}

fn default_consume_max_retries() -> u32 {
    DEFAULT_CONSUME_MAX_RETRIES
}

fn default_shutdown_grace_period() -> Duration {
    DEFAULT_SHUTDOWN_GRACE_PERIOD
}

/// Initial cursor values may be written as TOML strings or numbers.
fn deserialize_cursor_value<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Float(f64),
        Text(String),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Int(n) => n.to_string(),
        Raw::Float(f) => f.to_string(),
        Raw::Text(s) => s,
    }))
}

impl ReceiverConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Check the whole configuration and build the query specs.
    ///
    /// Every problem found here is fatal; nothing is deferred to the first
    /// tick.
    pub fn validate(&self) -> Result<Vec<QuerySpec>, ConfigError> {
        if self.username.trim().is_empty() {
            return Err(ConfigError::Invalid("username is required".into()));
        }
        if self.database.trim().is_empty() {
            return Err(ConfigError::Invalid("database is required".into()));
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host is required".into()));
        }

        match self.auth_mode() {
            AuthMode::Plaintext => {}
            AuthMode::Encrypted => {
                if self.password.is_none() {
                    return Err(ConfigError::Invalid(
                        "password_type = \"encrypted\" requires password".into(),
                    ));
                }
                if self.encrypt_secret_path.is_none() {
                    return Err(ConfigError::Invalid(
                        "password_type = \"encrypted\" requires encrypt_secret_path".into(),
                    ));
                }
            }
            AuthMode::IamToken => {
                if self.transport == TransportKind::Unix {
                    return Err(ConfigError::Invalid(
                        "authentication_mode = \"iam_rds_auth\" requires transport = \"tcp\""
                            .into(),
                    ));
                }
                if non_empty(self.region.as_deref()).is_none() {
                    return Err(ConfigError::Invalid(
                        "authentication_mode = \"iam_rds_auth\" requires region".into(),
                    ));
                }
                if self.aws_certificate_path.is_none() {
                    return Err(ConfigError::Invalid(
                        "authentication_mode = \"iam_rds_auth\" requires aws_certificate_path"
                            .into(),
                    ));
                }
            }
        }

        if self.db_queries.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one entry in db_queries is required".into(),
            ));
        }

        let mut seen = HashSet::new();
        let mut specs = Vec::with_capacity(self.db_queries.len());
        for (index, raw) in self.db_queries.iter().enumerate() {
            let spec = raw.to_spec(index)?;
            if !seen.insert(spec.id.clone()) {
                return Err(ConfigError::Query {
                    query_id: spec.id,
                    reason: "query_id is used more than once".into(),
                });
            }
            specs.push(spec);
        }
        Ok(specs)
    }

    /// Combined authentication mode from `authentication_mode` and
    /// `password_type`.
    pub fn auth_mode(&self) -> AuthMode {
        match (self.authentication_mode, self.password_type) {
            (AuthenticationMode::IamRdsAuth, _) => AuthMode::IamToken,
            (AuthenticationMode::Basic, PasswordType::Plaintext) => AuthMode::Plaintext,
            (AuthenticationMode::Basic, PasswordType::Encrypted) => AuthMode::Encrypted,
        }
    }

    pub fn credential_opts(&self) -> CredentialOpts {
        CredentialOpts {
            auth_mode: self.auth_mode(),
            host: self.host.trim().to_string(),
            port: self.port,
            transport: match self.transport {
                TransportKind::Tcp => Transport::Tcp,
                TransportKind::Unix => Transport::Unix,
            },
            username: self.username.trim().to_string(),
            password: self.password.clone(),
            encrypt_secret_path: self.encrypt_secret_path.clone(),
            region: non_empty(self.region.as_deref()).map(str::to_string),
            certificate_path: self.aws_certificate_path.clone(),
            database: self.database.trim().to_string(),
        }
    }

    pub fn pool_limits(&self) -> PoolLimits {
        PoolLimits::new(
            self.conn_max_lifetime,
            self.max_open_conns,
            self.max_idle_conns,
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            delay: self.consume_retry_delay,
            max_retries: self.consume_max_retries,
        }
    }

    pub fn max_db_workers(&self) -> usize {
        if self.max_db_workers == 0 {
            DEFAULT_MAX_DB_WORKERS
        } else {
            self.max_db_workers
        }
    }

    pub fn collection_interval(&self) -> Duration {
        if self.collection_interval.is_zero() {
            DEFAULT_COLLECTION_INTERVAL
        } else {
            self.collection_interval
        }
    }
}

impl DbQueryConfig {
    fn to_spec(&self, index: usize) -> Result<QuerySpec, ConfigError> {
        let query_id = self.query_id.trim();
        if query_id.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "db_queries[{index}] is missing query_id"
            )));
        }
        let invalid = |reason: String| ConfigError::Query {
            query_id: query_id.to_string(),
            reason,
        };

        if self.query.trim().is_empty() {
            return Err(invalid("query text is empty".into()));
        }

        let column = non_empty(self.index_column_name.as_deref());
        let cursor_type = non_empty(self.index_column_type.as_deref());
        match (column, cursor_type) {
            (None, None) => {
                if non_empty(self.initial_index_column_start_value.as_deref()).is_some() {
                    return Err(invalid(
                        "initial_index_column_start_value requires index_column_name".into(),
                    ));
                }
                Ok(QuerySpec::snapshot(query_id, self.query.trim()))
            }
            (Some(_), None) => Err(invalid(
                "index_column_name is set but index_column_type is missing".into(),
            )),
            (None, Some(_)) => Err(invalid(
                "index_column_type is set but index_column_name is missing".into(),
            )),
            (Some(column), Some(cursor_type)) => {
                let cursor_type: CursorType =
                    cursor_type.parse().map_err(|e| invalid(format!("{e}")))?;
                QuerySpec::incremental(
                    query_id,
                    self.query.trim(),
                    column,
                    cursor_type,
                    self.initial_index_column_start_value.clone(),
                )
                .map_err(|e| invalid(format!("{e}")))
            }
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
