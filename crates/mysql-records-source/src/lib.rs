//! MySQL query polling for mysql-records
//!
//! Resolves credentials, owns the connection pool, and turns configured SQL
//! queries into batches of JSON records. Incremental queries resume after a
//! cursor value; snapshot queries return every row on every run.

pub mod cipher;
pub mod connection;
pub mod credentials;
mod error;
pub mod query;
pub mod record;
pub mod testing;

pub use cipher::{decrypt_password, encrypt_password, PasswordCipher};
pub use connection::{ConnectionManager, PoolLimits, QueryRunner, RawResultSet};
pub use credentials::{
    resolve_profile, AuthMode, ConnectionProfile, CredentialOpts, RdsTokenIssuer, TokenIssuer,
    Transport,
};
pub use error::{Error, Result};
pub use query::{rewrite_query, CursorSpec, CursorType, QueryExecutor, QuerySpec};
pub use record::{Batch, Record, NULL_SENTINEL};
