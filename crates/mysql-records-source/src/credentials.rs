//! Credential resolution
//!
//! Turns the configured authentication mode into an immutable
//! [`ConnectionProfile`]. Three modes are supported:
//!
//! 1. `Plaintext` - the configured password is used as-is
//! 2. `Encrypted` - the configured password is ciphertext produced by
//!    [`crate::cipher::encrypt_password`] and is decrypted once here
//! 3. `IamToken` - a short-lived RDS IAM token is minted and used as the
//!    password, over TLS rooted in the configured certificate bundle
//!
//! See <https://docs.aws.amazon.com/AmazonRDS/latest/UserGuide/UsingWithRDS.IAMDBAuth.html>.

use std::fmt;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::Credentials;
use aws_sigv4::http_request::{
    sign, SignableBody, SignableRequest, SignatureLocation, SigningSettings,
};
use aws_sigv4::sign::v4;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::cipher::PasswordCipher;
use crate::error::{Error, Result};

/// Lifetime requested for RDS IAM tokens (the service maximum).
pub const IAM_TOKEN_LIFETIME: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Plaintext,
    Encrypted,
    IamToken,
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthMode::Plaintext => "plaintext",
            AuthMode::Encrypted => "encrypted",
            AuthMode::IamToken => "iam-token",
        })
    }
}

/// How the server is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Transport {
    #[default]
    Tcp,
    /// `host` is the path of a unix domain socket
    Unix,
}

/// Configured inputs for credential resolution.
#[derive(Debug)]
pub struct CredentialOpts {
    pub auth_mode: AuthMode,
    pub host: String,
    pub port: u16,
    pub transport: Transport,
    pub username: String,
    /// Plaintext password, or ciphertext in `Encrypted` mode
    pub password: Option<SecretString>,
    /// Key file for `Encrypted` mode; in `Plaintext` mode its presence makes
    /// the resolver log the ciphertext for the configured password
    pub encrypt_secret_path: Option<PathBuf>,
    pub region: Option<String>,
    /// PEM bundle trusted for IAM connections
    pub certificate_path: Option<PathBuf>,
    pub database: String,
}

impl CredentialOpts {
    /// `host:port`, or the socket path for unix transport.
    pub fn endpoint(&self) -> String {
        match self.transport {
            Transport::Tcp => format!("{}:{}", self.host, self.port),
            Transport::Unix => self.host.clone(),
        }
    }
}

/// Root certificates for the server's TLS chain.
#[derive(Clone)]
pub struct TlsMaterial {
    /// File the bundle was read from
    pub source: PathBuf,
    /// PEM contents, handed to the driver as its root store
    pub root_pem: Vec<u8>,
    /// Number of certificates found in the bundle
    pub cert_count: usize,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("source", &self.source)
            .field("cert_count", &self.cert_count)
            .finish()
    }
}

/// Resolved, immutable connection parameters.
///
/// Built once at startup; `Debug` never prints the secret.
pub struct ConnectionProfile {
    pub auth_mode: AuthMode,
    pub host: String,
    pub port: u16,
    pub transport: Transport,
    pub username: String,
    pub database: String,
    pub(crate) secret: SecretString,
    pub tls: Option<TlsMaterial>,
    /// When the IAM token stops being accepted for new connections
    pub token_expires_at: Option<SystemTime>,
}

impl ConnectionProfile {
    /// Password, decrypted password, or IAM token.
    pub fn secret(&self) -> &SecretString {
        &self.secret
    }

    pub fn endpoint(&self) -> String {
        match self.transport {
            Transport::Tcp => format!("{}:{}", self.host, self.port),
            Transport::Unix => self.host.clone(),
        }
    }
}

impl fmt::Debug for ConnectionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProfile")
            .field("auth_mode", &self.auth_mode)
            .field("endpoint", &self.endpoint())
            .field("transport", &self.transport)
            .field("username", &self.username)
            .field("database", &self.database)
            .field("secret", &"[REDACTED]")
            .field("tls", &self.tls)
            .field("token_expires_at", &self.token_expires_at)
            .finish()
    }
}

/// Issues short-lived database authentication tokens.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue_token(&self, endpoint: &str, region: &str, username: &str)
        -> Result<SecretString>;
}

/// Mints RDS IAM tokens from the ambient AWS credential chain
/// (environment, profile, instance role, ...).
#[derive(Debug, Default)]
pub struct RdsTokenIssuer;

impl RdsTokenIssuer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TokenIssuer for RdsTokenIssuer {
    async fn issue_token(
        &self,
        endpoint: &str,
        region: &str,
        username: &str,
    ) -> Result<SecretString> {
        let sdk_config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        let provider = sdk_config.credentials_provider().ok_or_else(|| {
            Error::TokenIssuanceFailed("no AWS credentials provider is configured".into())
        })?;
        let credentials = provider
            .provide_credentials()
            .await
            .map_err(|e| Error::TokenIssuanceFailed(format!("loading AWS credentials: {e}")))?;

        let token = presign_rds_token(endpoint, region, username, &credentials, SystemTime::now())?;
        debug!("Issued IAM authentication token for {username}@{endpoint}");
        Ok(token)
    }
}

/// Presign `https://<endpoint>/?Action=connect&DBUser=<user>` for `rds-db`
/// and return it without the scheme, which is the token RDS accepts as the
/// password.
pub fn presign_rds_token(
    endpoint: &str,
    region: &str,
    username: &str,
    credentials: &Credentials,
    now: SystemTime,
) -> Result<SecretString> {
    let identity = credentials.clone().into();

    let mut settings = SigningSettings::default();
    settings.expires_in = Some(IAM_TOKEN_LIFETIME);
    settings.signature_location = SignatureLocation::QueryParams;

    let params = v4::SigningParams::builder()
        .identity(&identity)
        .region(region)
        .name("rds-db")
        .time(now)
        .settings(settings)
        .build()
        .map_err(|e| Error::TokenIssuanceFailed(format!("signing parameters: {e}")))?;

    let mut url = url::Url::parse(&format!("https://{endpoint}/"))
        .map_err(|e| Error::TokenIssuanceFailed(format!("invalid endpoint '{endpoint}': {e}")))?;
    url.query_pairs_mut()
        .append_pair("Action", "connect")
        .append_pair("DBUser", username);

    let request = SignableRequest::new(
        "GET",
        url.as_str(),
        std::iter::empty(),
        SignableBody::Bytes(&[]),
    )
    .map_err(|e| Error::TokenIssuanceFailed(format!("building request: {e}")))?;

    let (instructions, _signature) = sign(request, &params.into())
        .map_err(|e| Error::TokenIssuanceFailed(format!("signing request: {e}")))?
        .into_parts();
    for (name, value) in instructions.params() {
        url.query_pairs_mut().append_pair(name, &value);
    }

    Ok(SecretString::from(
        url.as_str().trim_start_matches("https://").to_string(),
    ))
}

/// Read and check the PEM bundle used to verify the server certificate.
pub fn load_trust_store(path: &Path) -> Result<TlsMaterial> {
    let invalid = |reason: String| Error::TrustStoreInvalid {
        path: path.to_path_buf(),
        reason,
    };

    let root_pem = std::fs::read(path).map_err(|e| invalid(e.to_string()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(root_pem.as_slice()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| invalid(format!("failed to parse PEM: {e}")))?;
    if certs.is_empty() {
        return Err(invalid("no certificates found in PEM data".into()));
    }

    Ok(TlsMaterial {
        source: path.to_path_buf(),
        root_pem,
        cert_count: certs.len(),
    })
}

/// Build the connection profile for the configured authentication mode.
pub async fn resolve_profile(
    opts: &CredentialOpts,
    issuer: &dyn TokenIssuer,
) -> Result<ConnectionProfile> {
    if opts.auth_mode == AuthMode::Plaintext {
        if let Some(path) = &opts.encrypt_secret_path {
            log_encryption_hint(opts.password.as_ref(), path);
        }
    }

    let (secret, tls, token_expires_at) = match opts.auth_mode {
        AuthMode::Plaintext => (
            opts.password
                .clone()
                .unwrap_or_else(|| SecretString::from(String::new())),
            None,
            None,
        ),
        AuthMode::Encrypted => {
            let ciphertext = opts.password.as_ref().ok_or_else(|| {
                Error::Config("encrypted password mode requires a password".into())
            })?;
            let path = opts.encrypt_secret_path.as_ref().ok_or_else(|| {
                Error::Config("encrypted password mode requires encrypt_secret_path".into())
            })?;
            let cipher = PasswordCipher::from_secret_file(path)?;
            (cipher.decrypt(ciphertext.expose_secret())?, None, None)
        }
        AuthMode::IamToken => {
            if opts.transport == Transport::Unix {
                return Err(Error::Config(
                    "IAM authentication requires tcp transport".into(),
                ));
            }
            let region = opts.region.as_deref().ok_or_else(|| {
                Error::Config("IAM authentication requires a region".into())
            })?;
            let cert_path = opts.certificate_path.as_ref().ok_or_else(|| {
                Error::Config("IAM authentication requires aws_certificate_path".into())
            })?;
            let tls = load_trust_store(cert_path)?;
            let issued_at = SystemTime::now();
            let token = issuer
                .issue_token(&opts.endpoint(), region, &opts.username)
                .await?;
            (token, Some(tls), Some(issued_at + IAM_TOKEN_LIFETIME))
        }
    };

    info!(
        "Resolved {} credentials for {}@{}",
        opts.auth_mode,
        opts.username,
        opts.endpoint()
    );

    Ok(ConnectionProfile {
        auth_mode: opts.auth_mode,
        host: opts.host.clone(),
        port: opts.port,
        transport: opts.transport,
        username: opts.username.clone(),
        database: opts.database.clone(),
        secret,
        tls,
        token_expires_at,
    })
}

/// Log the ciphertext the operator can paste into the config to switch to
/// `encrypted` mode. Never fails.
fn log_encryption_hint(password: Option<&SecretString>, secret_path: &Path) {
    let Some(password) = password else {
        return;
    };
    match crate::cipher::encrypt_password(password.expose_secret(), secret_path) {
        Ok(ciphertext) => debug!(
            encrypted_password = %ciphertext,
            "The plaintext password can be replaced with this encrypted password"
        ),
        Err(e) => warn!("Could not compute encrypted password hint: {e}"),
    }
}
