//! Command-line interface for mysql-records
//!
//! # Usage Examples
//!
//! ```bash
//! # Check a configuration file and show the SQL each query runs first
//! mysql-records validate --config receiver.toml
//!
//! # Poll on the configured interval, writing JSON lines to stdout
//! RUST_LOG=info mysql-records run --config receiver.toml
//!
//! # Encrypt a password for password_type = "encrypted"
//! MYSQL_RECORDS_PASSWORD=hunter2 mysql-records encrypt-password \
//!   --secret-path /etc/mysql-records/secret
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use mysql_records::{JsonLinesConsumer, Receiver, ReceiverConfig, ShutdownStatus};
use mysql_records_source::{encrypt_password, rewrite_query};
use tracing::info;

/// Exit code reported when stopped by SIGINT/SIGTERM
const EXIT_SIGNALLED: i32 = 130;

#[derive(Parser)]
#[command(name = "mysql-records")]
#[command(about = "Poll MySQL queries and emit new rows as JSON records")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start polling and write records to stdout as JSON lines
    Run {
        /// Path to the TOML configuration file
        #[arg(long, env = "MYSQL_RECORDS_CONFIG")]
        config: PathBuf,
    },

    /// Validate a configuration file and print the query plan
    Validate {
        /// Path to the TOML configuration file
        #[arg(long, env = "MYSQL_RECORDS_CONFIG")]
        config: PathBuf,
    },

    /// Encrypt a database password with the key in a secret file
    EncryptPassword {
        /// File holding the 24-byte encryption secret
        #[arg(long)]
        secret_path: PathBuf,

        /// Password to encrypt
        #[arg(long, env = "MYSQL_RECORDS_PASSWORD", hide_env_values = true)]
        password: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match run().await {
        Ok(Some(code)) => std::process::exit(code),
        Ok(None) => Ok(()),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run() -> anyhow::Result<Option<i32>> {
    // Logs go to stderr; stdout carries the records
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config = ReceiverConfig::from_file(&config)
                .with_context(|| format!("Failed to load config from {config:?}"))?;
            let consumer = Arc::new(JsonLinesConsumer::new(tokio::io::stdout()));
            let receiver = Receiver::start(&config, consumer).await?;

            wait_for_signal().await?;
            let status = receiver.shutdown().await;
            if status == ShutdownStatus::Aborted {
                info!("Shutdown grace period expired before polling finished");
            }
            Ok(Some(EXIT_SIGNALLED))
        }
        Commands::Validate { config } => {
            let config = ReceiverConfig::from_file(&config)
                .with_context(|| format!("Failed to load config from {config:?}"))?;
            let queries = config.validate()?;

            println!(
                "{} ({} authentication), {} queries every {:?}",
                config.credential_opts().endpoint(),
                config.auth_mode(),
                queries.len(),
                config.collection_interval()
            );
            for spec in &queries {
                let kind = match &spec.cursor {
                    None => "snapshot".to_string(),
                    Some(cursor) => format!("incremental on {} ({})", cursor.column, cursor.cursor_type),
                };
                let sql = rewrite_query(spec, None)?;
                println!("  {}: {kind}\n    {sql}", spec.id);
            }
            Ok(None)
        }
        Commands::EncryptPassword {
            secret_path,
            password,
        } => {
            let ciphertext = encrypt_password(&password, &secret_path)?;
            println!("{ciphertext}");
            Ok(None)
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Received interrupt signal (Ctrl+C)");
        }
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received interrupt signal (Ctrl+C)");
    Ok(())
}
