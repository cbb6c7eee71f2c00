//! hpkv-cli - Command-line interface for HPKV
//!
//! Provides both a REPL and one-shot command execution.

mod commands;
mod repl;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use commands::{Context, Records};
use hpkv_client::{ChannelConfig, Client, RestClient, TlsClientConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hpkv-cli")]
#[command(about = "Command-line interface for the HPKV key-value service")]
#[command(version)]
struct Cli {
    /// Service base URL (e.g. https://api-eu-1.hpkv.io)
    #[arg(short = 'u', long, env = "HPKV_BASE_URL")]
    base_url: String,

    /// API key
    #[arg(short = 'a', long, env = "HPKV_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Transport used for get/set/update/delete
    #[arg(long, value_enum, default_value_t = Transport::Ws)]
    transport: Transport,

    /// Request timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    // ===== TLS Options (WebSocket) =====
    /// Path to CA certificate for server verification
    #[arg(long, env = "HPKV_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Path to client certificate (for mTLS)
    #[arg(long, env = "HPKV_CLIENT_CERT")]
    client_cert: Option<PathBuf>,

    /// Path to client private key (for mTLS)
    #[arg(long, env = "HPKV_CLIENT_KEY")]
    client_key: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE)
    #[arg(long, short = 'k')]
    insecure: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Transport {
    /// Correlated WebSocket channel
    Ws,
    /// REST API
    Rest,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start interactive REPL
    Repl,

    /// Read a record
    Get {
        key: String,
    },

    /// Create or replace a record
    Set {
        key: String,

        /// Value: JSON, plain text, or @file to read from file
        value: String,
    },

    /// Update a record
    Update {
        key: String,

        /// Value: JSON, plain text, or @file to read from file
        value: String,

        /// Merge the JSON fields into the stored value instead of replacing it
        #[arg(short, long)]
        partial: bool,
    },

    /// Delete a record
    Delete {
        key: String,
    },

    /// Atomically increment a numeric record (created at 0 if missing)
    Incr {
        key: String,

        /// Amount to add (may be negative)
        #[arg(default_value = "1", allow_hyphen_values = true)]
        by: i64,
    },

    /// List records with keys in [start, end]
    Range {
        start: String,
        end: String,

        /// Maximum records to return
        #[arg(short, long)]
        limit: Option<u32>,
    },

    /// Issue a WebSocket token subscribed to the given keys
    Token {
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Print change notifications for the given keys until Ctrl+C
    Watch {
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Walk through create, read, partial update, and delete of a sample record
    Demo,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let timeout = Duration::from_secs(cli.timeout);

    // Build TLS config if any TLS option is set
    let tls_config = if cli.ca_cert.is_some() || cli.client_cert.is_some() || cli.insecure {
        let mut tls = TlsClientConfig::new();
        if let Some(ref path) = cli.ca_cert {
            tls = tls.with_ca_cert(path);
        }
        if let (Some(cert), Some(key)) = (&cli.client_cert, &cli.client_key) {
            tls = tls.with_client_cert(cert, key);
        } else if cli.client_cert.is_some() || cli.client_key.is_some() {
            eprintln!(
                "{}: --client-cert and --client-key must be used together",
                "Error".red()
            );
            std::process::exit(1);
        }
        if cli.insecure {
            tls = tls.with_insecure();
        }
        Some(tls)
    } else {
        None
    };

    let rest = match RestClient::with_timeout(&cli.base_url, cli.api_key.clone(), timeout) {
        Ok(rest) => rest,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    };

    let records = match cli.transport {
        Transport::Ws => {
            let mut config = ChannelConfig::new(cli.base_url.clone(), cli.api_key.clone())
                .with_connect_timeout(timeout)
                .with_request_timeout(timeout);
            if let Some(tls) = tls_config.clone() {
                config = config.with_tls(tls);
            }
            Records::Ws(Client::new(config))
        }
        Transport::Rest => Records::Rest(rest.clone()),
    };

    let ctx = Context {
        base_url: cli.base_url,
        timeout,
        tls: tls_config,
        records,
        rest,
    };

    // Handle commands
    match cli.command {
        Some(Commands::Repl) | None => {
            repl::run(&ctx).await?;
        }
        Some(Commands::Watch { keys }) => {
            if let Err(e) = commands::watch(&ctx, &keys).await {
                eprintln!("{}: {}", "Error".red(), e);
                std::process::exit(1);
            }
        }
        Some(cmd) => {
            // WebSocket connections open lazily on the first request
            let result = commands::execute(&ctx, cmd).await;
            ctx.records.close().await;

            match result {
                Ok(output) => {
                    println!("{}", output);
                }
                Err(e) => {
                    eprintln!("{}: {}", "Error".red(), e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
