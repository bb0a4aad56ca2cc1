use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use quicmux::config::LogFormat;
use quicmux::prelude::*;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "quicmuxd")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Overrides `logging.level` from the configuration
    #[arg(short, long)]
    log_level: Option<String>,

    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a routing-only endpoint until Ctrl-C
    Serve {
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// Validate the configuration and print it
    CheckConfig,

    /// Print the ALPN token negotiated for a QUIC version
    Alpn {
        /// Version number, decimal or 0x-prefixed hex
        version: String,
    },
}

/// Used when no TLS backend is linked: every Initial is refused, so the
/// endpoint only negotiates versions and answers with stateless resets
struct NoTlsBackend;

impl ConnectionFactory for NoTlsBackend {
    fn new_connection(
        &self,
        remote_addr: SocketAddr,
        _version: QuicVersion,
        _original_destination: &ConnectionId,
    ) -> quicmux::Result<ConnectionParts> {
        Err(QuicError::Config(format!(
            "no TLS backend linked, refusing connection from {}",
            remote_addr
        )))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = QuicConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    init_logging(&config);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.endpoint.bind_address = bind;
            }
            serve(config).await?;
        }
        Commands::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Alpn { version } => {
            let version = QuicVersion::new(parse_version(&version)?);
            match quicmux::version_to_alpn(version) {
                Some(alpn) => println!("{}", alpn),
                None => bail!("no application protocol for version {}", version),
            }
        }
    }

    Ok(())
}

fn init_logging(config: &QuicConfig) {
    let filter = LevelFilter::from_level(config.tracing_level());
    match config.logging.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(filter)
            .init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().compact())
            .with(filter)
            .init(),
    }
}

fn parse_version(input: &str) -> Result<u32> {
    let parsed = match input.strip_prefix("0x").or_else(|| input.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => input.parse(),
    };
    parsed.with_context(|| format!("invalid version {:?}", input))
}

async fn serve(config: QuicConfig) -> Result<()> {
    info!("quicmuxd v{} starting", env!("CARGO_PKG_VERSION"));

    let endpoint = Endpoint::server(config, Arc::new(NoTlsBackend)).await?;
    info!("Serving on {}", endpoint.local_addr());

    let mut report = tokio::time::interval(Duration::from_secs(60));
    report.tick().await;

    let incoming = endpoint.incoming();
    tokio::pin!(incoming);

    loop {
        tokio::select! {
            Some(conn) = incoming.next() => {
                info!(conn = %conn.trace_id(), "Connection from {} ready", conn.remote_addr());
                tokio::spawn(async move {
                    let reason = conn.closed().await;
                    info!(conn = %conn.trace_id(), "Connection closed: {}", reason);
                });
            }
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for Ctrl-C")?;
                break;
            }
            _ = report.tick() => {
                let stats = endpoint.stats();
                info!(
                    received = stats.datagrams_received,
                    dropped = stats.datagrams_dropped,
                    version_negotiations = stats.version_negotiations_sent,
                    stateless_resets = stats.stateless_resets_sent,
                    refused = stats.connections_refused,
                    "Endpoint statistics"
                );
            }
        }
    }

    info!("Shutting down");
    endpoint.close(ConnectionError::Shutdown("daemon stopped".to_string()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("1").unwrap(), 1);
        assert_eq!(parse_version("0x6b3343cf").unwrap(), 0x6b3343cf);
        assert!(parse_version("v1").is_err());
    }
}
