//! tapwire: command-line forward proxy.
//!
//! Thin binary over the library: parses flags, installs a tracing
//! subscriber, and serves the proxy until Ctrl-C. TLS interception needs
//! a certificate-minting backend and is only available through the
//! library API.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tapwire::proxy::Proxy;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// HTTP/1.x forward proxy.
#[derive(Parser, Debug)]
#[command(name = "tapwire")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on.
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Idle timeout between requests on one connection, in seconds.
    #[arg(long, default_value_t = 300)]
    timeout: u64,

    /// Downstream proxy URL to chain through (e.g. http://proxy:3128).
    #[arg(long, value_name = "URL")]
    downstream_proxy: Option<String>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let mut proxy = Proxy::new();
    proxy.set_timeout(Duration::from_secs(cli.timeout));
    if let Some(url) = &cli.downstream_proxy {
        let url = url
            .parse()
            .with_context(|| format!("invalid downstream proxy URL: {}", url))?;
        proxy.set_downstream_proxy(Some(url));
    }

    let listener = TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen))?;
    info!("proxy listening on {}", listener.local_addr()?);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal.cancel();
        }
    });

    proxy
        .serve(listener, shutdown)
        .await
        .context("proxy server failed")
}

/// Initialize the tracing subscriber for stderr logging.
fn init_tracing(verbose: u8) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {}", e))?;

    Ok(())
}
