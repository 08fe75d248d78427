use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fortify::acme::{AcmeSettings, CertificateResolver, ChallengeContext};
use fortify::config::Config;
use fortify::server::{Handler, NotFoundHandler, PlainHttpServer, TlsServer};

#[derive(Parser, Debug)]
#[command(name = "fortify-serve")]
#[command(author, version, about = "TLS server with automatic ACME certificate management", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "fortify.toml")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config).await;

    let log_level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting fortify-serve v{}", env!("CARGO_PKG_VERSION"));

    if config.acme.tls_hosts.is_empty() {
        anyhow::bail!("no tls_hosts configured — refusing to start with an empty admission policy");
    }

    fortify::util::ensure_dir(&config.acme.cache_dir)
        .await
        .context("creating ACME cache directory")?;

    let settings = AcmeSettings {
        email: config.acme.email.clone(),
        directory_url: config.acme.acme_directory_url.clone(),
        cache_dir: config.acme.cache_dir.clone(),
        hosts: config.acme.tls_hosts.clone(),
    };
    let resolver = Arc::new(
        CertificateResolver::new(settings)
            .await
            .context("initializing certificate resolver")?,
    );

    let handler: Arc<dyn Handler> = Arc::new(NotFoundHandler);
    let challenge_ctx = ChallengeContext {
        store: resolver.challenges.clone(),
        account_key: resolver.account_key_slot.clone(),
    };

    let tls_addr: SocketAddr = config
        .server
        .tls_bind
        .parse()
        .with_context(|| format!("invalid tls_bind address: {}", config.server.tls_bind))?;
    let http_addr: SocketAddr = config
        .server
        .http_bind
        .parse()
        .with_context(|| format!("invalid http_bind address: {}", config.server.http_bind))?;

    let tls_server = TlsServer::new(resolver.clone(), handler.clone(), tls_addr);
    let http_server = PlainHttpServer::new(handler.clone(), challenge_ctx, http_addr);

    let tls_task = tokio::spawn(async move {
        if let Err(e) = tls_server.run().await {
            tracing::error!(error = %e, "TLS listener error");
        }
    });
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run().await {
            tracing::error!(error = %e, "plain HTTP listener error");
        }
    });

    tracing::info!(addr = %tls_addr, "TLS listener starting");
    tracing::info!(addr = %http_addr, "plain HTTP (ACME challenge) listener starting");

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
        _ = tls_task => {
            tracing::error!("TLS listener exited unexpectedly");
        }
        _ = http_task => {
            tracing::error!("plain HTTP listener exited unexpectedly");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
