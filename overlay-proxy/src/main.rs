// overlay-proxy: local HTTP proxy onto overlay sites and content bags.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use overlay_core::PublicKey;
use overlay_proxy::config;
use overlay_proxy::directory::{StaticDirectory, StaticNameService};
use overlay_proxy::local_storage::LocalStorage;
use overlay_proxy::tcp::TcpConnector;
use overlay_proxy::{HostResolver, OrderedPieceAssembler, ProxyState, SiteRegistry, Transport};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "overlay-proxy", version, about = "HTTP proxy onto overlay sites and bags")]
struct Cli {
    /// Config file (TOML). Defaults to ~/.config/overlay-proxy/config.toml, then /etc.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Listen address, overriding the config file.
    #[arg(short, long)]
    addr: Option<String>,
    /// Log verbosity: 0 error .. 4 trace. RUST_LOG wins when set.
    #[arg(short, long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(0..=4))]
    verbosity: u8,
    /// Serve overlay hosts only; refuse clear-web requests.
    #[arg(long)]
    no_http: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbosity);

    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(addr) = cli.addr {
        cfg.listen_addr = addr;
    }
    if cli.no_http {
        cfg.block_http = true;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let directory = StaticDirectory::from_config(&cfg.peers)?;
    let names = StaticNameService::from_config(&cfg.sites)?;
    let storage = LocalStorage::from_config(&cfg.bags)?;
    let local_key = PublicKey::from_bytes(rand::random());
    let connector = TcpConnector::new(local_key, cfg.transport.connect_timeout());

    let shutdown = CancellationToken::new();
    let resolver = HostResolver::new(
        Arc::new(directory),
        Arc::new(names),
        cfg.transport.resolver(),
    );
    let session_config = cfg.transport.session();
    let stream_buffer = session_config.stream_buffer;
    let registry = Arc::new(SiteRegistry::new(
        resolver,
        Arc::new(connector),
        Arc::new(storage),
        session_config,
        cfg.transport.registry(),
        shutdown.clone(),
    ));
    let reaper = registry.spawn_reaper();
    let transport = Arc::new(Transport::new(
        registry.clone(),
        OrderedPieceAssembler::new(stream_buffer),
    ));
    let state = ProxyState::new(transport, cfg.block_http, cfg.version_tag.clone())
        .context("http client")?
        .with_stream_buffer(stream_buffer);

    let listener = TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("bind {}", cfg.listen_addr))?;
    info!(
        addr = %cfg.listen_addr,
        block_http = cfg.block_http,
        sites = cfg.sites.len(),
        peers = cfg.peers.len(),
        bags = cfg.bags.len(),
        "overlay-proxy started"
    );

    let server = tokio::spawn(overlay_proxy::run_proxy(
        listener,
        Arc::new(state),
        shutdown.clone(),
    ));
    shutdown_signal().await?;
    info!("shutting down");
    shutdown.cancel();

    match server.await {
        Ok(Err(e)) => warn!(error = %e, "proxy loop failed"),
        Err(e) => warn!(error = %e, "proxy task panicked"),
        Ok(Ok(())) => {}
    }
    let _ = reaper.await;
    registry.close_all().await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
