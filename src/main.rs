use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::signal;
use tracing::info;

use hickory_server::ServerFuture;
use warden_dns::api;
use warden_dns::config::Config;
use warden_dns::metrics::Metrics;
use warden_dns::resolver::{
    chain_configuration, BlockingResolver, CnameResolver, Resolver, UpstreamResolver,
};
use warden_dns::server::DnsHandler;

#[tokio::main]
async fn main() -> Result<()> {
    // Load config before logging init to get the level.
    let config_path = std::env::args().nth(1).unwrap_or("config.toml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        Config::load(&config_path).await?
    } else {
        Config::default()
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let mut filter = config.log_level.clone();

        // Suppress hickory logs unless explicitly enabled/overridden
        if !filter.contains("hickory_server") {
            filter.push_str(",hickory_server=off");
        }
        if !filter.contains("hickory_proto") {
            filter.push_str(",hickory_proto=off");
        }

        tracing_subscriber::EnvFilter::new(filter)
    });

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    info!("Starting warden-dns...");

    if !std::path::Path::new(&config_path).exists() {
        info!("Config file not found, using defaults.");
    }

    let metrics = Metrics::new(config.metrics.enable);

    // Build the chain bottom-up: upstream <- blocking <- cname. The blocking
    // stage populates its list caches before the server starts serving.
    let upstream = config
        .upstream
        .first()
        .cloned()
        .context("no upstream configured")?;
    let upstream_stage = Box::new(UpstreamResolver::new(upstream));
    let blocking_stage = BlockingResolver::new(config.blocking.clone(), &metrics, upstream_stage)
        .await
        .context("invalid blocking configuration")?;
    let blocking_status = blocking_stage.status();
    let chain: Arc<dyn Resolver> =
        Arc::new(CnameResolver::new(config.cname.clone(), Box::new(blocking_stage)));

    for line in chain_configuration(chain.as_ref()) {
        info!("{line}");
    }

    // Control API
    let api_status = blocking_status.clone();
    let api_metrics = metrics.clone();
    let api_port = config.api.port;
    tokio::spawn(async move {
        if let Err(err) = api::serve(api_status, api_metrics, api_port).await {
            tracing::error!("control API failed: {err:#}");
        }
    });

    // DNS server
    let handler = DnsHandler::new(chain);
    let mut server = ServerFuture::new(handler);

    let addr = SocketAddr::new(config.host.parse().context("invalid bind host")?, config.port);

    server.register_socket(UdpSocket::bind(addr).await?);
    server.register_listener(TcpListener::bind(addr).await?, Duration::from_secs(5));

    info!("DNS server listening on {addr}");

    tokio::select! {
        _ = server.block_until_done() => {},
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received.");
        }
    }

    Ok(())
}
