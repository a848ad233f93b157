use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use switchyard::certs::{
    AcmeConfig, AcmeIssuer, AlpnChallenges, AutomationConfig, CertificateCache, CertificateIssuer,
    CertificateManager, LocalCaIssuer, MemoryCertificateCache, PgCertificateCache,
};
use switchyard::config::{IssuanceAuthority, ResolvedConfig, ResolvedDiscovery, RouterConfig};
use switchyard::discovery::{Discovery, HttpDiscovery, StaticDiscovery};
use switchyard::store::{MemoryRouteStore, PgRouteStore, RouteStore};
use switchyard::{HttpPlane, HttpPlaneConfig, Router, SyncConfig, TcpPlane, TcpPlaneConfig};

/// Bound on one automated certificate lookup + issuance
const ISSUANCE_TIMEOUT: Duration = Duration::from_secs(30);

/// ACME orders wait on the authority validating the challenge
const ACME_ISSUANCE_TIMEOUT: Duration = Duration::from_secs(120);

/// Data-plane router - proxies HTTP(S) by host and TCP by port
#[derive(Parser, Debug)]
#[command(name = "switchyard")]
#[command(about = "Host-based HTTP(S) and port-based TCP router with live route sync")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "switchyard.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install crypto provider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("switchyard=info".parse()?)
                .add_directive("switchyard_common=info".parse()?),
        )
        .init();

    let args = Args::parse();
    tracing::info!("Starting router with config: {}", args.config);

    let config = RouterConfig::load_and_resolve(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    tracing::info!("HTTP addresses: {:?}", config.http_addrs);
    tracing::info!("HTTPS addresses: {:?}", config.https_addrs);
    tracing::info!(
        "TCP port range: {}-{} on {}",
        config.tcp_port_range.0,
        config.tcp_port_range.1,
        config.tcp_ip
    );

    let (store, cert_cache) = open_store(&config).await?;
    let discovery = build_discovery(&config)?;
    let certs = Arc::new(build_certificates(&config, cert_cache)?);

    let mut http_config = HttpPlaneConfig::new(config.cookie_key);
    http_config.addrs = config.http_addrs.clone();
    http_config.tls_addrs = config.https_addrs.clone();
    http_config.proxy_protocol = config.proxy_protocol;
    http_config.drain_timeout = config.drain_timeout;
    http_config.sync = SyncConfig::default();
    let http_plane = HttpPlane::new(http_config, store.clone(), discovery.clone(), certs);

    let tcp_config = TcpPlaneConfig {
        ip: config.tcp_ip,
        port_range: config.tcp_port_range,
        reserved: config.reserved_ports(),
        proxy_protocol: config.proxy_protocol,
        drain_timeout: config.drain_timeout,
        ..TcpPlaneConfig::default()
    };
    let tcp_plane = TcpPlane::new(tcp_config, store, discovery);

    let router = Router::new(Arc::new(http_plane), Arc::new(tcp_plane));
    router.start().await.context("Failed to start router")?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, draining...");
    router.close().await;

    tracing::info!("Router shutdown complete");
    Ok(())
}

/// Postgres store + shared certificate cache, or the in-process pair
async fn open_store(
    config: &ResolvedConfig,
) -> Result<(Arc<dyn RouteStore>, Arc<dyn CertificateCache>)> {
    if let Some(url) = &config.database_url {
        tracing::info!("Route store: Postgres");
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .context("Failed to connect to database")?;
        let store = PgRouteStore::new(pool.clone());
        store
            .ensure_schema()
            .await
            .context("Failed to apply database schema")?;
        return Ok((Arc::new(store), Arc::new(PgCertificateCache::new(pool))));
    }

    let store = match &config.routes_file {
        Some(path) => {
            tracing::info!("Route store: in-process, persisted to {}", path.display());
            MemoryRouteStore::open(path)
                .with_context(|| format!("Failed to open route file {}", path.display()))?
        }
        None => {
            tracing::warn!("Route store: in-process and volatile, routes are lost on exit");
            MemoryRouteStore::new()
        }
    };
    Ok((Arc::new(store), Arc::new(MemoryCertificateCache::new())))
}

fn build_discovery(config: &ResolvedConfig) -> Result<Arc<dyn Discovery>> {
    Ok(match &config.discovery {
        ResolvedDiscovery::Http { url, timeout } => {
            tracing::info!("Discovery: {}", url);
            Arc::new(HttpDiscovery::new(url, *timeout).context("Invalid discovery URL")?)
        }
        ResolvedDiscovery::Static(services) => {
            tracing::info!("Discovery: static table with {} services", services.len());
            Arc::new(StaticDiscovery::from_services(services.clone()))
        }
    })
}

fn build_certificates(
    config: &ResolvedConfig,
    cache: Arc<dyn CertificateCache>,
) -> Result<CertificateManager> {
    let mut certs = CertificateManager::new();

    if let Some(keypair) = &config.static_tls {
        certs = certs
            .with_static(&keypair.cert_pem, &keypair.key_pem)
            .context("Failed to load static TLS keypair")?;
        tracing::info!("TLS: static fallback keypair loaded");
    }

    if let Some(issuance) = &config.issuance {
        let (issuer, timeout): (Arc<dyn CertificateIssuer>, Duration) = match &issuance.authority {
            IssuanceAuthority::Local { ca: Some(ca) } => (
                Arc::new(
                    LocalCaIssuer::from_pem(&ca.cert_pem, &ca.key_pem, issuance.validity_days)
                        .context("Failed to load issuance CA")?,
                ),
                ISSUANCE_TIMEOUT,
            ),
            IssuanceAuthority::Local { ca: None } => {
                tracing::warn!("TLS: no issuance CA configured, generating an ephemeral one");
                (
                    Arc::new(
                        LocalCaIssuer::generate("Switchyard Local CA", issuance.validity_days)
                            .context("Failed to generate issuance CA")?,
                    ),
                    ISSUANCE_TIMEOUT,
                )
            }
            IssuanceAuthority::Acme(acme) => {
                let challenges = Arc::new(AlpnChallenges::new());
                let mut settings = AcmeConfig::new(&acme.directory_url);
                settings.contact = acme.contact.clone();
                settings.account_key_pem = acme.account_key_pem.clone();
                let issuer = AcmeIssuer::new(settings, challenges.clone())
                    .context("Failed to set up ACME issuer")?;
                certs = certs.with_alpn_challenges(challenges);
                tracing::info!(directory = %acme.directory_url, "TLS: ACME issuance with TLS-ALPN-01");
                (Arc::new(issuer), ACME_ISSUANCE_TIMEOUT)
            }
        };
        certs = certs.with_automation(AutomationConfig {
            issuer,
            cache,
            require_route: issuance.require_route,
            timeout,
        });
        tracing::info!(
            require_route = issuance.require_route,
            "TLS: automated issuance enabled"
        );
    }

    if !certs.has_static() && config.issuance.is_none() && !config.https_addrs.is_empty() {
        tracing::warn!("TLS: only route certificates available, other handshakes will fail");
    }
    Ok(certs)
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
