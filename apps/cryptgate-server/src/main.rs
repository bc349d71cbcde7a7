//! cryptgate-server — transparent encrypting S3 gateway.
//!
//! Clients speak plain S3 to this process; it authenticates them against
//! the configured credentials, envelope-encrypts object payloads, and
//! re-signs every request to the upstream store with the gateway's own
//! service credentials. Plaintext never reaches the upstream.
//!
//! # Usage
//!
//! ```text
//! cryptgate-server [config.yaml]
//! ```
//!
//! The config path defaults to `CRYPTGATE_CONFIG`, then
//! `/etc/cryptgate/config.yaml`. `CRYPTGATE_LISTEN` overrides the bind
//! address; `RUST_LOG` (or the configured `log_level`) controls logging.
//!
//! Exit codes: 0 on graceful shutdown, non-zero on configuration errors or
//! bind failure.

use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HttpConnBuilder;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cryptgate_core::config::TlsConfig;
use cryptgate_core::upstream::http::HttpUpstream;
use cryptgate_core::{Gateway, GatewayConfig, spawn_reaper};
use cryptgate_http::GatewayService;

/// Server version reported in logs.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the tracing subscriber.
///
/// Uses `RUST_LOG` if set, otherwise falls back to the configured level.
fn init_tracing(log_level: &str) -> Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::try_new(log_level)
            .with_context(|| format!("invalid log level filter: {log_level}"))?
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    Ok(())
}

/// Resolve the config file path from the CLI argument or environment.
fn config_path() -> String {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CRYPTGATE_CONFIG").ok())
        .unwrap_or_else(|| "/etc/cryptgate/config.yaml".to_owned())
}

/// Build a TLS acceptor from the configured PEM files.
fn build_tls_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor> {
    let cert_file = std::fs::File::open(&tls.cert_file)
        .with_context(|| format!("cannot open TLS cert {}", tls.cert_file.display()))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::io::Result<_>>()
        .context("invalid TLS certificate chain")?;

    let key_file = std::fs::File::open(&tls.key_file)
        .with_context(|| format!("cannot open TLS key {}", tls.key_file.display()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .context("invalid TLS private key")?
        .context("no private key found in TLS key file")?;

    let config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("TLS configuration rejected")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

/// Accept loop: serve connections until a shutdown signal arrives, then
/// drain in-flight requests.
async fn serve(
    listener: TcpListener,
    service: GatewayService,
    tls: Option<TlsAcceptor>,
) -> Result<()> {
    let graceful = hyper_util::server::graceful::GracefulShutdown::new();
    let http = HttpConnBuilder::new(TokioExecutor::new());

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                };

                let svc = service.clone();
                match &tls {
                    Some(acceptor) => {
                        let acceptor = acceptor.clone();
                        let http = http.clone();
                        let watcher = graceful.watcher();
                        tokio::spawn(async move {
                            let tls_stream = match acceptor.accept(stream).await {
                                Ok(s) => s,
                                Err(e) => {
                                    warn!(peer_addr = %peer_addr, error = %e, "TLS handshake failed");
                                    return;
                                }
                            };
                            let conn = http.serve_connection(TokioIo::new(tls_stream), svc);
                            if let Err(e) = watcher.watch(conn.into_owned()).await {
                                error!(peer_addr = %peer_addr, error = %e, "connection error");
                            }
                        });
                    }
                    None => {
                        let conn = http.serve_connection(TokioIo::new(stream), svc);
                        let conn = graceful.watch(conn.into_owned());
                        tokio::spawn(async move {
                            if let Err(e) = conn.await {
                                error!(peer_addr = %peer_addr, error = %e, "connection error");
                            }
                        });
                    }
                }
            }

            () = &mut shutdown => {
                info!("received shutdown signal, draining connections");
                break;
            }
        }
    }

    graceful.shutdown().await;
    info!("all connections drained, exiting");

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let path = config_path();
    let config =
        GatewayConfig::from_yaml_file(&path).with_context(|| format!("loading {path}"))?;

    init_tracing(&config.log_level)?;

    info!(
        version = VERSION,
        bind_address = %config.bind_address,
        target_endpoint = %config.target_endpoint,
        region = %config.region,
        clients = config.s3_clients.len(),
        integrity = ?config.encryption.integrity_verification,
        "starting cryptgate"
    );

    let tls = config
        .tls
        .as_ref()
        .map(build_tls_acceptor)
        .transpose()
        .context("TLS listener setup failed")?;

    let upstream =
        Arc::new(HttpUpstream::from_config(&config).context("building upstream client")?);

    let addr: SocketAddr = config
        .bind_address
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.bind_address))?;

    let gateway = Arc::new(Gateway::new(config, upstream).context("initializing encryption")?);
    let reaper = spawn_reaper(Arc::clone(&gateway));
    let service = GatewayService::new(gateway);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    info!(%addr, tls = tls.is_some(), "listening for connections");

    let result = serve(listener, service, tls).await;
    reaper.abort();
    result
}
