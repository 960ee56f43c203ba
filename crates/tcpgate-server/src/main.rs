//! tcpgate: WebSocket-to-TCP protocol gateway.
//!
//! Accepts WebSocket clients, checks every requested destination against
//! the address policy, and bridges validated sessions to backend TCP
//! services, either as raw byte tunnels or through a protocol codec.

mod config;
mod dispatcher;
mod gateway;
mod registry;
mod server;
mod session;
mod transport;

use anyhow::{Context, Result};
use clap::Parser;
use config::{CliOverrides, GatewayConfig};
use server::GatewayServer;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// tcpgate: WebSocket-to-TCP protocol gateway
#[derive(Parser, Debug)]
#[command(name = "tcpgate", version, about = "WebSocket-to-TCP protocol gateway")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    bind: Option<IpAddr>,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.tcpgate/config.toml")]
    config: String,

    /// Generate self-signed certificate for development
    #[arg(long)]
    generate_cert: bool,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Backend connect timeout in milliseconds
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Session idle timeout in milliseconds
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting tcpgate");

    let (cert, key) = if cli.generate_cert {
        let (c, k) = generate_self_signed_cert().context("failed to generate self-signed certificate")?;
        info!(cert = %c.display(), key = %k.display(), "generated self-signed certificate");
        (Some(c.display().to_string()), Some(k.display().to_string()))
    } else {
        (cli.cert, cli.key)
    };

    let overrides = CliOverrides {
        port: cli.port,
        bind: cli.bind,
        cert,
        key,
        max_sessions: cli.max_sessions,
        connect_timeout_ms: cli.connect_timeout,
        idle_timeout_ms: cli.idle_timeout,
    };
    let config_path = PathBuf::from(&cli.config);
    let gateway_config =
        GatewayConfig::load(Some(&config_path), overrides).context("failed to load config")?;

    let tls_config = match (&gateway_config.cert_path, &gateway_config.key_path) {
        (Some(cert), Some(key)) => Some(Arc::new(
            load_tls_config(cert, key).context("failed to load TLS config")?,
        )),
        _ => {
            warn!("no certificate configured, serving plain ws://");
            None
        }
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        signal_token.cancel();
    });

    GatewayServer::new(gateway_config)
        .run(tls_config, shutdown)
        .await
        .context("server error")?;

    info!("tcpgate stopped");
    Ok(())
}

/// Load TLS certificate and key from PEM files, returning a rustls ServerConfig.
fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<rustls::ServerConfig> {
    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("cannot read cert {}", cert_path.display()))?;
    let key_pem = std::fs::read(key_path)
        .with_context(|| format!("cannot read key {}", key_path.display()))?;

    let certs: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &cert_pem[..]).collect::<Result<Vec<_>, _>>()?;

    let key = rustls_pemfile::private_key(&mut &key_pem[..])?
        .context("no private key found in PEM")?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut tls_config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    // WebSocket upgrades ride on HTTP/1.1.
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(tls_config)
}

/// Generate a self-signed certificate for development use.
fn generate_self_signed_cert() -> Result<(PathBuf, PathBuf)> {
    let dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".tcpgate");
    std::fs::create_dir_all(&dir)?;

    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");

    let mut params = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ])?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "tcpgate dev cert");

    let key_pair = rcgen::KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;

    Ok((cert_path, key_path))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
