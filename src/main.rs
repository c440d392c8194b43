//! qtun - mutually authenticated QUIC tunnel
//!
//! `qtun server` exposes a set of upstream TCP services to authenticated
//! clients. `qtun client` discovers them and listens on a local port for
//! each, or carries a packet device over the tunnel in full-tunnel mode.

mod reconnect;
mod settings;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use qtun_cert::{CertificateAuthority, TlsMaterial};
use qtun_client::{ClientConfig, ClientError, ClientSession, ListenerConfig, ListenerSet, TunnelClient};
use qtun_proto::{parse_upstream_list, Framing};
use qtun_relay::{FileDevice, PacketDevice};
use qtun_server::{ServerConfig, TunnelServer};
use qtun_session::SessionConfig;
use qtun_transport_quic::{QuicConfig, QuicConnection};
use qtun_upstream::{HealthConfig, HealthPolicy};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::reconnect::{Backoff, GiveUp, ReconnectConfig};
use crate::settings::{parse_remaps, FileSettings};

const LONG_VERSION: &str = concat!(
    env!("QTUN_GIT_TAG"),
    " (",
    env!("QTUN_GIT_HASH"),
    ", built ",
    env!("QTUN_BUILD_TIME"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "qtun")]
#[command(about = "Mutually authenticated QUIC tunnel")]
#[command(version, long_version = LONG_VERSION)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON settings file; command-line flags take precedence
    #[arg(long, global = true, env = "QTUN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct TlsArgs {
    /// PEM certificate chain
    #[arg(long, env = "QTUN_CERT")]
    cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long, env = "QTUN_KEY")]
    key: Option<PathBuf>,

    /// PEM CA certificate trusted for the peer
    #[arg(long, env = "QTUN_CA")]
    ca: Option<PathBuf>,

    #[arg(long, env = "QTUN_CERT_B64", hide = true)]
    cert_b64: Option<String>,

    #[arg(long, env = "QTUN_KEY_B64", hide = true)]
    key_b64: Option<String>,

    #[arg(long, env = "QTUN_CA_B64", hide = true)]
    ca_b64: Option<String>,
}

#[derive(Args, Debug, Clone)]
struct TimingArgs {
    /// Heartbeat interval in seconds
    #[arg(long, env = "QUIC_KEEPALIVE")]
    keep_alive: Option<u64>,

    /// Idle timeout in seconds
    #[arg(long, env = "QUIC_IDLE_TIMEOUT")]
    idle_timeout: Option<u64>,

    /// Log a summary of every tunneled packet
    #[arg(long, env = "QUIC_DEBUG")]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept tunnel clients and route their streams to upstreams
    #[command(long_about = r#"
Accept mutually authenticated QUIC clients and route their streams to a
fixed set of upstream TCP services.

EXAMPLES:
  qtun server --listen 0.0.0.0:4433 \
    --upstreams "127.0.0.1:5432/tcp,127.0.0.1:6379/tcp" \
    --secret $QTUN_SECRET \
    --cert server.crt --key server.key --ca ca.crt

ENVIRONMENT VARIABLES:
  QUIC_LISTEN       Listen address
  QUIC_CLIENTS      Upstream list (host:port/tcp,...)
  QTUN_SECRET       Shared route token
  QTUN_CERT_B64     Base64 PEM certificate (instead of --cert)
  QTUN_KEY_B64      Base64 PEM key (instead of --key)
  QTUN_CA_B64       Base64 PEM CA (instead of --ca)
  LOG_FORMAT        Set to "json" for JSON logs
    "#)]
    Server {
        /// UDP address to listen on
        #[arg(long, env = "QUIC_LISTEN")]
        listen: Option<String>,

        /// Upstreams as host:port/tcp, comma separated
        #[arg(long, env = "QUIC_CLIENTS")]
        upstreams: Option<String>,

        /// Shared route token
        #[arg(long, env = "QTUN_SECRET")]
        secret: Option<String>,

        /// Seconds between upstream health passes
        #[arg(long, env = "QTUN_HEALTH_INTERVAL")]
        health_interval: Option<u64>,

        /// teardown | isolate
        #[arg(long, env = "QTUN_HEALTH_POLICY")]
        health_policy: Option<String>,

        /// Packet device node for full-tunnel clients
        #[arg(long, env = "QTUN_DEVICE")]
        device: Option<PathBuf>,

        #[command(flatten)]
        timing: TimingArgs,

        #[command(flatten)]
        tls: TlsArgs,
    },

    /// Connect to a server and expose its upstreams locally
    #[command(long_about = r#"
Connect to a tunnel server, discover its upstreams and listen on a local
port for each. Reconnects with backoff when the session drops.

EXAMPLES:
  qtun client --server tunnel.example.com:4433 --secret $QTUN_SECRET \
    --cert client.crt --key client.key --ca ca.crt

  # Upstream 5432 is already taken locally; listen on 15432 instead
  qtun client --server 10.0.0.1:4433 --secret $QTUN_SECRET --remap 5432=15432 ...

  # Full tunnel over a pre-configured packet device
  qtun client --server 10.0.0.1:4433 --secret $QTUN_SECRET --device /dev/net/tun0 ...
    "#)]
    Client {
        /// Server host:port
        #[arg(long, env = "QUIC_PEER")]
        server: Option<String>,

        /// Name the server certificate must carry
        #[arg(long, env = "QUIC_SERVER_NAME")]
        server_name: Option<String>,

        /// Shared route token
        #[arg(long, env = "QTUN_SECRET")]
        secret: Option<String>,

        /// Host the local listeners bind
        #[arg(long, env = "QTUN_BIND_HOST")]
        bind_host: Option<String>,

        /// Listen on a different local port: remote=local (repeatable)
        #[arg(long = "remap", value_name = "REMOTE=LOCAL")]
        remaps: Vec<String>,

        /// Carry forwarded connections as chunk frames over pooled upstream connections
        #[arg(long)]
        chunked: bool,

        /// Run in full-tunnel mode over this packet device
        #[arg(long, env = "QTUN_DEVICE")]
        device: Option<PathBuf>,

        /// Maximum reconnection attempts (0 = infinite)
        #[arg(long, default_value = "0")]
        max_reconnect_attempts: usize,

        /// Initial reconnection delay in seconds
        #[arg(long, default_value = "1")]
        reconnect_delay: u64,

        /// Maximum reconnection delay in seconds
        #[arg(long, default_value = "60")]
        max_reconnect_delay: u64,

        #[command(flatten)]
        timing: TimingArgs,

        #[command(flatten)]
        tls: TlsArgs,
    },

    /// Write a development CA plus server and client certificates
    GenCerts {
        /// Output directory
        #[arg(long, default_value = "certs")]
        out_dir: PathBuf,

        /// Names the server certificate is valid for
        #[arg(long = "name", default_values_t = vec!["localhost".to_string(), "127.0.0.1".to_string()])]
        names: Vec<String>,
    },
}

/// Setup logging; LOG_FORMAT=json switches to JSON lines
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

fn load_tls(tls: &TlsArgs, settings: &FileSettings) -> Result<TlsMaterial> {
    if let (Some(cert), Some(key), Some(ca)) = (&tls.cert_b64, &tls.key_b64, &tls.ca_b64) {
        return TlsMaterial::from_base64_pem(cert, key, ca).context("Invalid base64 TLS material");
    }

    let cert = tls.cert.clone().or_else(|| settings.cert.clone());
    let key = tls.key.clone().or_else(|| settings.key.clone());
    let ca = tls.ca.clone().or_else(|| settings.ca.clone());

    match (cert, key, ca) {
        (Some(cert), Some(key), Some(ca)) => TlsMaterial::from_pem_files(&cert, &key, &ca)
            .with_context(|| format!("Failed to load TLS material from {}", cert.display())),
        _ => bail!("TLS material required: --cert, --key and --ca (or QTUN_*_B64)"),
    }
}

fn session_config(timing: &TimingArgs, settings: &FileSettings) -> Result<SessionConfig> {
    let mut config = SessionConfig::default();
    if let Some(secs) = timing.keep_alive.or(settings.keep_alive_secs) {
        config = config.with_keep_alive(Duration::from_secs(secs));
    }
    if let Some(secs) = timing.idle_timeout.or(settings.idle_timeout_secs) {
        config = config.with_idle_timeout(Duration::from_secs(secs));
    }
    config.validate()?;
    Ok(config)
}

async fn open_device(path: &Path) -> Result<Arc<dyn PacketDevice>> {
    let device = FileDevice::open(path)
        .await
        .with_context(|| format!("Failed to open packet device {}", path.display()))?;
    Ok(Arc::new(device))
}

/// Resolve on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_server(
    settings: FileSettings,
    listen: Option<String>,
    upstreams: Option<String>,
    secret: Option<String>,
    health_interval: Option<u64>,
    health_policy: Option<String>,
    device: Option<PathBuf>,
    timing: TimingArgs,
    tls: TlsArgs,
) -> Result<()> {
    let listen: SocketAddr = listen
        .or_else(|| settings.listen.clone())
        .unwrap_or_else(|| "0.0.0.0:4433".to_string())
        .parse()
        .context("Invalid listen address")?;

    let upstreams = upstreams
        .or_else(|| settings.upstreams.clone())
        .context("--upstreams is required")?;
    let upstreams = parse_upstream_list(&upstreams).context("Invalid upstream list")?;

    let secret = secret
        .or_else(|| settings.secret.clone())
        .context("--secret is required")?;

    let mut health = HealthConfig::default();
    if let Some(secs) = health_interval.or(settings.health_interval_secs) {
        health.interval = Duration::from_secs(secs.max(1));
    }
    if let Some(policy) = health_policy.or_else(|| settings.health_policy.clone()) {
        health.policy = policy.parse::<HealthPolicy>().map_err(anyhow::Error::msg)?;
    }

    let debug = timing.debug || settings.debug.unwrap_or(false);
    let config = ServerConfig::new(listen, upstreams, secret)
        .with_session(session_config(&timing, &settings)?)
        .with_health(health)
        .with_debug(debug);

    info!("Upstreams: {}", config.upstreams.iter().map(|u| u.to_string()).collect::<Vec<_>>().join(", "));
    info!("Health policy: {}", config.health.policy);

    let quic = QuicConfig::new(load_tls(&tls, &settings)?);
    let device = match device {
        Some(path) => Some(open_device(&path).await?),
        None => None,
    };

    let server = TunnelServer::bind_with_device(config, quic, device)
        .await
        .context("Failed to start server")?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    server.run(shutdown).await?;
    info!("Server stopped");
    Ok(())
}

enum ClientMode {
    Forward(ListenerConfig),
    FullTunnel(PathBuf),
}

async fn serve_session(session: &ClientSession<QuicConnection>, mode: &ClientMode) -> Result<(), ClientError> {
    match mode {
        ClientMode::Forward(listener_config) => {
            let listeners = ListenerSet::bind(session.upstreams(), listener_config).await?;
            session.forward(listeners).await
        }
        ClientMode::FullTunnel(path) => {
            let device = FileDevice::open(path)
                .await
                .map_err(|e| ClientError::Config(format!("{}: {}", path.display(), e)))?;
            session.run_full_tunnel(Arc::new(device)).await
        }
    }
}

/// Keep a session up until shutdown, reconnecting with backoff
async fn connect_with_reconnect(
    client: TunnelClient,
    mode: ClientMode,
    reconnect: ReconnectConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut backoff = Backoff::new(reconnect);

    loop {
        let connected = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            connected = client.connect() => connected,
        };

        match connected {
            Ok(session) => {
                backoff.reset();
                info!("Connected; {} upstream(s) available", session.upstreams().len());
                for upstream in session.upstreams() {
                    info!("  {}", upstream);
                }

                let outcome = tokio::select! {
                    _ = shutdown.cancelled() => {
                        session.shutdown().await;
                        return Ok(());
                    }
                    outcome = serve_session(&session, &mode) => outcome,
                };
                session.shutdown().await;

                match outcome {
                    Ok(()) => warn!("Session ended"),
                    Err(e @ ClientError::LocalListenFailed { .. }) => {
                        return Err(e).context("Cannot expose upstreams locally");
                    }
                    Err(e) => error!("Session error: {}", e),
                }
            }
            Err(e) => error!("Connection failed: {}", e),
        }

        match backoff.wait(&shutdown).await {
            Ok(()) => info!("Reconnecting (attempt {})", backoff.attempt()),
            Err(GiveUp::Cancelled) => return Ok(()),
            Err(GiveUp::MaxAttemptsReached) => {
                bail!("Failed to connect after {} attempts", backoff.attempt() - 1)
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_client(
    settings: FileSettings,
    server: Option<String>,
    server_name: Option<String>,
    secret: Option<String>,
    bind_host: Option<String>,
    remaps: Vec<String>,
    chunked: bool,
    device: Option<PathBuf>,
    reconnect: ReconnectConfig,
    timing: TimingArgs,
    tls: TlsArgs,
) -> Result<()> {
    let server = server
        .or_else(|| settings.server.clone())
        .context("--server is required")?;
    let server_name = server_name
        .or_else(|| settings.server_name.clone())
        .unwrap_or_else(|| "localhost".to_string());
    let secret = secret
        .or_else(|| settings.secret.clone())
        .context("--secret is required")?;

    let mut listener = ListenerConfig::default();
    if let Some(host) = bind_host.or_else(|| settings.bind_host.clone()) {
        let host: IpAddr = host.parse().context("Invalid bind host")?;
        listener = listener.with_bind_host(host);
    }
    let remaps = if remaps.is_empty() {
        settings.remap.clone().unwrap_or_default()
    } else {
        remaps
    };
    listener.port_map = parse_remaps(&remaps)?;
    if chunked {
        listener = listener.with_framing(Framing::Chunked);
    }

    let debug = timing.debug || settings.debug.unwrap_or(false);
    let config = ClientConfig::new(server, server_name, secret)
        .with_session(session_config(&timing, &settings)?)
        .with_listener(listener.clone())
        .with_debug(debug);

    let mode = match device {
        Some(path) => ClientMode::FullTunnel(path),
        None => ClientMode::Forward(listener),
    };

    let client = TunnelClient::new(config, QuicConfig::new(load_tls(&tls, &settings)?))?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    connect_with_reconnect(client, mode, reconnect, shutdown).await?;
    info!("Client stopped");
    Ok(())
}

fn gen_certs(out_dir: &Path, names: &[String]) -> Result<()> {
    let ca = CertificateAuthority::generate("qtun CA")?;
    let names: Vec<&str> = names.iter().map(String::as_str).collect();

    ca.issue("qtun server", &names)?.save_to_dir(out_dir, "server")?;
    ca.issue("qtun client", &["qtun-client"])?.save_to_dir(out_dir, "client")?;

    let ca_path = out_dir.join("ca.crt");
    std::fs::write(&ca_path, ca.cert_pem())
        .with_context(|| format!("Failed to write {}", ca_path.display()))?;

    info!("Wrote ca.crt, server.crt/key and client.crt/key to {}", out_dir.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let settings = match &cli.config {
        Some(path) => FileSettings::load(path)?,
        None => FileSettings::default(),
    };

    match cli.command {
        Commands::Server {
            listen,
            upstreams,
            secret,
            health_interval,
            health_policy,
            device,
            timing,
            tls,
        } => {
            info!("qtun {} starting server", LONG_VERSION);
            run_server(
                settings,
                listen,
                upstreams,
                secret,
                health_interval,
                health_policy,
                device,
                timing,
                tls,
            )
            .await
        }
        Commands::Client {
            server,
            server_name,
            secret,
            bind_host,
            remaps,
            chunked,
            device,
            max_reconnect_attempts,
            reconnect_delay,
            max_reconnect_delay,
            timing,
            tls,
        } => {
            info!("qtun {} starting client", LONG_VERSION);
            let reconnect = ReconnectConfig {
                initial_backoff: Duration::from_secs(reconnect_delay),
                max_backoff: Duration::from_secs(max_reconnect_delay),
                max_attempts: (max_reconnect_attempts > 0).then_some(max_reconnect_attempts),
                ..ReconnectConfig::default()
            };
            run_client(
                settings,
                server,
                server_name,
                secret,
                bind_host,
                remaps,
                chunked,
                device,
                reconnect,
                timing,
                tls,
            )
            .await
        }
        Commands::GenCerts { out_dir, names } => gen_certs(&out_dir, &names),
    }
}
