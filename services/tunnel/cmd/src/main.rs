//! Tunnel node binary.
//!
//! Runs an echo listener or a message sender over the TCP or HTTP transport.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tunnel_session::{
    ConnectionEvent, ConnectionKey, ConnectionManager, Connector, DispatchHandler, HttpClientConnector,
    HttpServerConnector, InboundMessage, Message, NoSecurityFactory, SecuritySessionFactory, TcpConnector,
    TransportConfig, TransportError,
};
use tunnel_wire::{ConnectionKind, FramedBuffer};

mod config;
mod logging;

use config::{TransportKind, TunnelConfig};
use logging::TunnelLogFormatter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Mode {
    /// Accept connections and echo invocations
    Listen,
    /// Send messages to `--connect`
    Send,
}

/// Reliable message transport node
#[derive(Parser, Debug)]
#[command(name = "tunnel", version, about = "Reliable message transport over TCP and HTTP")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "tunnel.yaml")]
    config: PathBuf,

    /// Listen for peers or send to one
    #[arg(long, value_enum, default_value = "listen")]
    mode: Mode,

    /// Transport, overrides the configuration file
    #[arg(long, value_enum)]
    transport: Option<TransportKind>,

    /// Listen address, e.g. 0.0.0.0:7000
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Peer URI to send to, e.g. tcp://10.0.0.2:7000
    #[arg(long)]
    connect: Option<String>,

    /// Pre-shared key as 64 hex digits
    #[arg(long)]
    psk: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Messages to send
    #[arg(long, default_value_t = 1)]
    count: u32,

    /// Message text
    #[arg(long, default_value = "hello")]
    message: String,

    /// Send invocations and print the replies
    #[arg(long)]
    invoke: bool,

    /// Pause between messages, e.g. 500ms
    #[arg(long, default_value = "1s")]
    interval: humantime::Duration,
}

/// Logs every message and answers invocations with their own payload
#[derive(Debug)]
struct EchoHandler;

#[async_trait]
impl DispatchHandler for EchoHandler {
    async fn handle_message(&self, mut message: InboundMessage) -> Option<FramedBuffer> {
        let payload = match message.content.to_bytes() {
            Ok(payload) => payload,
            Err(error) => {
                warn!(component = "main", peer = %message.peer.uri(), %error, "unreadable message");
                return None;
            }
        };
        info!(
            component = "main",
            peer = %message.peer.uri(),
            connection = %message.connection_name,
            bytes = payload.len(),
            "received: {}",
            String::from_utf8_lossy(&payload)
        );
        (message.kind == ConnectionKind::Invocation).then(|| FramedBuffer::from_bytes(payload))
    }

    fn dispatch_exception(&self, message: Message, error: TransportError) {
        error!(component = "main", id = message.id(), connection = %message.key(), %error, "message not delivered");
    }
}

fn security_factory(config: &TunnelConfig) -> Result<Arc<dyn SecuritySessionFactory>> {
    match &config.psk {
        None => Ok(Arc::new(NoSecurityFactory)),
        #[cfg(feature = "crypto")]
        Some(hex) => Ok(Arc::new(tunnel_session::PskSessionFactory::from_hex(hex)?)),
        #[cfg(not(feature = "crypto"))]
        Some(_) => bail!("pre-shared keys need the crypto feature"),
    }
}

fn log_events<K: Connector>(manager: &ConnectionManager<K>) {
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Established { key, origin }) => {
                    info!(component = "main", connection = %key, ?origin, "connection established")
                }
                Ok(ConnectionEvent::Reestablishing { key, cause }) => {
                    warn!(component = "main", connection = %key, %cause, "connection reestablishing")
                }
                Ok(ConnectionEvent::Reestablished { key }) => {
                    info!(component = "main", connection = %key, "connection reestablished")
                }
                Ok(ConnectionEvent::Closed { key, reason }) => {
                    info!(component = "main", connection = %key, %reason, "connection closed")
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(component = "main", missed, "event log lagging")
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn send_messages<K: Connector>(manager: &ConnectionManager<K>, peer: &str, args: &Args) -> Result<()> {
    for n in 1..=args.count {
        let payload = format!("{} #{n}", args.message).into_bytes();
        if args.invoke {
            match manager.invoke(peer, FramedBuffer::from_bytes(payload)).await? {
                Some(mut reply) => {
                    let reply = reply.to_bytes()?;
                    info!(component = "main", "reply: {}", String::from_utf8_lossy(&reply));
                }
                None => warn!(component = "main", "invocation returned no reply"),
            }
        } else {
            let message = Message::new(ConnectionKey::persistent(peer), FramedBuffer::from_bytes(payload)).synchronous(true);
            manager.send(message).await?;
            info!(component = "main", n, "message sent");
        }
        if n < args.count {
            tokio::time::sleep(args.interval.into()).await;
        }
    }
    Ok(())
}

async fn wait_for_shutdown<K: Connector>(manager: &ConnectionManager<K>) -> Result<()> {
    tokio::signal::ctrl_c().await.context("failed to wait for ctrl-c")?;
    info!(component = "main", "Received SIGINT, shutting down");
    manager.shutdown();
    Ok(())
}

async fn run_tcp(args: &Args, config: &TunnelConfig, transport: TransportConfig) -> Result<()> {
    let manager = ConnectionManager::new(transport, config.local_uri(), TcpConnector::new(), Arc::new(EchoHandler), security_factory(config)?)?;
    log_events(&manager);
    if let Some(addr) = config.listen {
        let bound = manager.listen(addr).await?;
        info!(component = "main", addr = %bound, "listening");
    }

    match args.mode {
        Mode::Listen if config.listen.is_none() => bail!("listen mode needs --listen"),
        Mode::Listen => wait_for_shutdown(&manager).await,
        Mode::Send => {
            let peer = config.connect.as_deref().context("send mode needs --connect")?;
            let sent = send_messages(&manager, peer, args).await;
            manager.shutdown();
            sent
        }
    }
}

async fn run_http(args: &Args, config: &TunnelConfig, transport: TransportConfig) -> Result<()> {
    let security = security_factory(config)?;
    match args.mode {
        Mode::Listen => {
            let addr = config.listen.context("listen mode needs --listen")?;
            let manager = ConnectionManager::new(transport, config.local_uri(), HttpServerConnector::new(), Arc::new(EchoHandler), security)?;
            log_events(&manager);
            let bound = manager.serve(addr).await?;
            info!(component = "main", addr = %bound, path = %manager.config().http_path, "serving");
            wait_for_shutdown(&manager).await
        }
        Mode::Send => {
            let peer = config.connect.as_deref().context("send mode needs --connect")?;
            let connector = HttpClientConnector::new(&transport);
            let manager = ConnectionManager::new(transport, config.local_uri(), connector, Arc::new(EchoHandler), security)?;
            log_events(&manager);
            let sent = send_messages(&manager, peer, args).await;
            manager.shutdown();
            sent
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("tunnel={}", args.log_level).parse()?)
        .add_directive(format!("tunnel_session={}", args.log_level).parse()?)
        .add_directive(format!("tunnel_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(true)
        .event_format(TunnelLogFormatter::new("tunnel"))
        .init();

    info!(component = "main", "Starting tunnel v{}", env!("CARGO_PKG_VERSION"));

    let mut config = TunnelConfig::load_from_file(&args.config)?;
    if let Some(transport) = args.transport {
        config.transport = transport;
    }
    if let Some(listen) = args.listen {
        config.listen = Some(listen);
    }
    if let Some(connect) = &args.connect {
        config.connect = Some(connect.clone());
    }
    if let Some(psk) = &args.psk {
        config.psk = Some(psk.clone());
    }
    let transport = config.transport_config()?;
    info!(component = "main", uri = %config.local_uri(), transport = ?config.transport, mode = ?args.mode, "configuration loaded");

    match config.transport {
        TransportKind::Tcp => run_tcp(&args, &config, transport).await,
        TransportKind::Http => run_http(&args, &config, transport).await,
    }
}
