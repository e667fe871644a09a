//! MeshCore Bridge Node - companion transport with optional broker relay
//!
//! This binary runs a transport (a TCP companion socket unless the config
//! file says otherwise) and logs every packet a companion client sends.
//! Built with the `mqtt` feature and started with `--broker`, it also relays
//! those packets to an MQTT broker and, in bidirectional mode, forwards
//! packets from the broker back to the companion.

#[cfg(feature = "mqtt")]
mod relay;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use meshcore_bridge::{
    build_transport, BridgeConfig, BridgeService, PacketSink, PacketView, TransportConfig,
    DEFAULT_MQTT_PORT, MAX_FRAME_SIZE,
};

#[derive(Parser)]
#[command(name = "meshcore-bridge-node")]
#[command(about = "MeshCore companion transport with optional MQTT relay")]
struct Args {
    /// JSON configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Companion socket port (overrides the config file)
    #[arg(long, short)]
    listen: Option<u16>,

    /// Largest frame payload accepted from or sent to the companion
    #[arg(long)]
    max_frame_size: Option<usize>,

    /// Broker address as host[:port]
    #[cfg(feature = "mqtt")]
    #[arg(long, short)]
    broker: Option<String>,

    /// Broker topic prefix
    #[cfg(feature = "mqtt")]
    #[arg(long, default_value = meshcore_bridge::DEFAULT_TOPIC_PREFIX)]
    prefix: String,

    /// Node name; the broker client id is derived from it
    #[cfg(feature = "mqtt")]
    #[arg(long, short, default_value = "")]
    name: String,

    /// Accept packets from the broker's rx topic and forward them to the companion
    #[cfg(feature = "mqtt")]
    #[arg(long)]
    bidirectional: bool,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG overrides the verbosity flag
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = load_config(args.config.as_deref())?;
    apply_overrides(&mut config, args.listen, args.max_frame_size);

    info!(
        max_frame_size = config.framing.max_frame_size,
        queue_size = config.framing.queue_size,
        "Starting MeshCore bridge node"
    );

    let transport = build_transport(&config).context("building companion transport")?;
    info!(transport = %transport.name(), "Companion transport ready");

    // Packets arriving from the broker relay, destined for the companion
    let (broker_tx, mut broker_rx) = mpsc::unbounded_channel::<Bytes>();

    #[cfg(feature = "mqtt")]
    let relay = relay::start(&args, broker_tx)?;
    #[cfg(not(feature = "mqtt"))]
    let _broker_tx = broker_tx;

    let (companion_tx, mut companion_rx) = mpsc::unbounded_channel::<Bytes>();
    let sink: PacketSink = Arc::new(move |packet| {
        let _ = companion_tx.send(packet);
    });
    let (service, handle) = BridgeService::new(transport, &config.service, sink);
    let service_task = tokio::spawn(service.run());

    loop {
        tokio::select! {
            Some(packet) = companion_rx.recv() => {
                log_packet("companion", &packet);

                #[cfg(feature = "mqtt")]
                {
                    if let Some(relay) = &relay {
                        match relay.send_packet(packet.clone()).await {
                            Ok(0) => debug!("Broker not connected, packet not relayed"),
                            Ok(_) => debug!(size = packet.len(), "Queued packet for broker"),
                            Err(e) => warn!(error = %e, "Broker relay refused packet"),
                        }
                    }
                }
            }

            Some(packet) = broker_rx.recv() => {
                log_packet("broker", &packet);
                match handle.send_packet(packet).await {
                    Ok(0) => debug!("No companion connected, packet dropped"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Companion transport refused packet"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    if let Ok(stats) = handle.stats().await {
        info!(
            sent = stats.packets_sent,
            received = stats.packets_received,
            malformed = stats.transport.malformed_frames,
            clients = stats.transport.clients_accepted,
            "Companion transport statistics"
        );
    }

    #[cfg(feature = "mqtt")]
    {
        if let Some(relay) = &relay {
            let _ = relay.shutdown().await;
        }
    }

    handle.shutdown().await?;
    match service_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Bridge service failed"),
        Err(e) => error!(error = %e, "Bridge service task panicked"),
    }

    info!("MeshCore bridge node stopped");
    Ok(())
}

/// Load a JSON config file, or defaults when no file is given
fn load_config(path: Option<&Path>) -> anyhow::Result<BridgeConfig> {
    let Some(path) = path else {
        return Ok(BridgeConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config = serde_json::from_str(&raw)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    info!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

fn apply_overrides(config: &mut BridgeConfig, listen: Option<u16>, max_frame_size: Option<usize>) {
    if let Some(port) = listen {
        let host = match &config.transport {
            TransportConfig::Socket { host, .. } => host.clone(),
            _ => "0.0.0.0".to_string(),
        };
        config.transport = TransportConfig::Socket { host, port };
    }
    if let Some(size) = max_frame_size {
        if size > MAX_FRAME_SIZE {
            warn!(
                requested = size,
                companion_max = MAX_FRAME_SIZE,
                "Frame size above the companion default; peers must agree"
            );
        }
        config.framing.max_frame_size = size.clamp(1, u16::MAX as usize);
    }
}

fn log_packet(source: &str, packet: &[u8]) {
    match PacketView::parse(packet) {
        Some(view) => info!(
            source = source,
            size = packet.len(),
            payload_type = ?view.payload_type(),
            route = ?view.route_type(),
            hops = view.path().len(),
            channel = ?view.channel_hash(),
            "Packet"
        ),
        None => info!(source = source, size = packet.len(), "Unparseable packet"),
    }
}

/// Split `host[:port]`, defaulting the port
fn parse_broker_addr(addr: &str) -> anyhow::Result<(String, u16)> {
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port
                .parse()
                .with_context(|| format!("invalid broker port in {}", addr))?;
            Ok((host.to_string(), port))
        }
        Some(_) => anyhow::bail!("missing broker host in {}", addr),
        None if addr.is_empty() => anyhow::bail!("empty broker address"),
        None => Ok((addr.to_string(), DEFAULT_MQTT_PORT)),
    }
}
