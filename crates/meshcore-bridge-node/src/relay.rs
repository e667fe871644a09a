//! Broker relay for packets received from the companion

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

use meshcore_bridge::{
    BridgeDirection, BridgeHandle, BridgeService, BrokerConfig, BrokerProfile, BrokerTransport,
    MonotonicClock, PacketSink, RumqttClient, ServiceConfig,
};

use crate::{parse_broker_addr, Args};

/// Start a broker transport service when `--broker` was given
///
/// Packets the broker delivers are pushed into `to_companion`.
pub fn start(
    args: &Args,
    to_companion: mpsc::UnboundedSender<Bytes>,
) -> anyhow::Result<Option<BridgeHandle>> {
    let Some(addr) = args.broker.as_deref() else {
        return Ok(None);
    };
    let (host, port) = parse_broker_addr(addr)?;

    let config = BrokerConfig {
        primary: BrokerProfile::new(host, port),
        topic_prefix: args.prefix.clone(),
        node_name: args.name.clone(),
        direction: if args.bidirectional {
            BridgeDirection::Bidirectional
        } else {
            BridgeDirection::SendOnly
        },
        ..BrokerConfig::default()
    };
    info!(
        broker = %config.primary.host,
        port = config.primary.port,
        prefix = %config.topic_prefix,
        client_id = %config.resolved_client_id(),
        direction = ?config.direction,
        "Starting broker relay"
    );

    let transport = BrokerTransport::new(RumqttClient::new(), config, MonotonicClock::shared())?;
    let sink: PacketSink = Arc::new(move |packet| {
        let _ = to_companion.send(packet);
    });
    let (service, handle) =
        BridgeService::new(Box::new(transport), &ServiceConfig::default(), sink);

    tokio::spawn(async move {
        if let Err(e) = service.run().await {
            error!(error = %e, "Broker relay stopped");
        }
    });

    Ok(Some(handle))
}
