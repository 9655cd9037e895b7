//! Embedded MQTT broker using rumqttd
//!
//! Lets a single relay process serve a small deployment without an
//! external broker. Only the MQTT v4 listener is enabled; participants and
//! the classifier speak plain 3.1.1.

use crate::infra::config::BrokerConfig;
use anyhow::Context;
use rumqttd::{Broker, Config, ConnectionSettings, RouterConfig, ServerSettings};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::thread::{self, JoinHandle};
use tracing::{error, info};

/// Largest packet either side accepts; camera frames ride the predict topic
pub const MAX_PACKET_BYTES: usize = 2 * 1024 * 1024;

const LISTENER: &str = "v4";

/// Per-connection limits for the listener
fn connection_settings() -> ConnectionSettings {
    ConnectionSettings {
        connection_timeout_ms: 5000,
        max_payload_size: MAX_PACKET_BYTES,
        max_inflight_count: 200,
        auth: None,
        dynamic_filters: false,
        external_auth: None,
    }
}

/// Build the rumqttd configuration for `broker`
pub fn broker_settings(broker: &BrokerConfig) -> anyhow::Result<Config> {
    let ip: IpAddr = broker
        .bind_address
        .parse()
        .with_context(|| format!("broker.bind_address {:?} is not an IP address", broker.bind_address))?;
    let listen = SocketAddr::new(ip, broker.port);

    let router = RouterConfig {
        // retained log per filter; a few frames' worth is plenty
        max_segment_size: 5 * MAX_PACKET_BYTES,
        max_segment_count: 10,
        max_connections: broker.max_connections,
        max_outgoing_packet_count: 200,
        initialized_filters: None,
        ..Default::default()
    };

    let listener = ServerSettings {
        name: LISTENER.to_string(),
        listen,
        tls: None,
        next_connection_delay_ms: 1,
        connections: connection_settings(),
    };

    Ok(Config {
        id: 0,
        router,
        v4: Some(HashMap::from([(LISTENER.to_string(), listener)])),
        v5: None,
        ws: None,
        prometheus: None,
        metrics: None,
        bridge: None,
        console: None,
        cluster: None,
    })
}

/// Start the broker on its own thread
///
/// `Broker::start` blocks for the life of the broker, so the handle only
/// finishes if the listener fails.
pub fn spawn_embedded_broker(broker: &BrokerConfig) -> anyhow::Result<JoinHandle<()>> {
    let settings = broker_settings(broker)?;
    let addr = format!("{}:{}", broker.bind_address, broker.port);

    let handle = thread::Builder::new()
        .name("mqtt-broker".to_string())
        .spawn(move || {
            if let Err(e) = Broker::new(settings).start() {
                error!(error = %e, "broker_stopped");
            }
        })
        .context("spawning broker thread")?;

    info!(addr = %addr, max_connections = %broker.max_connections, "broker_started");
    Ok(handle)
}
