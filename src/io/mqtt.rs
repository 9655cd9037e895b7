//! MQTT transport for participants and the relay
//!
//! Topic layout under the configured prefix:
//! - `{prefix}/up/{pid}` - participant -> relay (JSON `UpMessage`)
//! - `{prefix}/down/{pid}` - relay/classifier -> participant (JSON `DownMessage`)
//! - `{prefix}/predict` - camera frames for the classifier
//!
//! Each participant registers `{"event":"disconnect"}` as its last will on
//! its up topic so the relay notices abrupt disconnects.

use crate::infra::broker::MAX_PACKET_BYTES;
use crate::infra::config::{Config, MqttConfig};
use crate::infra::metrics::Metrics;
use crate::io::channel::{DownMessage, Outbound, UpMessage};
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Outgoing, Packet, QoS};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Transport-level events delivered into the participant inbox
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected,
    Message(DownMessage),
}

/// An up-message as seen by the relay
#[derive(Debug, Clone, PartialEq)]
pub struct RelayInbound {
    pub pid: String,
    pub msg: UpMessage,
}

/// A down-message addressed to one participant
#[derive(Debug, Clone, PartialEq)]
pub struct RelayOutbound {
    pub pid: String,
    pub msg: DownMessage,
}

/// Topic names derived from the configured prefix
#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        Self { prefix: prefix.trim_end_matches('/').to_string() }
    }

    pub fn up(&self, pid: &str) -> String {
        format!("{}/up/{}", self.prefix, pid)
    }

    pub fn down(&self, pid: &str) -> String {
        format!("{}/down/{}", self.prefix, pid)
    }

    pub fn predict(&self) -> String {
        format!("{}/predict", self.prefix)
    }

    pub fn up_wildcard(&self) -> String {
        format!("{}/up/+", self.prefix)
    }

    /// Extract the pid from an up topic
    pub fn pid_from_up<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let rest = topic.strip_prefix(self.prefix.as_str())?.strip_prefix("/up/")?;
        if rest.is_empty() || rest.contains('/') {
            return None;
        }
        Some(rest)
    }
}

/// Parse a participant up-message published on `{prefix}/up/{pid}`
pub fn parse_up(topics: &Topics, topic: &str, payload: &[u8]) -> Option<RelayInbound> {
    let pid = topics.pid_from_up(topic)?;
    match serde_json::from_slice::<UpMessage>(payload) {
        Ok(msg) => Some(RelayInbound { pid: pid.to_string(), msg }),
        Err(e) => {
            debug!(error = %e, topic = %topic, "up_message_parse_failed");
            None
        }
    }
}

/// Parse a down-message for this participant
pub fn parse_down(payload: &[u8]) -> Option<DownMessage> {
    match serde_json::from_slice::<DownMessage>(payload) {
        Ok(msg) => Some(msg),
        Err(e) => {
            debug!(error = %e, "down_message_parse_failed");
            None
        }
    }
}

fn mqtt_options(mqtt: &MqttConfig, client_id: &str) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, mqtt.host.as_str(), mqtt.port);
    options.set_keep_alive(Duration::from_secs(mqtt.keep_alive_secs.max(1)));
    options.set_clean_session(true);
    // frames are large; the default 10 KiB limit would reject them
    options.set_max_packet_size(MAX_PACKET_BYTES, MAX_PACKET_BYTES);

    if let (Some(username), Some(password)) = (&mqtt.username, &mqtt.password) {
        options.set_credentials(username, password);
    }
    options
}

/// Forward a transport event into an inbox
///
/// Waits for room; an `alert_end` is sent only once and must not be lost.
/// Returns false once the inbox is closed.
async fn forward<E: From<ChannelEvent>>(inbox: &mpsc::Sender<E>, event: ChannelEvent) -> bool {
    inbox.send(E::from(event)).await.is_ok()
}

/// Run the participant side of the channel
///
/// Publishes everything received on `outbound` until every `ChannelSender`
/// has been dropped, then disconnects cleanly. Inbound down-messages and
/// connection changes are forwarded into `inbox`.
pub async fn run_participant_channel<E>(
    config: &Config,
    mut outbound: mpsc::Receiver<Outbound>,
    inbox: mpsc::Sender<E>,
    metrics: Arc<Metrics>,
) -> anyhow::Result<()>
where
    E: From<ChannelEvent> + Send + 'static,
{
    let topics = Topics::new(config.topic_prefix());
    let pid = config.pid().to_string();
    let up_topic = topics.up(&pid);
    let down_topic = topics.down(&pid);
    let predict_topic = topics.predict();

    let mut options = mqtt_options(config.mqtt(), &format!("{}-{}", config.role().as_str(), pid));
    let will = serde_json::to_vec(&UpMessage::Disconnect)?;
    options.set_last_will(LastWill::new(&up_topic, will, QoS::AtLeastOnce, false));

    let (client, mut eventloop) = AsyncClient::new(options, 100);

    info!(
        host = %config.mqtt_host(),
        port = %config.mqtt_port(),
        up = %up_topic,
        down = %down_topic,
        "participant_channel_started"
    );

    let sub_client = client.clone();
    let sub_topic = down_topic.clone();
    let poller = tokio::spawn(async move {
        let mut connected = false;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    // clean session: subscriptions do not survive a reconnect
                    if let Err(e) = sub_client.try_subscribe(sub_topic.as_str(), QoS::AtLeastOnce) {
                        error!(error = %e, topic = %sub_topic, "subscribe_failed");
                    }
                    connected = true;
                    info!("channel_connected");
                    if !forward(&inbox, ChannelEvent::Connected).await {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if let Some(msg) = parse_down(&publish.payload) {
                        debug!(event = msg.event_name(), "down_message_received");
                        if !forward(&inbox, ChannelEvent::Message(msg)).await {
                            break;
                        }
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("channel_disconnect_sent");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    if connected {
                        connected = false;
                        warn!(error = %e, "channel_disconnected");
                        if !forward(&inbox, ChannelEvent::Disconnected).await {
                            break;
                        }
                    } else {
                        debug!(error = %e, "channel_connect_failed");
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    while let Some(msg) = outbound.recv().await {
        let result = match msg {
            Outbound::Up(up) => {
                let qos = if up.is_membership_change() { QoS::AtLeastOnce } else { QoS::AtMostOnce };
                let payload = serde_json::to_vec(&up)?;
                debug!(event = up.event_name(), crosswalk_id = ?up.crosswalk_id(), "up_message_published");
                client.publish(up_topic.as_str(), qos, false, payload).await
            }
            Outbound::Predict(request) => {
                let payload = serde_json::to_vec(&request)?;
                client.publish(predict_topic.as_str(), QoS::AtMostOnce, false, payload).await
            }
        };
        if let Err(e) = result {
            metrics.record_channel_dropped();
            warn!(error = %e, "channel_publish_failed");
        }
    }

    info!("participant_channel_draining");
    if let Err(e) = client.disconnect().await {
        debug!(error = %e, "channel_disconnect_failed");
    }
    if tokio::time::timeout(Duration::from_secs(2), poller).await.is_err() {
        warn!("channel_disconnect_timeout");
    }
    info!("participant_channel_stopped");
    Ok(())
}

/// Run the relay side of the channel
///
/// Subscribes to every participant up topic and forwards parsed messages into
/// `inbox`; publishes queued down-messages to `{prefix}/down/{pid}`.
pub async fn run_relay_channel(
    mqtt: &MqttConfig,
    mut outbound: mpsc::Receiver<RelayOutbound>,
    inbox: mpsc::Sender<RelayInbound>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let topics = Topics::new(&mqtt.topic_prefix);
    let client_id = format!("crosswalk-relay-{}", std::process::id());
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(mqtt, &client_id), 1000);
    let wildcard = topics.up_wildcard();

    info!(host = %mqtt.host, port = %mqtt.port, topic = %wildcard, "relay_channel_started");

    let mut last_drop_warn = Instant::now() - Duration::from_secs(2);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("relay_channel_shutdown");
                    while let Ok(out) = outbound.try_recv() {
                        publish_down(&client, &topics, out, &metrics).await;
                    }
                    let _ = client.disconnect().await;
                    return Ok(());
                }
            }
            Some(out) = outbound.recv() => {
                publish_down(&client, &topics, out, &metrics).await;
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        if let Err(e) = client.try_subscribe(wildcard.as_str(), QoS::AtLeastOnce) {
                            error!(error = %e, "relay_subscribe_failed");
                        }
                        info!("relay_channel_connected");
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let Some(inbound) = parse_up(&topics, &publish.topic, &publish.payload) else {
                            continue;
                        };
                        if let Err(e) = inbox.try_send(inbound) {
                            match e {
                                TrySendError::Full(_) => {
                                    metrics.record_inbox_dropped();
                                    if last_drop_warn.elapsed() > Duration::from_secs(1) {
                                        warn!("relay_event_dropped: channel full");
                                        last_drop_warn = Instant::now();
                                    }
                                }
                                TrySendError::Closed(_) => {
                                    warn!("relay inbox closed");
                                    return Ok(());
                                }
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "relay_mqtt_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

async fn publish_down(client: &AsyncClient, topics: &Topics, out: RelayOutbound, metrics: &Metrics) {
    // Presence is refreshed continuously; criticals and their end are not
    let qos = match out.msg {
        DownMessage::Presence { .. } => QoS::AtMostOnce,
        _ => QoS::AtLeastOnce,
    };
    let payload = match serde_json::to_vec(&out.msg) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "down_message_encode_failed");
            return;
        }
    };
    match client.try_publish(topics.down(&out.pid), qos, false, payload) {
        Ok(()) => metrics.record_channel_sent(),
        Err(e) => {
            metrics.record_channel_dropped();
            debug!(error = %e, pid = %out.pid, "down_message_publish_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::CrosswalkId;

    #[test]
    fn test_topics() {
        let topics = Topics::new("crosswalk/");
        assert_eq!(topics.up("p1"), "crosswalk/up/p1");
        assert_eq!(topics.down("p1"), "crosswalk/down/p1");
        assert_eq!(topics.predict(), "crosswalk/predict");
        assert_eq!(topics.up_wildcard(), "crosswalk/up/+");
    }

    #[test]
    fn test_pid_from_up() {
        let topics = Topics::new("crosswalk");
        assert_eq!(topics.pid_from_up("crosswalk/up/abc"), Some("abc"));
        assert_eq!(topics.pid_from_up("crosswalk/down/abc"), None);
        assert_eq!(topics.pid_from_up("crosswalk/up/"), None);
        assert_eq!(topics.pid_from_up("crosswalk/up/a/b"), None);
        assert_eq!(topics.pid_from_up("other/up/abc"), None);
    }

    #[test]
    fn test_parse_up_driver_update() {
        let topics = Topics::new("crosswalk");
        let inbound = parse_up(
            &topics,
            "crosswalk/up/driver-1",
            br#"{"event":"driver_update","crosswalk_id":9,"distance":10.0,"speed":2.5}"#,
        )
        .unwrap();
        assert_eq!(inbound.pid, "driver-1");
        assert_eq!(
            inbound.msg,
            UpMessage::DriverUpdate { crosswalk_id: CrosswalkId(9), distance: Some(10.0), speed: Some(2.5) }
        );
    }

    #[test]
    fn test_parse_up_last_will() {
        let topics = Topics::new("crosswalk");
        let inbound = parse_up(&topics, "crosswalk/up/ped-1", br#"{"event":"disconnect"}"#).unwrap();
        assert_eq!(inbound.msg, UpMessage::Disconnect);
    }

    #[test]
    fn test_parse_invalid_payloads() {
        let topics = Topics::new("crosswalk");
        assert!(parse_up(&topics, "crosswalk/up/p", b"not json").is_none());
        assert!(parse_down(b"{\"event\":\"presence\"}").is_none());
    }

    #[tokio::test]
    async fn test_forward_waits_on_full_inbox() {
        let (tx, mut rx) = mpsc::channel::<ChannelEvent>(1);
        assert!(forward(&tx, ChannelEvent::Connected).await);

        let end = DownMessage::alert_end(CrosswalkId(123));
        let pending = tokio::spawn({
            let tx = tx.clone();
            let end = end.clone();
            async move { forward(&tx, ChannelEvent::Message(end)).await }
        });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        assert_eq!(rx.recv().await, Some(ChannelEvent::Connected));
        assert!(pending.await.unwrap());
        assert_eq!(rx.recv().await, Some(ChannelEvent::Message(end)));

        drop(rx);
        assert!(!forward(&tx, ChannelEvent::Disconnected).await);
    }

    #[test]
    fn test_parse_down_alert_end() {
        let msg = parse_down(br#"{"event":"alert_end","crosswalk_id":123,"ts":1}"#).unwrap();
        assert_eq!(msg, DownMessage::AlertEnd { crosswalk_id: CrosswalkId(123), ts: 1 });
    }
}
