//! Typed participant <-> relay messages and the outbound channel
//!
//! Provides a non-blocking way for the participant loop to hand messages to
//! the transport. Uses a bounded mpsc channel so a stalled broker cannot grow
//! memory without limit; overflow is logged and counted.

use crate::domain::types::{epoch_secs, CrosswalkId};
use crate::infra::metrics::Metrics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

/// Participant -> relay, published on `{prefix}/up/{pid}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UpMessage {
    PedEnter {
        crosswalk_id: CrosswalkId,
    },
    PedLeave {
        crosswalk_id: CrosswalkId,
    },
    DriverEnter {
        crosswalk_id: CrosswalkId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        distance: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
    },
    DriverLeave {
        crosswalk_id: CrosswalkId,
    },
    DriverUpdate {
        crosswalk_id: CrosswalkId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        distance: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
    },
    /// Last-will payload; never sent by the participant loop itself
    Disconnect,
}

impl UpMessage {
    pub fn crosswalk_id(&self) -> Option<CrosswalkId> {
        match self {
            UpMessage::PedEnter { crosswalk_id }
            | UpMessage::PedLeave { crosswalk_id }
            | UpMessage::DriverEnter { crosswalk_id, .. }
            | UpMessage::DriverLeave { crosswalk_id }
            | UpMessage::DriverUpdate { crosswalk_id, .. } => Some(*crosswalk_id),
            UpMessage::Disconnect => None,
        }
    }

    /// Membership changes are delivered at-least-once; updates are best effort
    pub fn is_membership_change(&self) -> bool {
        matches!(
            self,
            UpMessage::PedEnter { .. }
                | UpMessage::PedLeave { .. }
                | UpMessage::DriverEnter { .. }
                | UpMessage::DriverLeave { .. }
        )
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            UpMessage::PedEnter { .. } => "ped_enter",
            UpMessage::PedLeave { .. } => "ped_leave",
            UpMessage::DriverEnter { .. } => "driver_enter",
            UpMessage::DriverLeave { .. } => "driver_leave",
            UpMessage::DriverUpdate { .. } => "driver_update",
            UpMessage::Disconnect => "disconnect",
        }
    }
}

/// Camera frame for the external crosswalk classifier, published on `{prefix}/predict`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictRequest {
    pub pid: String,
    /// Base64 encoded JPEG as produced by the camera layer
    pub image: String,
    pub allow_store: bool,
}

/// Relay/classifier -> participant, published on `{prefix}/down/{pid}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DownMessage {
    Presence {
        crosswalk_id: CrosswalkId,
        ped_count: u32,
        driver_count: u32,
        ts: u64,
    },
    PedCritical {
        crosswalk_id: CrosswalkId,
        min_distance: f64,
        ts: u64,
    },
    DriverCritical {
        crosswalk_id: CrosswalkId,
        ts: u64,
    },
    AlertEnd {
        crosswalk_id: CrosswalkId,
        ts: u64,
    },
    PredictResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<String>,
        result: bool,
    },
}

impl DownMessage {
    pub fn presence(crosswalk_id: CrosswalkId, ped_count: usize, driver_count: usize) -> Self {
        DownMessage::Presence {
            crosswalk_id,
            ped_count: ped_count as u32,
            driver_count: driver_count as u32,
            ts: epoch_secs(),
        }
    }

    pub fn ped_critical(crosswalk_id: CrosswalkId, min_distance: f64) -> Self {
        DownMessage::PedCritical { crosswalk_id, min_distance, ts: epoch_secs() }
    }

    pub fn driver_critical(crosswalk_id: CrosswalkId) -> Self {
        DownMessage::DriverCritical { crosswalk_id, ts: epoch_secs() }
    }

    pub fn alert_end(crosswalk_id: CrosswalkId) -> Self {
        DownMessage::AlertEnd { crosswalk_id, ts: epoch_secs() }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            DownMessage::Presence { .. } => "presence",
            DownMessage::PedCritical { .. } => "ped_critical",
            DownMessage::DriverCritical { .. } => "driver_critical",
            DownMessage::AlertEnd { .. } => "alert_end",
            DownMessage::PredictResult { .. } => "predict_result",
        }
    }
}

/// Everything the participant loop can emit
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Up(UpMessage),
    Predict(PredictRequest),
}

/// Sender handle for outbound messages
///
/// Clone this to share across producers. Non-blocking: if the channel is
/// full or the transport is gone, the message is dropped, logged and counted.
#[derive(Clone)]
pub struct ChannelSender {
    tx: mpsc::Sender<Outbound>,
    metrics: Option<Arc<Metrics>>,
}

impl ChannelSender {
    pub fn new(tx: mpsc::Sender<Outbound>, metrics: Option<Arc<Metrics>>) -> Self {
        Self { tx, metrics }
    }

    pub fn send_up(&self, msg: UpMessage) -> bool {
        self.send(Outbound::Up(msg))
    }

    pub fn send_predict(&self, request: PredictRequest) -> bool {
        self.send(Outbound::Predict(request))
    }

    /// Returns true if the message was queued
    pub fn send(&self, msg: Outbound) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => {
                if let Some(ref m) = self.metrics {
                    m.record_channel_sent();
                }
                true
            }
            Err(e) => {
                let (reason, msg) = match e {
                    TrySendError::Full(msg) => ("full", msg),
                    TrySendError::Closed(msg) => ("closed", msg),
                };
                let event = match &msg {
                    Outbound::Up(up) => up.event_name(),
                    Outbound::Predict(_) => "predict",
                };
                warn!(reason = reason, event = event, "channel_send_dropped");
                if let Some(ref m) = self.metrics {
                    m.record_channel_dropped();
                }
                false
            }
        }
    }
}

/// Create a new outbound channel pair
///
/// Returns (sender, receiver) where sender can be cloned and shared.
pub fn create_channel(
    buffer_size: usize,
    metrics: Option<Arc<Metrics>>,
) -> (ChannelSender, mpsc::Receiver<Outbound>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (ChannelSender::new(tx, metrics), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_up_message_wire_format() {
        let msg = UpMessage::PedEnter { crosswalk_id: CrosswalkId(123) };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, serde_json::json!({"event": "ped_enter", "crosswalk_id": 123}));

        let msg = UpMessage::DriverEnter { crosswalk_id: CrosswalkId(7), distance: Some(42.5), speed: None };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, serde_json::json!({"event": "driver_enter", "crosswalk_id": 7, "distance": 42.5}));
    }

    #[test]
    fn test_last_will_payload() {
        let parsed: UpMessage = serde_json::from_str(r#"{"event":"disconnect"}"#).unwrap();
        assert_eq!(parsed, UpMessage::Disconnect);
        assert_eq!(parsed.crosswalk_id(), None);
    }

    #[test]
    fn test_down_message_parse() {
        let parsed: DownMessage = serde_json::from_str(
            r#"{"event":"presence","crosswalk_id":7,"ped_count":1,"driver_count":0,"ts":1700000000}"#,
        )
        .unwrap();
        assert_eq!(
            parsed,
            DownMessage::Presence { crosswalk_id: CrosswalkId(7), ped_count: 1, driver_count: 0, ts: 1700000000 }
        );

        let parsed: DownMessage =
            serde_json::from_str(r#"{"event":"predict_result","result":true}"#).unwrap();
        assert_eq!(parsed, DownMessage::PredictResult { pid: None, result: true });

        assert!(serde_json::from_str::<DownMessage>(r#"{"event":"bogus"}"#).is_err());
    }

    #[test]
    fn test_membership_change_classification() {
        assert!(UpMessage::PedLeave { crosswalk_id: CrosswalkId(1) }.is_membership_change());
        assert!(!UpMessage::DriverUpdate { crosswalk_id: CrosswalkId(1), distance: None, speed: None }
            .is_membership_change());
    }

    #[tokio::test]
    async fn test_sender_counts_drops_when_full() {
        let metrics = Arc::new(Metrics::new());
        let (sender, mut rx) = create_channel(1, Some(metrics.clone()));

        assert!(sender.send_up(UpMessage::PedEnter { crosswalk_id: CrosswalkId(1) }));
        assert!(!sender.send_up(UpMessage::PedEnter { crosswalk_id: CrosswalkId(2) }));

        assert_eq!(metrics.channel_sent(), 1);
        assert_eq!(metrics.channel_dropped(), 1);
        assert_eq!(rx.recv().await, Some(Outbound::Up(UpMessage::PedEnter { crosswalk_id: CrosswalkId(1) })));
    }

    #[tokio::test]
    async fn test_sender_closed_channel() {
        let (sender, rx) = create_channel(4, None);
        drop(rx);
        assert!(!sender.send_up(UpMessage::DriverLeave { crosswalk_id: CrosswalkId(3) }));
    }
}
