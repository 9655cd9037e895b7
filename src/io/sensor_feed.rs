//! JSON-lines sensor feed
//!
//! Stands in for the device sensor wrappers: each line is one reading or
//! UI command, e.g.
//!
//! ```text
//! {"type":"start"}
//! {"type":"location","latitude":47.5,"longitude":19.04,"accuracy":12.0,"speed":1.2}
//! {"type":"heading","degrees":92.0}
//! {"type":"magnitude","value":3.4}
//! {"type":"frame","image":"<base64 jpeg>"}
//! {"type":"wait","ms":500}
//! ```

use crate::domain::types::Location;
use serde::Deserialize;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// UI commands carried on the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Calibrate,
    CancelCalibration,
}

/// One reading delivered to the participant loop
#[derive(Debug, Clone, PartialEq)]
pub enum SensorInput {
    Location(Location),
    /// Compass heading in degrees
    Heading(f64),
    /// Acceleration magnitude sample
    Magnitude(f64),
    /// Latest camera frame (base64 JPEG)
    Frame(String),
    Command(Command),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum FeedLine {
    Location(Location),
    Heading { degrees: f64 },
    Magnitude { value: f64 },
    Frame { image: String },
    Start,
    Stop,
    Calibrate,
    CancelCalibration,
    /// Replay pacing; not forwarded
    Wait { ms: u64 },
}

enum Parsed {
    Input(SensorInput),
    Wait(Duration),
}

fn parse_line(line: &str) -> Option<Parsed> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let parsed: FeedLine = match serde_json::from_str(line) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "sensor_feed_line_invalid");
            return None;
        }
    };
    Some(match parsed {
        FeedLine::Location(loc) => Parsed::Input(SensorInput::Location(loc)),
        FeedLine::Heading { degrees } => Parsed::Input(SensorInput::Heading(degrees)),
        FeedLine::Magnitude { value } => Parsed::Input(SensorInput::Magnitude(value)),
        FeedLine::Frame { image } => Parsed::Input(SensorInput::Frame(image)),
        FeedLine::Start => Parsed::Input(SensorInput::Command(Command::Start)),
        FeedLine::Stop => Parsed::Input(SensorInput::Command(Command::Stop)),
        FeedLine::Calibrate => Parsed::Input(SensorInput::Command(Command::Calibrate)),
        FeedLine::CancelCalibration => Parsed::Input(SensorInput::Command(Command::CancelCalibration)),
        FeedLine::Wait { ms } => Parsed::Wait(Duration::from_millis(ms)),
    })
}

/// Read the feed until EOF, forwarding each reading into `inbox`
///
/// Returns the number of readings forwarded.
pub async fn run_sensor_feed<R, E>(reader: R, inbox: mpsc::Sender<E>) -> anyhow::Result<u64>
where
    R: AsyncBufRead + Unpin,
    E: From<SensorInput>,
{
    let mut lines = reader.lines();
    let mut forwarded = 0u64;

    while let Some(line) = lines.next_line().await? {
        match parse_line(&line) {
            Some(Parsed::Input(input)) => {
                debug!(input = ?input_kind(&input), "sensor_input");
                if inbox.send(E::from(input)).await.is_err() {
                    debug!("sensor_feed_inbox_closed");
                    break;
                }
                forwarded += 1;
            }
            Some(Parsed::Wait(d)) => tokio::time::sleep(d).await,
            None => {}
        }
    }

    info!(forwarded = %forwarded, "sensor_feed_finished");
    Ok(forwarded)
}

fn input_kind(input: &SensorInput) -> &'static str {
    match input {
        SensorInput::Location(_) => "location",
        SensorInput::Heading(_) => "heading",
        SensorInput::Magnitude(_) => "magnitude",
        SensorInput::Frame(_) => "frame",
        SensorInput::Command(_) => "command",
    }
}
