//! IO modules - external system interfaces
//!
//! - `channel` - Typed up/down messages and the non-blocking outbound sender
//! - `mqtt` - MQTT transport for participants and the relay
//! - `lookup` - Geo lookup and routing traits
//! - `overpass` - Overpass API crosswalk lookup
//! - `osrm` - OSRM table routing
//! - `sensor_feed` - JSON-lines sensor/command feed
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod channel;
pub mod lookup;
pub mod mqtt;
pub mod osrm;
pub mod overpass;
pub mod prometheus;
pub mod sensor_feed;

pub use channel::{create_channel, ChannelSender, DownMessage, Outbound, PredictRequest, UpMessage};
pub use lookup::{GeoLookup, LookupError, RoutingService};
pub use mqtt::{ChannelEvent, RelayInbound, RelayOutbound, Topics};
pub use osrm::OsrmClient;
pub use overpass::OverpassClient;
pub use sensor_feed::{Command, SensorInput};
