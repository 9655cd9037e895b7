//! Infrastructure - configuration, metrics, and broker
//!
//! - `config` - Application configuration (TOML loading, defaults)
//! - `metrics` - Lock-free metrics collection
//! - `broker` - Embedded MQTT broker (rumqttd) for the relay

pub mod broker;
pub mod config;
pub mod metrics;

pub use config::{Config, PresencePolicy};
pub use metrics::Metrics;
