//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::types::{AlertLevel, Role};
use anyhow::{bail, Context};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct ParticipantSection {
    #[serde(default = "default_role")]
    pub role: Role,
    /// Stable participant id; a UUIDv7 is generated when absent
    #[serde(default)]
    pub pid: Option<String>,
}

fn default_role() -> Role {
    Role::Pedestrian
}

impl Default for ParticipantSection {
    fn default() -> Self {
        Self { role: default_role(), pid: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Topic prefix; participants use `{prefix}/up/{pid}` and `{prefix}/down/{pid}`
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_topic_prefix() -> String {
    "crosswalk".to_string()
}

fn default_keep_alive_secs() -> u64 {
    5
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            topic_prefix: default_topic_prefix(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccuracyConfig {
    /// Fixes with accuracy above this (meters) are too imprecise to act on
    #[serde(default = "default_max_accuracy_m")]
    pub max_accuracy_m: f64,
}

fn default_max_accuracy_m() -> f64 {
    50.0
}

impl Default for AccuracyConfig {
    fn default() -> Self {
        Self { max_accuracy_m: default_max_accuracy_m() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchingConfig {
    /// Moving average window (samples)
    #[serde(default = "default_window")]
    pub window: usize,
    /// Averages at or below this are treated as "not moving"
    #[serde(default = "default_min_magnitude")]
    pub min_magnitude: f64,
    /// Pre-calibrated threshold; 0 leaves the detector inert until calibration
    #[serde(default)]
    pub threshold: f64,
    /// Length of each calibration phase
    #[serde(default = "default_calibration_phase_secs")]
    pub calibration_phase_secs: u64,
    /// Phase averages at or below this fail calibration
    #[serde(default = "default_calibration_min_average")]
    pub calibration_min_average: f64,
}

fn default_window() -> usize {
    100
}

fn default_min_magnitude() -> f64 {
    0.5
}

fn default_calibration_phase_secs() -> u64 {
    10
}

fn default_calibration_min_average() -> f64 {
    1.0
}

impl Default for WatchingConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            min_magnitude: default_min_magnitude(),
            threshold: 0.0,
            calibration_phase_secs: default_calibration_phase_secs(),
            calibration_min_average: default_calibration_min_average(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VisualConfig {
    /// Consecutive negative frames before dropping back to level 1
    #[serde(default = "default_miss_limit")]
    pub miss_limit: u32,
    /// Frame submission period (3 Hz by default)
    #[serde(default = "default_predict_interval_ms")]
    pub predict_interval_ms: u64,
    /// Whether the classifier may keep submitted frames
    #[serde(default)]
    pub allow_store: bool,
}

fn default_miss_limit() -> u32 {
    5
}

fn default_predict_interval_ms() -> u64 {
    333
}

impl Default for VisualConfig {
    fn default() -> Self {
        Self {
            miss_limit: default_miss_limit(),
            predict_interval_ms: default_predict_interval_ms(),
            allow_store: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelevanceConfig {
    #[serde(default = "default_ped_refresh_secs")]
    pub ped_refresh_secs: u64,
    #[serde(default = "default_driver_refresh_secs")]
    pub driver_refresh_secs: u64,
    /// Geo cache time-to-live
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Movement since the last fetch that invalidates the cache
    #[serde(default = "default_refetch_distance_m")]
    pub refetch_distance_m: f64,
    #[serde(default = "default_heading_tolerance_deg")]
    pub heading_tolerance_deg: f64,
    /// A free-standing node beats the nearest way only when this many times closer
    #[serde(default = "default_node_preference_factor")]
    pub node_preference_factor: f64,
    /// Lower bound on the accuracy-driven pedestrian lookup radius
    #[serde(default = "default_ped_min_radius_m")]
    pub ped_min_radius_m: f64,
    /// Pedestrian fixes less accurate than this are not looked up at all
    #[serde(default = "default_ped_max_radius_m")]
    pub ped_max_radius_m: f64,
    #[serde(default = "default_driver_fetch_radius_m")]
    pub driver_fetch_radius_m: f64,
    /// Routing duration bound for a crosswalk to count as relevant
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: f64,
    /// Live distance bound for a relevant crosswalk to count as dangered
    #[serde(default = "default_danger_radius_m")]
    pub danger_radius_m: f64,
    #[serde(default = "default_distance_watch_ms")]
    pub distance_watch_ms: u64,
    #[serde(default = "default_overpass_url")]
    pub overpass_url: String,
    #[serde(default = "default_osrm_url")]
    pub osrm_url: String,
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
}

fn default_ped_refresh_secs() -> u64 {
    5
}

fn default_driver_refresh_secs() -> u64 {
    10
}

fn default_cache_ttl_secs() -> u64 {
    30
}

fn default_refetch_distance_m() -> f64 {
    30.0
}

fn default_heading_tolerance_deg() -> f64 {
    20.0
}

fn default_node_preference_factor() -> f64 {
    3.0
}

fn default_ped_min_radius_m() -> f64 {
    10.0
}

fn default_ped_max_radius_m() -> f64 {
    500.0
}

fn default_driver_fetch_radius_m() -> f64 {
    200.0
}

fn default_max_duration_secs() -> f64 {
    25.0
}

fn default_danger_radius_m() -> f64 {
    150.0
}

fn default_distance_watch_ms() -> u64 {
    200
}

fn default_overpass_url() -> String {
    "https://overpass.private.coffee/api/interpreter".to_string()
}

fn default_osrm_url() -> String {
    "https://router.project-osrm.org/table/v1/driving/".to_string()
}

fn default_http_timeout_ms() -> u64 {
    4000
}

impl Default for RelevanceConfig {
    fn default() -> Self {
        Self {
            ped_refresh_secs: default_ped_refresh_secs(),
            driver_refresh_secs: default_driver_refresh_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            refetch_distance_m: default_refetch_distance_m(),
            heading_tolerance_deg: default_heading_tolerance_deg(),
            node_preference_factor: default_node_preference_factor(),
            ped_min_radius_m: default_ped_min_radius_m(),
            ped_max_radius_m: default_ped_max_radius_m(),
            driver_fetch_radius_m: default_driver_fetch_radius_m(),
            max_duration_secs: default_max_duration_secs(),
            danger_radius_m: default_danger_radius_m(),
            distance_watch_ms: default_distance_watch_ms(),
            overpass_url: default_overpass_url(),
            osrm_url: default_osrm_url(),
            http_timeout_ms: default_http_timeout_ms(),
        }
    }
}

/// Room thresholds for one role
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PresencePolicy {
    /// Lowest level at which the participant holds room membership
    #[serde(default = "default_join_level")]
    pub join_level: AlertLevel,
    /// Lowest level from which a critical assertion escalates to 4
    #[serde(default = "default_critical_from")]
    pub critical_from: AlertLevel,
}

fn default_join_level() -> AlertLevel {
    AlertLevel::CROSSWALK
}

fn default_critical_from() -> AlertLevel {
    AlertLevel::CROSSWALK
}

impl Default for PresencePolicy {
    fn default() -> Self {
        Self { join_level: default_join_level(), critical_from: default_critical_from() }
    }
}

impl PresencePolicy {
    pub fn new(join_level: AlertLevel, critical_from: AlertLevel) -> Self {
        Self { join_level, critical_from }
    }

    fn validate(&self, role: &str) -> anyhow::Result<()> {
        let allowed = AlertLevel::CROSSWALK..=AlertLevel::PRESENCE;
        if !allowed.contains(&self.join_level) {
            bail!("presence.{role}.join_level must be 2 or 3, got {}", self.join_level);
        }
        if !allowed.contains(&self.critical_from) {
            bail!("presence.{role}.critical_from must be 2 or 3, got {}", self.critical_from);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresenceConfig {
    /// Membership heartbeat period
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default)]
    pub pedestrian: PresencePolicy,
    #[serde(default)]
    pub driver: PresencePolicy,
}

fn default_heartbeat_ms() -> u64 {
    1000
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: default_heartbeat_ms(),
            pedestrian: PresencePolicy::default(),
            driver: PresencePolicy::default(),
        }
    }
}

impl PresenceConfig {
    pub fn policy(&self, role: Role) -> PresencePolicy {
        match role {
            Role::Pedestrian => self.pedestrian,
            Role::Driver => self.driver,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_ped_critical_distance_m")]
    pub ped_critical_distance_m: f64,
    #[serde(default = "default_driver_critical_distance_m")]
    pub driver_critical_distance_m: f64,
    /// Minimum distance change before a critical is re-sent
    #[serde(default = "default_debounce_m")]
    pub debounce_m: f64,
    #[serde(default = "default_driver_ttl_ms")]
    pub driver_ttl_ms: u64,
    #[serde(default = "default_ped_ttl_ms")]
    pub ped_ttl_ms: u64,
    #[serde(default = "default_prune_interval_ms")]
    pub prune_interval_ms: u64,
}

fn default_ped_critical_distance_m() -> f64 {
    100.0
}

fn default_driver_critical_distance_m() -> f64 {
    50.0
}

fn default_debounce_m() -> f64 {
    3.0
}

fn default_driver_ttl_ms() -> u64 {
    3000
}

fn default_ped_ttl_ms() -> u64 {
    15000
}

fn default_prune_interval_ms() -> u64 {
    1000
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ped_critical_distance_m: default_ped_critical_distance_m(),
            driver_critical_distance_m: default_driver_critical_distance_m(),
            debounce_m: default_debounce_m(),
            driver_ttl_ms: default_driver_ttl_ms(),
            ped_ttl_ms: default_ped_ttl_ms(),
            prune_interval_ms: default_prune_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Run an embedded broker inside the relay process
    #[serde(default)]
    pub embedded: bool,
    #[serde(default = "default_broker_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_broker_max_connections")]
    pub max_connections: usize,
}

fn default_broker_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_broker_max_connections() -> usize {
    1000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            embedded: false,
            bind_address: default_broker_bind_address(),
            port: default_broker_port(),
            max_connections: default_broker_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default)]
    pub prometheus_port: u16,
}

fn default_metrics_interval_secs() -> u64 {
    30
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs(), prometheus_port: 0 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub participant: ParticipantSection,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub accuracy: AccuracyConfig,
    #[serde(default)]
    pub watching: WatchingConfig,
    #[serde(default)]
    pub visual: VisualConfig,
    #[serde(default)]
    pub relevance: RelevanceConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    role: Role,
    pid: String,
    mqtt: MqttConfig,
    accuracy: AccuracyConfig,
    watching: WatchingConfig,
    visual: VisualConfig,
    relevance: RelevanceConfig,
    presence: PresenceConfig,
    relay: RelayConfig,
    broker: BrokerConfig,
    metrics: MetricsConfig,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        let pid = toml_config
            .participant
            .pid
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());

        Self {
            role: toml_config.participant.role,
            pid,
            mqtt: toml_config.mqtt,
            accuracy: toml_config.accuracy,
            watching: toml_config.watching,
            visual: toml_config.visual,
            relevance: toml_config.relevance,
            presence: toml_config.presence,
            relay: toml_config.relay,
            broker: toml_config.broker,
            metrics: toml_config.metrics,
            config_file,
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(cli_path: Option<&str>) -> String {
        if let Some(path) = cli_path {
            return path.to_string();
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        toml_config.presence.pedestrian.validate("pedestrian")?;
        toml_config.presence.driver.validate("driver")?;
        if toml_config.watching.window == 0 {
            bail!("watching.window must be at least 1");
        }
        if !(15..=60).contains(&toml_config.relevance.cache_ttl_secs) {
            bail!("relevance.cache_ttl_secs must be within 15..=60, got {}", toml_config.relevance.cache_ttl_secs);
        }

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), path = %path, "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn pid(&self) -> &str {
        &self.pid
    }

    pub fn mqtt(&self) -> &MqttConfig {
        &self.mqtt
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt.host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt.port
    }

    pub fn topic_prefix(&self) -> &str {
        &self.mqtt.topic_prefix
    }

    pub fn accuracy(&self) -> &AccuracyConfig {
        &self.accuracy
    }

    pub fn watching(&self) -> &WatchingConfig {
        &self.watching
    }

    pub fn visual(&self) -> &VisualConfig {
        &self.visual
    }

    pub fn relevance(&self) -> &RelevanceConfig {
        &self.relevance
    }

    pub fn presence(&self) -> &PresenceConfig {
        &self.presence
    }

    pub fn presence_policy(&self) -> PresencePolicy {
        self.presence.policy(self.role)
    }

    pub fn relay(&self) -> &RelayConfig {
        &self.relay
    }

    pub fn broker(&self) -> &BrokerConfig {
        &self.broker
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics.interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.metrics.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to set the role
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Builder method for tests to pin the pid
    pub fn with_pid(mut self, pid: &str) -> Self {
        self.pid = pid.to_string();
        self
    }

    /// Builder method for tests to override a role's presence policy
    pub fn with_presence_policy(mut self, role: Role, policy: PresencePolicy) -> Self {
        match role {
            Role::Pedestrian => self.presence.pedestrian = policy,
            Role::Driver => self.presence.driver = policy,
        }
        self
    }

    /// Builder method for tests to seed the watching threshold
    pub fn with_watching_threshold(mut self, threshold: f64) -> Self {
        self.watching.threshold = threshold;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.role(), Role::Pedestrian);
        assert_eq!(config.mqtt_host(), "localhost");
        assert_eq!(config.mqtt_port(), 1883);
        assert_eq!(config.topic_prefix(), "crosswalk");
        assert_eq!(config.accuracy().max_accuracy_m, 50.0);
        assert_eq!(config.watching().window, 100);
        assert_eq!(config.visual().miss_limit, 5);
        assert_eq!(config.relevance().heading_tolerance_deg, 20.0);
        assert_eq!(config.presence().heartbeat_ms, 1000);
        assert_eq!(config.presence_policy().join_level, AlertLevel::CROSSWALK);
    }

    #[test]
    fn test_generated_pid_is_unique() {
        let a = Config::default();
        let b = Config::default();
        assert!(!a.pid().is_empty());
        assert_ne!(a.pid(), b.pid());
    }

    #[test]
    fn test_resolve_config_path_from_cli() {
        assert_eq!(Config::resolve_config_path(Some("config/driver.toml")), "config/driver.toml");
    }

    #[test]
    fn test_policy_per_role() {
        let strict = PresencePolicy::new(AlertLevel::PRESENCE, AlertLevel::PRESENCE);
        let config = Config::default().with_presence_policy(Role::Driver, strict);
        assert_eq!(config.presence().policy(Role::Driver), strict);
        assert_eq!(config.presence().policy(Role::Pedestrian), PresencePolicy::default());
    }

    #[test]
    fn test_policy_validation() {
        assert!(PresencePolicy::default().validate("pedestrian").is_ok());
        let bad = PresencePolicy::new(AlertLevel::CRITICAL, AlertLevel::CROSSWALK);
        assert!(bad.validate("driver").is_err());
        let bad = PresencePolicy::new(AlertLevel::CROSSWALK, AlertLevel::SUSPECTED);
        assert!(bad.validate("driver").is_err());
    }
}
