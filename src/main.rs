//! Crosswalk guard participant
//!
//! Runs one pedestrian or driver client: reads sensor readings from a
//! JSON-lines feed, keeps the alert level and talks to the relay over MQTT.
//!
//! Module structure:
//! - `domain/` - Core types, geometry and the alert state machine
//! - `io/` - External interfaces (MQTT, Overpass, OSRM, sensor feed)
//! - `services/` - Business logic (Participant, relevance, presence, relay)
//! - `infra/` - Infrastructure (Config, Metrics, Broker)

use clap::Parser;
use crosswalk_guard::infra::{Config, Metrics};
use crosswalk_guard::io::lookup::{GeoLookup, RoutingService};
use crosswalk_guard::io::{create_channel, OsrmClient, OverpassClient};
use crosswalk_guard::services::{Participant, ParticipantEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Crosswalk guard - pedestrian/driver alert client
#[derive(Parser, Debug)]
#[command(name = "crosswalk-guard", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// JSON-lines sensor feed (stdin when omitted)
    #[arg(short, long)]
    feed: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    // RUST_LOG overrides; INFO by default, debug shows timers and room traffic
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_timer(UtcTime::rfc_3339()).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!(git_hash = env!("GIT_HASH"), "crosswalk-guard starting");

    let config_path = Config::resolve_config_path(args.config.as_deref());
    let config = Config::load_from_path(&config_path);
    let policy = config.presence_policy();

    info!(
        config_file = %config.config_file(),
        role = %config.role().as_str(),
        pid = %config.pid(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        topic_prefix = %config.topic_prefix(),
        join_level = %policy.join_level,
        critical_from = %policy.critical_from,
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    let relevance = config.relevance();
    let http_timeout = Duration::from_millis(relevance.http_timeout_ms);
    let geo: Arc<dyn GeoLookup> = Arc::new(OverpassClient::new(&relevance.overpass_url, http_timeout)?);
    let routing: Arc<dyn RoutingService> = Arc::new(OsrmClient::new(&relevance.osrm_url, http_timeout)?);

    // Bounded channels for backpressure
    let (sender, outbound_rx) = create_channel(256, Some(metrics.clone()));
    let (inbox_tx, inbox_rx) = mpsc::channel::<ParticipantEvent>(1000);

    // MQTT transport; exits once every sender is dropped
    let channel_config = config.clone();
    let channel_inbox = inbox_tx.clone();
    let channel_metrics = metrics.clone();
    let channel_task = tokio::spawn(async move {
        if let Err(e) =
            crosswalk_guard::io::mqtt::run_participant_channel(&channel_config, outbound_rx, channel_inbox, channel_metrics)
                .await
        {
            error!(error = %e, "participant_channel_error");
        }
    });

    // Sensor feed
    let feed_inbox = inbox_tx.clone();
    let feed_path = args.feed.clone();
    tokio::spawn(async move {
        let result = match feed_path {
            Some(path) => match tokio::fs::File::open(&path).await {
                Ok(file) => crosswalk_guard::io::sensor_feed::run_sensor_feed(BufReader::new(file), feed_inbox).await,
                Err(e) => Err(anyhow::Error::new(e).context(format!("Failed to open feed {path}"))),
            },
            None => {
                crosswalk_guard::io::sensor_feed::run_sensor_feed(BufReader::new(tokio::io::stdin()), feed_inbox).await
            }
        };
        match result {
            Ok(count) => info!(readings = %count, "sensor_feed_finished"),
            Err(e) => error!(error = %format!("{e:#}"), "sensor_feed_error"),
        }
    });

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_shutdown = shutdown_rx.clone();
        let node = config.pid().to_string();
        tokio::spawn(async move {
            if let Err(e) =
                crosswalk_guard::io::prometheus::start_metrics_server(prometheus_port, prom_metrics, node, prom_shutdown)
                    .await
            {
                error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Start metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    let mut participant = Participant::new(config, sender, inbox_tx, geo, routing, metrics);

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    participant.run(inbox_rx, shutdown_rx).await;

    // Dropping the participant drops the last sender; the channel drains its leaves
    drop(participant);
    if tokio::time::timeout(Duration::from_secs(3), channel_task).await.is_err() {
        warn!("participant_channel_drain_timeout");
    }

    info!("crosswalk-guard shutdown complete");
    Ok(())
}
