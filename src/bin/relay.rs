//! Crosswalk relay
//!
//! Aggregates per-crosswalk rooms from participant up-messages and sends
//! presence, critical and alert-end notifications back down. Can host an
//! embedded MQTT broker for small deployments.

use clap::Parser;
use crosswalk_guard::infra::broker::spawn_embedded_broker;
use crosswalk_guard::infra::{Config, Metrics};
use crosswalk_guard::io::mqtt::run_relay_channel;
use crosswalk_guard::services::run_relay;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "crosswalk-relay", version, about = "Crosswalk room relay")]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Start the embedded broker regardless of config
    #[arg(long)]
    embedded_broker: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_timer(UtcTime::rfc_3339()).with_target(false).init();

    let args = Args::parse();
    info!(git_hash = env!("GIT_HASH"), "crosswalk-relay starting");

    let config_path = Config::resolve_config_path(args.config.as_deref());
    let config = Config::load_from_path(&config_path);
    let relay = config.relay().clone();

    info!(
        config_file = %config.config_file(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        topic_prefix = %config.topic_prefix(),
        ped_critical_m = %relay.ped_critical_distance_m,
        driver_critical_m = %relay.driver_critical_distance_m,
        debounce_m = %relay.debounce_m,
        "config_loaded"
    );

    if args.embedded_broker || config.broker().embedded {
        spawn_embedded_broker(config.broker())?;
        // Give the broker a moment to bind before the client connects
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    let (inbox_tx, inbox_rx) = mpsc::channel(1000);
    let (outbound_tx, outbound_rx) = mpsc::channel(1000);

    let mqtt = config.mqtt().clone();
    let channel_metrics = metrics.clone();
    let channel_shutdown = shutdown_rx.clone();
    let channel_task = tokio::spawn(async move {
        if let Err(e) = run_relay_channel(&mqtt, outbound_rx, inbox_tx, channel_metrics, channel_shutdown).await {
            error!(error = %e, "relay_channel_error");
        }
    });

    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = crosswalk_guard::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                "relay".to_string(),
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log_relay();
        }
    });

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    run_relay(relay, inbox_rx, outbound_tx, metrics, shutdown_rx).await;
    let _ = channel_task.await;

    info!("crosswalk-relay shutdown complete");
    Ok(())
}
