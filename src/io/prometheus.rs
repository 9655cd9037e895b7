//! Prometheus metrics HTTP endpoint
//!
//! Exposes participant/relay metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server. Scraping never resets the periodic
//! counters used by the summary log.

use crate::infra::metrics::{
    Metrics, METRICS_BUCKET_BOUNDS, METRICS_LOOKUP_BOUNDS, METRICS_NUM_BUCKETS,
};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with node label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, node: &str, val: i64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{node=\"{node}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    node: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{node=\"{node}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{node=\"{node}\",le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_sum{{node=\"{node}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{node=\"{node}\"}} {cumulative}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, node: &str) -> String {
    use MetricType::{Counter, Gauge};

    let mut output = String::with_capacity(4096);
    let counters: [(&str, &str, MetricType, i64); 16] = [
        ("crosswalk_events_total", "Events processed by the serialized loop", Counter, metrics.events_total() as i64),
        ("crosswalk_transitions_total", "Alert level transitions", Counter, metrics.transitions_total() as i64),
        ("crosswalk_alert_level", "Current alert level (-1 off .. 4 critical)", Gauge, metrics.alert_level()),
        ("crosswalk_joined_rooms", "Crosswalk rooms currently joined", Gauge, metrics.joined_rooms() as i64),
        ("crosswalk_critical_rooms", "Joined rooms asserting critical", Gauge, metrics.critical_rooms() as i64),
        ("crosswalk_channel_sent_total", "Messages handed to the transport", Counter, metrics.channel_sent() as i64),
        ("crosswalk_channel_dropped_total", "Messages dropped on send", Counter, metrics.channel_dropped() as i64),
        ("crosswalk_inbox_dropped_total", "Inbound events dropped on a full inbox", Counter, metrics.inbox_dropped() as i64),
        ("crosswalk_lookups_ok_total", "Successful geo/routing lookups", Counter, metrics.lookups_ok() as i64),
        ("crosswalk_lookups_failed_total", "Failed geo/routing lookups", Counter, metrics.lookups_failed() as i64),
        ("crosswalk_timers_started_total", "Timers started", Counter, metrics.timers_started() as i64),
        ("crosswalk_timers_stopped_total", "Timers cancelled", Counter, metrics.timers_stopped() as i64),
        ("crosswalk_stale_events_total", "Room events ignored for non-member crosswalks", Counter, metrics.stale_events() as i64),
        ("crosswalk_calibrations_ok_total", "Completed watching calibrations", Counter, metrics.calibrations_ok() as i64),
        ("crosswalk_calibrations_failed_total", "Failed watching calibrations", Counter, metrics.calibrations_failed() as i64),
        ("crosswalk_relay_rooms", "Rooms held by the relay", Gauge, metrics.relay_rooms() as i64),
    ];
    for (name, help, typ, val) in counters {
        write_metric(&mut output, name, help, typ, node, val);
    }
    write_metric(
        &mut output,
        "crosswalk_relay_notifications_total",
        "Notifications published by the relay",
        Counter,
        node,
        metrics.relay_notifications() as i64,
    );

    write_histogram(
        &mut output,
        "crosswalk_event_latency_us",
        "Event processing latency in microseconds",
        node,
        &metrics.latency_buckets(),
        &METRICS_BUCKET_BOUNDS,
        metrics.latency_total_us(),
    );
    write_histogram(
        &mut output,
        "crosswalk_lookup_latency_ms",
        "Geo/routing lookup latency in milliseconds",
        node,
        &metrics.lookup_latency_buckets(),
        &METRICS_LOOKUP_BOUNDS,
        metrics.lookup_latency_total_ms(),
    );

    output
}

fn text_response(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body)));
    *resp.status_mut() = status;
    resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    node: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(&metrics, &node),
        ),
        (&Method::GET, "/health") => text_response(StatusCode::OK, "text/plain", "ok".to_string()),
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
    })
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    node: String,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let node = Arc::new(node);

    info!(port = %port, node = %node, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let node = node.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let node = node.clone();
                                async move { handle_request(req, metrics, node).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
