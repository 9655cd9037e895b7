//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use crate::domain::types::AlertLevel;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Lookup latency bucket boundaries (milliseconds)
/// Buckets: ≤25, ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, >12800 ms
const LOOKUP_BOUNDS: [u64; 10] = [25, 50, 100, 200, 400, 800, 1600, 3200, 6400, 12800];

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

#[inline]
fn lookup_bucket_index(latency_ms: u64) -> usize {
    LOOKUP_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// Shared by the participant loop, its channel task and lookup tasks, and by
/// the relay. The `report()` method atomically swaps periodic counters.
pub struct Metrics {
    /// Total events ever processed (monotonic)
    events_total: AtomicU64,
    /// Events since last report (reset on report)
    events_since_report: AtomicU64,
    /// Sum of latencies in microseconds (reset on report)
    latency_sum_us: AtomicU64,
    /// Max latency in microseconds (reset on report)
    latency_max_us: AtomicU64,
    /// Event processing latency histogram buckets (reset on report)
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Event latency histogram for scraping (monotonic)
    latency_buckets_total: [AtomicU64; NUM_BUCKETS],
    /// Sum of all event latencies in microseconds (monotonic)
    latency_total_us: AtomicU64,
    /// Level transitions applied (monotonic)
    transitions_total: AtomicU64,
    /// Current alert level (gauge)
    alert_level: AtomicI64,
    /// Rooms currently joined (gauge)
    joined_rooms: AtomicU64,
    /// Rooms currently asserting critical (gauge)
    critical_rooms: AtomicU64,
    /// Messages handed to the transport (monotonic)
    channel_sent: AtomicU64,
    /// Messages dropped because the outbound queue was full or closed (monotonic)
    channel_dropped: AtomicU64,
    /// Inbound events dropped because the participant inbox was full (monotonic)
    inbox_dropped: AtomicU64,
    /// Geo/routing lookups that succeeded (monotonic)
    lookups_ok: AtomicU64,
    /// Geo/routing lookups that failed (monotonic)
    lookups_failed: AtomicU64,
    /// Lookup latency histogram (milliseconds, LOOKUP_BOUNDS)
    lookup_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Sum of lookup latencies (reset on report)
    lookup_latency_sum_ms: AtomicU64,
    /// Sum of all lookup latencies in milliseconds (monotonic)
    lookup_latency_total_ms: AtomicU64,
    /// Lookups since last report (reset on report)
    lookups_since_report: AtomicU64,
    /// Timer starts (monotonic)
    timers_started: AtomicU64,
    /// Timer cancellations (monotonic)
    timers_stopped: AtomicU64,
    /// Inbound room events ignored for non-member crosswalks (monotonic)
    stale_events: AtomicU64,
    /// Calibrations that produced a threshold (monotonic)
    calibrations_ok: AtomicU64,
    /// Calibrations that failed (monotonic)
    calibrations_failed: AtomicU64,
    /// Relay rooms with at least one member (gauge)
    relay_rooms: AtomicU64,
    /// Relay notifications published (monotonic)
    relay_notifications: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events_total: AtomicU64::new(0),
            events_since_report: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            latency_buckets_total: std::array::from_fn(|_| AtomicU64::new(0)),
            latency_total_us: AtomicU64::new(0),
            transitions_total: AtomicU64::new(0),
            alert_level: AtomicI64::new(AlertLevel::OFF.value() as i64),
            joined_rooms: AtomicU64::new(0),
            critical_rooms: AtomicU64::new(0),
            channel_sent: AtomicU64::new(0),
            channel_dropped: AtomicU64::new(0),
            inbox_dropped: AtomicU64::new(0),
            lookups_ok: AtomicU64::new(0),
            lookups_failed: AtomicU64::new(0),
            lookup_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            lookup_latency_sum_ms: AtomicU64::new(0),
            lookup_latency_total_ms: AtomicU64::new(0),
            lookups_since_report: AtomicU64::new(0),
            timers_started: AtomicU64::new(0),
            timers_stopped: AtomicU64::new(0),
            stale_events: AtomicU64::new(0),
            calibrations_ok: AtomicU64::new(0),
            calibrations_failed: AtomicU64::new(0),
            relay_rooms: AtomicU64::new(0),
            relay_notifications: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record an event was processed with given latency (lock-free)
    #[inline]
    pub fn record_event_processed(&self, latency_us: u64) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
        self.events_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        self.latency_total_us.fetch_add(latency_us, Ordering::Relaxed);

        let bucket = bucket_index(latency_us);
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.latency_buckets_total[bucket].fetch_add(1, Ordering::Relaxed);

        update_atomic_max(&self.latency_max_us, latency_us);
    }

    /// Record a level transition and update the level gauge
    #[inline]
    pub fn record_transition(&self, to: AlertLevel) {
        self.transitions_total.fetch_add(1, Ordering::Relaxed);
        self.alert_level.store(to.value() as i64, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_rooms(&self, joined: usize, critical: usize) {
        self.joined_rooms.store(joined as u64, Ordering::Relaxed);
        self.critical_rooms.store(critical as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_channel_sent(&self) {
        self.channel_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_channel_dropped(&self) {
        self.channel_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_inbox_dropped(&self) {
        self.inbox_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a lookup outcome with its wall-clock latency
    #[inline]
    pub fn record_lookup(&self, ok: bool, latency_ms: u64) {
        if ok {
            self.lookups_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.lookups_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.lookups_since_report.fetch_add(1, Ordering::Relaxed);
        self.lookup_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.lookup_latency_total_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.lookup_latency_buckets[lookup_bucket_index(latency_ms)]
            .fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_timer_started(&self) {
        self.timers_started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_timer_stopped(&self) {
        self.timers_stopped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_stale_event(&self) {
        self.stale_events.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_calibration(&self, ok: bool) {
        if ok {
            self.calibrations_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.calibrations_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn set_relay_rooms(&self, rooms: usize) {
        self.relay_rooms.store(rooms as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_relay_notification(&self) {
        self.relay_notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_total(&self) -> u64 {
        self.events_total.load(Ordering::Relaxed)
    }

    pub fn transitions_total(&self) -> u64 {
        self.transitions_total.load(Ordering::Relaxed)
    }

    pub fn alert_level(&self) -> i64 {
        self.alert_level.load(Ordering::Relaxed)
    }

    pub fn joined_rooms(&self) -> u64 {
        self.joined_rooms.load(Ordering::Relaxed)
    }

    pub fn critical_rooms(&self) -> u64 {
        self.critical_rooms.load(Ordering::Relaxed)
    }

    pub fn channel_sent(&self) -> u64 {
        self.channel_sent.load(Ordering::Relaxed)
    }

    pub fn channel_dropped(&self) -> u64 {
        self.channel_dropped.load(Ordering::Relaxed)
    }

    pub fn inbox_dropped(&self) -> u64 {
        self.inbox_dropped.load(Ordering::Relaxed)
    }

    pub fn lookups_ok(&self) -> u64 {
        self.lookups_ok.load(Ordering::Relaxed)
    }

    pub fn lookups_failed(&self) -> u64 {
        self.lookups_failed.load(Ordering::Relaxed)
    }

    pub fn timers_started(&self) -> u64 {
        self.timers_started.load(Ordering::Relaxed)
    }

    pub fn timers_stopped(&self) -> u64 {
        self.timers_stopped.load(Ordering::Relaxed)
    }

    pub fn stale_events(&self) -> u64 {
        self.stale_events.load(Ordering::Relaxed)
    }

    pub fn calibrations_ok(&self) -> u64 {
        self.calibrations_ok.load(Ordering::Relaxed)
    }

    pub fn calibrations_failed(&self) -> u64 {
        self.calibrations_failed.load(Ordering::Relaxed)
    }

    pub fn relay_rooms(&self) -> u64 {
        self.relay_rooms.load(Ordering::Relaxed)
    }

    pub fn relay_notifications(&self) -> u64 {
        self.relay_notifications.load(Ordering::Relaxed)
    }

    /// Cumulative event latency buckets (for Prometheus)
    pub fn latency_buckets(&self) -> [u64; NUM_BUCKETS] {
        load_buckets(&self.latency_buckets_total)
    }

    pub fn latency_total_us(&self) -> u64 {
        self.latency_total_us.load(Ordering::Relaxed)
    }

    pub fn lookup_latency_total_ms(&self) -> u64 {
        self.lookup_latency_total_ms.load(Ordering::Relaxed)
    }

    /// Cumulative lookup latency buckets (for Prometheus)
    pub fn lookup_latency_buckets(&self) -> [u64; NUM_BUCKETS] {
        load_buckets(&self.lookup_latency_buckets)
    }

    /// Generate a summary report and reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let events_count = self.events_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.latency_buckets);

        let lookups_count = self.lookups_since_report.swap(0, Ordering::Relaxed);
        let lookup_latency_sum = self.lookup_latency_sum_ms.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let events_per_sec = if elapsed.as_secs_f64() > 0.0 {
            events_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let avg_latency = if events_count > 0 { latency_sum / events_count } else { 0 };
        let lookup_avg_ms = if lookups_count > 0 { lookup_latency_sum / lookups_count } else { 0 };

        MetricsSummary {
            events_total: self.events_total(),
            events_per_sec,
            avg_process_latency_us: avg_latency,
            max_process_latency_us: max_latency,
            lat_buckets,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p95_us: percentile_from_buckets(&lat_buckets, 0.95),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            transitions_total: self.transitions_total(),
            alert_level: self.alert_level(),
            joined_rooms: self.joined_rooms(),
            critical_rooms: self.critical_rooms(),
            channel_sent: self.channel_sent(),
            channel_dropped: self.channel_dropped(),
            inbox_dropped: self.inbox_dropped(),
            lookups_ok: self.lookups_ok(),
            lookups_failed: self.lookups_failed(),
            lookup_avg_ms,
            timers_started: self.timers_started(),
            timers_stopped: self.timers_stopped(),
            stale_events: self.stale_events(),
            relay_rooms: self.relay_rooms(),
            relay_notifications: self.relay_notifications(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_LOOKUP_BOUNDS: [u64; 10] = LOOKUP_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub events_total: u64,
    pub events_per_sec: f64,
    pub avg_process_latency_us: u64,
    pub max_process_latency_us: u64,
    /// Event processing latency histogram buckets
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    pub transitions_total: u64,
    pub alert_level: i64,
    pub joined_rooms: u64,
    pub critical_rooms: u64,
    pub channel_sent: u64,
    pub channel_dropped: u64,
    pub inbox_dropped: u64,
    pub lookups_ok: u64,
    pub lookups_failed: u64,
    /// Average lookup latency since last report (ms)
    pub lookup_avg_ms: u64,
    pub timers_started: u64,
    pub timers_stopped: u64,
    pub stale_events: u64,
    pub relay_rooms: u64,
    pub relay_notifications: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            events_total = %self.events_total,
            events_per_sec = format!("{:.1}", self.events_per_sec),
            avg_latency_us = %self.avg_process_latency_us,
            max_latency_us = %self.max_process_latency_us,
            p99_us = %self.lat_p99_us,
            level = %self.alert_level,
            transitions = %self.transitions_total,
            joined = %self.joined_rooms,
            critical = %self.critical_rooms,
            sent = %self.channel_sent,
            dropped = %self.channel_dropped,
            lookups_ok = %self.lookups_ok,
            lookups_failed = %self.lookups_failed,
            lookup_avg_ms = %self.lookup_avg_ms,
            stale = %self.stale_events,
            "metrics"
        );
    }

    /// Relay flavour of the periodic summary
    pub fn log_relay(&self) {
        info!(
            events_total = %self.events_total,
            events_per_sec = format!("{:.1}", self.events_per_sec),
            p99_us = %self.lat_p99_us,
            rooms = %self.relay_rooms,
            notifications = %self.relay_notifications,
            sent = %self.channel_sent,
            dropped = %self.channel_dropped,
            "relay_metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.events_total(), 0);
        assert_eq!(metrics.alert_level(), -1);
        assert_eq!(metrics.channel_sent(), 0);
    }

    #[test]
    fn test_record_event() {
        let metrics = Metrics::new();

        metrics.record_event_processed(100);
        assert_eq!(metrics.events_total(), 1);
        assert_eq!(metrics.latency_sum_us.load(Ordering::Relaxed), 100);

        metrics.record_event_processed(200);
        assert_eq!(metrics.events_total(), 2);
        assert_eq!(metrics.latency_sum_us.load(Ordering::Relaxed), 300);
    }

    #[test]
    fn test_record_transition_updates_gauge() {
        let metrics = Metrics::new();
        metrics.record_transition(AlertLevel::ACTIVE);
        metrics.record_transition(AlertLevel::CRITICAL);
        assert_eq!(metrics.transitions_total(), 2);
        assert_eq!(metrics.alert_level(), 4);
    }

    #[test]
    fn test_report() {
        let metrics = Metrics::new();

        metrics.record_event_processed(100);
        metrics.record_event_processed(200);
        metrics.record_event_processed(300);
        metrics.record_channel_sent();
        metrics.record_channel_dropped();
        metrics.set_rooms(2, 1);

        let summary = metrics.report();

        assert_eq!(summary.events_total, 3);
        assert_eq!(summary.avg_process_latency_us, 200);
        assert_eq!(summary.max_process_latency_us, 300);
        assert_eq!(summary.channel_sent, 1);
        assert_eq!(summary.channel_dropped, 1);
        assert_eq!(summary.joined_rooms, 2);
        assert_eq!(summary.critical_rooms, 1);

        // Periodic counters should be reset
        assert_eq!(metrics.events_since_report.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.latency_sum_us.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.latency_max_us.load(Ordering::Relaxed), 0);

        // Monotonic counters should NOT be reset
        assert_eq!(metrics.events_total(), 3);
    }

    #[test]
    fn test_lookup_tracking() {
        let metrics = Metrics::new();
        metrics.record_lookup(true, 100);
        metrics.record_lookup(false, 300);

        assert_eq!(metrics.lookups_ok(), 1);
        assert_eq!(metrics.lookups_failed(), 1);
        let buckets = metrics.lookup_latency_buckets();
        assert_eq!(buckets[2], 1);
        assert_eq!(buckets[4], 1);

        let summary = metrics.report();
        assert_eq!(summary.lookup_avg_ms, 200);
    }

    #[test]
    fn test_max_latency() {
        let metrics = Metrics::new();

        metrics.record_event_processed(100);
        metrics.record_event_processed(500);
        metrics.record_event_processed(200);
        metrics.record_event_processed(50);

        assert_eq!(metrics.latency_max_us.load(Ordering::Relaxed), 500);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    m.record_event_processed(i as u64);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.events_total(), 10_000);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(51200), 9);
        assert_eq!(bucket_index(51201), 10);
        assert_eq!(lookup_bucket_index(25), 0);
        assert_eq!(lookup_bucket_index(20000), 10);
    }

    #[test]
    fn test_percentile_computation() {
        let metrics = Metrics::new();

        for _ in 0..100 {
            metrics.record_event_processed(150);
        }

        let summary = metrics.report();

        assert_eq!(summary.lat_p50_us, 200);
        assert_eq!(summary.lat_p95_us, 200);
        assert_eq!(summary.lat_p99_us, 200);
    }
}
