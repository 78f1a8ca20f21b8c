//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! Counters are monotonic; the periodic log works on a window that
//! `report()` swaps to zero, while histograms exported to Prometheus
//! stay cumulative.
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Exponential bucket boundaries, shared by µs and ms histograms
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a value using binary search
#[inline]
fn bucket_index(value: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < value)
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

    // last bucket uses 2x the previous bound
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

#[inline]
fn avg(sum: u64, count: u64) -> u64 {
    if count > 0 {
        sum / count
    } else {
        0
    }
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Frames processed by the tracker (monotonic)
    frames_total: AtomicU64,
    /// Frames since last report (reset on report)
    frames_since_report: AtomicU64,
    /// Sum of frame latencies in µs (reset on report)
    frame_latency_sum_us: AtomicU64,
    /// Max frame latency in µs (reset on report)
    frame_latency_max_us: AtomicU64,
    /// Frame latency buckets for the log window (reset on report)
    frame_latency_window: [AtomicU64; NUM_BUCKETS],
    /// Frame latency buckets for Prometheus (cumulative)
    frame_latency_buckets: [AtomicU64; NUM_BUCKETS],
    frame_latency_total_us: AtomicU64,
    /// Frames or control messages dropped because the tracker queue was full
    ingress_dropped: AtomicU64,
    /// Ingress payloads that failed to parse
    ingress_malformed: AtomicU64,
    /// Session/event messages dropped because the egress queue was full
    egress_dropped: AtomicU64,
    /// Backend deliveries that failed (transport or non-2xx)
    egress_failed: AtomicU64,
    zone_enters: AtomicU64,
    zone_exits: AtomicU64,
    baselines_captured: AtomicU64,
    /// Shelf image or detector unavailable (baseline or diff)
    detections_unavailable: AtomicU64,
    diffs_applied: AtomicU64,
    diffs_skipped: AtomicU64,
    /// Diff results discarded because a newer generation replaced them
    diffs_superseded: AtomicU64,
    items_taken: AtomicU64,
    items_returned: AtomicU64,
    malformed_mutations: AtomicU64,
    identity_links: AtomicU64,
    settlements_paid: AtomicU64,
    settlements_unpaid: AtomicU64,
    invoice_failures: AtomicU64,
    /// Invoice round-trip latency buckets in ms (cumulative)
    invoice_latency_buckets: [AtomicU64; NUM_BUCKETS],
    invoice_latency_sum_ms: AtomicU64,
    /// Invoice queue delay (enqueue to worker pickup) buckets in µs (cumulative)
    invoice_queue_delay_buckets: [AtomicU64; NUM_BUCKETS],
    invoice_queue_delay_sum_us: AtomicU64,
    invoice_queue_delay_max_us: AtomicU64,
    /// Live tracks (gauge, set by the tracker)
    active_tracks: AtomicU64,
    /// Exit diffs in flight (gauge, set by the tracker)
    pending_diffs: AtomicU64,
    /// Current tracker queue depth (updated by sampler)
    event_queue_depth: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            frames_total: AtomicU64::new(0),
            frames_since_report: AtomicU64::new(0),
            frame_latency_sum_us: AtomicU64::new(0),
            frame_latency_max_us: AtomicU64::new(0),
            frame_latency_window: std::array::from_fn(|_| AtomicU64::new(0)),
            frame_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            frame_latency_total_us: AtomicU64::new(0),
            ingress_dropped: AtomicU64::new(0),
            ingress_malformed: AtomicU64::new(0),
            egress_dropped: AtomicU64::new(0),
            egress_failed: AtomicU64::new(0),
            zone_enters: AtomicU64::new(0),
            zone_exits: AtomicU64::new(0),
            baselines_captured: AtomicU64::new(0),
            detections_unavailable: AtomicU64::new(0),
            diffs_applied: AtomicU64::new(0),
            diffs_skipped: AtomicU64::new(0),
            diffs_superseded: AtomicU64::new(0),
            items_taken: AtomicU64::new(0),
            items_returned: AtomicU64::new(0),
            malformed_mutations: AtomicU64::new(0),
            identity_links: AtomicU64::new(0),
            settlements_paid: AtomicU64::new(0),
            settlements_unpaid: AtomicU64::new(0),
            invoice_failures: AtomicU64::new(0),
            invoice_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            invoice_latency_sum_ms: AtomicU64::new(0),
            invoice_queue_delay_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            invoice_queue_delay_sum_us: AtomicU64::new(0),
            invoice_queue_delay_max_us: AtomicU64::new(0),
            active_tracks: AtomicU64::new(0),
            pending_diffs: AtomicU64::new(0),
            event_queue_depth: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a perception frame was processed with given latency (lock-free)
    #[inline]
    pub fn record_frame_processed(&self, latency_us: u64) {
        self.frames_total.fetch_add(1, Ordering::Relaxed);
        self.frames_since_report.fetch_add(1, Ordering::Relaxed);
        self.frame_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.frame_latency_total_us.fetch_add(latency_us, Ordering::Relaxed);

        let bucket = bucket_index(latency_us);
        self.frame_latency_window[bucket].fetch_add(1, Ordering::Relaxed);
        self.frame_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);

        update_atomic_max(&self.frame_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_ingress_dropped(&self) {
        self.ingress_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_ingress_malformed(&self) {
        self.ingress_malformed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_egress_dropped(&self) {
        self.egress_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_egress_failed(&self) {
        self.egress_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_zone_enter(&self) {
        self.zone_enters.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_zone_exit(&self) {
        self.zone_exits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_baseline_captured(&self) {
        self.baselines_captured.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_detection_unavailable(&self) {
        self.detections_unavailable.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_diff_applied(&self) {
        self.diffs_applied.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_diff_skipped(&self) {
        self.diffs_skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_diff_superseded(&self) {
        self.diffs_superseded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_items_taken(&self, count: u64) {
        self.items_taken.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_items_returned(&self, count: u64) {
        self.items_returned.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_malformed_mutation(&self) {
        self.malformed_mutations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_identity_link(&self) {
        self.identity_links.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_settlement(&self, paid: bool) {
        if paid {
            self.settlements_paid.fetch_add(1, Ordering::Relaxed);
        } else {
            self.settlements_unpaid.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_invoice_failure(&self) {
        self.invoice_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record invoice round-trip latency in milliseconds
    #[inline]
    pub fn record_invoice_latency(&self, latency_ms: u64) {
        let bucket = bucket_index(latency_ms);
        self.invoice_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.invoice_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    /// Record invoice queue delay (time from enqueue to worker pickup)
    #[inline]
    pub fn record_invoice_queue_delay(&self, delay_us: u64) {
        let bucket = bucket_index(delay_us);
        self.invoice_queue_delay_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.invoice_queue_delay_sum_us.fetch_add(delay_us, Ordering::Relaxed);
        update_atomic_max(&self.invoice_queue_delay_max_us, delay_us);
    }

    #[inline]
    pub fn set_active_tracks(&self, count: usize) {
        self.active_tracks.store(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_pending_diffs(&self, count: usize) {
        self.pending_diffs.store(count as u64, Ordering::Relaxed);
    }

    /// Set current event queue depth (called by sampler)
    #[inline]
    pub fn set_event_queue_depth(&self, depth: u64) {
        self.event_queue_depth.store(depth, Ordering::Relaxed);
    }

    #[inline]
    pub fn frames_total(&self) -> u64 {
        self.frames_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn egress_dropped(&self) -> u64 {
        self.egress_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn ingress_dropped(&self) -> u64 {
        self.ingress_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn malformed_mutations(&self) -> u64 {
        self.malformed_mutations.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn diffs_applied(&self) -> u64 {
        self.diffs_applied.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn diffs_skipped(&self) -> u64 {
        self.diffs_skipped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn settlements_paid(&self) -> u64 {
        self.settlements_paid.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn settlements_unpaid(&self) -> u64 {
        self.settlements_unpaid.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn invoice_failures(&self) -> u64 {
        self.invoice_failures.load(Ordering::Relaxed)
    }

    /// Calculate the periodic summary, then reset the window counters
    ///
    /// This is the only method that resets anything. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let frames_count = self.frames_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.frame_latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.frame_latency_max_us.swap(0, Ordering::Relaxed);
        let window = swap_buckets(&self.frame_latency_window);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let frames_per_sec = if elapsed.as_secs_f64() > 0.0 {
            frames_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            frames_total: self.frames_total.load(Ordering::Relaxed),
            frames_per_sec,
            avg_frame_latency_us: avg(latency_sum, frames_count),
            max_frame_latency_us: max_latency,
            lat_p50_us: percentile_from_buckets(&window, 0.50),
            lat_p95_us: percentile_from_buckets(&window, 0.95),
            lat_p99_us: percentile_from_buckets(&window, 0.99),
            active_tracks: self.active_tracks.load(Ordering::Relaxed),
            pending_diffs: self.pending_diffs.load(Ordering::Relaxed),
            diffs_applied: self.diffs_applied.load(Ordering::Relaxed),
            diffs_skipped: self.diffs_skipped.load(Ordering::Relaxed),
            settlements_paid: self.settlements_paid.load(Ordering::Relaxed),
            settlements_unpaid: self.settlements_unpaid.load(Ordering::Relaxed),
            invoice_failures: self.invoice_failures.load(Ordering::Relaxed),
            ingress_dropped: self.ingress_dropped.load(Ordering::Relaxed),
            egress_dropped: self.egress_dropped.load(Ordering::Relaxed),
            event_queue_depth: self.event_queue_depth.load(Ordering::Relaxed),
        }
    }

    /// Cumulative view for the Prometheus endpoint (does not reset)
    pub fn snapshot(&self) -> MetricsSnapshot {
        let frame_latency_buckets = load_buckets(&self.frame_latency_buckets);
        let frame_count: u64 = frame_latency_buckets.iter().sum();
        let invoice_latency_buckets = load_buckets(&self.invoice_latency_buckets);
        let invoice_count: u64 = invoice_latency_buckets.iter().sum();
        let invoice_queue_delay_buckets = load_buckets(&self.invoice_queue_delay_buckets);
        let queue_count: u64 = invoice_queue_delay_buckets.iter().sum();

        MetricsSnapshot {
            frames_total: self.frames_total.load(Ordering::Relaxed),
            frame_latency_buckets,
            frame_latency_avg_us: avg(self.frame_latency_total_us.load(Ordering::Relaxed), frame_count),
            frame_latency_p99_us: percentile_from_buckets(&frame_latency_buckets, 0.99),
            ingress_dropped: self.ingress_dropped.load(Ordering::Relaxed),
            ingress_malformed: self.ingress_malformed.load(Ordering::Relaxed),
            egress_dropped: self.egress_dropped.load(Ordering::Relaxed),
            egress_failed: self.egress_failed.load(Ordering::Relaxed),
            zone_enters: self.zone_enters.load(Ordering::Relaxed),
            zone_exits: self.zone_exits.load(Ordering::Relaxed),
            baselines_captured: self.baselines_captured.load(Ordering::Relaxed),
            detections_unavailable: self.detections_unavailable.load(Ordering::Relaxed),
            diffs_applied: self.diffs_applied.load(Ordering::Relaxed),
            diffs_skipped: self.diffs_skipped.load(Ordering::Relaxed),
            diffs_superseded: self.diffs_superseded.load(Ordering::Relaxed),
            items_taken: self.items_taken.load(Ordering::Relaxed),
            items_returned: self.items_returned.load(Ordering::Relaxed),
            malformed_mutations: self.malformed_mutations.load(Ordering::Relaxed),
            identity_links: self.identity_links.load(Ordering::Relaxed),
            settlements_paid: self.settlements_paid.load(Ordering::Relaxed),
            settlements_unpaid: self.settlements_unpaid.load(Ordering::Relaxed),
            invoice_failures: self.invoice_failures.load(Ordering::Relaxed),
            invoice_latency_buckets,
            invoice_latency_avg_ms: avg(self.invoice_latency_sum_ms.load(Ordering::Relaxed), invoice_count),
            invoice_queue_delay_buckets,
            invoice_queue_delay_avg_us: avg(
                self.invoice_queue_delay_sum_us.load(Ordering::Relaxed),
                queue_count,
            ),
            invoice_queue_delay_max_us: self.invoice_queue_delay_max_us.load(Ordering::Relaxed),
            active_tracks: self.active_tracks.load(Ordering::Relaxed),
            pending_diffs: self.pending_diffs.load(Ordering::Relaxed),
            event_queue_depth: self.event_queue_depth.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

/// Periodic log summary
#[derive(Debug)]
pub struct MetricsSummary {
    pub frames_total: u64,
    pub frames_per_sec: f64,
    pub avg_frame_latency_us: u64,
    pub max_frame_latency_us: u64,
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    pub active_tracks: u64,
    pub pending_diffs: u64,
    pub diffs_applied: u64,
    pub diffs_skipped: u64,
    pub settlements_paid: u64,
    pub settlements_unpaid: u64,
    pub invoice_failures: u64,
    pub ingress_dropped: u64,
    pub egress_dropped: u64,
    pub event_queue_depth: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            frames_total = %self.frames_total,
            frames_per_sec = format!("{:.1}", self.frames_per_sec),
            avg_latency_us = %self.avg_frame_latency_us,
            max_latency_us = %self.max_frame_latency_us,
            p50_us = %self.lat_p50_us,
            p95_us = %self.lat_p95_us,
            p99_us = %self.lat_p99_us,
            active_tracks = %self.active_tracks,
            pending_diffs = %self.pending_diffs,
            diffs_applied = %self.diffs_applied,
            diffs_skipped = %self.diffs_skipped,
            paid = %self.settlements_paid,
            unpaid = %self.settlements_unpaid,
            invoice_failures = %self.invoice_failures,
            ingress_dropped = %self.ingress_dropped,
            egress_dropped = %self.egress_dropped,
            queue_depth = %self.event_queue_depth,
            "metrics"
        );
    }
}

/// Cumulative counters and histograms for Prometheus
#[derive(Debug)]
pub struct MetricsSnapshot {
    pub frames_total: u64,
    /// Frame processing latency buckets (µs)
    pub frame_latency_buckets: [u64; NUM_BUCKETS],
    pub frame_latency_avg_us: u64,
    pub frame_latency_p99_us: u64,
    pub ingress_dropped: u64,
    pub ingress_malformed: u64,
    pub egress_dropped: u64,
    pub egress_failed: u64,
    pub zone_enters: u64,
    pub zone_exits: u64,
    pub baselines_captured: u64,
    pub detections_unavailable: u64,
    pub diffs_applied: u64,
    pub diffs_skipped: u64,
    pub diffs_superseded: u64,
    pub items_taken: u64,
    pub items_returned: u64,
    pub malformed_mutations: u64,
    pub identity_links: u64,
    pub settlements_paid: u64,
    pub settlements_unpaid: u64,
    pub invoice_failures: u64,
    /// Invoice round-trip buckets (ms)
    pub invoice_latency_buckets: [u64; NUM_BUCKETS],
    pub invoice_latency_avg_ms: u64,
    /// Invoice queue delay buckets (µs)
    pub invoice_queue_delay_buckets: [u64; NUM_BUCKETS],
    pub invoice_queue_delay_avg_us: u64,
    pub invoice_queue_delay_max_us: u64,
    pub active_tracks: u64,
    pub pending_diffs: u64,
    pub event_queue_depth: u64,
}
