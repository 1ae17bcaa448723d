//! Cache Metrics Collection
//!
//! Relaxed atomic counters for tier hits, coordination outcomes and buffer
//! recycling, plus a Prometheus bridge for the binary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use prometheus::{Encoder, Gauge, IntGaugeVec, Opts, Registry, TextEncoder};

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // L1 metrics
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l1_writes: AtomicU64,

    // L2 metrics
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
    l2_read_failures: AtomicU64,
    l2_writes: AtomicU64,
    l2_write_failures: AtomicU64,
    l2_write_retries: AtomicU64,

    // Coordination
    factory_executions: AtomicU64,
    factory_failures: AtomicU64,
    stampede_joins: AtomicU64,
    uncoordinated_executions: AtomicU64,
    caller_cancellations: AtomicU64,
    group_cancellations: AtomicU64,
    stale_writebacks_suppressed: AtomicU64,

    // Admission
    invalid_keys: AtomicU64,
    oversized_payloads: AtomicU64,

    // Latencies (microseconds, exponential moving average)
    l1_read_latency_us: AtomicU64,
    l2_read_latency_us: AtomicU64,
    factory_latency_us: AtomicU64,
}

macro_rules! counters {
    ($($record:ident / $read:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $record(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }

            pub fn $read(&self) -> u64 {
                self.$field.load(Ordering::Relaxed)
            }
        )*
    };
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    counters! {
        record_l1_hit / l1_hits => l1_hits,
        record_l1_miss / l1_misses => l1_misses,
        record_l1_write / l1_writes => l1_writes,
        record_l2_hit / l2_hits => l2_hits,
        record_l2_miss / l2_misses => l2_misses,
        record_l2_read_failure / l2_read_failures => l2_read_failures,
        record_l2_write / l2_writes => l2_writes,
        record_l2_write_failure / l2_write_failures => l2_write_failures,
        record_l2_write_retry / l2_write_retries => l2_write_retries,
        record_factory_execution / factory_executions => factory_executions,
        record_factory_failure / factory_failures => factory_failures,
        record_stampede_join / stampede_joins => stampede_joins,
        record_uncoordinated_execution / uncoordinated_executions => uncoordinated_executions,
        record_caller_cancellation / caller_cancellations => caller_cancellations,
        record_group_cancellation / group_cancellations => group_cancellations,
        record_stale_writeback / stale_writebacks_suppressed => stale_writebacks_suppressed,
        record_invalid_key / invalid_keys => invalid_keys,
        record_oversized_payload / oversized_payloads => oversized_payloads,
    }

    pub fn l1_hit_ratio(&self) -> f64 {
        ratio(self.l1_hits(), self.l1_misses())
    }

    pub fn l2_hit_ratio(&self) -> f64 {
        ratio(self.l2_hits(), self.l2_misses())
    }

    /// Share of lookups answered by either tier without running a factory
    pub fn overall_hit_ratio(&self) -> f64 {
        let hits = self.l1_hits() + self.l2_hits();
        ratio(hits, self.factory_executions())
    }

    // Latency tracking
    pub fn record_l1_read_latency(&self, duration: Duration) {
        update_latency_ema(&self.l1_read_latency_us, duration);
    }

    pub fn record_l2_read_latency(&self, duration: Duration) {
        update_latency_ema(&self.l2_read_latency_us, duration);
    }

    pub fn record_factory_latency(&self, duration: Duration) {
        update_latency_ema(&self.factory_latency_us, duration);
    }

    pub fn l1_read_latency(&self) -> Duration {
        Duration::from_micros(self.l1_read_latency_us.load(Ordering::Relaxed))
    }

    pub fn l2_read_latency(&self) -> Duration {
        Duration::from_micros(self.l2_read_latency_us.load(Ordering::Relaxed))
    }

    pub fn factory_latency(&self) -> Duration {
        Duration::from_micros(self.factory_latency_us.load(Ordering::Relaxed))
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            l1_hits: self.l1_hits(),
            l1_misses: self.l1_misses(),
            l1_writes: self.l1_writes(),
            l1_hit_ratio: self.l1_hit_ratio(),
            l1_read_latency: self.l1_read_latency(),

            l2_hits: self.l2_hits(),
            l2_misses: self.l2_misses(),
            l2_read_failures: self.l2_read_failures(),
            l2_writes: self.l2_writes(),
            l2_write_failures: self.l2_write_failures(),
            l2_write_retries: self.l2_write_retries(),
            l2_hit_ratio: self.l2_hit_ratio(),
            l2_read_latency: self.l2_read_latency(),

            factory_executions: self.factory_executions(),
            factory_failures: self.factory_failures(),
            factory_latency: self.factory_latency(),
            stampede_joins: self.stampede_joins(),
            uncoordinated_executions: self.uncoordinated_executions(),
            caller_cancellations: self.caller_cancellations(),
            group_cancellations: self.group_cancellations(),
            stale_writebacks_suppressed: self.stale_writebacks_suppressed(),

            invalid_keys: self.invalid_keys(),
            oversized_payloads: self.oversized_payloads(),

            overall_hit_ratio: self.overall_hit_ratio(),
        }
    }
}

fn ratio(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

fn update_latency_ema(target: &AtomicU64, duration: Duration) {
    let new_us = duration.as_micros() as u64;
    let alpha = 0.1; // EMA smoothing factor

    loop {
        let current = target.load(Ordering::Relaxed);
        let updated = if current == 0 {
            new_us
        } else {
            ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
        };

        if target
            .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    // L1
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l1_writes: u64,
    pub l1_hit_ratio: f64,
    pub l1_read_latency: Duration,

    // L2
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub l2_read_failures: u64,
    pub l2_writes: u64,
    pub l2_write_failures: u64,
    pub l2_write_retries: u64,
    pub l2_hit_ratio: f64,
    pub l2_read_latency: Duration,

    // Coordination
    pub factory_executions: u64,
    pub factory_failures: u64,
    pub factory_latency: Duration,
    pub stampede_joins: u64,
    pub uncoordinated_executions: u64,
    pub caller_cancellations: u64,
    pub group_cancellations: u64,
    pub stale_writebacks_suppressed: u64,

    // Admission
    pub invalid_keys: u64,
    pub oversized_payloads: u64,

    // Overall
    pub overall_hit_ratio: f64,
}

impl MetricsSnapshot {
    fn events(&self) -> [(&'static str, u64); 18] {
        [
            ("l1_hit", self.l1_hits),
            ("l1_miss", self.l1_misses),
            ("l1_write", self.l1_writes),
            ("l2_hit", self.l2_hits),
            ("l2_miss", self.l2_misses),
            ("l2_read_failure", self.l2_read_failures),
            ("l2_write", self.l2_writes),
            ("l2_write_failure", self.l2_write_failures),
            ("l2_write_retry", self.l2_write_retries),
            ("factory_execution", self.factory_executions),
            ("factory_failure", self.factory_failures),
            ("stampede_join", self.stampede_joins),
            ("uncoordinated_execution", self.uncoordinated_executions),
            ("caller_cancellation", self.caller_cancellations),
            ("group_cancellation", self.group_cancellations),
            ("stale_writeback_suppressed", self.stale_writebacks_suppressed),
            ("invalid_key", self.invalid_keys),
            ("oversized_payload", self.oversized_payloads),
        ]
    }
}

/// Publishes [`MetricsSnapshot`]s into a Prometheus registry
pub struct PrometheusExporter {
    registry: Registry,
    events: IntGaugeVec,
    hit_ratio: Gauge,
    l1_read_latency_us: Gauge,
    factory_latency_us: Gauge,
}

impl PrometheusExporter {
    /// Register the cache gauges in a fresh registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let events = IntGaugeVec::new(
            Opts::new("hybrid_cache_events", "Cumulative cache events by kind"),
            &["event"],
        )?;
        let hit_ratio = Gauge::new(
            "hybrid_cache_hit_ratio",
            "Lookups served from L1 or L2 over all lookups",
        )?;
        let l1_read_latency_us = Gauge::new(
            "hybrid_cache_l1_read_latency_us",
            "Smoothed L1 read latency in microseconds",
        )?;
        let factory_latency_us = Gauge::new(
            "hybrid_cache_factory_latency_us",
            "Smoothed value factory latency in microseconds",
        )?;

        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(hit_ratio.clone()))?;
        registry.register(Box::new(l1_read_latency_us.clone()))?;
        registry.register(Box::new(factory_latency_us.clone()))?;

        Ok(Self {
            registry,
            events,
            hit_ratio,
            l1_read_latency_us,
            factory_latency_us,
        })
    }

    /// Copy a snapshot into the gauges
    pub fn update(&self, snapshot: &MetricsSnapshot) {
        for (event, value) in snapshot.events() {
            self.events
                .with_label_values(&[event])
                .set(value.min(i64::MAX as u64) as i64);
        }
        self.hit_ratio.set(snapshot.overall_hit_ratio);
        self.l1_read_latency_us
            .set(snapshot.l1_read_latency.as_micros() as f64);
        self.factory_latency_us
            .set(snapshot.factory_latency.as_micros() as f64);
    }

    /// Render the registry in the Prometheus text format
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// The underlying registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.l1_hits(), 0);
        assert_eq!(metrics.l2_hits(), 0);
        assert_eq!(metrics.factory_executions(), 0);
    }

    #[test]
    fn test_hit_tracking() {
        let metrics = CacheMetrics::new();

        metrics.record_l1_hit();
        metrics.record_l1_hit();
        metrics.record_l1_miss();

        assert_eq!(metrics.l1_hits(), 2);
        assert_eq!(metrics.l1_misses(), 1);
        assert!((metrics.l1_hit_ratio() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_latency_tracking() {
        let metrics = CacheMetrics::new();

        metrics.record_l1_read_latency(Duration::from_micros(100));
        assert_eq!(metrics.l1_read_latency(), Duration::from_micros(100));

        // EMA should smooth values
        metrics.record_l1_read_latency(Duration::from_micros(200));
        let latency = metrics.l1_read_latency().as_micros();
        assert!(latency > 100 && latency < 200);
    }

    #[test]
    fn test_overall_hit_ratio() {
        let metrics = CacheMetrics::new();

        metrics.record_l1_hit();
        metrics.record_l1_hit();
        metrics.record_l2_hit();
        metrics.record_factory_execution();

        assert!((metrics.overall_hit_ratio() - 0.75).abs() < 0.01);
    }

    #[test]
    fn test_snapshot() {
        let metrics = CacheMetrics::new();

        metrics.record_stampede_join();
        metrics.record_stampede_join();
        metrics.record_group_cancellation();
        metrics.record_l2_read_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.stampede_joins, 2);
        assert_eq!(snapshot.group_cancellations, 1);
        assert_eq!(snapshot.l2_read_failures, 1);
        assert_eq!(snapshot.factory_executions, 0);
    }

    #[test]
    fn test_prometheus_render() {
        let metrics = CacheMetrics::new();
        metrics.record_factory_execution();
        metrics.record_l1_hit();

        let exporter = PrometheusExporter::new().unwrap();
        exporter.update(&metrics.snapshot());
        let text = exporter.render().unwrap();

        assert!(text.contains("hybrid_cache_events{event=\"factory_execution\"} 1"));
        assert!(text.contains("hybrid_cache_events{event=\"l1_hit\"} 1"));
        assert!(text.contains("hybrid_cache_hit_ratio 0.5"));
    }

    #[test]
    fn test_latency_tracker() {
        let tracker = LatencyTracker::start();
        std::thread::sleep(Duration::from_millis(10));
        assert!(tracker.elapsed() >= Duration::from_millis(10));
    }
}
