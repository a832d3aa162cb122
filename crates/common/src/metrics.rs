//! Operator metrics registry and Prometheus rendering helpers.
//!
//! The counter names below are a stable contract with profile consumers:
//! `HashBuckets`, `PartitionsCreated`, `MaxPartitionLevel`,
//! `SpilledPartitions`, `BuildRowsPartitioned`, `ProbeRowsPartitioned`,
//! `NumRepartitions`, `LargestPartitionPercent`, `HashCollisions`,
//! `ReductionFactorEstimate`, `ReductionFactorThresholdToExpand`,
//! `RowsPassedThrough`, plus the hash-table statistics emitted on Close
//! (`HashProbes`, `HashFailedProbes`, `HashTravelLength`, `HashResizes`).

use std::sync::{Arc, OnceLock};

use prometheus::{
    Encoder, GaugeVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

/// Shared registry handing out per-operator counter sets.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    hash_buckets: IntCounterVec,
    partitions_created: IntCounterVec,
    max_partition_level: IntGaugeVec,
    spilled_partitions: IntCounterVec,
    build_rows_partitioned: IntCounterVec,
    probe_rows_partitioned: IntCounterVec,
    num_repartitions: IntCounterVec,
    largest_partition_percent: IntGaugeVec,
    hash_collisions: IntCounterVec,
    reduction_factor_estimate: GaugeVec,
    reduction_factor_threshold: GaugeVec,
    rows_passed_through: IntCounterVec,
    hash_probes: IntCounterVec,
    hash_failed_probes: IntCounterVec,
    hash_travel_length: IntCounterVec,
    hash_resizes: IntCounterVec,
}

impl MetricsRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Bind the full operator counter set for one operator instance.
    pub fn operator(&self, operator_id: &str) -> OperatorMetrics {
        let m = &self.inner;
        let l = &[operator_id];
        OperatorMetrics {
            hash_buckets: m.hash_buckets.with_label_values(l),
            partitions_created: m.partitions_created.with_label_values(l),
            max_partition_level: m.max_partition_level.with_label_values(l),
            spilled_partitions: m.spilled_partitions.with_label_values(l),
            build_rows_partitioned: m.build_rows_partitioned.with_label_values(l),
            probe_rows_partitioned: m.probe_rows_partitioned.with_label_values(l),
            num_repartitions: m.num_repartitions.with_label_values(l),
            largest_partition_percent: m.largest_partition_percent.with_label_values(l),
            hash_collisions: m.hash_collisions.with_label_values(l),
            reduction_factor_estimate: m.reduction_factor_estimate.with_label_values(l),
            reduction_factor_threshold: m.reduction_factor_threshold.with_label_values(l),
            rows_passed_through: m.rows_passed_through.with_label_values(l),
            hash_probes: m.hash_probes.with_label_values(l),
            hash_failed_probes: m.hash_failed_probes.with_label_values(l),
            hash_travel_length: m.hash_travel_length.with_label_values(l),
            hash_resizes: m.hash_resizes.with_label_values(l),
        }
    }

    /// Render all registered metric families in Prometheus text format.
    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-operator counter handles. Cheap to clone; values survive operator
/// teardown so profiles can be read after Close.
#[derive(Clone, Debug)]
pub struct OperatorMetrics {
    /// Total buckets across all hash tables iterated for output.
    pub hash_buckets: IntCounter,
    /// Partitions created, across all levels.
    pub partitions_created: IntCounter,
    /// High-water partition recursion level.
    pub max_partition_level: IntGauge,
    /// Partitions evicted to disk.
    pub spilled_partitions: IntCounter,
    /// Build-side rows routed through the partitioning path.
    pub build_rows_partitioned: IntCounter,
    /// Probe-side rows routed through the partitioning path.
    pub probe_rows_partitioned: IntCounter,
    /// Repartitioning passes over spilled partitions.
    pub num_repartitions: IntCounter,
    /// High-water largest-partition share of its level input, in percent.
    pub largest_partition_percent: IntGauge,
    /// Bucket probes whose cached hash matched but keys differed.
    pub hash_collisions: IntCounter,
    /// Streaming pre-aggregation: extrapolated final reduction factor.
    pub reduction_factor_estimate: prometheus::Gauge,
    /// Streaming pre-aggregation: minimum reduction required to expand.
    pub reduction_factor_threshold: prometheus::Gauge,
    /// Streaming pre-aggregation: rows emitted without aggregation.
    pub rows_passed_through: IntCounter,
    /// Hash-table probe count, folded in on Close.
    pub hash_probes: IntCounter,
    /// Probes that found no filled bucket.
    pub hash_failed_probes: IntCounter,
    /// Total probe travel length.
    pub hash_travel_length: IntCounter,
    /// Bucket-array resizes.
    pub hash_resizes: IntCounter,
}

impl OperatorMetrics {
    /// Raise a high-water gauge to `value` if it is below it.
    pub fn set_highwater(gauge: &IntGauge, value: i64) {
        if gauge.get() < value {
            gauge.set(value);
        }
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();
        let labels = &["operator"];
        Self {
            hash_buckets: counter_vec(
                &registry,
                "riffle_hash_buckets_total",
                "Hash buckets iterated for output (HashBuckets)",
                labels,
            ),
            partitions_created: counter_vec(
                &registry,
                "riffle_partitions_created_total",
                "Partitions created across all levels (PartitionsCreated)",
                labels,
            ),
            max_partition_level: gauge_vec(
                &registry,
                "riffle_max_partition_level",
                "High-water partition recursion level (MaxPartitionLevel)",
                labels,
            ),
            spilled_partitions: counter_vec(
                &registry,
                "riffle_spilled_partitions_total",
                "Partitions evicted to disk (SpilledPartitions)",
                labels,
            ),
            build_rows_partitioned: counter_vec(
                &registry,
                "riffle_build_rows_partitioned_total",
                "Build rows partitioned (BuildRowsPartitioned)",
                labels,
            ),
            probe_rows_partitioned: counter_vec(
                &registry,
                "riffle_probe_rows_partitioned_total",
                "Probe rows partitioned (ProbeRowsPartitioned)",
                labels,
            ),
            num_repartitions: counter_vec(
                &registry,
                "riffle_repartitions_total",
                "Repartitioning passes (NumRepartitions)",
                labels,
            ),
            largest_partition_percent: gauge_vec(
                &registry,
                "riffle_largest_partition_percent",
                "High-water largest partition share (LargestPartitionPercent)",
                labels,
            ),
            hash_collisions: counter_vec(
                &registry,
                "riffle_hash_collisions_total",
                "Same-hash different-key probe steps (HashCollisions)",
                labels,
            ),
            reduction_factor_estimate: f64_gauge_vec(
                &registry,
                "riffle_reduction_factor_estimate",
                "Streaming pre-agg estimated reduction (ReductionFactorEstimate)",
                labels,
            ),
            reduction_factor_threshold: f64_gauge_vec(
                &registry,
                "riffle_reduction_factor_threshold_to_expand",
                "Streaming pre-agg expansion threshold (ReductionFactorThresholdToExpand)",
                labels,
            ),
            rows_passed_through: counter_vec(
                &registry,
                "riffle_rows_passed_through_total",
                "Streaming pre-agg pass-through rows (RowsPassedThrough)",
                labels,
            ),
            hash_probes: counter_vec(
                &registry,
                "riffle_hash_probes_total",
                "Hash table probes (HashProbes)",
                labels,
            ),
            hash_failed_probes: counter_vec(
                &registry,
                "riffle_hash_failed_probes_total",
                "Hash table probes finding nothing (HashFailedProbes)",
                labels,
            ),
            hash_travel_length: counter_vec(
                &registry,
                "riffle_hash_travel_length_total",
                "Total probe travel length (HashTravelLength)",
                labels,
            ),
            hash_resizes: counter_vec(
                &registry,
                "riffle_hash_resizes_total",
                "Hash table resizes (HashResizes)",
                labels,
            ),
            registry,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    let g = IntGaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn f64_gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Process-wide registry, for callers that do not thread their own.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
