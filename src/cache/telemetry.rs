//! Telemetry Adapter
//!
//! Optional span and metric sink for cache operations. The manager treats
//! every call here as advisory: errors are logged at debug level and never
//! reach the caller of `get`/`set`.

use crate::cache::metrics::CacheStats;
use crate::error::{Error, Result};
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// An open span
#[derive(Debug, Clone)]
pub struct SpanHandle {
    pub id: u64,
    pub name: String,
    pub started: Instant,
    pub attributes: Vec<(String, String)>,
}

impl SpanHandle {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            started: Instant::now(),
            attributes: Vec::new(),
        }
    }

    /// Attribute value by key
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

// =============================================================================
// Telemetry Trait
// =============================================================================

/// Span and metric sink used by the cache
pub trait Telemetry: Send + Sync {
    fn start_span(&self, name: &str) -> Result<SpanHandle>;

    fn set_span_attribute(&self, span: &mut SpanHandle, key: &str, value: &str) -> Result<()>;

    /// Add `value` to the named metric
    fn record_metric(&self, name: &str, value: f64, labels: &[(&str, &str)]) -> Result<()>;

    fn end_span(&self, span: SpanHandle) -> Result<()>;

    /// Export a stats snapshot as gauges
    fn publish_stats(&self, _stats: &CacheStats) -> Result<()> {
        Ok(())
    }
}

/// Telemetry that records nothing
#[derive(Debug, Default)]
pub struct NoopTelemetry {
    next_id: AtomicU64,
}

impl Telemetry for NoopTelemetry {
    fn start_span(&self, name: &str) -> Result<SpanHandle> {
        Ok(SpanHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed), name))
    }

    fn set_span_attribute(&self, span: &mut SpanHandle, key: &str, value: &str) -> Result<()> {
        span.attributes.push((key.to_string(), value.to_string()));
        Ok(())
    }

    fn record_metric(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) -> Result<()> {
        Ok(())
    }

    fn end_span(&self, _span: SpanHandle) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Prometheus Telemetry
// =============================================================================

fn prometheus_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("prometheus: {}", e))
}

/// Prometheus-backed telemetry with its own registry
pub struct PrometheusTelemetry {
    registry: Registry,
    next_id: AtomicU64,
    metrics: CounterVec,
    spans: HistogramVec,
    items: GaugeVec,
    bytes: GaugeVec,
    hit_ratio: Gauge,
}

impl PrometheusTelemetry {
    /// Create and register all collectors
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let metrics = CounterVec::new(
            Opts::new("ngx_cache_metric_total", "Cache metric counters by name"),
            &["metric", "tier"],
        )
        .map_err(prometheus_error)?;
        let spans = HistogramVec::new(
            HistogramOpts::new(
                "ngx_cache_operation_duration_seconds",
                "Duration of cache operations",
            )
            .buckets(vec![
                0.000_05, 0.000_1, 0.000_25, 0.000_5, 0.001, 0.0025, 0.005, 0.01, 0.05, 0.1, 0.5,
            ]),
            &["operation", "outcome"],
        )
        .map_err(prometheus_error)?;
        let items = GaugeVec::new(
            Opts::new("ngx_cache_items", "Resident entries per tier"),
            &["tier"],
        )
        .map_err(prometheus_error)?;
        let bytes = GaugeVec::new(
            Opts::new("ngx_cache_bytes", "Resident bytes per tier"),
            &["tier"],
        )
        .map_err(prometheus_error)?;
        let hit_ratio = Gauge::new("ngx_cache_hit_ratio", "Lifetime hit ratio")
            .map_err(prometheus_error)?;

        registry
            .register(Box::new(metrics.clone()))
            .map_err(prometheus_error)?;
        registry
            .register(Box::new(spans.clone()))
            .map_err(prometheus_error)?;
        registry
            .register(Box::new(items.clone()))
            .map_err(prometheus_error)?;
        registry
            .register(Box::new(bytes.clone()))
            .map_err(prometheus_error)?;
        registry
            .register(Box::new(hit_ratio.clone()))
            .map_err(prometheus_error)?;

        Ok(Self {
            registry,
            next_id: AtomicU64::new(0),
            metrics,
            spans,
            items,
            bytes,
            hit_ratio,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the text exposition format
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(prometheus_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

impl Telemetry for PrometheusTelemetry {
    fn start_span(&self, name: &str) -> Result<SpanHandle> {
        Ok(SpanHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed), name))
    }

    fn set_span_attribute(&self, span: &mut SpanHandle, key: &str, value: &str) -> Result<()> {
        span.attributes.push((key.to_string(), value.to_string()));
        Ok(())
    }

    fn record_metric(&self, name: &str, value: f64, labels: &[(&str, &str)]) -> Result<()> {
        if !value.is_finite() || value < 0.0 {
            return Err(Error::validation(format!(
                "metric {} got non-monotonic value {}",
                name, value
            )));
        }
        let tier = labels
            .iter()
            .find(|(k, _)| *k == "tier")
            .map(|(_, v)| *v)
            .unwrap_or("");
        self.metrics
            .get_metric_with_label_values(&[name, tier])
            .map_err(prometheus_error)?
            .inc_by(value);
        Ok(())
    }

    fn end_span(&self, span: SpanHandle) -> Result<()> {
        let outcome = span.attribute("outcome").unwrap_or("ok");
        self.spans
            .get_metric_with_label_values(&[span.name.as_str(), outcome])
            .map_err(prometheus_error)?
            .observe(span.started.elapsed().as_secs_f64());
        Ok(())
    }

    fn publish_stats(&self, stats: &CacheStats) -> Result<()> {
        for (tier, t) in [("l1", &stats.l1), ("l2", &stats.l2)] {
            self.items
                .get_metric_with_label_values(&[tier])
                .map_err(prometheus_error)?
                .set(t.items as f64);
            self.bytes
                .get_metric_with_label_values(&[tier])
                .map_err(prometheus_error)?
                .set(t.memory_bytes as f64);
        }
        self.hit_ratio.set(stats.hit_ratio);
        Ok(())
    }
}
