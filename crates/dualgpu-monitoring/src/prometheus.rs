//! Prometheus-backed [`MetricsSink`].
//!
//! Known engine metrics are registered up front with fixed label names.
//! Unknown names are registered on first use with the label names of that
//! first call. Labels a call omits are exported as empty strings; extra
//! labels are dropped.

use std::collections::HashMap;

use dualgpu_kernel::MetricsSink;
use dualgpu_kernel::metrics::{Labels, names};
use parking_lot::RwLock;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use tracing::warn;

/// Load times run from sub-second (warm mmap) to many minutes (large
/// checkpoints over the network).
const LOAD_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0];
const FIRST_TOKEN_BUCKETS: &[f64] = &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

const MODEL_LABELS: &[&str] = &["model", "backend"];
const UNLOAD_LABELS: &[&str] = &["model", "backend", "reason"];

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PrometheusSinkError {
    #[error("failed to register metric: {0}")]
    Register(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encode(String),
}

#[derive(Clone)]
enum Family {
    Counter(IntCounterVec),
    Histogram(HistogramVec),
    Gauge(GaugeVec),
}

struct Registered {
    family: Family,
    label_names: Vec<String>,
}

impl Registered {
    fn values<'a>(&'a self, labels: Labels<'a>) -> Vec<&'a str> {
        self.label_names
            .iter()
            .map(|name| {
                labels
                    .iter()
                    .find(|(k, _)| *k == name.as_str())
                    .map(|(_, v)| *v)
                    .unwrap_or("")
            })
            .collect()
    }
}

/// Exposes pool metrics through a `prometheus::Registry`.
pub struct PrometheusMetricsSink {
    registry: Registry,
    families: RwLock<HashMap<String, Registered>>,
}

impl PrometheusMetricsSink {
    /// Sink over a fresh registry with every engine metric pre-registered.
    pub fn new() -> Result<Self, PrometheusSinkError> {
        Self::with_registry(Registry::new())
    }

    pub fn with_registry(registry: Registry) -> Result<Self, PrometheusSinkError> {
        let sink = Self {
            registry,
            families: RwLock::new(HashMap::new()),
        };

        for name in names::COUNTERS {
            let labels = if name == names::UNLOADS || name == names::EVICTIONS {
                UNLOAD_LABELS
            } else {
                MODEL_LABELS
            };
            sink.register_counter(name, help_for(name), labels)?;
        }
        sink.register_histogram(names::LOAD_SECONDS, help_for(names::LOAD_SECONDS), LOAD_BUCKETS)?;
        sink.register_histogram(
            names::FIRST_TOKEN_SECONDS,
            help_for(names::FIRST_TOKEN_SECONDS),
            FIRST_TOKEN_BUCKETS,
        )?;
        sink.register_gauge(names::CACHE_SIZE, help_for(names::CACHE_SIZE), &[])?;
        Ok(sink)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current metrics in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, PrometheusSinkError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| PrometheusSinkError::Encode(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| PrometheusSinkError::Encode(e.to_string()))
    }

    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }

    fn register_counter(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> Result<Family, PrometheusSinkError> {
        let counter = IntCounterVec::new(Opts::new(name, help), label_names)?;
        self.registry.register(Box::new(counter.clone()))?;
        Ok(self.remember(name, Family::Counter(counter), label_names))
    }

    fn register_histogram(
        &self,
        name: &str,
        help: &str,
        buckets: &[f64],
    ) -> Result<Family, PrometheusSinkError> {
        let histogram = HistogramVec::new(
            HistogramOpts::new(name, help).buckets(buckets.to_vec()),
            MODEL_LABELS,
        )?;
        self.registry.register(Box::new(histogram.clone()))?;
        Ok(self.remember(name, Family::Histogram(histogram), MODEL_LABELS))
    }

    fn register_gauge(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> Result<Family, PrometheusSinkError> {
        let gauge = GaugeVec::new(Opts::new(name, help), label_names)?;
        self.registry.register(Box::new(gauge.clone()))?;
        Ok(self.remember(name, Family::Gauge(gauge), label_names))
    }

    fn remember(&self, name: &str, family: Family, label_names: &[&str]) -> Family {
        self.families.write().insert(
            name.to_string(),
            Registered {
                family: family.clone(),
                label_names: label_names.iter().map(|s| s.to_string()).collect(),
            },
        );
        family
    }

    /// Run `apply` against the family for `name`, registering it on first use.
    fn with_family<F>(&self, name: &str, labels: Labels<'_>, register: F, apply: impl FnOnce(&Family, &[&str]))
    where
        F: FnOnce(&Self, &[&str]) -> Result<Family, PrometheusSinkError>,
    {
        {
            let families = self.families.read();
            if let Some(registered) = families.get(name) {
                let values = registered.values(labels);
                apply(&registered.family, &values);
                return;
            }
        }

        let label_names: Vec<&str> = labels.iter().map(|(k, _)| *k).collect();
        match register(self, &label_names) {
            Ok(_) => {
                let families = self.families.read();
                if let Some(registered) = families.get(name) {
                    let values = registered.values(labels);
                    apply(&registered.family, &values);
                }
            }
            Err(err) => warn!(metric = name, error = %err, "Dropping metric sample"),
        }
    }
}

fn help_for(name: &str) -> &'static str {
    match name {
        names::CACHE_HITS => "Engine cache hits",
        names::CACHE_MISSES => "Engine cache misses (completed loads)",
        names::EVICTIONS => "Engines evicted by LRU pressure, resize or request",
        names::HEALTH_CHECKS => "Health probes run",
        names::HEALTH_FAILURES => "Health probes that failed",
        names::UNLOADS => "Engines unloaded for any reason",
        names::AUTO_RESTARTS => "Proactive reloads after a health-driven unload",
        names::LOAD_FAILURES => "Engine loads that failed",
        names::LOAD_SECONDS => "Engine load time in seconds",
        names::FIRST_TOKEN_SECONDS => "Warmup first-token latency in seconds",
        names::CACHE_SIZE => "Resident engines",
        _ => "Engine pool metric",
    }
}

impl MetricsSink for PrometheusMetricsSink {
    fn increment(&self, counter_name: &str, labels: Labels<'_>) {
        self.with_family(
            counter_name,
            labels,
            |sink, label_names| sink.register_counter(counter_name, help_for(counter_name), label_names),
            |family, values| match family {
                Family::Counter(counter) => match counter.get_metric_with_label_values(values) {
                    Ok(counter) => counter.inc(),
                    Err(err) => warn!(metric = counter_name, error = %err, "Bad counter labels"),
                },
                _ => warn!(metric = counter_name, "Metric is not a counter"),
            },
        );
    }

    fn observe(&self, histogram_name: &str, value: f64, labels: Labels<'_>) {
        self.with_family(
            histogram_name,
            labels,
            |sink, _| {
                sink.register_histogram(
                    histogram_name,
                    help_for(histogram_name),
                    prometheus::DEFAULT_BUCKETS,
                )
            },
            |family, values| match family {
                Family::Histogram(histogram) => {
                    match histogram.get_metric_with_label_values(values) {
                        Ok(histogram) => histogram.observe(value),
                        Err(err) => {
                            warn!(metric = histogram_name, error = %err, "Bad histogram labels")
                        }
                    }
                }
                _ => warn!(metric = histogram_name, "Metric is not a histogram"),
            },
        );
    }

    fn set_gauge(&self, gauge_name: &str, value: f64, labels: Labels<'_>) {
        self.with_family(
            gauge_name,
            labels,
            |sink, label_names| sink.register_gauge(gauge_name, help_for(gauge_name), label_names),
            |family, values| match family {
                Family::Gauge(gauge) => match gauge.get_metric_with_label_values(values) {
                    Ok(gauge) => gauge.set(value),
                    Err(err) => warn!(metric = gauge_name, error = %err, "Bad gauge labels"),
                },
                _ => warn!(metric = gauge_name, "Metric is not a gauge"),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_known_metrics() {
        let sink = PrometheusMetricsSink::new().unwrap();
        sink.increment(names::CACHE_HITS, &[("model", "/m"), ("backend", "mock")]);
        sink.increment(names::CACHE_HITS, &[("backend", "mock"), ("model", "/m")]);
        sink.observe(names::LOAD_SECONDS, 1.2, &[("model", "/m"), ("backend", "mock")]);
        sink.set_gauge(names::CACHE_SIZE, 1.0, &[]);

        let text = sink.render().unwrap();
        assert!(text.contains(r#"engine_cache_hits_total{backend="mock",model="/m"} 2"#));
        assert!(text.contains("engine_load_seconds_count"));
        assert!(text.contains("engine_cache_size 1"));
    }

    #[test]
    fn test_missing_and_extra_labels() {
        let sink = PrometheusMetricsSink::new().unwrap();
        sink.increment(names::UNLOADS, &[("model", "/m"), ("extra", "x")]);

        let text = sink.render().unwrap();
        assert!(text.contains(r#"engine_unloads_total{backend="",model="/m",reason=""} 1"#));
        assert!(!text.contains("extra"));
    }

    #[test]
    fn test_unknown_metric_registered_on_first_use() {
        let sink = PrometheusMetricsSink::new().unwrap();
        sink.increment("engine_custom_total", &[("kind", "a")]);
        sink.increment("engine_custom_total", &[("kind", "a")]);
        assert!(sink.render().unwrap().contains(r#"engine_custom_total{kind="a"} 2"#));
    }

    #[test]
    fn test_type_mismatch_is_ignored() {
        let sink = PrometheusMetricsSink::new().unwrap();
        sink.observe(names::CACHE_HITS, 1.0, &[]);
        sink.set_gauge(names::LOAD_SECONDS, 1.0, &[]);
        assert!(sink.render().is_ok());
    }
}
