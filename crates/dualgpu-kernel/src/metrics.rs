//! Pluggable metrics sink.
//!
//! The pool reports cache hits, misses, load latency, evictions and health
//! events through [`MetricsSink`]. [`NoopMetricsSink`] is always a valid
//! choice; a monitoring backend is never required for correctness.

/// Metric names emitted by the engine pool.
pub mod names {
    pub const CACHE_HITS: &str = "engine_cache_hits_total";
    pub const CACHE_MISSES: &str = "engine_cache_misses_total";
    pub const EVICTIONS: &str = "engine_evictions_total";
    pub const HEALTH_CHECKS: &str = "engine_health_checks_total";
    pub const HEALTH_FAILURES: &str = "engine_health_failures_total";
    pub const UNLOADS: &str = "engine_unloads_total";
    pub const AUTO_RESTARTS: &str = "engine_auto_restarts_total";
    pub const LOAD_FAILURES: &str = "engine_load_failures_total";
    pub const LOAD_SECONDS: &str = "engine_load_seconds";
    pub const FIRST_TOKEN_SECONDS: &str = "engine_first_token_seconds";
    pub const CACHE_SIZE: &str = "engine_cache_size";

    pub const COUNTERS: [&str; 8] = [
        CACHE_HITS,
        CACHE_MISSES,
        EVICTIONS,
        HEALTH_CHECKS,
        HEALTH_FAILURES,
        UNLOADS,
        AUTO_RESTARTS,
        LOAD_FAILURES,
    ];

    pub const HISTOGRAMS: [&str; 2] = [LOAD_SECONDS, FIRST_TOKEN_SECONDS];
}

/// Label pairs attached to a sample
pub type Labels<'a> = &'a [(&'a str, &'a str)];

/// External counters and histograms.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, counter_name: &str, labels: Labels<'_>);

    fn observe(&self, histogram_name: &str, value: f64, labels: Labels<'_>);

    /// Set a gauge. Sinks without gauge support may ignore it.
    fn set_gauge(&self, gauge_name: &str, value: f64, labels: Labels<'_>) {}
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn increment(&self, _counter_name: &str, _labels: Labels<'_>) {}

    fn observe(&self, _histogram_name: &str, _value: f64, _labels: Labels<'_>) {}
}

const MAX_LABEL_LEN: usize = 100;

/// Make a model path safe to use as a metric label value.
///
/// Characters outside `[A-Za-z0-9-_/]` become `_`; long values are cut to
/// 97 characters plus `...` to bound label cardinality.
pub fn sanitize_label(path: &str) -> String {
    let sanitized: String = path
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.len() > MAX_LABEL_LEN {
        format!("{}...", &sanitized[..MAX_LABEL_LEN - 3])
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_replaces_special_characters() {
        assert_eq!(
            sanitize_label("/models/llama-3.1 8b@Q4:K"),
            "/models/llama-3_1_8b_Q4_K"
        );
    }

    #[test]
    fn test_sanitize_truncates_long_paths() {
        let long = "a".repeat(250);
        let label = sanitize_label(&long);
        assert_eq!(label.len(), 100);
        assert!(label.ends_with("..."));
    }

    #[test]
    fn test_noop_sink_accepts_everything() {
        let sink = NoopMetricsSink;
        sink.increment(names::CACHE_HITS, &[("model", "m")]);
        sink.observe(names::LOAD_SECONDS, 1.5, &[]);
        sink.set_gauge(names::CACHE_SIZE, 2.0, &[]);
    }
}
