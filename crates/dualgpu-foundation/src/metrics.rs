//! In-memory metrics sink
//!
//! Keeps counters, histogram summaries and gauges per metric name and label
//! set. Useful for tests and for one-shot CLI runs that print a summary
//! instead of exposing a scrape endpoint.

use std::collections::BTreeMap;

use dualgpu_kernel::MetricsSink;
use dualgpu_kernel::metrics::Labels;
use parking_lot::RwLock;
use serde::Serialize;

type SeriesKey = (String, Vec<(String, String)>);

fn series_key(name: &str, labels: Labels<'_>) -> SeriesKey {
    let mut labels: Vec<(String, String)> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    labels.sort();
    (name.to_string(), labels)
}

/// Count, sum, min and max of observed values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl HistogramSummary {
    fn observe(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

#[derive(Debug, Default)]
struct Series {
    counters: BTreeMap<SeriesKey, u64>,
    histograms: BTreeMap<SeriesKey, HistogramSummary>,
    gauges: BTreeMap<SeriesKey, f64>,
}

/// [`MetricsSink`] that records everything in memory.
#[derive(Debug, Default)]
pub struct RecordingMetricsSink {
    series: RwLock<Series>,
}

impl RecordingMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter total across every label set.
    pub fn counter(&self, name: &str) -> u64 {
        self.series
            .read()
            .counters
            .iter()
            .filter(|((n, _), _)| n == name)
            .map(|(_, v)| *v)
            .sum()
    }

    /// Counter value for one exact label set.
    pub fn counter_with(&self, name: &str, labels: Labels<'_>) -> u64 {
        self.series
            .read()
            .counters
            .get(&series_key(name, labels))
            .copied()
            .unwrap_or(0)
    }

    /// Histogram summary merged across every label set.
    pub fn histogram(&self, name: &str) -> HistogramSummary {
        let series = self.series.read();
        let mut merged = HistogramSummary::default();
        for ((n, _), summary) in series.histograms.iter() {
            if n != name || summary.count == 0 {
                continue;
            }
            if merged.count == 0 {
                merged = *summary;
            } else {
                merged.count += summary.count;
                merged.sum += summary.sum;
                merged.min = merged.min.min(summary.min);
                merged.max = merged.max.max(summary.max);
            }
        }
        merged
    }

    /// Unlabelled gauge value, if set.
    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.series.read().gauges.get(&series_key(name, &[])).copied()
    }

    pub fn reset(&self) {
        *self.series.write() = Series::default();
    }
}

impl MetricsSink for RecordingMetricsSink {
    fn increment(&self, counter_name: &str, labels: Labels<'_>) {
        *self
            .series
            .write()
            .counters
            .entry(series_key(counter_name, labels))
            .or_insert(0) += 1;
    }

    fn observe(&self, histogram_name: &str, value: f64, labels: Labels<'_>) {
        self.series
            .write()
            .histograms
            .entry(series_key(histogram_name, labels))
            .or_default()
            .observe(value);
    }

    fn set_gauge(&self, gauge_name: &str, value: f64, labels: Labels<'_>) {
        self.series
            .write()
            .gauges
            .insert(series_key(gauge_name, labels), value);
    }
}
