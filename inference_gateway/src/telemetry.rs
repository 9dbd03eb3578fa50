use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use prometheus::Registry;
use std::collections::BTreeSet;

pub struct Metrics {
    request_counter: Counter<u64>,
    batch_counter: Counter<u64>,
    frames_inferred: Counter<u64>,
    predict_duration: Histogram<u64>,
    batch_duration: Histogram<u64>,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("inference_gateway");
        global::set_meter_provider(provider);

        let request_counter = meter
            .u64_counter("requests_total")
            .with_description("Total number of requests")
            .build();

        let batch_counter = meter
            .u64_counter("batch_requests_total")
            .with_description("Batch prediction requests by outcome")
            .build();

        let frames_inferred = meter
            .u64_counter("frames_inferred_total")
            .with_description("Video frames returned by successful batches")
            .build();

        let predict_duration = meter
            .u64_histogram("predict_duration_ms")
            .with_boundaries(generate_boundaries(&[
                (10, 100, 10),
                (100, 1000, 100),
                (1000, 5000, 1000),
            ]))
            .with_description("Duration of single image predictions in milliseconds")
            .build();

        let batch_duration = meter
            .u64_histogram("batch_duration_ms")
            .with_boundaries(generate_boundaries(&[
                (100, 1000, 100),
                (1000, 10_000, 1000),
                (10_000, 120_000, 10_000),
            ]))
            .with_description("Duration of batch predictions in milliseconds")
            .build();

        Ok(Metrics {
            request_counter,
            batch_counter,
            frames_inferred,
            predict_duration,
            batch_duration,
            registry,
        })
    }

    pub fn record_request(&self, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_predict(&self, duration_ms: u64, mode: &'static str) {
        let attributes = vec![KeyValue::new("mode", mode)];
        self.predict_duration.record(duration_ms, &attributes);
    }

    pub fn record_batch(&self, duration_ms: u64, outcome: &'static str, frames: usize) {
        let attributes = vec![KeyValue::new("outcome", outcome)];
        self.batch_counter.add(1, &attributes);
        self.batch_duration.record(duration_ms, &attributes);
        if frames > 0 {
            self.frames_inferred.add(frames as u64, &[]);
        }
    }
}

/// Histogram bucket boundaries from `(start, end, step)` segments, deduplicated and sorted.
fn generate_boundaries(segments: &[(u64, u64, usize)]) -> Vec<f64> {
    segments
        .iter()
        .flat_map(|&(start, end, step)| (start..=end).step_by(step.max(1)))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|x| x as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};

    #[test]
    fn test_generate_boundaries() {
        let get = generate_boundaries(&[(2, 22, 10), (22, 26, 2), (26, 46, 20)]);
        let expected = vec![2.0, 12.0, 22.0, 24.0, 26.0, 46.0];

        assert_eq!(get, expected);
    }

    #[test]
    fn test_batch_metrics_are_exported() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request("batch_predict");
        metrics.record_batch(250, "success", 20);

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metrics.registry.gather(), &mut buffer)
            .unwrap();
        let exported = String::from_utf8(buffer).unwrap();

        assert!(exported.contains("frames_inferred"));
        assert!(exported.contains("batch_duration_ms"));
    }
}
