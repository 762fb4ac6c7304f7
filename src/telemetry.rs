use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;

pub struct Metrics {
    request_counter: Counter<u64>,
    upload_failures: Counter<u64>,
    prediction_duration: Histogram<u64>,
    upload_size: Histogram<u64>,
    // Dropping the last provider handle shuts its readers down.
    _provider: SdkMeterProvider,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = SdkMeterProvider::builder().with_reader(exporter).build();

        let meter = provider.meter("image_upload");
        global::set_meter_provider(provider.clone());

        let request_counter = meter
            .u64_counter("requests_total")
            .with_description("Total number of upload requests")
            .build();

        let upload_failures = meter
            .u64_counter("upload_failures_total")
            .with_description("Upload requests answered with an error, by reason")
            .build();

        let prediction_duration = meter
            .u64_histogram("prediction_duration_ms")
            .with_boundaries(exponential_boundaries(5.0, 2.0, 12))
            .with_description("Duration of prediction service calls in milliseconds")
            .build();

        let upload_size = meter
            .u64_histogram("upload_size_bytes")
            .with_boundaries(exponential_boundaries(16.0 * 1024.0, 2.0, 10))
            .with_description("Size of staged uploads in bytes")
            .build();

        Ok(Metrics {
            request_counter,
            upload_failures,
            prediction_duration,
            upload_size,
            _provider: provider,
            registry,
        })
    }

    pub fn record_request(&self, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_failure(&self, reason: &'static str, route: &str) {
        let attributes = vec![
            KeyValue::new("route", route.to_string()),
            KeyValue::new("reason", reason),
        ];
        self.upload_failures.add(1, &attributes);
    }

    pub fn record_prediction_duration(&self, duration_ms: u64, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.prediction_duration.record(duration_ms, &attributes);
    }

    pub fn record_upload_size(&self, bytes: u64, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.upload_size.record(bytes, &attributes);
    }
}

fn exponential_boundaries(start: f64, factor: f64, count: usize) -> Vec<f64> {
    std::iter::successors(Some(start), |previous| Some(previous * factor))
        .take(count)
        .collect()
}
