//! # Prometheus Metrics — Gateway Exposition
//!
//! Exposes gateway counters in the OpenMetrics text format on `/metrics`.
//!
//! ## Metrics Exposed
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `sigma_images_generated_total` | Counter | `kind`, `size` | Images saved and recorded |
//! | `sigma_image_failures_total` | Counter | `kind` | Generation attempts that produced no image |
//! | `sigma_tasks_reaped_total` | Counter | — | Stale tasks failed by the reaper |
//! | `sigma_upstream_request_seconds` | Histogram | — | Generation POST latency |
//! | `sigma_http_request_duration_seconds` | Histogram | `method`, `path` | Handler latency |
//!
//! Paths are normalised before labelling so ids do not explode cardinality.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct ImageLabel {
    pub kind: String,
    pub size: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct KindLabel {
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct HttpLabel {
    pub method: String,
    pub path: String,
}

fn upstream_histogram() -> Histogram {
    // 0.5s .. ~17min
    Histogram::new(exponential_buckets(0.5, 2.0, 12))
}

fn http_histogram() -> Histogram {
    Histogram::new(exponential_buckets(0.005, 2.0, 14))
}

pub struct Metrics {
    pub registry: Registry,
    pub images_generated: Family<ImageLabel, Counter>,
    pub image_failures: Family<KindLabel, Counter>,
    pub tasks_reaped: Counter,
    pub upstream_request_seconds: Histogram,
    pub http_request_duration: Family<HttpLabel, Histogram, fn() -> Histogram>,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let images_generated = Family::<ImageLabel, Counter>::default();
        registry.register(
            "sigma_images_generated",
            "Images saved and recorded, by generation type and size",
            images_generated.clone(),
        );

        let image_failures = Family::<KindLabel, Counter>::default();
        registry.register(
            "sigma_image_failures",
            "Generation attempts that produced no image",
            image_failures.clone(),
        );

        let tasks_reaped = Counter::default();
        registry.register(
            "sigma_tasks_reaped",
            "Tasks failed by the stale-task reaper",
            tasks_reaped.clone(),
        );

        let upstream_request_seconds = upstream_histogram();
        registry.register(
            "sigma_upstream_request_seconds",
            "Latency of generation requests to the upstream provider",
            upstream_request_seconds.clone(),
        );

        let http_request_duration =
            Family::<HttpLabel, Histogram, fn() -> Histogram>::new_with_constructor(
                http_histogram,
            );
        registry.register(
            "sigma_http_request_duration_seconds",
            "HTTP handler latency by method and normalised path",
            http_request_duration.clone(),
        );

        Self {
            registry,
            images_generated,
            image_failures,
            tasks_reaped,
            upstream_request_seconds,
            http_request_duration,
        }
    }

    pub fn record_image(&self, kind: &str, size: &str) {
        self.images_generated
            .get_or_create(&ImageLabel {
                kind: kind.to_string(),
                size: size.to_string(),
            })
            .inc();
    }

    pub fn record_failure(&self, kind: &str) {
        self.image_failures
            .get_or_create(&KindLabel {
                kind: kind.to_string(),
            })
            .inc();
    }

    /// Render all metrics in the text exposition format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        if let Err(e) = encode(&mut buf, &self.registry) {
            tracing::warn!(error = %e, "metrics encoding failed");
        }
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
