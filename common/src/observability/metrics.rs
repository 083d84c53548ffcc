//! Prometheus metrics (Rust `prometheus` crate).
//!
//! One `MetricsContext` is intended per process. It implements
//! [`MetricsSink`], so every playout component reports through the same
//! registry, labelled by `source` (stream / track identifier) and `field`.

use crate::clock::Ticks;
use crate::observability::sink::{Metric, MetricsSink};
use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{Encoder, GaugeVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

const LABELS: &[&str] = &["source", "field"];

/// Configuration for the built-in Prometheus scrape endpoint.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    // ---
    /// Address to bind, e.g. `127.0.0.1:9200`.
    pub bind: SocketAddr,
}

impl MetricsServerConfig {
    // ---
    pub fn new(bind: SocketAddr) -> Self {
        // ---
        Self { bind }
    }
}

/// Prometheus metrics registry + handles.
///
/// Counters land in `playout_events_total{source,field}` and gauges in
/// `playout_value{source,field}`. Recording is a label lookup plus an atomic
/// update, cheap enough for per-frame use.
#[derive(Clone)]
pub struct MetricsContext {
    // ---
    registry: Registry,

    pub events_total: IntCounterVec,
    pub values: GaugeVec,

    /// Number of streams currently registered for dequeue scheduling.
    pub scheduled_streams: IntGauge,
}

impl MetricsContext {
    // ---
    /// Create a new registry and register the standard metrics.
    ///
    /// `process_name` is applied as a constant label (`process=<name>`).
    pub fn new(process_name: &str) -> Result<Self> {
        // ---
        let registry = Registry::new_custom(
            Some("moq_playout".into()),
            Some(prometheus::labels! { "process".to_string() => process_name.to_string() }),
        )?;

        let events_total = IntCounterVec::new(
            Opts::new(
                "playout_events_total",
                "Playout events (writes, reads, underruns, evictions, selections)",
            ),
            LABELS,
        )?;
        let values = GaugeVec::new(
            Opts::new(
                "playout_value",
                "Latest playout measurement (depths, wait times, jitter) in seconds",
            ),
            LABELS,
        )?;
        let scheduled_streams = IntGauge::with_opts(Opts::new(
            "scheduled_streams",
            "Streams registered with the dequeue coordinator",
        ))?;

        registry.register(Box::new(events_total.clone()))?;
        registry.register(Box::new(values.clone()))?;
        registry.register(Box::new(scheduled_streams.clone()))?;

        Ok(Self {
            registry,
            events_total,
            values,
            scheduled_streams,
        })
    }

    /// Gather metric families from this registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        // ---
        self.registry.gather()
    }

    /// Spawns a minimal HTTP server that serves `GET /metrics`.
    ///
    /// Callers decide whether to run it; the playout core never does.
    pub fn spawn_metrics_server(&self, cfg: MetricsServerConfig) -> JoinHandle<Result<()>> {
        // ---
        let registry = Arc::new(self.registry.clone());
        tokio::spawn(async move {
            // ---
            let make_svc = make_service_fn(move |_conn| {
                let registry = Arc::clone(&registry);
                async move {
                    Ok::<_, hyper::Error>(service_fn(move |req| {
                        let registry = Arc::clone(&registry);
                        async move { handle_metrics_request(req, registry).await }
                    }))
                }
            });

            Server::bind(&cfg.bind)
                .serve(make_svc)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            Ok(())
        })
    }
}

impl MetricsSink for MetricsContext {
    fn record(&self, source: &str, metric: Metric, _timestamp: Ticks) {
        // ---
        // Prometheus stamps samples at scrape time.
        match metric {
            Metric::Counter(field, count) => self
                .events_total
                .with_label_values(&[source, field])
                .inc_by(count),
            Metric::Gauge("scheduled_streams", value) => self.scheduled_streams.set(value as i64),
            Metric::Gauge(field, value) => {
                self.values.with_label_values(&[source, field]).set(value)
            }
        }
    }
}

async fn handle_metrics_request(
    req: Request<Body>,
    registry: Arc<Registry>,
) -> Result<Response<Body>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();

            if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
                let mut resp = Response::new(Body::from(format!("encode error: {e}")));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                return Ok(resp);
            }

            let mut resp = Response::new(Body::from(buffer));
            resp.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            Ok(resp)
        }
        _ => {
            let mut resp = Response::new(Body::from("not found"));
            *resp.status_mut() = StatusCode::NOT_FOUND;
            Ok(resp)
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn sink_records_reach_registry() {
        // ---
        let ctx = MetricsContext::new("test").expect("MetricsContext should init");
        ctx.record("video/hd", Metric::Counter("reads", 3), Ticks::ZERO);
        ctx.record("video/hd", Metric::Gauge("depth_seconds", 0.25), Ticks::ZERO);

        assert_eq!(
            ctx.events_total
                .with_label_values(&["video/hd", "reads"])
                .get(),
            3
        );
        assert_eq!(
            ctx.values
                .with_label_values(&["video/hd", "depth_seconds"])
                .get(),
            0.25
        );
        ctx.record("coordinator", Metric::Gauge("scheduled_streams", 4.0), Ticks::ZERO);
        assert_eq!(ctx.scheduled_streams.get(), 4);
        assert!(!ctx.gather().is_empty());
    }
}
