use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub const MESSAGES_RECEIVED: &str = "flow_messages_received_total";
pub const WORKER_READ_ERRORS: &str = "flow_worker_read_errors_total";
pub const KAFKA_CONSUMER_ERRORS: &str = "flow_kafka_consumer_errors_total";
pub const PARTITION_WORKERS_ACTIVE: &str = "flow_partition_workers_active";
pub const RECORDS_WRITTEN: &str = "flow_records_written_total";
pub const DECODE_ERRORS: &str = "flow_decode_errors_total";
pub const PIPELINE_STOPPED: &str = "flow_pipeline_stopped_total";
pub const SINK_WRITE_SECONDS: &str = "flow_sink_write_seconds";
pub const HTTP_REQUESTS: &str = "flow_http_requests_total";
pub const HTTP_REQUEST_SECONDS: &str = "flow_http_request_duration_seconds";

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Add the prometheus endpoint and middleware to a router, should be called last.
pub fn setup_metrics_routes(router: Router) -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics)))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    // Sink writes are flushed one by one, so they stay well under a second
    const SECONDS: &[f64] = &[
        0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(SECONDS)?
        .install_recorder()
}

/// Count and time the health and metrics endpoints, labelled by route.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    // Unmatched paths share one label to keep cardinality bounded
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_owned(), |p| p.as_str().to_owned());
    let method = req.method().to_string();

    let start = Instant::now();
    let response = next.run(req).await;
    let elapsed = start.elapsed().as_secs_f64();

    let labels = [
        ("method", method),
        ("route", route),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!(HTTP_REQUESTS, &labels).increment(1);
    metrics::histogram!(HTTP_REQUEST_SECONDS, &labels).record(elapsed);

    response
}
