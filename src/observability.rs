use std::time::Instant;

use anyhow::{Result, anyhow};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{
    counter, decrement_gauge, describe_counter, describe_gauge, describe_histogram, histogram,
    increment_gauge,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();
static START_TIME: OnceCell<Instant> = OnceCell::new();

pub fn init() -> Result<()> {
    if PROMETHEUS_HANDLE.get().is_some() {
        return Ok(());
    }

    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("tracedx_http_request_duration_seconds".into()),
            &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
        )
        .map_err(|err| anyhow!("failed to configure prometheus exporter: {err}"))?
        .set_buckets_for_metric(
            Matcher::Full("tracedx_codec_response_duration_seconds".into()),
            &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0],
        )
        .map_err(|err| anyhow!("failed to configure prometheus exporter: {err}"))?;
    let handle = builder
        .install_recorder()
        .map_err(|err| anyhow!("failed to initialise prometheus recorder: {err}"))?;

    describe_counter!(
        "tracedx_http_requests_total",
        "Total number of HTTP requests processed by the provider."
    );
    describe_histogram!(
        "tracedx_http_request_duration_seconds",
        "HTTP request latency observed by the provider."
    );
    describe_counter!(
        "tracedx_store_requests_total",
        "Total number of queries issued to the record store."
    );
    describe_counter!(
        "tracedx_store_retries_total",
        "Total number of retried store queries in SSE mode."
    );
    describe_counter!(
        "tracedx_records_emitted_total",
        "Total number of records written to search responses."
    );
    describe_counter!(
        "tracedx_merger_ticks_total",
        "Total number of heartbeat ticks consumed by the stream merger."
    );
    describe_gauge!(
        "tracedx_codec_pending_requests",
        "Codec requests currently awaiting a response."
    );
    describe_histogram!(
        "tracedx_codec_response_duration_seconds",
        "Round-trip latency of codec decode requests."
    );
    describe_counter!(
        "tracedx_codec_timeouts_total",
        "Codec requests resolved as failed after the response deadline."
    );
    describe_counter!(
        "tracedx_codec_dispatch_failures_total",
        "Codec requests that failed to dispatch to the transport."
    );

    let _ = PROMETHEUS_HANDLE.set(handle);
    let _ = START_TIME.set(Instant::now());
    Ok(())
}

pub async fn metrics_handler() -> Response {
    if PROMETHEUS_HANDLE.get().is_none() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not initialised",
        )
            .into_response();
    }

    let body = render_metrics();
    let headers = [(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    )];
    (StatusCode::OK, headers, body).into_response()
}

pub async fn track_http_metrics(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let matched_path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string());
    let path = matched_path.unwrap_or_else(|| req.uri().path().to_string());
    let method_label = method.as_str().to_owned();

    let start = Instant::now();
    let response = next.run(req).await;
    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(
        "tracedx_http_requests_total",
        1,
        "method" => method_label.clone(),
        "path" => path.clone(),
        "status" => status.clone()
    );
    histogram!(
        "tracedx_http_request_duration_seconds",
        latency,
        "method" => method_label,
        "path" => path,
        "status" => status
    );

    response
}

pub fn record_store_request(operation: &'static str) {
    counter!("tracedx_store_requests_total", 1, "operation" => operation);
}

pub fn record_store_retry(operation: &'static str) {
    counter!("tracedx_store_retries_total", 1, "operation" => operation);
}

pub fn record_emitted(kind: &'static str) {
    counter!("tracedx_records_emitted_total", 1, "kind" => kind);
}

pub fn record_merger_tick() {
    counter!("tracedx_merger_ticks_total", 1);
}

pub fn codec_request_started() {
    increment_gauge!("tracedx_codec_pending_requests", 1.0);
}

pub fn codec_request_finished(stream: &str, outcome: &'static str, duration: f64) {
    decrement_gauge!("tracedx_codec_pending_requests", 1.0);
    histogram!(
        "tracedx_codec_response_duration_seconds",
        duration,
        "stream" => stream.to_owned(),
        "outcome" => outcome
    );
    match outcome {
        "timeout" => counter!("tracedx_codec_timeouts_total", 1),
        "dispatch_failed" => counter!("tracedx_codec_dispatch_failures_total", 1),
        _ => {}
    }
}

pub fn render_metrics() -> String {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        let mut body = handle.render();
        if let Some(start) = START_TIME.get() {
            let uptime = start.elapsed().as_secs_f64();
            body.push_str(&format!("tracedx_uptime_seconds{{}} {}\n", uptime));
        }
        body
    } else {
        String::new()
    }
}
