//! Prometheus metrics for the gRPC server.
//!
//! Call metrics go through the [`metrics`] facade and are exported by
//! `metrics-exporter-prometheus`. The recorder is process wide and installed
//! at most once; every server in the process shares it. The scrape endpoint
//! is a small axum app serving the rendered text format.
//!
//! ## Metrics
//! - `grpc_server_started_total` (counter): calls started, by service and method
//! - `grpc_server_handled_total` (counter): calls finished, plus `grpc_code`
//! - `grpc_server_handling_seconds` (histogram): call latency, plus `grpc_code`

use crate::{Error, Result, interceptor::RequestContext};
use axum::{Router, extract::State, http::header, response::IntoResponse, routing::get};
use core::time::Duration;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::{Mutex, PoisonError};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tonic::Code;

pub const STARTED_TOTAL: &str = "grpc_server_started_total";
pub const HANDLED_TOTAL: &str = "grpc_server_handled_total";
pub const HANDLING_SECONDS: &str = "grpc_server_handling_seconds";

const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

static HANDLE: Mutex<Option<PrometheusHandle>> = Mutex::new(None);

/// Installs the process-wide Prometheus recorder, or returns the one that is
/// already installed.
pub fn install_recorder() -> Result<PrometheusHandle> {
    let mut slot = HANDLE.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(handle) = slot.as_ref() {
        return Ok(handle.clone());
    }
    let recorder = PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(HANDLING_SECONDS.to_owned()), LATENCY_BUCKETS)?
        .build_recorder();
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder).map_err(|_| {
        Error::config("a different metrics recorder is already installed")
    })?;
    *slot = Some(handle.clone());
    Ok(handle)
}

pub(crate) fn record_started(context: &RequestContext) {
    let (service, method) = context.service_and_method();
    metrics::counter!(
        STARTED_TOTAL,
        "grpc_service" => service.to_owned(),
        "grpc_method" => method.to_owned(),
    )
    .increment(1);
}

pub(crate) fn record_handled(context: &RequestContext, code: Code) {
    let (service, method) = context.service_and_method();
    let code = code_label(code);
    metrics::counter!(
        HANDLED_TOTAL,
        "grpc_service" => service.to_owned(),
        "grpc_method" => method.to_owned(),
        "grpc_code" => code,
    )
    .increment(1);
    metrics::histogram!(
        HANDLING_SECONDS,
        "grpc_service" => service.to_owned(),
        "grpc_method" => method.to_owned(),
        "grpc_code" => code,
    )
    .record(context.started_at().elapsed().as_secs_f64());
}

/// The `grpc_code` label value, spelled the way go-grpc-prometheus spells
/// it so existing dashboards and alerts keep matching.
pub fn code_label(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "Canceled",
        Code::Unknown => "Unknown",
        Code::InvalidArgument => "InvalidArgument",
        Code::DeadlineExceeded => "DeadlineExceeded",
        Code::NotFound => "NotFound",
        Code::AlreadyExists => "AlreadyExists",
        Code::PermissionDenied => "PermissionDenied",
        Code::ResourceExhausted => "ResourceExhausted",
        Code::FailedPrecondition => "FailedPrecondition",
        Code::Aborted => "Aborted",
        Code::OutOfRange => "OutOfRange",
        Code::Unimplemented => "Unimplemented",
        Code::Internal => "Internal",
        Code::Unavailable => "Unavailable",
        Code::DataLoss => "DataLoss",
        Code::Unauthenticated => "Unauthenticated",
    }
}

/// The scrape app. Every path renders the full metrics payload.
pub fn router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(scrape))
        .fallback(scrape)
        .with_state(handle)
}

async fn scrape(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
}

/// Serves the scrape endpoint until `shutdown` is cancelled.
///
/// Histogram upkeep runs alongside the endpoint and stops with it.
pub(crate) async fn serve(
    listener: TcpListener,
    handle: PrometheusHandle,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let upkeep = {
        let handle = handle.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(UPKEEP_INTERVAL);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => handle.run_upkeep(),
                }
            }
        })
    };

    let result = axum::serve(listener, router(handle))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await;
    upkeep.abort();
    result
}
