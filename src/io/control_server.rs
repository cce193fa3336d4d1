//! HTTP control endpoint
//!
//! Serves the status board as JSON, Prometheus text metrics, and accepts user
//! commands which are forwarded to the poll loop. Uses hyper for the HTTP
//! server.
//!
//! Routes:
//! - `GET /status`, `GET /metrics`, `GET /health`
//! - `POST /mode` (body: mode name), `POST /threshold` (body: integer ms)
//! - `POST /play-sound` (body: true/false), `POST /clear`, `POST /copy` (body: text)

use crate::domain::types::{Badge, Mode};
use crate::infra::metrics::{
    Metrics, MetricsSummary, METRICS_FETCH_BOUNDS, METRICS_NUM_BUCKETS, METRICS_POLL_BOUNDS,
};
use crate::io::status_board::{StatusBoard, StatusSnapshot};
use crate::services::poll_loop::{Command, EngineHandle};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

const MAX_BODY_BYTES: usize = 64 * 1024;

/// Shared state for request handlers
pub struct ControlContext {
    pub status: Arc<StatusBoard>,
    pub metrics: Arc<Metrics>,
    pub engine: EngineHandle,
}

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, val: i64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name} {val}");
}

fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_sum {sum}");
    let _ = writeln!(output, "{name}_count {cumulative}");
}

/// Format metrics and current status in Prometheus text exposition format
pub fn format_prometheus_metrics(summary: &MetricsSummary, status: &StatusSnapshot) -> String {
    let mut output = String::with_capacity(4096);

    write_poll_metrics(&mut output, summary);
    write_hang_metrics(&mut output, summary, status);
    write_fetch_metrics(&mut output, summary);

    output
}

fn write_poll_metrics(output: &mut String, summary: &MetricsSummary) {
    write_metric(
        output,
        "hang_monitor_polls_total",
        "Poll passes executed",
        MetricType::Counter,
        summary.polls_total as i64,
    );
    write_metric(
        output,
        "hang_monitor_polls_failed_total",
        "Poll passes that did not observe data",
        MetricType::Counter,
        summary.polls_failed as i64,
    );
    write_metric(
        output,
        "hang_monitor_source_unavailable_total",
        "Reads of a histogram the host does not provide",
        MetricType::Counter,
        summary.source_unavailable as i64,
    );
    write_histogram(
        output,
        "hang_monitor_poll_duration_us",
        "Poll pass duration in microseconds",
        &summary.poll_duration_buckets,
        &METRICS_POLL_BOUNDS,
        summary.poll_duration_sum_us,
    );
    write_metric(
        output,
        "hang_monitor_poll_duration_max_us",
        "Longest poll pass",
        MetricType::Gauge,
        summary.poll_duration_max_us as i64,
    );
    write_metric(
        output,
        "hang_monitor_mode_switches_total",
        "Mode switches applied",
        MetricType::Counter,
        summary.mode_switches as i64,
    );
}

fn write_hang_metrics(output: &mut String, summary: &MetricsSummary, status: &StatusSnapshot) {
    write_metric(
        output,
        "hang_monitor_qualifying_events_total",
        "Qualifying events added to the running total",
        MetricType::Counter,
        summary.qualifying_events as i64,
    );
    write_metric(
        output,
        "hang_monitor_hangs_recorded_total",
        "Individual hangs reconstructed from stack histograms",
        MetricType::Counter,
        summary.hangs_recorded as i64,
    );
    write_metric(
        output,
        "hang_monitor_malformed_repairs_total",
        "Readings clamped, skipped or re-baselined",
        MetricType::Counter,
        summary.malformed_repairs as i64,
    );
    write_metric(
        output,
        "hang_monitor_clears_total",
        "Counter clears, explicit and deferred",
        MetricType::Counter,
        summary.clears_total as i64,
    );

    let _ = writeln!(output, "# HELP hang_monitor_badge Visible badge value (absent while unknown)");
    let _ = writeln!(output, "# TYPE hang_monitor_badge gauge");
    if let Badge::Known(n) = status.visible_badge {
        let _ = writeln!(output, "hang_monitor_badge {n}");
    }

    write_metric(
        output,
        "hang_monitor_recent_hangs",
        "Hangs currently held in the recent history",
        MetricType::Gauge,
        status.recent_hangs.len() as i64,
    );
    if let Some(threshold) = status.computed_threshold {
        write_metric(
            output,
            "hang_monitor_computed_threshold_ms",
            "Smallest qualifying bucket lower bound",
            MetricType::Gauge,
            threshold as i64,
        );
    }
}

fn write_fetch_metrics(output: &mut String, summary: &MetricsSummary) {
    write_metric(
        output,
        "hang_monitor_subordinate_cache_hits_total",
        "Subordinate requests served from cache",
        MetricType::Counter,
        summary.cache_hits as i64,
    );
    write_metric(
        output,
        "hang_monitor_subordinate_cache_misses_total",
        "Subordinate requests that went to the source",
        MetricType::Counter,
        summary.cache_misses as i64,
    );
    write_metric(
        output,
        "hang_monitor_subordinate_fetch_failures_total",
        "Subordinate fetches that failed or timed out",
        MetricType::Counter,
        summary.fetch_failures as i64,
    );
    write_histogram(
        output,
        "hang_monitor_subordinate_fetch_ms",
        "Subordinate fetch latency in milliseconds",
        &summary.fetch_latency_buckets,
        &METRICS_FETCH_BOUNDS,
        summary.fetch_latency_sum_ms,
    );
}

fn json_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body)))
        .expect("static response should not fail")
}

fn error_response(status: StatusCode, error: &str) -> Response<Full<Bytes>> {
    json_response(status, format!(r#"{{"ok":false,"error":"{error}"}}"#))
}

fn dispatch(engine: &EngineHandle, command: Command) -> Response<Full<Bytes>> {
    if engine.send(command) {
        json_response(StatusCode::ACCEPTED, r#"{"ok":true}"#.to_string())
    } else {
        error_response(StatusCode::SERVICE_UNAVAILABLE, "engine_unavailable")
    }
}

fn parse_play_sound(body: &str) -> Option<bool> {
    match body {
        "true" | "1" | "on" => Some(true),
        "false" | "0" | "off" => Some(false),
        _ => None,
    }
}

/// Route a request with an already collected body
pub fn route(method: &Method, path: &str, body: &[u8], ctx: &ControlContext) -> Response<Full<Bytes>> {
    let text = std::str::from_utf8(body).map(str::trim);

    match (method, path) {
        (&Method::GET, "/status") => match serde_json::to_string(&ctx.status.snapshot()) {
            Ok(json) => json_response(StatusCode::OK, json),
            Err(e) => {
                error!(error = %e, "status_serialize_failed");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "serialize_failed")
            }
        },
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&ctx.metrics.report(), &ctx.status.snapshot());
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail")
        }
        (&Method::GET, "/health") => Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .expect("static response should not fail"),
        (&Method::POST, "/mode") => match text.ok().and_then(Mode::parse) {
            Some(mode) => dispatch(&ctx.engine, Command::SetMode(mode)),
            None => error_response(StatusCode::BAD_REQUEST, "unknown_mode"),
        },
        (&Method::POST, "/threshold") => {
            // Non-numeric input falls back to the default like any invalid value
            let threshold = text.ok().and_then(|t| t.parse::<i64>().ok()).unwrap_or(0);
            dispatch(&ctx.engine, Command::SetThreshold(threshold))
        }
        (&Method::POST, "/play-sound") => match text.ok().and_then(parse_play_sound) {
            Some(play_sound) => dispatch(&ctx.engine, Command::SetPlaySound(play_sound)),
            None => error_response(StatusCode::BAD_REQUEST, "expected_boolean"),
        },
        (&Method::POST, "/clear") => dispatch(&ctx.engine, Command::ClearCount),
        (&Method::POST, "/copy") => match std::str::from_utf8(body) {
            Ok(text) => dispatch(&ctx.engine, Command::CopyToClipboard(text.to_string())),
            Err(_) => error_response(StatusCode::BAD_REQUEST, "expected_utf8"),
        },
        (&Method::OPTIONS, _) => Response::builder()
            .status(StatusCode::OK)
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
            .header("Access-Control-Allow-Headers", "Content-Type")
            .body(Full::new(Bytes::from("")))
            .expect("static response should not fail"),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .expect("static response should not fail"),
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    ctx: Arc<ControlContext>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(path = %path, error = %e, "control_body_rejected");
            return Ok(error_response(StatusCode::PAYLOAD_TOO_LARGE, "body_rejected"));
        }
    };

    Ok(route(&method, &path, &body, &ctx))
}

/// Start the HTTP control server
pub async fn start_control_server(
    port: u16,
    ctx: Arc<ControlContext>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = %port, "control_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let ctx = ctx.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let ctx = ctx.clone();
                                async move { handle_request(req, ctx).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "control_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "control_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("control_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
