// Copyright 2020 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The client-facing Graphite-compatible HTTP surface: `/metrics/find/`, `/render/`, `/info/`,
//! and `/lb_check`.

use std::collections::HashMap;
use std::time::Instant;

use prost::Message;
use protos::carbonapi_v2::{GlobMatch as PbGlobMatch, GlobResponse, MultiFetchResponse};
use serde::Serialize;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::date::date_param_to_epoch;
use crate::error::{FanoutError, ZipperError};
use crate::metrics::ZipperMetrics;
use crate::orchestrator::{status_for_error, SharedApp};
use crate::types::{InfoResponse, Metric, RenderRequest, Trace};

mod pickle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Format {
    Protobuf,
    Json,
    Pickle,
}

impl Format {
    /// `None`/empty means "use the default"; `Some(unrecognized)` is a 400, not a silent
    /// fallback -- a client that asked for a format we don't speak should find out, not get
    /// protobuf back unannounced.
    fn parse(s: Option<&str>) -> Result<Format, String> {
        match s {
            None | Some("") => Ok(Format::Protobuf),
            Some("protobuf") => Ok(Format::Protobuf),
            Some("json") => Ok(Format::Json),
            Some("pickle") => Ok(Format::Pickle),
            Some(other) => Err(format!("unsupported format: {other}")),
        }
    }
}

/// Guards one request's lifetime: increments `RequestCancel{cause=client_closed}` if dropped
/// before `disarm()` runs (the connection closed out from under the in-flight fan-out), and
/// plays no role otherwise. Mirrors the RAII-permit pattern `Backend::acquire` uses for its
/// concurrency limiter.
struct CancelGuard<'a> {
    metrics: &'a ZipperMetrics,
    handler: &'static str,
    armed: bool,
}

impl<'a> CancelGuard<'a> {
    fn new(metrics: &'a ZipperMetrics, handler: &'static str) -> Self {
        CancelGuard {
            metrics,
            handler,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.metrics.request_cancel(self.handler, "client_closed");
        }
    }
}

/// Bound one request's fan-out by `config.global_timeout`, counting a `RequestCancel{cause=timeout}`
/// on expiry per §8 invariant 9.
async fn with_deadline<T>(
    app: &SharedApp,
    handler: &'static str,
    fut: impl std::future::Future<Output = Result<T, FanoutError>>,
) -> Result<T, FanoutError> {
    match tokio::time::timeout(app.config.global_timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            app.metrics.request_cancel(handler, "timeout");
            Err(FanoutError {
                aggregate: ZipperError::Timeout {
                    backend: String::new(),
                },
                per_backend: Vec::new(),
            })
        }
    }
}

fn bad_request(message: impl Into<String>) -> Box<dyn Reply> {
    let message = message.into();
    tracing::warn!(reason = %message, "rejecting malformed request");
    Box::new(warp::reply::with_status(message, StatusCode::BAD_REQUEST))
}

#[derive(Serialize)]
struct JsonMetric<'a> {
    name: &'a str,
    #[serde(rename = "startTime")]
    start_time: i32,
    #[serde(rename = "stopTime")]
    stop_time: i32,
    #[serde(rename = "stepTime")]
    step_time: i32,
    values: &'a [f64],
    #[serde(rename = "isAbsent")]
    is_absent: &'a [bool],
}

#[derive(Serialize)]
struct JsonGlobMatch<'a> {
    path: &'a str,
    #[serde(rename = "isLeaf")]
    is_leaf: bool,
}

/// Build the combined warp filter for the client-facing server.
pub fn routes(app: SharedApp) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let find = warp::path!("metrics" / "find")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::filters::query::raw())
        .and(with_app(app.clone()))
        .and_then(find_handler);

    let render = warp::path!("render")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::filters::query::raw())
        .and(with_app(app.clone()))
        .and_then(render_handler);

    let info = warp::path!("info")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::filters::query::raw())
        .and(with_app(app.clone()))
        .and_then(info_handler);

    let lb_check = warp::path!("lb_check")
        .and(warp::get())
        .map(|| warp::reply::with_status("OK", StatusCode::OK));

    find.or(render).or(info).or(lb_check)
}

fn with_app(app: SharedApp) -> impl Filter<Extract = (SharedApp,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || app.clone())
}

/// Parse a raw query string into a multimap, preserving repeated keys (e.g. `target=a&target=b`)
/// the way Graphite's render API expects.
fn parse_query(raw: &str) -> HashMap<String, Vec<String>> {
    let mut params: HashMap<String, Vec<String>> = HashMap::new();
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let decode = |s: &str| {
            percent_encoding::percent_decode_str(s)
                .decode_utf8_lossy()
                .into_owned()
        };
        params.entry(decode(key)).or_default().push(decode(value));
    }
    params
}

fn first<'a>(params: &'a HashMap<String, Vec<String>>, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.first()).map(String::as_str)
}

async fn find_handler(
    raw_query: String,
    app: SharedApp,
) -> Result<Box<dyn Reply>, std::convert::Infallible> {
    let start = Instant::now();
    app.metrics.requests.increment(1);
    let params = parse_query(&raw_query);
    let query = first(&params, "query").unwrap_or_default().to_owned();
    let format = match Format::parse(first(&params, "format")) {
        Ok(format) => format,
        Err(message) => return Ok(bad_request(message)),
    };
    if query.is_empty() {
        return Ok(bad_request("missing required parameter: query"));
    }

    let guard = CancelGuard::new(&app.metrics, "find");
    let result = with_deadline(&app, "find", app.find(&query)).await;
    guard.disarm();
    app.metrics.find_duration_exp(start.elapsed().as_secs_f64());

    match result {
        Ok(response) => {
            app.metrics.response("200", "find");
            Ok(serialize_find(&response.matches, format))
        }
        Err(err) => {
            let status = status_for_error(&err.aggregate);
            tracing::warn!(error = %err, "find failed on all backends");
            app.metrics.response(&status.to_string(), "find");
            Ok(reply_with_status(status))
        }
    }
}

async fn render_handler(
    raw_query: String,
    app: SharedApp,
) -> Result<Box<dyn Reply>, std::convert::Infallible> {
    let start = Instant::now();
    app.metrics.requests.increment(1);
    let params = parse_query(&raw_query);
    let targets: Vec<String> = params
        .get("target")
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter(|t| !t.is_empty())
        .collect();
    let format = match Format::parse(first(&params, "format")) {
        Ok(format) => format,
        Err(message) => return Ok(bad_request(message)),
    };
    if targets.is_empty() {
        return Ok(bad_request("missing required parameter: target"));
    }
    let tz = first(&params, "tz");

    let now = chrono::Utc::now();
    let default_tz: chrono_tz::Tz = app.config.default_timezone.parse().unwrap_or(chrono_tz::Tz::UTC);
    let from = date_param_to_epoch(first(&params, "from").unwrap_or(""), tz, 0, default_tz, now);
    let until = date_param_to_epoch(
        first(&params, "until").unwrap_or(""),
        tz,
        now.timestamp(),
        default_tz,
        now,
    );

    let request = RenderRequest {
        targets,
        from,
        until,
        trace: Trace::new(),
    };

    let guard = CancelGuard::new(&app.metrics, "render");
    let result = with_deadline(&app, "render", app.render(request)).await;
    guard.disarm();
    app.metrics.render_duration_exp(start.elapsed().as_secs_f64());

    match result {
        Ok(metrics) => {
            app.metrics.response("200", "render");
            Ok(serialize_render(&metrics, format))
        }
        Err(err) => {
            let status = status_for_error(&err.aggregate);
            tracing::warn!(error = %err, "render failed on all backends");
            app.metrics.response(&status.to_string(), "render");
            Ok(reply_with_status(status))
        }
    }
}

async fn info_handler(
    raw_query: String,
    app: SharedApp,
) -> Result<Box<dyn Reply>, std::convert::Infallible> {
    app.metrics.requests.increment(1);
    let params = parse_query(&raw_query);
    let target = first(&params, "target").unwrap_or_default().to_owned();
    let format = match Format::parse(first(&params, "format")) {
        Ok(format) => format,
        Err(message) => return Ok(bad_request(message)),
    };
    if target.is_empty() {
        return Ok(bad_request("missing required parameter: target"));
    }

    let guard = CancelGuard::new(&app.metrics, "info");
    let result = with_deadline(&app, "info", app.info(&target)).await;
    guard.disarm();

    match result {
        Ok(infos) => {
            app.metrics.response("200", "info");
            Ok(serialize_info(&infos, format))
        }
        Err(err) => {
            let status = status_for_error(&err.aggregate);
            tracing::warn!(error = %err, "info failed on all backends");
            app.metrics.response(&status.to_string(), "info");
            Ok(reply_with_status(status))
        }
    }
}

fn reply_with_status(status: u16) -> Box<dyn Reply> {
    let code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Box::new(warp::reply::with_status(warp::reply(), code))
}

fn serialize_find(matches: &[crate::types::GlobMatch], format: Format) -> Box<dyn Reply> {
    match format {
        Format::Protobuf => {
            let pb = GlobResponse {
                name: String::new(),
                matches: matches
                    .iter()
                    .map(|m| PbGlobMatch {
                        path: m.path.clone(),
                        is_leaf: m.is_leaf,
                    })
                    .collect(),
            };
            Box::new(warp::reply::with_header(
                pb.encode_to_vec(),
                "content-type",
                "application/x-protobuf",
            ))
        }
        Format::Json => {
            let json: Vec<JsonGlobMatch> = matches
                .iter()
                .map(|m| JsonGlobMatch {
                    path: &m.path,
                    is_leaf: m.is_leaf,
                })
                .collect();
            Box::new(warp::reply::json(&json))
        }
        Format::Pickle => {
            let items: Vec<pickle::Value> = matches
                .iter()
                .map(|m| {
                    pickle::Value::dict(vec![
                        ("path", pickle::Value::String(m.path.clone())),
                        ("isLeaf", pickle::Value::Bool(m.is_leaf)),
                    ])
                })
                .collect();
            Box::new(warp::reply::with_header(
                pickle::encode(&pickle::Value::List(items)),
                "content-type",
                "application/pickle",
            ))
        }
    }
}

fn serialize_render(metrics: &[Metric], format: Format) -> Box<dyn Reply> {
    match format {
        Format::Protobuf => {
            let pb = MultiFetchResponse {
                metrics: metrics
                    .iter()
                    .map(|m| protos::carbonapi_v2::FetchResponse {
                        name: m.name.clone(),
                        start_time: m.start_time,
                        stop_time: m.stop_time,
                        step_time: m.step_time,
                        values: m.values.clone(),
                        is_absent: m.is_absent.clone(),
                    })
                    .collect(),
            };
            Box::new(warp::reply::with_header(
                pb.encode_to_vec(),
                "content-type",
                "application/x-protobuf",
            ))
        }
        Format::Json => {
            let json: Vec<JsonMetric> = metrics
                .iter()
                .map(|m| JsonMetric {
                    name: &m.name,
                    start_time: m.start_time,
                    stop_time: m.stop_time,
                    step_time: m.step_time,
                    values: &m.values,
                    is_absent: &m.is_absent,
                })
                .collect();
            Box::new(warp::reply::json(&json))
        }
        Format::Pickle => {
            let items: Vec<pickle::Value> = metrics
                .iter()
                .map(|m| {
                    pickle::Value::dict(vec![
                        ("name", pickle::Value::String(m.name.clone())),
                        ("start", pickle::Value::Int(m.start_time as i64)),
                        ("end", pickle::Value::Int(m.stop_time as i64)),
                        ("step", pickle::Value::Int(m.step_time as i64)),
                        (
                            "values",
                            pickle::Value::List(
                                m.values
                                    .iter()
                                    .zip(m.is_absent.iter())
                                    .map(|(v, absent)| {
                                        if *absent {
                                            pickle::Value::None
                                        } else {
                                            pickle::Value::Float(*v)
                                        }
                                    })
                                    .collect(),
                            ),
                        ),
                    ])
                })
                .collect();
            Box::new(warp::reply::with_header(
                pickle::encode(&pickle::Value::List(items)),
                "content-type",
                "application/pickle",
            ))
        }
    }
}

fn serialize_info(infos: &[InfoResponse], format: Format) -> Box<dyn Reply> {
    match format {
        Format::Protobuf => {
            // Graphite's info wire format publishes a single InfoResponse per target; with
            // multiple replicas we publish the first, as per the Normal reconciliation default.
            let pb = infos.first().map(|i| protos::carbonapi_v2::InfoResponse {
                name: i.name.clone(),
                aggregation_method: i.aggregation_method.clone(),
                max_retention: i.max_retention,
                x_files_factor: i.x_files_factor,
                retentions: i
                    .retentions
                    .iter()
                    .map(|r| protos::carbonapi_v2::Retention {
                        seconds_per_point: r.seconds_per_point,
                        points: r.points,
                    })
                    .collect(),
            });
            let bytes = pb.map(|p| p.encode_to_vec()).unwrap_or_default();
            Box::new(warp::reply::with_header(bytes, "content-type", "application/x-protobuf"))
        }
        Format::Json | Format::Pickle => Box::new(warp::reply::json(&infos_as_json(infos))),
    }
}

#[derive(Serialize)]
struct JsonInfo<'a> {
    name: &'a str,
    #[serde(rename = "aggregationMethod")]
    aggregation_method: &'a str,
    #[serde(rename = "maxRetention")]
    max_retention: i32,
    #[serde(rename = "xFilesFactor")]
    x_files_factor: f32,
}

fn infos_as_json(infos: &[InfoResponse]) -> Vec<JsonInfo> {
    infos
        .iter()
        .map(|i| JsonInfo {
            name: &i.name,
            aggregation_method: &i.aggregation_method,
            max_retention: i.max_retention,
            x_files_factor: i.x_files_factor,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parse_defaults_to_protobuf() {
        assert_eq!(Format::parse(None).unwrap(), Format::Protobuf);
        assert_eq!(Format::parse(Some("")).unwrap(), Format::Protobuf);
    }

    #[test]
    fn format_parse_accepts_known_formats() {
        assert_eq!(Format::parse(Some("json")).unwrap(), Format::Json);
        assert_eq!(Format::parse(Some("pickle")).unwrap(), Format::Pickle);
        assert_eq!(Format::parse(Some("protobuf")).unwrap(), Format::Protobuf);
    }

    #[test]
    fn format_parse_rejects_unknown_format() {
        assert!(Format::parse(Some("xml")).is_err());
    }

    #[test]
    fn parse_query_preserves_repeated_keys() {
        let params = parse_query("target=a&target=b&format=json");
        assert_eq!(params.get("target").unwrap(), &vec!["a".to_owned(), "b".to_owned()]);
        assert_eq!(first(&params, "format"), Some("json"));
    }
}
