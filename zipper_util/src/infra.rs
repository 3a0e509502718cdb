// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::net::SocketAddr;
use std::time::Instant;

use futures::FutureExt;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use tokio::runtime::Builder;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use warp::Filter;

/// Default Prometheus histogram buckets.
///
/// These have been chosen to hopefully be better for latencies internal to a data center, as
/// opposed to the defaults used by the [Prometheus Go client], which are tuned for Web API calls
/// made over the public Internet.
/// [Prometheus Go client]: https://github.com/prometheus/client_golang/blob/9ef86855d4e52661184748b7a6fd9ed39985b479/prometheus/histogram.go#L63
const DEFAULT_PROMETHEUS_BUCKETS: &[f64] = &[
    0.0005, // 0.5 ms
    0.001,  // 1 ms
    0.002,  // 2 ms
    0.003,  // 3 ms
    0.004,  // 4 ms
    0.005,  // 5 ms
    0.010,  // 10 ms
    0.020,  // 20 ms
    0.030,  // 30 ms
    0.040,  // 40 ms
    0.050,  // 50 ms
    0.100,  // 100 ms
    0.250,  // 250 ms
    0.5,    // 500 ms
    1.0,    // 1 sec
    2.5,    // 2.5 secs
    5.0,    // 5 secs
    10.0,   // 10 secs
    30.0,   // 30 secs
];

/// Admin endpoints configuration: the internal HTTP surface carrying `/metrics` and
/// `/debug/vars`, separate from the client-facing Graphite API.
#[derive(Clone, Debug, Deserialize)]
pub struct InfraConfig {
    /// Bind address for the internal admin server.
    #[serde(default = "default_listen_internal")]
    pub listen_internal: String,

    /// Sentry DSN.
    pub sentry_dsn: Option<String>,

    /// Tracing configuration.
    pub tracing: Option<TracingConfig>,
}

impl Default for InfraConfig {
    fn default() -> Self {
        InfraConfig {
            listen_internal: default_listen_internal(),
            sentry_dsn: None,
            tracing: None,
        }
    }
}

/// Tracing configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct TracingConfig {
    /// OpenTelemetry agent endpoint, e.g. `http://otel_collector:4317`.
    pub otel_agent: String,

    /// Sampling probability used by the OpenTelemetry subscriber.
    ///
    /// Expects a number from 0.0 to 1.0, where higher numbers mean more events will be sent.
    pub sampling_probability: f64,
}

fn default_listen_internal() -> String {
    "0.0.0.0:8010".to_owned()
}

#[derive(Serialize)]
struct DebugVars {
    uptime_seconds: f64,
    build_version: &'static str,
}

/// Setup metrics collection and scraping endpoint.
fn setup_metrics_handler() -> Result<PrometheusHandle, String> {
    let recorder = PrometheusBuilder::new()
        .set_buckets(DEFAULT_PROMETHEUS_BUCKETS)
        .map_err(|err| format!("Failed to set histogram buckets: {err}"))?
        .build_recorder();
    let handle = recorder.handle();
    metrics::set_boxed_recorder(Box::new(recorder))
        .map_err(|err| format!("Failed to install Prometheus metrics recorder: {err}"))?;
    Ok(handle)
}

/// Setup infra endpoints for use by devops systems: `/metrics` and `/debug/vars` on
/// `listen_internal`.
///
/// Returns a `sync::watch` receiver that should be used by all servers (including the TLD cache
/// probe loop) as a shutdown signal by looking for `RecvError` when calling `.changed()`.
pub fn setup_infra_endpoints(
    config: InfraConfig,
    build_version: &'static str,
) -> Result<watch::Receiver<()>, String> {
    let metrics_handle = setup_metrics_handler()?;
    let start_time = Instant::now();

    let listen_internal: SocketAddr = config
        .listen_internal
        .parse()
        .map_err(|err| format!("Failed to parse internal listen address: {err}"))?;

    let (shutdown_sender, shutdown_receiver) = watch::channel(());

    // Spawn a thread for all admin tasks to isolate them from the main event loop.
    std::thread::spawn(move || {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .thread_name("admin")
            .build()
            .expect("initialize admin event loop");

        runtime.block_on(async move {
            let mut sigint_stream = signal(SignalKind::interrupt())
                .map_err(|err| format!("Failed to create SIGINT handler: {err}"))
                .expect("attach SIGINT handler");
            let mut sigterm_stream = signal(SignalKind::terminate())
                .map_err(|err| format!("Failed to create SIGTERM handler: {err}"))
                .expect("attach SIGTERM handler");
            tokio::spawn(async move {
                futures::future::select(
                    sigint_stream.recv().boxed(),
                    sigterm_stream.recv().boxed(),
                )
                .await;
                log::info!("Received shutdown signal. Starting graceful shutdown ...");
                // This causes every receiver to observe `RecvError` on their next `.changed()`.
                drop(shutdown_sender);
            });

            let metrics = warp::path!("metrics").and(warp::get()).map(move || {
                metrics_handle.render()
            });

            let debug_vars = warp::path!("debug" / "vars").and(warp::get()).map(move || {
                warp::reply::json(&DebugVars {
                    uptime_seconds: start_time.elapsed().as_secs_f64(),
                    build_version,
                })
            });

            warp::serve(metrics.or(debug_vars))
                .bind(listen_internal)
                .await
        });
    });

    Ok(shutdown_receiver)
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use tokio::time::{sleep, Duration};

    use super::{setup_infra_endpoints, InfraConfig};

    #[tokio::test]
    async fn infra_endpoints_respond() {
        let config = InfraConfig {
            listen_internal: "127.0.0.1:18010".to_owned(),
            ..InfraConfig::default()
        };
        setup_infra_endpoints(config, "test").unwrap();

        // `warp` does not give us a way to wait until it has finished binding.
        sleep(Duration::from_millis(500)).await;

        metrics::increment_counter!("test_counter");
        let response = reqwest::get("http://127.0.0.1:18010/metrics")
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.text().await.unwrap().contains("test_counter"));

        let response = reqwest::get("http://127.0.0.1:18010/debug/vars")
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.text().await.unwrap().contains("uptime_seconds"));
    }
}
