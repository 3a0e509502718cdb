// Copyright 2020 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::backend::Backend;
use crate::config::ZipperConfig;
use crate::error::{FanoutError, ZipperError};
use crate::fanout;
use crate::metrics::ZipperMetrics;
use crate::reconcile::ReplicaReconciler;
use crate::tldcache::{init_tld_prefixes, TldCache, TldPrefix};
use crate::types::{FindRequest, FindResponse, InfoRequest, InfoResponse, Metric, RenderRequest};

/// Ties together configuration, the backend fleet, the TLD cache, and metrics, and drives every
/// inbound request through TLD-filter -> fan-out -> reconcile.
///
/// Per the cyclic `App <-> Metrics` structure noted for the original: `App` owns `Metrics`, and
/// `Backend` does not hold a back-reference to either, breaking the cycle.
pub struct App {
    pub config: ZipperConfig,
    pub backends: Vec<Backend>,
    pub tld_cache: TldCache,
    pub tld_prefixes: Vec<TldPrefix>,
    pub metrics: ZipperMetrics,
    reconciler: ReplicaReconciler,
}

impl App {
    pub async fn new(config: ZipperConfig) -> Result<App, String> {
        if config.backends.is_empty() {
            return Err("no backends loaded -- exiting".to_owned());
        }
        let metrics = ZipperMetrics::new(&config.monitoring);
        let tld_prefixes = init_tld_prefixes(&config.tld_prefixes);
        let reconciler = ReplicaReconciler::new(config.reconcile_policy);

        let backend_futures = config.backends.iter().cloned().map(Backend::new);
        let backends = join_all(backend_futures)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        Ok(App {
            config,
            backends,
            tld_cache: TldCache::default(),
            tld_prefixes,
            metrics,
            reconciler,
        })
    }

    /// Spawn the TLD cache's long-running probe loop; returns once `shutdown` fires.
    pub async fn run_tld_probe_loop(&self, shutdown: tokio::sync::watch::Receiver<()>) {
        let period = Duration::from_secs(self.config.tld_probe_period_secs);
        self.tld_cache
            .run(&self.tld_prefixes, &self.backends, period, &self.metrics, shutdown)
            .await;
    }

    fn filtered_backends(&self, targets: &[String]) -> Vec<&Backend> {
        self.tld_cache.filter(targets, &self.tld_prefixes, &self.backends)
    }

    pub async fn find(&self, query: &str) -> Result<FindResponse, FanoutError> {
        let request = FindRequest::new(query);
        let backends = self.filtered_backends(std::slice::from_ref(&request.query));
        match fanout::fanout_find(&backends, &request).await {
            Ok((response, warnings)) => {
                log_partial_failures("find", &warnings);
                Ok(response)
            }
            Err(err) => {
                if matches!(err.aggregate, ZipperError::AllNotFound) {
                    self.metrics.find_not_found.increment(1);
                }
                Err(err)
            }
        }
    }

    pub async fn render(&self, request: RenderRequest) -> Result<Vec<Metric>, FanoutError> {
        let backends = self.filtered_backends(&request.targets);
        let (groups, warnings) = fanout::fanout_render(&backends, &request).await?;
        log_partial_failures("render", &warnings);
        self.metrics.renders.increment(groups.len() as u64);

        let merged = groups
            .into_values()
            .map(|replicas| self.reconciler.reconcile(replicas, &self.metrics))
            .collect();
        Ok(merged)
    }

    pub async fn info(&self, target: &str) -> Result<Vec<InfoResponse>, FanoutError> {
        let request = InfoRequest {
            target: target.to_owned(),
        };
        let backends = self.filtered_backends(std::slice::from_ref(&request.target));
        let (infos, warnings) = fanout::fanout_info(&backends, &request).await?;
        log_partial_failures("info", &warnings);
        Ok(infos)
    }
}

/// Log the per-backend errors behind a partial success, per §7: a request that still returned
/// data from at least one backend is a warning, never surfaced to the caller.
fn log_partial_failures(handler: &str, errors: &[ZipperError]) {
    if !errors.is_empty() {
        tracing::warn!(handler, count = errors.len(), ?errors, "partial fan-out failure");
    }
}

/// Pick an HTTP status code for a total fan-out failure, per the precedence
/// `AllNotFound > Timeout > others` (§7).
pub fn status_for_error(err: &ZipperError) -> u16 {
    match err {
        ZipperError::AllNotFound | ZipperError::NotFound { .. } => 404,
        ZipperError::Timeout { .. } => 503,
        _ => 500,
    }
}

pub type SharedApp = Arc<App>;
