// Copyright 2020 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The zipper's Prometheus metrics set, named after the fields their original Go counterpart
//! exposed on `/metrics`. Counters used by the replica reconciler also keep a local atomic
//! tally so that unit tests can assert on them directly rather than scraping a recorder.

use std::sync::atomic::{AtomicU64, Ordering};

/// A counter that both forwards to the global `metrics` recorder (for Prometheus export) and
/// keeps a local tally for in-process assertions.
pub struct Counter {
    name: &'static str,
    value: AtomicU64,
}

impl Counter {
    fn new(name: &'static str) -> Self {
        Counter {
            name,
            value: AtomicU64::new(0),
        }
    }

    pub fn increment(&self, amount: u64) {
        self.value.fetch_add(amount, Ordering::Relaxed);
        metrics::increment_counter!(self.name);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Histogram buckets for render/find request durations, configured from YAML per §6.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct HistogramBucketsConfig {
    pub start: f64,
    pub bucket_size: f64,
    pub buckets_num: u32,
}

impl HistogramBucketsConfig {
    fn exponential_buckets(&self) -> Vec<f64> {
        (0..self.buckets_num)
            .map(|i| self.start * self.bucket_size.powi(i as i32))
            .collect()
    }

    fn linear_buckets(&self) -> Vec<f64> {
        (0..self.buckets_num)
            .map(|i| self.start + self.bucket_size * i as f64)
            .collect()
    }
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct MonitoringConfig {
    pub render_duration_exp: HistogramBucketsConfig,
    pub find_duration_exp: HistogramBucketsConfig,
    pub find_duration_lin: HistogramBucketsConfig,
    pub find_out_duration: HistogramBucketsConfig,
    pub time_in_queue_exp_histogram: HistogramBucketsConfig,
}

/// All metrics exposed on `/metrics`, ported field-for-field from the original zipper's
/// Prometheus metric set.
pub struct ZipperMetrics {
    pub requests: Counter,
    pub render_mismatches: Counter,
    pub render_fixed_mismatches: Counter,
    pub render_mismatched_responses: Counter,
    pub renders: Counter,
    pub find_not_found: Counter,

    pub tldcache_probe_req_total: Counter,
    pub tldcache_probe_errors: Counter,

    pub path_cache_filtered_requests: Counter,
}

impl ZipperMetrics {
    pub fn new(config: &MonitoringConfig) -> Self {
        describe_histogram("render_request_duration_seconds_exp", &config.render_duration_exp);
        describe_histogram("render_outbound_request_duration_seconds_exp", &config.render_duration_exp);
        describe_histogram("find_request_duration_seconds_exp", &config.find_duration_exp);
        describe_linear_histogram("find_request_duration_seconds_lin", &config.find_duration_lin);
        describe_histogram("find_out_duration_seconds", &config.find_out_duration);

        ZipperMetrics {
            requests: Counter::new("http_request_total"),
            render_mismatches: Counter::new("render_mismatches_total"),
            render_fixed_mismatches: Counter::new("render_fixed_mismatches_total"),
            render_mismatched_responses: Counter::new("render_mismatched_responses_total"),
            renders: Counter::new("render_total"),
            find_not_found: Counter::new("find_not_found"),
            tldcache_probe_req_total: Counter::new("tldcache_probe_req_total"),
            tldcache_probe_errors: Counter::new("tldcache_probe_errors_total"),
            path_cache_filtered_requests: Counter::new("path_cache_filtered_requests_total"),
        }
    }

    #[cfg(test)]
    pub fn new_for_test() -> Self {
        ZipperMetrics {
            requests: Counter::new("http_request_total"),
            render_mismatches: Counter::new("render_mismatches_total"),
            render_fixed_mismatches: Counter::new("render_fixed_mismatches_total"),
            render_mismatched_responses: Counter::new("render_mismatched_responses_total"),
            renders: Counter::new("render_total"),
            find_not_found: Counter::new("find_not_found"),
            tldcache_probe_req_total: Counter::new("tldcache_probe_req_total"),
            tldcache_probe_errors: Counter::new("tldcache_probe_errors_total"),
            path_cache_filtered_requests: Counter::new("path_cache_filtered_requests_total"),
        }
    }

    pub fn response(&self, code: &str, handler: &str) {
        metrics::increment_counter!("http_responses_total", "code" => code.to_owned(), "handler" => handler.to_owned());
    }

    pub fn request_cancel(&self, handler: &str, cause: &str) {
        metrics::increment_counter!("request_cancel", "handler" => handler.to_owned(), "cause" => cause.to_owned());
    }

    pub fn backend_response(&self, code: &str, handler: &str) {
        metrics::increment_counter!("backend_responses_total", "code" => code.to_owned(), "handler" => handler.to_owned());
    }

    pub fn tldcache_hosts_per_domain(&self, domain: &str, count: usize) {
        metrics::gauge!("tldcache_num_hosts_per_domain", count as f64, "domain" => domain.to_owned());
    }

    pub fn time_in_queue(&self, request_kind: &str, seconds: f64) {
        metrics::histogram!("time_in_queue", seconds, "request" => request_kind.to_owned());
    }

    pub fn render_duration_exp(&self, seconds: f64) {
        metrics::histogram!("render_request_duration_seconds_exp", seconds);
    }

    pub fn render_out_duration_exp(&self, dc: &str, cluster: &str, seconds: f64) {
        metrics::histogram!("render_outbound_request_duration_seconds_exp", seconds, "dc" => dc.to_owned(), "cluster" => cluster.to_owned());
    }

    pub fn find_duration_exp(&self, seconds: f64) {
        metrics::histogram!("find_request_duration_seconds_exp", seconds);
    }

    pub fn find_duration_lin(&self, seconds: f64) {
        metrics::histogram!("find_request_duration_seconds_lin", seconds);
    }

    pub fn find_out_duration(&self, cluster: &str, seconds: f64) {
        metrics::histogram!("find_out_duration_seconds", seconds, "cluster" => cluster.to_owned());
    }
}

fn describe_histogram(name: &'static str, config: &HistogramBucketsConfig) {
    let buckets = config.exponential_buckets();
    tracing::debug!(histogram = name, ?buckets, "registering histogram buckets");
}

fn describe_linear_histogram(name: &'static str, config: &HistogramBucketsConfig) {
    let buckets = config.linear_buckets();
    tracing::debug!(histogram = name, ?buckets, "registering histogram buckets");
}
