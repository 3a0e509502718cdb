// Copyright 2020 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A periodically refreshed `tld -> backends` index used to prune the fan-out set before a
//! request reaches the Fan-out Engine.
//!
//! The whole mapping is rebuilt each probe cycle and republished with a single atomic pointer
//! swap (`arc_swap::ArcSwap`, the same primitive the proxy server previously used to swap its
//! auth-token mapping), so readers never observe a partially built map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::backend::Backend;
use crate::metrics::ZipperMetrics;
use crate::types::FindRequest;

#[derive(Clone, Debug)]
pub struct TldPrefix {
    prefix: String,
    segments: Vec<String>,
    segment_count: usize,
}

type TldMapping = HashMap<String, Vec<usize>>;

/// `InitTLDPrefixes`: validate configured prefixes (discarding any with an empty segment),
/// always include the empty prefix so default TLDs are covered, sort ascending by segment
/// count, and deduplicate. Processing order is load-bearing: see `run_probe_cycle`.
pub fn init_tld_prefixes(configured: &[String]) -> Vec<TldPrefix> {
    let mut prefixes = vec![TldPrefix {
        prefix: String::new(),
        segments: Vec::new(),
        segment_count: 0,
    }];

    for p in configured {
        let segments: Vec<String> = p.split('.').map(str::to_owned).collect();
        if segments.iter().any(String::is_empty) {
            tracing::warn!(prefix = %p, "tld prefix invalid");
            continue;
        }
        prefixes.push(TldPrefix {
            prefix: p.clone(),
            segment_count: segments.len(),
            segments,
        });
    }

    prefixes.sort_by_key(|p| p.segment_count);
    prefixes.dedup_by(|a, b| a.prefix == b.prefix);
    prefixes
}

impl TldPrefix {
    fn query(&self) -> String {
        if self.prefix.is_empty() {
            "*".to_owned()
        } else {
            format!("{}.*", self.prefix)
        }
    }
}

pub struct TldCache {
    mapping: ArcSwap<TldMapping>,
}

impl Default for TldCache {
    fn default() -> Self {
        TldCache {
            mapping: ArcSwap::from(Arc::new(HashMap::new())),
        }
    }
}

impl TldCache {
    /// Run the probe loop until `shutdown` fires, per the open question about the original's
    /// leaked ticker: this loop stops cleanly instead of running forever unobserved.
    pub async fn run(
        &self,
        prefixes: &[TldPrefix],
        backends: &[Backend],
        probe_period: Duration,
        metrics: &ZipperMetrics,
        mut shutdown: tokio::sync::watch::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(probe_period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_probe_cycle(prefixes, backends, metrics).await;
                }
                _ = shutdown.changed() => {
                    tracing::info!("tld cache probe loop shutting down");
                    return;
                }
            }
        }
    }

    async fn run_probe_cycle(&self, prefixes: &[TldPrefix], backends: &[Backend], metrics: &ZipperMetrics) {
        let mut new_mapping: TldMapping = HashMap::new();

        for prefix in prefixes {
            let candidate_backends = backends_for_prefix(prefix, backends, &new_mapping);
            for &backend_index in &candidate_backends {
                metrics.tldcache_probe_req_total.increment(1);
                match probe_backend(&backends[backend_index], prefix).await {
                    Ok(paths) => {
                        for path in paths {
                            new_mapping.entry(path).or_default().push(backend_index);
                        }
                    }
                    Err(_) => {
                        // The probe loop deliberately does not log per-backend errors: at full
                        // fleet size that would be pure noise. Only the counter matters.
                        metrics.tldcache_probe_errors.increment(1);
                    }
                }
            }
        }

        for (tld, backend_indices) in &new_mapping {
            metrics.tldcache_hosts_per_domain(tld, backend_indices.len());
        }

        self.mapping.store(Arc::new(new_mapping));
    }

    /// Given request target names, compute their effective TLDs and union the cached backend
    /// sets. Fail open to every backend if the union is empty or the cache is unpopulated.
    pub fn filter<'b>(&self, targets: &[String], prefixes: &[TldPrefix], backends: &'b [Backend]) -> Vec<&'b Backend> {
        let mapping = self.mapping.load();
        if mapping.is_empty() {
            return backends.iter().collect();
        }

        let mut seen = std::collections::HashSet::new();
        let mut selected = Vec::new();
        for target in targets {
            let tld = target_top_level_domain(target, prefixes);
            if let Some(indices) = mapping.get(&tld) {
                for &index in indices {
                    if seen.insert(index) {
                        selected.push(&backends[index]);
                    }
                }
            }
        }

        if selected.is_empty() {
            backends.iter().collect()
        } else {
            selected
        }
    }
}

/// `getBackendsForPrefix`: reuse the backends already discovered for the longest populated
/// ancestor prefix in the *in-progress* mapping -- not the last-published one -- falling back
/// to every backend. This only produces the intended pruning because `prefixes` is processed
/// in ascending segment-count order (an ancestor is always handled before its descendants).
fn backends_for_prefix(prefix: &TldPrefix, backends: &[Backend], new_mapping: &TldMapping) -> Vec<usize> {
    for i in (1..=prefix.segment_count).rev() {
        let ancestor = prefix.segments[..i].join(".");
        if let Some(indices) = new_mapping.get(&ancestor) {
            return indices.clone();
        }
    }
    (0..backends.len()).collect()
}

async fn probe_backend(backend: &Backend, prefix: &TldPrefix) -> Result<Vec<String>, crate::error::ZipperError> {
    let request = FindRequest::new(prefix.query());
    let response = tokio::time::timeout(Duration::from_secs(5), backend.find(&request))
        .await
        .map_err(|_| crate::error::ZipperError::Timeout {
            backend: backend.address.clone(),
        })??;
    Ok(response.matches.into_iter().map(|m| m.path).collect())
}

/// `getTargetTopLevelDomain`: find the longest configured prefix that `target` starts with
/// (prefixes are pre-sorted ascending, so scan from the end for "longest first"), and return
/// its leading `segment_count + 1` dotted segments. Falls back to the bare first segment.
fn target_top_level_domain(target: &str, prefixes: &[TldPrefix]) -> String {
    for prefix in prefixes.iter().rev() {
        if target.starts_with(&prefix.prefix) {
            let wanted = prefix.segment_count + 1;
            let joined: Vec<&str> = target.splitn(wanted + 1, '.').take(wanted).collect();
            return joined.join(".");
        }
    }
    target.split('.').next().unwrap_or(target).to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_prefixes_sorts_ascending_and_dedupes() {
        let prefixes = init_tld_prefixes(&["a.b".to_owned(), "a".to_owned(), "a".to_owned()]);
        let counts: Vec<usize> = prefixes.iter().map(|p| p.segment_count).collect();
        assert_eq!(counts, vec![0, 1, 2]);
    }

    #[test]
    fn init_prefixes_discards_invalid() {
        let prefixes = init_tld_prefixes(&["a..b".to_owned(), "ok".to_owned()]);
        assert_eq!(prefixes.iter().filter(|p| p.prefix == "a..b").count(), 0);
        assert_eq!(prefixes.iter().filter(|p| p.prefix == "ok").count(), 1);
    }

    #[test]
    fn target_tld_matches_longest_prefix() {
        let prefixes = init_tld_prefixes(&["a".to_owned(), "a.b".to_owned()]);
        assert_eq!(target_top_level_domain("a.b.c", &prefixes), "a.b.c");
        assert_eq!(target_top_level_domain("a.x.y", &prefixes), "a.x");
        assert_eq!(target_top_level_domain("z.y", &prefixes), "z");
    }

    #[test]
    fn backends_for_prefix_reuses_ancestor_in_progress_mapping() {
        let prefixes = init_tld_prefixes(&["a".to_owned(), "a.b".to_owned()]);
        let ab_prefix = prefixes.iter().find(|p| p.prefix == "a.b").unwrap();

        let mut new_mapping: TldMapping = HashMap::new();
        new_mapping.insert("a".to_owned(), vec![2]);

        // No backends slice is actually dereferenced by this helper other than for its length
        // in the fallback path, so an empty slice is fine here.
        let result = backends_for_prefix(ab_prefix, &[], &new_mapping);
        assert_eq!(result, vec![2]);
    }
}
