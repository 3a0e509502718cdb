// Copyright 2020 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Parallel dispatch of one logical request across a set of `Backend`s, and the per-request-type
//! merge rules that turn `N` replies into one.

use std::collections::BTreeMap;

use futures::stream::FuturesUnordered;
use futures::StreamExt;

use crate::backend::Backend;
use crate::error::{FanoutError, ZipperError};
use crate::types::{FindRequest, FindResponse, GlobMatch, InfoRequest, InfoResponse, Metric, RenderRequest};

/// One (result | error) tuple per backend, in the order replies arrived -- NOT backend order.
/// §4.3 "first replica" is defined by this arrival order.
enum Outcome<T> {
    Ok(T),
    Err(ZipperError),
}

/// Dispatch one call per backend in parallel and collect outcomes in genuine completion order.
///
/// A `FuturesUnordered` is the single-task equivalent of "a response channel sized N plus a
/// worker per backend": polling it yields each backend's result as soon as it's ready rather
/// than in backend order. That completion order is what the replica reconciler's "first
/// replica" rule (§4.3) is defined in terms of.
async fn dispatch<T, F, Fut>(backends: &[&Backend], call: F) -> Vec<Outcome<T>>
where
    F: Fn(&Backend) -> Fut,
    Fut: std::future::Future<Output = Result<T, ZipperError>>,
{
    let mut in_flight: FuturesUnordered<_> = backends
        .iter()
        .map(|backend| call(backend))
        .collect();

    let mut outcomes = Vec::with_capacity(backends.len());
    while let Some(result) = in_flight.next().await {
        outcomes.push(match result {
            Ok(value) => Outcome::Ok(value),
            Err(err) => Outcome::Err(err),
        });
    }
    outcomes
}

/// Partition a batch of per-backend outcomes into successes and errors, and decide whether the
/// fan-out as a whole succeeded, per §4.2 rule 4-5: a `NotFound` does not count as a failure for
/// the "at least one succeeded" rule unless every backend reported it.
///
/// On partial success the per-backend errors that did occur are returned alongside the merged
/// values rather than discarded -- the caller logs them as a warning per §7.
fn partition<T>(outcomes: Vec<Outcome<T>>) -> Result<(Vec<T>, Vec<ZipperError>), FanoutError> {
    let total = outcomes.len();
    let mut oks = Vec::new();
    let mut errs = Vec::new();
    let mut not_found_count = 0;
    for outcome in outcomes {
        match outcome {
            Outcome::Ok(value) => oks.push(value),
            Outcome::Err(err) => {
                if matches!(err, ZipperError::NotFound { .. }) {
                    not_found_count += 1;
                }
                errs.push(err);
            }
        }
    }
    if !oks.is_empty() {
        return Ok((oks, errs));
    }
    if total > 0 && not_found_count == total {
        return Err(FanoutError {
            aggregate: ZipperError::AllNotFound,
            per_backend: errs,
        });
    }
    let aggregate = ZipperError::most_specific(&errs)
        .cloned()
        .unwrap_or(ZipperError::AllNotFound);
    Err(FanoutError {
        aggregate,
        per_backend: errs,
    })
}

/// Fan a Find request out to every backend and merge the union of matches, deduplicated by
/// path with ties on `is_leaf` resolving to `true`, ordered deterministically by path.
pub async fn fanout_find(
    backends: &[&Backend],
    request: &FindRequest,
) -> Result<(FindResponse, Vec<ZipperError>), FanoutError> {
    let outcomes = dispatch(backends, |b| b.find(request)).await;
    let (responses, warnings) = partition(outcomes)?;

    let mut by_path: BTreeMap<String, bool> = BTreeMap::new();
    for response in responses {
        for m in response.matches {
            by_path
                .entry(m.path)
                .and_modify(|is_leaf| *is_leaf = *is_leaf || m.is_leaf)
                .or_insert(m.is_leaf);
        }
    }
    Ok((
        FindResponse {
            matches: by_path
                .into_iter()
                .map(|(path, is_leaf)| GlobMatch { path, is_leaf })
                .collect(),
        },
        warnings,
    ))
}

/// Fan an Info request out and merge one entry per distinct backend address.
pub async fn fanout_info(
    backends: &[&Backend],
    request: &InfoRequest,
) -> Result<(Vec<InfoResponse>, Vec<ZipperError>), FanoutError> {
    let outcomes = dispatch(backends, |b| b.info(request)).await;
    let (responses, warnings) = partition(outcomes)?;
    Ok((responses.into_iter().flatten().collect(), warnings))
}

/// Fan a Render request out, grouping replies by target name into one `Vec<Metric>` per target
/// -- the replica groups the reconciler then collapses into a single canonical series each.
pub async fn fanout_render(
    backends: &[&Backend],
    request: &RenderRequest,
) -> Result<(BTreeMap<String, Vec<Metric>>, Vec<ZipperError>), FanoutError> {
    let outcomes = dispatch(backends, |b| b.render(request)).await;
    let (responses, warnings) = partition(outcomes)?;

    let mut groups: BTreeMap<String, Vec<Metric>> = BTreeMap::new();
    for metrics in responses {
        for metric in metrics {
            groups.entry(metric.name.clone()).or_default().push(metric);
        }
    }
    Ok((groups, warnings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_at_least_one_success_wins() {
        let outcomes = vec![
            Outcome::Ok(1),
            Outcome::Err(ZipperError::Transport {
                backend: "b2".to_owned(),
                message: "boom".to_owned(),
            }),
        ];
        let (oks, warnings) = partition(outcomes).unwrap();
        assert_eq!(oks, vec![1]);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn partition_all_not_found_is_aggregate() {
        let outcomes: Vec<Outcome<()>> = vec![
            Outcome::Err(ZipperError::NotFound {
                backend: "b1".to_owned(),
            }),
            Outcome::Err(ZipperError::NotFound {
                backend: "b2".to_owned(),
            }),
        ];
        let err = partition(outcomes).unwrap_err();
        assert!(matches!(err.aggregate, ZipperError::AllNotFound));
        assert_eq!(err.per_backend.len(), 2);
    }

    #[test]
    fn partition_mixed_not_found_and_transport_prefers_timeout_over_other() {
        let outcomes: Vec<Outcome<()>> = vec![
            Outcome::Err(ZipperError::NotFound {
                backend: "b1".to_owned(),
            }),
            Outcome::Err(ZipperError::Timeout {
                backend: "b2".to_owned(),
            }),
        ];
        let err = partition(outcomes).unwrap_err();
        assert!(matches!(err.aggregate, ZipperError::Timeout { .. }));
    }

    #[test]
    fn find_merge_dedups_by_path_and_leaf_wins() {
        let mut by_path: BTreeMap<String, bool> = BTreeMap::new();
        for (path, is_leaf) in [("a", false), ("a", true), ("b", false)] {
            by_path
                .entry(path.to_owned())
                .and_modify(|v| *v = *v || is_leaf)
                .or_insert(is_leaf);
        }
        assert_eq!(by_path["a"], true);
        assert_eq!(by_path["b"], false);
    }
}
