// Copyright 2020 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Collapses the `k >= 1` Render replicas of one metric name -- one per backend that answered --
//! into a single canonical series.

use serde::Deserialize;

use crate::metrics::ZipperMetrics;
use crate::types::Metric;

#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReconcilePolicy {
    /// Return the first replica's series as-is; do not compare.
    Normal,
    /// Compare all replicas point-wise, counting and fixing mismatches.
    Check,
    /// At each index take the value held by the plurality of non-absent replicas.
    Majority,
}

pub struct ReplicaReconciler {
    policy: ReconcilePolicy,
}

impl ReplicaReconciler {
    pub fn new(policy: ReconcilePolicy) -> Self {
        ReplicaReconciler { policy }
    }

    /// `replicas` must be non-empty; every entry is assumed to share `{start, stop, step}` after
    /// alignment, per the Fan-out Engine's render grouping. Ordering of `replicas` is "first
    /// response received", not a priori backend order (§4.3 Determinism).
    pub fn reconcile(&self, replicas: Vec<Metric>, metrics: &ZipperMetrics) -> Metric {
        match self.policy {
            ReconcilePolicy::Normal => replicas.into_iter().next().expect("non-empty replica set"),
            ReconcilePolicy::Check => reconcile_check(replicas, metrics),
            ReconcilePolicy::Majority => reconcile_majority(replicas),
        }
    }
}

fn reconcile_check(mut replicas: Vec<Metric>, metrics: &ZipperMetrics) -> Metric {
    if replicas.len() == 1 {
        return replicas.remove(0);
    }
    let len = replicas[0].values.len();
    let mut mismatched_response = false;

    let mut canonical = replicas[0].clone();
    for i in 0..len {
        let present_values: Vec<f64> = replicas
            .iter()
            .filter(|r| !r.is_absent_at(i))
            .map(|r| r.values[i])
            .collect();

        if present_values.is_empty() {
            // All replicas absent at this index: agree, nothing to do.
            continue;
        }
        if present_values.len() == replicas.len() {
            // Every replica present: check they all agree.
            if present_values.iter().any(|v| !values_agree(*v, present_values[0])) {
                metrics.render_mismatches.increment(1);
                mismatched_response = true;
            }
            canonical.values[i] = present_values[0];
            canonical.is_absent[i] = false;
        } else {
            // Some absent, some present: fixed mismatch, adopt the present value. If the
            // present replicas themselves disagree, that's also a genuine mismatch.
            if present_values.iter().any(|v| !values_agree(*v, present_values[0])) {
                metrics.render_mismatches.increment(1);
                mismatched_response = true;
            } else {
                metrics.render_fixed_mismatches.increment(1);
            }
            canonical.values[i] = present_values[0];
            canonical.is_absent[i] = false;
        }
    }
    if mismatched_response {
        metrics.render_mismatched_responses.increment(1);
    }
    canonical
}

fn reconcile_majority(replicas: Vec<Metric>) -> Metric {
    let len = replicas[0].values.len();
    let mut canonical = replicas[0].clone();
    let k = replicas.len();

    for i in 0..len {
        let present: Vec<f64> = replicas
            .iter()
            .filter(|r| !r.is_absent_at(i))
            .map(|r| r.values[i])
            .collect();

        // A point is absent only if absent in a strict majority.
        if present.len() * 2 < k {
            canonical.is_absent[i] = true;
            canonical.values[i] = f64::NAN;
            continue;
        }

        // Plurality vote among non-absent replicas; ties break toward the first replica that
        // held the winning value.
        let mut best_value = present[0];
        let mut best_count = 0usize;
        for candidate in &present {
            let count = present.iter().filter(|v| values_agree(**v, *candidate)).count();
            if count > best_count {
                best_count = count;
                best_value = *candidate;
            }
        }
        canonical.values[i] = best_value;
        canonical.is_absent[i] = false;
    }
    canonical
}

/// NaN is treated as equal to NaN (contrary to IEEE 754), so that two replicas both missing a
/// point still agree during comparison.
fn values_agree(a: f64, b: f64) -> bool {
    (a.is_nan() && b.is_nan()) || a == b
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(values: Vec<f64>, is_absent: Vec<bool>) -> Metric {
        let len = values.len() as i32;
        Metric {
            name: "m1".to_owned(),
            start_time: 0,
            stop_time: len * 60,
            step_time: 60,
            values,
            is_absent,
        }
    }

    #[test]
    fn normal_returns_first_replica_unexamined() {
        let a = metric(vec![1.0], vec![false]);
        let b = metric(vec![99.0], vec![false]);
        let r = ReplicaReconciler::new(ReconcilePolicy::Normal);
        let metrics = ZipperMetrics::new_for_test();
        let result = r.reconcile(vec![a.clone(), b], &metrics);
        assert_eq!(result.values, a.values);
    }

    #[test]
    fn reconciler_is_identity_for_single_replica_under_every_policy() {
        let x = metric(vec![1.0, 2.0, 3.0], vec![false, false, false]);
        let metrics = ZipperMetrics::new_for_test();
        for policy in [
            ReconcilePolicy::Normal,
            ReconcilePolicy::Check,
            ReconcilePolicy::Majority,
        ] {
            let r = ReplicaReconciler::new(policy);
            let result = r.reconcile(vec![x.clone()], &metrics);
            assert_eq!(result.values, x.values);
        }
    }

    #[test]
    fn reconciler_is_identity_when_all_replicas_agree() {
        let x = metric(vec![1.0, 2.0, 3.0], vec![false, false, false]);
        let metrics = ZipperMetrics::new_for_test();
        for policy in [
            ReconcilePolicy::Normal,
            ReconcilePolicy::Check,
            ReconcilePolicy::Majority,
        ] {
            let r = ReplicaReconciler::new(policy);
            let result = r.reconcile(vec![x.clone(), x.clone(), x.clone()], &metrics);
            assert_eq!(result.values, x.values);
        }
    }

    /// S1 -- Averaging across replicas (Check).
    #[test]
    fn s1_check_fixes_one_absent_mismatch() {
        let a = metric(vec![1.0, f64::NAN, 3.0], vec![false, true, false]);
        let b = metric(vec![1.0, 2.0, 3.0], vec![false, false, false]);
        let metrics = ZipperMetrics::new_for_test();
        let r = ReplicaReconciler::new(ReconcilePolicy::Check);
        let result = r.reconcile(vec![a, b], &metrics);
        assert_eq!(result.values, vec![1.0, 2.0, 3.0]);
        assert_eq!(metrics.render_fixed_mismatches.get(), 1);
        assert_eq!(metrics.render_mismatches.get(), 0);
    }

    /// S2 -- Majority ties and Check mismatch counting.
    #[test]
    fn s2_majority_and_check() {
        let a = metric(vec![5.0, 5.0, 9.0], vec![false, false, false]);
        let b = metric(vec![5.0, 7.0, 9.0], vec![false, false, false]);
        let c = metric(vec![5.0, 7.0, 9.0], vec![false, false, false]);

        let majority = ReplicaReconciler::new(ReconcilePolicy::Majority);
        let metrics = ZipperMetrics::new_for_test();
        let result = majority.reconcile(vec![a.clone(), b.clone(), c.clone()], &metrics);
        assert_eq!(result.values, vec![5.0, 7.0, 9.0]);

        let check = ReplicaReconciler::new(ReconcilePolicy::Check);
        let metrics = ZipperMetrics::new_for_test();
        check.reconcile(vec![a, b, c], &metrics);
        assert_eq!(metrics.render_mismatches.get(), 1);
    }
}
