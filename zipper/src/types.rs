// Copyright 2020 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::Instant;

/// A glob-style query for metric-name expansion.
#[derive(Clone, Debug)]
pub struct FindRequest {
    pub query: String,
}

impl FindRequest {
    pub fn new(query: impl Into<String>) -> Self {
        FindRequest {
            query: query.into(),
        }
    }
}

/// A single leaf or branch matched by a `Find`.
#[derive(Clone, Debug, PartialEq)]
pub struct GlobMatch {
    pub path: String,
    pub is_leaf: bool,
}

#[derive(Clone, Debug, Default)]
pub struct FindResponse {
    pub matches: Vec<GlobMatch>,
}

/// A fetch for one or more target names over a time range.
#[derive(Clone, Debug)]
pub struct RenderRequest {
    pub targets: Vec<String>,
    pub from: i32,
    pub until: i32,
    pub trace: Trace,
}

/// A single metric series as returned by a backend.
#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
    pub name: String,
    pub start_time: i32,
    pub stop_time: i32,
    pub step_time: i32,
    pub values: Vec<f64>,
    pub is_absent: Vec<bool>,
}

impl Metric {
    /// The point count implied by the series' own `{start, stop, step}`, per the invariant that
    /// `len(values) == len(is_absent) == ceil((stop - start) / step)`.
    pub fn expected_len(&self) -> usize {
        if self.step_time <= 0 {
            return 0;
        }
        let span = (self.stop_time - self.start_time).max(0) as i64;
        ((span + self.step_time as i64 - 1) / self.step_time as i64) as usize
    }

    /// A point is absent if the bit is set or the value is NaN (§4.3 NaN semantics).
    pub fn is_absent_at(&self, index: usize) -> bool {
        self.is_absent.get(index).copied().unwrap_or(true) || self.values[index].is_nan()
    }

    /// Enforce §3's invariant against a series just decoded off the wire: `values` and
    /// `is_absent` must be the same length, and that length must match what `{start, stop,
    /// step}` implies. A backend that violates this sent us a corrupt or truncated response.
    pub fn validate(&self) -> Result<(), String> {
        if self.values.len() != self.is_absent.len() {
            return Err(format!(
                "{}: values length {} does not match is_absent length {}",
                self.name,
                self.values.len(),
                self.is_absent.len()
            ));
        }
        let expected = self.expected_len();
        if self.values.len() != expected {
            return Err(format!(
                "{}: got {} points, expected {} for start={} stop={} step={}",
                self.name,
                self.values.len(),
                expected,
                self.start_time,
                self.stop_time,
                self.step_time
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct InfoRequest {
    pub target: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Retention {
    pub seconds_per_point: i32,
    pub points: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InfoResponse {
    pub name: String,
    pub aggregation_method: String,
    pub max_retention: i32,
    pub x_files_factor: f32,
    pub retentions: Vec<Retention>,
}

/// Ordered timestamps for one request's lifecycle, used for latency breakdowns in logs and
/// traces. Stages are appended as the request progresses; a stage left unset simply never
/// happened for this request (e.g. a request that never reached the limiter).
#[derive(Clone, Debug, Default)]
pub struct Trace {
    pub marshal: Option<Instant>,
    pub limiter_entered: Option<Instant>,
    pub first_byte: Option<Instant>,
}

impl Trace {
    pub fn new() -> Self {
        Trace::default()
    }

    pub fn add_marshal(&mut self, at: Instant) {
        self.marshal = Some(at);
    }

    pub fn add_limiter(&mut self, at: Instant) {
        self.limiter_entered = Some(at);
    }

    pub fn add_first_byte(&mut self, at: Instant) {
        self.first_byte = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(values: Vec<f64>, is_absent: Vec<bool>) -> Metric {
        Metric {
            name: "servers.a.cpu".to_owned(),
            start_time: 0,
            stop_time: 120,
            step_time: 60,
            values,
            is_absent,
        }
    }

    #[test]
    fn expected_len_matches_span_over_step() {
        let m = metric(vec![1.0, 2.0], vec![false, false]);
        assert_eq!(m.expected_len(), 2);
    }

    #[test]
    fn validate_rejects_mismatched_values_and_is_absent_lengths() {
        let m = metric(vec![1.0, 2.0], vec![false]);
        assert!(m.validate().is_err());
    }

    #[test]
    fn validate_rejects_length_not_matching_start_stop_step() {
        let m = metric(vec![1.0], vec![false]);
        assert!(m.validate().is_err());
    }

    #[test]
    fn validate_accepts_well_formed_series() {
        let m = metric(vec![1.0, 2.0], vec![false, false]);
        assert!(m.validate().is_ok());
    }
}
