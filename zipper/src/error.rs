// Copyright 2020 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

/// The error taxonomy surfaced by a single `Backend` call and, once aggregated, by the
/// fan-out engine.
///
/// Every variant other than `Internal` carries the address of the backend that produced it
/// so that the orchestrator can log a precise per-backend error list even after the individual
/// errors have been collapsed into one HTTP response.
#[derive(Clone, Debug)]
pub enum ZipperError {
    /// This backend explicitly reported that no metrics matched the request.
    NotFound { backend: String },
    /// Every backend in a fan-out reported `NotFound`.
    AllNotFound,
    /// The per-call deadline elapsed before the backend replied.
    Timeout { backend: String },
    /// The caller's context was cancelled before or during the call.
    Cancelled { backend: String },
    /// The backend's concurrency limiter could not be acquired before the deadline.
    LimiterExhausted { backend: String },
    /// A dial, read, or other transport-level failure.
    Transport { backend: String, message: String },
    /// A response was received but could not be decoded.
    Decode { backend: String, message: String },
    /// Any other failure that does not fit the above classes.
    Internal { message: String },
}

impl ZipperError {
    pub fn backend(&self) -> Option<&str> {
        match self {
            ZipperError::NotFound { backend }
            | ZipperError::Timeout { backend }
            | ZipperError::Cancelled { backend }
            | ZipperError::LimiterExhausted { backend }
            | ZipperError::Transport { backend, .. }
            | ZipperError::Decode { backend, .. } => Some(backend),
            ZipperError::AllNotFound | ZipperError::Internal { .. } => None,
        }
    }

    /// Rank used to pick "the most specific" error out of a list of per-backend failures, per
    /// the precedence `AllNotFound > Timeout > others`.
    fn specificity_rank(&self) -> u8 {
        match self {
            ZipperError::AllNotFound => 0,
            ZipperError::Timeout { .. } => 1,
            _ => 2,
        }
    }

    /// Pick the most specific error among a non-empty set of per-backend failures, used by the
    /// orchestrator to choose an HTTP status code when every backend in a fan-out failed.
    pub fn most_specific(errors: &[ZipperError]) -> Option<&ZipperError> {
        errors.iter().min_by_key(|e| e.specificity_rank())
    }
}

impl fmt::Display for ZipperError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZipperError::NotFound { backend } => write!(f, "{backend}: not found"),
            ZipperError::AllNotFound => write!(f, "not found on any backend"),
            ZipperError::Timeout { backend } => write!(f, "{backend}: timed out"),
            ZipperError::Cancelled { backend } => write!(f, "{backend}: cancelled"),
            ZipperError::LimiterExhausted { backend } => {
                write!(f, "{backend}: concurrency limiter exhausted")
            }
            ZipperError::Transport { backend, message } => {
                write!(f, "{backend}: transport error: {message}")
            }
            ZipperError::Decode { backend, message } => {
                write!(f, "{backend}: decode error: {message}")
            }
            ZipperError::Internal { message } => write!(f, "internal error: {message}"),
        }
    }
}

impl std::error::Error for ZipperError {}

/// The aggregate outcome of a fan-out: callers almost always want "at least one success", not
/// a per-backend `Result`.
#[derive(Debug)]
pub struct FanoutError {
    /// The most actionable single cause, used to pick an HTTP status.
    pub aggregate: ZipperError,
    /// Every per-backend error observed, preserved for logging.
    pub per_backend: Vec<ZipperError>,
}

impl fmt::Display for FanoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} backend error(s))",
            self.aggregate,
            self.per_backend.len()
        )
    }
}

impl std::error::Error for FanoutError {}
