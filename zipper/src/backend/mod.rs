// Copyright 2020 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::future::Cache;
use serde::Deserialize;
use tokio::sync::Semaphore;

use crate::error::ZipperError;
use crate::types::{FindRequest, FindResponse, InfoRequest, InfoResponse, Metric, RenderRequest};

mod grpc;
mod http;

pub use grpc::GrpcTransport;
pub use http::HttpTransport;

/// Configuration for one storage host: its transport address(es), how many outbound calls may
/// be in flight at once, and how long a single call is allowed to take.
#[derive(Clone, Deserialize, Debug)]
pub struct BackendConfig {
    /// HTTP URL of this backend, e.g. `http://storage-1:8080`.
    pub address: String,
    /// Optional gRPC dial address; when present, Render/Find/Info prefer gRPC streaming.
    pub grpc_address: Option<String>,
    /// Maximum number of concurrent outbound calls to this backend.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Per-call timeout, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// TTL, in seconds, for entries in the path-existence cache.
    #[serde(default = "default_cache_expiry_secs")]
    pub cache_expiry_secs: u64,
}

fn default_limit() -> usize {
    100
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_cache_expiry_secs() -> u64 {
    600
}

enum Transport {
    Http(HttpTransport),
    Grpc(GrpcTransport),
}

/// A handle to one storage host behind the zipper.
///
/// `Backend` is immutable after construction: the only mutable state it owns is the semaphore
/// permit count (via `tokio::sync::Semaphore`, itself interior-mutable) and the path-existence
/// cache. Both are safe under concurrent use by many in-flight requests.
pub struct Backend {
    pub address: String,
    limiter: Semaphore,
    timeout: Duration,
    path_cache: Cache<String, ()>,
    transport: Transport,
}

impl Backend {
    pub async fn new(config: BackendConfig) -> Result<Backend, String> {
        let transport = match &config.grpc_address {
            Some(grpc_address) => Transport::Grpc(GrpcTransport::new(grpc_address.clone()).await?),
            None => Transport::Http(HttpTransport::new(config.address.clone())?),
        };
        Ok(Backend {
            address: config.address,
            limiter: Semaphore::new(config.limit),
            timeout: Duration::from_secs(config.timeout_secs),
            path_cache: Cache::builder()
                .time_to_live(Duration::from_secs(config.cache_expiry_secs))
                .build(),
            transport,
        })
    }

    /// Acquire a limiter permit, respecting the caller's deadline. Returns `LimiterExhausted` if
    /// the semaphore cannot be acquired before `deadline` elapses, without making any network
    /// call.
    async fn acquire(&self, deadline: Duration) -> Result<tokio::sync::SemaphorePermit<'_>, ZipperError> {
        match tokio::time::timeout(deadline, self.limiter.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(ZipperError::Internal {
                message: format!("{}: limiter semaphore closed", self.address),
            }),
            Err(_) => Err(ZipperError::LimiterExhausted {
                backend: self.address.clone(),
            }),
        }
    }

    /// Run `call` under a single deadline that covers both the limiter wait and the network
    /// call, matching `examples/original_source/backend/net/grpc.go`'s `setTimeout` context
    /// (one shared deadline for dial + limiter-enter + stream consumption), rather than giving
    /// the acquire and the call each a fresh, independent `self.timeout` window.
    async fn call_with_deadline<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, ZipperError>>,
    ) -> Result<T, ZipperError> {
        let started = Instant::now();
        let _permit = self.acquire(self.timeout).await?;
        let remaining = self.timeout.saturating_sub(started.elapsed());
        match tokio::time::timeout(remaining, call).await {
            Ok(result) => result.map_err(|err| self.attribute(err)),
            Err(_) => Err(ZipperError::Timeout {
                backend: self.address.clone(),
            }),
        }
    }

    pub async fn find(&self, request: &FindRequest) -> Result<FindResponse, ZipperError> {
        let transport = &self.transport;
        self.call_with_deadline(async move {
            match transport {
                Transport::Http(t) => t.find(request).await,
                Transport::Grpc(t) => t.find(request).await,
            }
        })
        .await
    }

    pub async fn render(&self, request: &RenderRequest) -> Result<Vec<Metric>, ZipperError> {
        let transport = &self.transport;
        let result = self
            .call_with_deadline(async move {
                match transport {
                    Transport::Http(t) => t.render(request).await,
                    Transport::Grpc(t) => t.render(request).await,
                }
            })
            .await;
        if let Ok(metrics) = &result {
            for metric in metrics {
                self.path_cache.insert(metric.name.clone(), ()).await;
            }
        }
        result
    }

    pub async fn info(&self, request: &InfoRequest) -> Result<Vec<InfoResponse>, ZipperError> {
        let transport = &self.transport;
        self.call_with_deadline(async move {
            match transport {
                Transport::Http(t) => t.info(request).await,
                Transport::Grpc(t) => t.info(request).await,
            }
        })
        .await
    }

    /// Non-authoritative probe of the path-existence cache. Only a `true` result is
    /// informative -- a `false` only means "not recently seen", not "absent".
    pub fn contains(&self, name: &str) -> bool {
        self.path_cache.get(name).is_some()
    }

    /// Turn an untagged transport error into one carrying this backend's address, unless it
    /// already is one of the typed error variants (a `NotFound` from the transport layer, say).
    fn attribute(&self, err: ZipperError) -> ZipperError {
        match err {
            ZipperError::Internal { message } => ZipperError::Transport {
                backend: self.address.clone(),
                message,
            },
            ZipperError::NotFound { backend } if backend.is_empty() => ZipperError::NotFound {
                backend: self.address.clone(),
            },
            ZipperError::Decode { backend, message } if backend.is_empty() => ZipperError::Decode {
                backend: self.address.clone(),
                message,
            },
            other => other,
        }
    }
}

pub type Backends = Arc<Vec<Backend>>;
