// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::Duration;

use serde::Deserialize;
use tonic::transport::{Channel, Endpoint};

/// Configuration for dialing a single storage backend over gRPC.
#[derive(Clone, Deserialize, Debug)]
pub struct BackendConfig {
    /// ADDRESS:PORT of this backend's gRPC endpoint.
    pub address: String,

    /// Timeout, in seconds, applied to the TCP connect itself (distinct from the per-call
    /// timeout applied to each RPC).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            address: String::new(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Dial a gRPC channel to a single backend host.
///
/// Unlike a client-facing load balancer, a `Backend` is one specific host: the zipper itself is
/// responsible for fanning a request out across the set of backends, so the channel here talks
/// to exactly the address given, lazily -- the first RPC triggers the connect.
pub async fn construct_channel(config: BackendConfig) -> Result<Channel, String> {
    let uri = format!("http://{}", config.address);
    let endpoint: Endpoint = uri
        .parse()
        .map_err(|err| format!("invalid backend address {}: {err}", config.address))?;
    let endpoint = endpoint.connect_timeout(Duration::from_secs(config.connect_timeout_secs));
    Ok(endpoint.connect_lazy())
}
