// Copyright 2020 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::Duration;

use serde::Deserialize;

use crate::backend::BackendConfig;
use crate::metrics::MonitoringConfig;
use crate::reconcile::ReconcilePolicy;

/// The YAML configuration consumed by the `zipper_server` binary.
#[derive(Clone, Deserialize, Debug)]
pub struct ZipperConfig {
    /// One entry per storage host.
    pub backends: Vec<BackendConfig>,

    /// Client-facing listen address, e.g. `0.0.0.0:8080`.
    pub listen: String,

    /// Global timeout applied to a whole request (as opposed to a single backend call).
    #[serde(default = "default_global_timeout_secs", with = "duration_secs")]
    pub global_timeout: Duration,

    /// Metric-name prefixes used to build the TLD cache.
    #[serde(default)]
    pub tld_prefixes: Vec<String>,

    /// Period, in seconds, between TLD cache probe cycles.
    #[serde(default = "default_tld_probe_period_secs")]
    pub tld_probe_period_secs: u64,

    /// Replica reconciliation policy applied to Render results.
    #[serde(default = "default_reconcile_policy")]
    pub reconcile_policy: ReconcilePolicy,

    /// Default timezone used by date parsing when no `tz` query parameter is given.
    #[serde(default = "default_timezone")]
    pub default_timezone: String,

    pub monitoring: MonitoringConfig,

    /// Caps the number of worker threads used by the async runtime; 0 means "use all cores".
    #[serde(default)]
    pub max_procs: usize,

    /// Path to write this process' pid at startup.
    #[serde(default)]
    pub pidfile: Option<String>,

    /// Admin endpoints, logging, and Sentry configuration.
    #[serde(default)]
    pub infra: Option<zipper_util::infra::InfraConfig>,
}

fn default_global_timeout_secs() -> Duration {
    Duration::from_secs(60)
}

fn default_tld_probe_period_secs() -> u64 {
    600
}

fn default_reconcile_policy() -> ReconcilePolicy {
    ReconcilePolicy::Normal
}

fn default_timezone() -> String {
    "UTC".to_owned()
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

impl ZipperConfig {
    pub fn parse(contents: &str) -> Result<ZipperConfig, String> {
        serde_yaml::from_str(contents).map_err(|err| format!("failed to parse config: {err}"))
    }
}
