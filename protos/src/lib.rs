// Copyright 2020 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![allow(clippy::derive_partial_eq_without_eq)]

pub mod carbonapi_v2 {
    include!(concat!(env!("OUT_DIR"), "/carbonapi_v2.rs"));
}

#[cfg(test)]
mod tests;
