// Copyright 2020 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use prost::Message;

use crate::carbonapi_v2::{FetchResponse, GlobMatch, GlobResponse};

#[test]
fn test_fetch_response_roundtrip() {
    let response = FetchResponse {
        name: "servers.a.cpu".to_owned(),
        start_time: 100,
        stop_time: 400,
        step_time: 60,
        values: vec![1.0, 2.0, 3.0, 4.0, 5.0],
        is_absent: vec![false, false, true, false, false],
    };

    let mut buf = Vec::with_capacity(response.encoded_len());
    response.encode(&mut buf).unwrap();

    let decoded = FetchResponse::decode(buf.as_slice()).expect("decode FetchResponse");
    assert_eq!(response, decoded);
}

#[test]
fn test_glob_response_roundtrip() {
    let response = GlobResponse {
        name: "servers.*".to_owned(),
        matches: vec![
            GlobMatch {
                path: "servers.a".to_owned(),
                is_leaf: false,
            },
            GlobMatch {
                path: "servers.b.cpu".to_owned(),
                is_leaf: true,
            },
        ],
    };

    let mut buf = Vec::with_capacity(response.encoded_len());
    response.encode(&mut buf).unwrap();

    let decoded = GlobResponse::decode(buf.as_slice()).expect("decode GlobResponse");
    assert_eq!(response, decoded);
}
