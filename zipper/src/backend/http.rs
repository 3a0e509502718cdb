// Copyright 2020 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use bytes::Buf;
use hyper::client::HttpConnector;
use hyper::{Client, Uri};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use prost::Message;
use protos::carbonapi_v2::{GlobResponse, InfoResponse as PbInfoResponse, MultiFetchResponse};

use crate::error::ZipperError;
use crate::types::{
    FindRequest, FindResponse, GlobMatch, InfoRequest, InfoResponse, Metric, Retention,
    RenderRequest,
};

/// An HTTP transport to one storage backend: each call is a single GET returning one protobuf
/// blob, as opposed to the gRPC transport's streamed messages.
pub struct HttpTransport {
    base_url: String,
    client: Client<HttpConnector>,
}

impl HttpTransport {
    pub fn new(base_url: String) -> Result<HttpTransport, String> {
        Ok(HttpTransport {
            base_url,
            client: Client::builder().build(HttpConnector::new()),
        })
    }

    async fn get(&self, path_and_query: &str) -> Result<bytes::Bytes, ZipperError> {
        let uri: Uri = format!("{}{}", self.base_url, path_and_query)
            .parse()
            .map_err(|err| internal(format!("invalid backend URL: {err}")))?;
        let response = self
            .client
            .get(uri)
            .await
            .map_err(|err| internal(format!("request failed: {err}")))?;
        if response.status() == hyper::StatusCode::NOT_FOUND {
            return Err(ZipperError::NotFound {
                backend: String::new(),
            });
        }
        if !response.status().is_success() {
            return Err(internal(format!("unexpected status {}", response.status())));
        }
        hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|err| internal(format!("failed to read response body: {err}")))
    }

    pub async fn find(&self, request: &FindRequest) -> Result<FindResponse, ZipperError> {
        let query = urlencode(&request.query);
        let body = self
            .get(&format!("/metrics/find/?format=protobuf&query={query}"))
            .await?;
        let decoded = GlobResponse::decode(body.reader())
            .map_err(|err| ZipperError::Decode {
                backend: String::new(),
                message: err.to_string(),
            })?;
        Ok(FindResponse {
            matches: decoded
                .matches
                .into_iter()
                .map(|m| GlobMatch {
                    path: m.path,
                    is_leaf: m.is_leaf,
                })
                .collect(),
        })
    }

    pub async fn render(&self, request: &RenderRequest) -> Result<Vec<Metric>, ZipperError> {
        let targets = request
            .targets
            .iter()
            .map(|t| format!("target={}", urlencode(t)))
            .collect::<Vec<_>>()
            .join("&");
        let body = self
            .get(&format!(
                "/render/?format=protobuf&{targets}&from={}&until={}",
                request.from, request.until
            ))
            .await?;
        let decoded = MultiFetchResponse::decode(body.reader())
            .map_err(|err| ZipperError::Decode {
                backend: String::new(),
                message: err.to_string(),
            })?;
        let metrics: Vec<Metric> = decoded
            .metrics
            .into_iter()
            .map(|m| Metric {
                name: m.name,
                start_time: m.start_time,
                stop_time: m.stop_time,
                step_time: m.step_time,
                values: m.values,
                is_absent: m.is_absent,
            })
            .collect();
        for metric in &metrics {
            metric.validate().map_err(|message| ZipperError::Decode {
                backend: String::new(),
                message,
            })?;
        }
        Ok(metrics)
    }

    pub async fn info(&self, request: &InfoRequest) -> Result<Vec<InfoResponse>, ZipperError> {
        let target = urlencode(&request.target);
        let body = self
            .get(&format!("/info/?format=protobuf&target={target}"))
            .await?;
        let decoded = PbInfoResponse::decode(body.reader())
            .map_err(|err| ZipperError::Decode {
                backend: String::new(),
                message: err.to_string(),
            })?;
        Ok(vec![InfoResponse {
            name: decoded.name,
            aggregation_method: decoded.aggregation_method,
            max_retention: decoded.max_retention,
            x_files_factor: decoded.x_files_factor,
            retentions: decoded
                .retentions
                .into_iter()
                .map(|r| Retention {
                    seconds_per_point: r.seconds_per_point,
                    points: r.points,
                })
                .collect(),
        }])
    }
}

fn internal(message: String) -> ZipperError {
    ZipperError::Internal { message }
}

const QUERY_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

fn urlencode(s: &str) -> String {
    utf8_percent_encode(s, QUERY_COMPONENT).to_string()
}
