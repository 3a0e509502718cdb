// Copyright 2020 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use protos::carbonapi_v2::carbon_v2_client::CarbonV2Client;
use protos::carbonapi_v2::{FetchRequest, MultiFetchRequest, MultiGlobRequest, MultiInfoRequest};
use tonic::transport::Channel;
use tonic::{Code, Status};

use crate::error::ZipperError;
use crate::types::{
    FindRequest, FindResponse, GlobMatch, InfoRequest, InfoResponse, Metric, Retention,
    RenderRequest,
};

/// A gRPC transport to one storage backend, consuming a streaming `FetchResponse`/`GlobResponse`
/// reply one message at a time until the stream ends.
pub struct GrpcTransport {
    client: CarbonV2Client<Channel>,
}

impl GrpcTransport {
    pub async fn new(address: String) -> Result<GrpcTransport, String> {
        let channel = zipper_util::backend::construct_channel(zipper_util::backend::BackendConfig {
            address,
            connect_timeout_secs: 5,
        })
        .await?;
        Ok(GrpcTransport {
            client: CarbonV2Client::new(channel),
        })
    }

    pub async fn find(&self, request: &FindRequest) -> Result<FindResponse, ZipperError> {
        let mut client = self.client.clone();
        let grpc_request = MultiGlobRequest {
            metrics: vec![request.query.clone()],
        };
        let mut stream = client
            .find(grpc_request)
            .await
            .map_err(map_status)?
            .into_inner();

        let mut matches = Vec::new();
        loop {
            match stream.message().await {
                Ok(Some(glob_response)) => {
                    for m in glob_response.matches {
                        matches.push(GlobMatch {
                            path: m.path,
                            is_leaf: m.is_leaf,
                        });
                    }
                }
                Ok(None) => break,
                Err(status) => return Err(map_status(status)),
            }
        }
        Ok(FindResponse { matches })
    }

    pub async fn render(&self, request: &RenderRequest) -> Result<Vec<Metric>, ZipperError> {
        let mut client = self.client.clone();
        let grpc_request = MultiFetchRequest {
            metrics: request
                .targets
                .iter()
                .map(|name| FetchRequest {
                    name: name.clone(),
                    start_time: request.from,
                    stop_time: request.until,
                })
                .collect(),
        };
        let mut stream = client
            .render(grpc_request)
            .await
            .map_err(map_status)?
            .into_inner();

        let mut metrics = Vec::new();
        loop {
            match stream.message().await {
                Ok(Some(fetch_response)) => {
                    let metric = Metric {
                        name: fetch_response.name,
                        start_time: fetch_response.start_time,
                        stop_time: fetch_response.stop_time,
                        step_time: fetch_response.step_time,
                        values: fetch_response.values,
                        is_absent: fetch_response.is_absent,
                    };
                    metric.validate().map_err(|message| ZipperError::Decode {
                        backend: String::new(),
                        message,
                    })?;
                    metrics.push(metric);
                }
                Ok(None) => break,
                Err(status) => return Err(map_status(status)),
            }
        }
        Ok(metrics)
    }

    pub async fn info(&self, request: &InfoRequest) -> Result<Vec<InfoResponse>, ZipperError> {
        let mut client = self.client.clone();
        let grpc_request = MultiInfoRequest {
            names: vec![request.target.clone()],
        };
        let mut stream = client
            .info(grpc_request)
            .await
            .map_err(map_status)?
            .into_inner();

        let mut infos = Vec::new();
        loop {
            match stream.message().await {
                Ok(Some(info_response)) => infos.push(InfoResponse {
                    name: info_response.name,
                    aggregation_method: info_response.aggregation_method,
                    max_retention: info_response.max_retention,
                    x_files_factor: info_response.x_files_factor,
                    retentions: info_response
                        .retentions
                        .into_iter()
                        .map(|r| Retention {
                            seconds_per_point: r.seconds_per_point,
                            points: r.points,
                        })
                        .collect(),
                }),
                Ok(None) => break,
                Err(status) => return Err(map_status(status)),
            }
        }
        Ok(infos)
    }
}

/// `NotFound` status maps to the typed `NotFound` error; every other code maps to `Transport`.
fn map_status(status: Status) -> ZipperError {
    match status.code() {
        Code::NotFound => ZipperError::NotFound {
            backend: String::new(),
        },
        _ => ZipperError::Internal {
            message: status.to_string(),
        },
    }
}
