// Copyright 2020 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

use clap::{Arg, Command};
use tokio::sync::watch;
use warp::Filter;

use zipper::{App, SharedApp, ZipperConfig};
use zipper_util::infra::setup_infra_endpoints;
use zipper_util::logging::setup_logging;
use zipper_util::sentry::setup_sentry;

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = Command::new("zipper_server")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .required(true)
                .value_name("FILE"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").unwrap();
    let config_content = std::fs::read_to_string(config_path)
        .map_err(|err| format!("unable to read config file {config_path}: {err}"))?;
    let config = ZipperConfig::parse(&config_content)?;

    if config.backends.is_empty() {
        return Err("no backends loaded -- exiting".into());
    }

    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    runtime_builder.enable_all();
    if config.max_procs != 0 {
        runtime_builder.worker_threads(config.max_procs);
    }
    let runtime = runtime_builder.build()?;
    runtime.block_on(run(config))
}

async fn run(config: ZipperConfig) -> Result<(), Box<dyn std::error::Error>> {
    setup_logging(config.infra.as_ref(), "zipper");
    log::info!("starting zipper server, build_version={BUILD_VERSION}");
    let _sentry_guard = setup_sentry(config.infra.as_ref(), "zipper");

    if let Some(pidfile) = &config.pidfile {
        tokio::fs::write(pidfile, std::process::id().to_string()).await?;
    }

    let shutdown_receiver = setup_infra_endpoints(config.infra.clone().unwrap_or_default(), BUILD_VERSION)
        .map_err(|err| format!("failed to set up infra endpoints: {err}"))?;

    let listen = config.listen.clone();
    let app: SharedApp = std::sync::Arc::new(App::new(config).await?);

    let probe_app = app.clone();
    let probe_shutdown = shutdown_receiver.clone();
    tokio::spawn(async move { probe_app.run_tld_probe_loop(probe_shutdown).await });

    serve(listen, app, shutdown_receiver).await;
    Ok(())
}

async fn serve(listen: String, app: SharedApp, mut shutdown_receiver: watch::Receiver<()>) {
    let address: std::net::SocketAddr = listen.parse().expect("invalid listen address");
    log::info!("serving zipper client API on {address}");

    let routes = zipper::http_api::routes(app);
    let (_, server) = warp::serve(routes).bind_with_graceful_shutdown(address, async move {
        while shutdown_receiver.changed().await.is_ok() {}
    });
    server.await;
}
