use std::{rc::Rc, sync::Arc};

use anyhow::Result;
use clap::Parser;
use gangway_core::orchestrator::WorkerFleet;
use gangway_services::{
    proxy::balancer::AffinityRegistry,
    tls::{server_config, CertStore},
    worker::{worker_main, WorkerConfig},
};
use tracing::{info, warn};

mod admin;
mod config;
mod control;
mod registry;
mod snapshot;

use config::Config;
use control::Controller;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the config file
    #[clap(short, long, value_parser)]
    config: Option<String>,
}

#[monoio::main(timer_enabled = true)]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path).await?,
        None => Config::default(),
    };
    info!(
        http = %config.http_addr(),
        https = %config.https_addr(),
        socket = %config.socket_path.display(),
        workers = config.runtime.worker_threads,
        "gangway starting"
    );

    let cert_store = Arc::new(CertStore::new());
    let tls_config = server_config(cert_store.clone());
    let affinity = AffinityRegistry::new();

    let worker_config = WorkerConfig {
        http_addr: config.http_addr(),
        https_addr: Some(config.https_addr()),
        tls_config: Some(tls_config),
        cert_store: Some(cert_store.clone()),
        affinity,
    };

    let mut fleet = WorkerFleet::new(config.runtime.clone());
    let _workers = fleet.spawn_workers(|worker_id, shutdown, commands| {
        worker_main(worker_id, worker_config.clone(), shutdown, commands)
    });

    let controller = Rc::new(Controller::new(
        fleet,
        cert_store,
        config.state_file.clone(),
    ));
    if let Err(e) = controller.restore().await {
        warn!("restoring saved state failed: {e:#}");
    }

    admin::run(controller, &config.socket_path).await
}
