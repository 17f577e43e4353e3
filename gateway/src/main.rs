//! The paygate gateway binary: loads configuration, connects Postgres
//! and Redis, spawns the job worker, and serves the HTTP surface until
//! SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::Context;
use paygate_api::ApiState;
use paygate_common::config::Config;
use paygate_core::{
    Ctx,
    driver::DriverRegistry,
    queue::{self, DelayedJobQueue},
};
use paygate_crypto::PlatformSigner;
use paygate_store::{PgStore, RedisCache};
use tokio::sync::watch;
use tracing::info;

fn main() -> anyhow::Result<()> {
    // A missing .env is fine; production injects real env vars.
    let _ = dotenvy::dotenv();
    paygate_logger::init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env().context("loading configuration")?;

    let store = PgStore::connect(&config.database_url).await?;
    store.migrate().await?;
    let cache = RedisCache::connect(&config.redis_url).await?;
    let signer = PlatformSigner::from_b64_der(&config.platform_rsa_key_b64)
        .context("loading platform RSA key")?;

    let (job_queue, job_rx) = DelayedJobQueue::new();

    // Upstream drivers register here. The gateway ships none itself;
    // deployments link driver crates and add them to the registry.
    let drivers = DriverRegistry::new();

    let http = reqwest::Client::builder()
        .timeout(config.driver_timeout)
        .build()
        .context("building HTTP client")?;

    let listen_addr = config.listen_addr;
    let ctx = Arc::new(Ctx {
        store: Arc::new(store),
        cache: Arc::new(cache),
        queue: Arc::new(job_queue),
        drivers,
        config,
        signer,
        http,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(queue::run_worker(
        ctx.clone(),
        job_rx,
        shutdown_rx.clone(),
    ));

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    let server = tokio::spawn(paygate_api::serve(
        ApiState::new(ctx),
        listener,
        shutdown_rx,
    ));

    wait_for_shutdown().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = worker.await;
    server.await.context("server task panicked")??;
    Ok(())
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())
        .expect("installing SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
