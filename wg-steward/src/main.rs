// WireGuard Steward Daemon

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use wg_steward::{
    config::load_config,
    configuration::Context as EngineContext,
    jobs::JobScheduler,
    poller::Poller,
    registry::Registry,
    store::Store,
    wg_controller::WgController,
};

#[derive(Parser)]
#[command(name = "wg-steward")]
#[command(about = "WireGuard configuration and peer management daemon", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/wg-steward/config.toml")]
    config: PathBuf,
}

fn main() -> Result<()> {
    // 2 threads: the background loops mostly wait on child processes and SQLite
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("wg-steward")
        .thread_stack_size(2 * 1024 * 1024)
        .enable_time()
        .enable_io()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.server.log_level),
    )
    .init();

    log::info!("Starting wg-steward daemon");
    log::info!("WireGuard configurations: {}", config.server.wg_conf_path.display());
    if let Some(awg) = &config.server.awg_conf_path {
        log::info!("AmneziaWG configurations: {}", awg.display());
    }
    log::info!("Database: {}", config.server.database_path.display());

    let store = Store::connect(&config.server.database_path)
        .await
        .with_context(|| format!("Failed to open database {:?}", config.server.database_path))?;
    let control = Arc::new(WgController::new(config.server.command_timeout));
    let ctx = EngineContext::new(
        store,
        control,
        config.peers.clone(),
        config.server.download_path.clone(),
    );

    let registry = Arc::new(Registry::new(
        ctx.clone(),
        config.server.wg_conf_path.clone(),
        config.server.awg_conf_path.clone(),
        config.server.autostart.clone(),
    ));
    let count = registry
        .discover(true)
        .await
        .context("Failed to discover configurations")?;
    log::info!("Managing {} configuration(s)", count);
    for summary in registry.summaries().await {
        log::info!(
            "  {} ({}): {} peers, {}",
            summary.name,
            summary.protocol,
            summary.total_peers,
            if summary.status { "up" } else { "down" }
        );
    }

    let token = CancellationToken::new();
    let poller = Poller::new(registry.clone(), config.scheduler.poll_interval);
    let scheduler = JobScheduler::new(
        registry.clone(),
        ctx.jobs.clone(),
        config.scheduler.job_interval,
        config.scheduler.orphan_job_max_misses,
    );
    let poller_handle = tokio::spawn(poller.run(token.clone()));
    let scheduler_handle = tokio::spawn(scheduler.run(token.clone()));

    log::info!("Daemon started successfully");

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to set up SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => log::info!("Received SIGTERM"),
        _ = sigint.recv() => log::info!("Received SIGINT"),
    }

    log::info!("Shutting down gracefully...");
    token.cancel();
    for (name, handle) in [("poller", poller_handle), ("job scheduler", scheduler_handle)] {
        if let Err(e) = handle.await {
            log::error!("The {} task failed: {}", name, e);
        }
    }
    log::info!("Shutdown complete");

    Ok(())
}
