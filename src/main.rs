//! Catsync daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use catsync::adapters::catalog::HttpCatalog;
use catsync::adapters::driver;
use catsync::api::{server, ApiState};
use catsync::domain::ports::catalog::Catalog;
use catsync::infrastructure::config::ConfigLoader;
use catsync::infrastructure::logging;
use catsync::services::{
    Controller, ControllerConfig, DependencyWatcher, DriverFactory, EventStore,
    RegistrationManager, TemplateEngine, WatcherConfig,
};

#[derive(Parser)]
#[command(name = "catsync", version, about = "Catalog-driven infrastructure sync daemon")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, env = "CATSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Run every task once, then exit.
    #[arg(long)]
    once: bool,

    /// Dry-run every task once, report plans, then exit.
    #[arg(long, conflicts_with = "once")]
    inspect: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ConfigLoader::load(cli.config.as_deref()).context("Failed to load configuration")?;
    logging::init(&config.log)?;

    let catalog = Arc::new(HttpCatalog::new(&config.catalog)?);
    if let Err(err) = catalog.probe_license().await {
        tracing::warn!(error = %err, "license probe failed");
    }

    let events = Arc::new(EventStore::new(config.event_buffer_size));
    let catalog_port: Arc<dyn Catalog> = catalog.clone();
    let watcher = DependencyWatcher::new(Arc::clone(&catalog_port), WatcherConfig::default());
    let engine = TemplateEngine::new(watcher, config.working_dir.clone());

    let driver_config = config.driver.clone();
    let drivers: DriverFactory = Arc::new(move |task, template| {
        driver::new_driver(&driver_config, task, template)
    });

    let controller = Arc::new(Controller::new(
        engine,
        events,
        drivers,
        ControllerConfig {
            default_buffer: config.buffer,
            once_timeout: Duration::from_secs(config.once_timeout_secs),
        },
    ));

    controller
        .init_once(config.tasks.clone(), cli.inspect)
        .await
        .context("once-mode startup failed")?;

    if cli.once || cli.inspect {
        controller.shutdown().await;
        return Ok(());
    }

    let registration = if config.catalog.self_registration.enabled {
        let manager = RegistrationManager::new(&config, Arc::clone(&catalog_port));
        if let Err(err) = manager.register().await {
            tracing::warn!(error = %err, "self-registration failed, continuing without it");
        }
        Some(manager)
    } else {
        None
    };

    let state = ApiState {
        controller: Arc::clone(&controller),
        auth_token: config.api.auth_token.clone().map(Arc::new),
    };
    let api_config = config.api.clone();
    let mut api = tokio::spawn(async move { server::serve(state, &api_config).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            api.abort();
        }
        result = &mut api => {
            result.context("API server task panicked")??;
        }
    }

    if let Some(manager) = registration {
        if let Err(err) = manager.deregister().await {
            tracing::warn!(error = %err, "self-deregistration failed");
        }
    }
    controller.shutdown().await;
    Ok(())
}
