mod aggregation;
mod api;
mod cli;
mod db;
mod metrics;
mod periods;
mod scheduler;
mod settings;
mod utils;
mod withings;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::Parser;
use log::{info, warn};

use aggregation::Aggregator;
use cli::{Cli, Commands};
use db::Database;
use scheduler::{Scheduler, SchedulerConfig};
use settings::{AppSettings, SettingsStore};
use withings::{SyncOutcome, SyncRunner, WithingsClient};

pub use aggregation::AggregationSummary;
pub use periods::{PeriodBucket, PeriodKind};

/// Wall clock used to place "now" into period buckets.
pub(crate) type Clock = Arc<dyn Fn() -> DateTime<Local> + Send + Sync>;

/// Shared handles for the HTTP handlers.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) user_id: Arc<str>,
    pub(crate) aggregator: Aggregator,
    pub(crate) sync: SyncRunner,
    pub(crate) clock: Clock,
}

impl AppState {
    pub(crate) fn new(user_id: String, aggregator: Aggregator, sync: SyncRunner) -> Self {
        Self {
            user_id: user_id.into(),
            aggregator,
            sync,
            clock: Arc::new(Local::now),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub(crate) fn now(&self) -> DateTime<Local> {
        (self.clock)()
    }
}

struct Services {
    settings: AppSettings,
    aggregator: Aggregator,
    sync: SyncRunner,
}

impl Services {
    fn build(settings: AppSettings) -> Result<Self> {
        let database = Database::new(settings.database_path.clone())?;
        let aggregator = Aggregator::new(database.clone(), settings.start_year, settings.prune_stale);
        let client = WithingsClient::new(&settings.withings)?;
        let sync = SyncRunner::new(database, client, aggregator.clone());

        Ok(Self {
            settings,
            aggregator,
            sync,
        })
    }
}

pub fn run() -> Result<()> {
    // .env first so RUST_LOG set there reaches the logger
    let dotenv = dotenvy::dotenv();
    logger().init();

    if let Err(err) = dotenv {
        if !err.not_found() {
            warn!("Failed to load .env: {err}");
        }
    }

    let cli = Cli::parse();
    let store = SettingsStore::new(cli.config.clone())?;
    info!("Resonans starting up (config {})", store.path().display());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(async move {
        let services = Services::build(store.into_settings())?;
        let user_id = services.settings.default_user_id.clone();

        match cli.command() {
            Commands::Serve => serve(services).await,
            Commands::Aggregate { period: Some(kind) } => {
                let written = services.aggregator.aggregate_period(&user_id, kind).await?;
                info!("Aggregated {written} {kind} buckets");
                Ok(())
            }
            Commands::Aggregate { period: None } => {
                let summary = services.aggregator.aggregate_all_periods(&user_id).await?;
                info!(
                    "Aggregated {} weeks, {} months, {} years from {} events",
                    summary.weeks, summary.months, summary.years, summary.events
                );
                Ok(())
            }
            Commands::Sync => report_sync(services.sync.sync(&user_id).await?),
            Commands::FullSync => report_sync(services.sync.full_sync(&user_id).await?),
        }
    })
}

/// Info by default; RUST_LOG overrides.
fn logger() -> env_logger::Builder {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(log::LevelFilter::Info)
        .parse_default_env();
    builder
}

fn report_sync(outcome: SyncOutcome) -> Result<()> {
    match outcome {
        SyncOutcome::Completed(counts) => {
            info!(
                "Synced {} weight, {} activity, {} sleep records",
                counts.weight, counts.activity, counts.sleep
            );
            Ok(())
        }
        SyncOutcome::Skipped => {
            warn!("Another sync is already running");
            Ok(())
        }
        SyncOutcome::NotConnected => Err(anyhow::anyhow!("No active Withings sensor found")),
    }
}

async fn serve(services: Services) -> Result<()> {
    let Services {
        settings,
        aggregator,
        sync,
    } = services;

    let mut scheduler = Scheduler::new(
        SchedulerConfig {
            user_id: settings.default_user_id.clone(),
            sync_interval: settings.sync_interval(),
            aggregation_time: settings.aggregation_time_of_day()?,
        },
        aggregator.clone(),
        sync.clone(),
    );
    scheduler.start();

    let state = AppState::new(settings.default_user_id.clone(), aggregator, sync);
    let listener = tokio::net::TcpListener::bind(&settings.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_address))?;
    info!("Listening on http://{}", settings.bind_address);

    let served = axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed");

    scheduler.stop().await?;
    info!("Resonans stopped");
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
