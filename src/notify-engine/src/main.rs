//! Notify Engine: scheduled notification dispatch for event guests.
//!
//! Loads configuration and optional seed data, then runs the due-check
//! loop against the simulated provider until interrupted.

mod fixture;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use notify_channels::sender::SimulatedSender;
use notify_channels::templates::TemplateStore;
use notify_core::config::AppConfig;
use notify_core::directory::InMemoryDirectory;
use notify_scheduler::ScheduleEngine;
use tracing::{error, info, warn};

use crate::fixture::Fixture;

#[derive(Parser, Debug)]
#[command(name = "notify-engine")]
#[command(about = "Scheduled email, SMS and WhatsApp notifications for event guests")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, env = "NOTIFY_ENGINE_CONFIG")]
    config: Option<String>,

    /// JSON file with guests, events, templates and schedules to load
    #[arg(long, env = "NOTIFY_ENGINE_FIXTURE")]
    fixture: Option<PathBuf>,

    /// Schedules CSV to import at startup
    #[arg(long)]
    import: Option<PathBuf>,

    /// Node identifier (overrides config)
    #[arg(long, env = "NOTIFY_ENGINE__NODE_ID")]
    node_id: Option<String>,

    /// Seconds between due-checks (overrides config)
    #[arg(long, env = "NOTIFY_ENGINE__SCHEDULER__TICK_INTERVAL_SECS")]
    tick_secs: Option<u64>,

    /// Prometheus exporter port (overrides config)
    #[arg(long, env = "NOTIFY_ENGINE__METRICS__PORT")]
    metrics_port: Option<u16>,

    /// Run a single due-check and exit
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Clock for `--once`, RFC 3339 (defaults to now)
    #[arg(long, requires = "once")]
    at: Option<DateTime<Utc>>,

    /// Directory to write schedules.csv and campaigns.csv to on exit
    #[arg(long)]
    export: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "notify_engine=info,notify_scheduler=info,notify_channels=info".into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();
    info!("Notify Engine starting up");

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    if let Some(node_id) = cli.node_id.clone() {
        config.node_id = node_id;
    }
    if let Some(secs) = cli.tick_secs {
        config.scheduler.tick_interval_secs = secs;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.port = port;
    }
    info!(
        node_id = %config.node_id,
        tick_interval_secs = config.scheduler.tick_interval_secs,
        sending_timeout_secs = config.scheduler.sending_timeout_secs,
        max_concurrent_dispatches = config.scheduler.max_concurrent_dispatches,
        "Configuration loaded"
    );

    if !cli.once {
        if let Err(e) = start_metrics(&config) {
            error!(error = %e, "Failed to start metrics exporter");
        }
    }

    let mut fixture = match &cli.fixture {
        Some(path) => Fixture::load(path)?,
        None => Fixture::default(),
    };
    let templates = Arc::new(TemplateStore::new().with_multipart_sms(config.sms.allow_multipart));
    if fixture.templates.is_empty() {
        templates.seed_defaults()?;
    } else {
        fixture.install_templates(&templates)?;
    }
    let directory = Arc::new(InMemoryDirectory::new(fixture.snapshot()));
    let sender = Arc::new(SimulatedSender::new());
    info!("Using the simulated provider; no messages leave this process");

    let engine = ScheduleEngine::from_config(&config, templates, directory, sender);
    let started = cli.at.unwrap_or_else(Utc::now);
    let seeded = fixture.install_schedules(&engine, started).await?;
    if let Some(path) = &cli.import {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let imported = engine.import_csv(&data, started).await?;
        info!(count = imported.len(), path = %path.display(), "Schedules imported");
    }
    info!(schedules = engine.list().len(), seeded, "Engine ready");

    if cli.once {
        run_cycle(&engine, started).await;
    } else {
        let period = std::time::Duration::from_secs(config.scheduler.tick_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => run_cycle(&engine, Utc::now()).await,
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }
    }

    if let Some(dir) = &cli.export {
        export(&engine, dir).await?;
    }
    info!("Notify Engine stopped");
    Ok(())
}

/// One pass: fail stuck dispatches, then fire whatever is due.
async fn run_cycle(engine: &ScheduleEngine, now: DateTime<Utc>) {
    match engine.recover_stuck(now).await {
        Ok(recovered) if !recovered.is_empty() => {
            warn!(count = recovered.len(), "Recovered stuck schedules");
        }
        Ok(_) => {}
        Err(e) => error!(error = %e, "Stuck-schedule recovery failed"),
    }
    if let Err(e) = engine.tick(now).await {
        error!(error = %e, "Due-check failed");
    }
    if let Err(e) = engine.refresh_next_fire_times(now).await {
        error!(error = %e, "Could not refresh next run times");
    }
}

fn start_metrics(config: &AppConfig) -> anyhow::Result<()> {
    let addr = SocketAddr::new(config.metrics.host.parse()?, config.metrics.port);
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    info!(port = config.metrics.port, "Metrics exporter started");
    Ok(())
}

async fn export(engine: &ScheduleEngine, dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let schedules = dir.join("schedules.csv");
    std::fs::write(&schedules, engine.export_csv().await?)
        .with_context(|| format!("writing {}", schedules.display()))?;
    let campaigns = dir.join("campaigns.csv");
    std::fs::write(&campaigns, engine.export_campaigns_csv()?)
        .with_context(|| format!("writing {}", campaigns.display()))?;
    info!(dir = %dir.display(), "Exported schedules and campaigns");
    Ok(())
}
