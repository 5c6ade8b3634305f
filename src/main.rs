use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gridcast::config::Config;
use gridcast::controller::ControllerClient;
use gridcast::domain::SpanishHolidays;
use gridcast::forecast::{CsvDayArchive, FeatureExtractor, ForecastController, ObservationLog};
use gridcast::ml::{learn_all, Adwin, FileModelStore, HoeffdingTreeRegressor, ModelStore};
use gridcast::modbus::{ModbusClient, RegisterServer};
use gridcast::simulation::DeviceSimulator;
use gridcast::telemetry::{init_tracing, shutdown_token};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "gridcast")]
#[command(author, version, about = "Next-day demand forecasting and grid pre-charge control")]
struct Cli {
    /// Extra TOML file layered over config/default.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the device register block and replay the consumption trace
    Simulate {
        /// Consumption trace (overrides data.trace_path)
        #[arg(long)]
        trace: Option<PathBuf>,
    },

    /// Poll the device, forecast daily demand and drive the grid connection
    Control {
        /// Historical observations (overrides data.history_path)
        #[arg(long)]
        history: Option<PathBuf>,
    },

    /// Train a fresh model over a whole historical file and persist it
    Train {
        /// Historical observations (overrides data.history_path)
        #[arg(long)]
        history: Option<PathBuf>,

        /// Model file to write (overrides forecast.model_path)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let cfg = Config::load(cli.config.as_deref())?;
    init_tracing(cfg.logging.json);

    match cli.command {
        Commands::Simulate { trace } => simulate(&cfg, trace).await,
        Commands::Control { history } => control(&cfg, history).await,
        Commands::Train { history, output } => train(&cfg, history, output),
    }
}

fn extractor() -> FeatureExtractor {
    FeatureExtractor::new(Arc::new(SpanishHolidays))
}

fn load_observations(path: &std::path::Path) -> Result<ObservationLog> {
    let log = ObservationLog::from_csv_path(path, &extractor())
        .with_context(|| format!("failed to read observations from {}", path.display()))?;
    if log.is_empty() {
        anyhow::bail!("{} contains no observations", path.display());
    }
    Ok(log)
}

async fn simulate(cfg: &Config, trace: Option<PathBuf>) -> Result<()> {
    let trace_path = trace.unwrap_or_else(|| cfg.data.trace_path.clone());
    let trace = load_observations(&trace_path)?;
    info!(path = %trace_path.display(), days = trace.days(), "loaded consumption trace");

    let mut simulator = DeviceSimulator::new(cfg.device_config(), trace.iter().cloned().collect());
    let server = RegisterServer::bind(&cfg.device.addr())
        .await
        .with_context(|| format!("failed to bind register server on {}", cfg.device.addr()))?;

    let shutdown = shutdown_token();
    let server_task = tokio::spawn(server.serve(simulator.block(), shutdown.clone()));

    let tick = Duration::from_secs_f64(cfg.simulation.seconds_per_hour);
    simulator.run(tick, shutdown.clone()).await;

    shutdown.cancel();
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "register server failed"),
        Err(e) => warn!(error = %e, "register server task panicked"),
    }
    info!("simulation complete");
    Ok(())
}

async fn control(cfg: &Config, history: Option<PathBuf>) -> Result<()> {
    let history_path = history.unwrap_or_else(|| cfg.data.history_path.clone());
    let source = load_observations(&history_path)?;
    info!(
        path = %history_path.display(),
        days = source.days(),
        "loaded historical source"
    );

    let device = ModbusClient::connect_with_timeout(
        &cfg.device.addr(),
        cfg.device.unit_id,
        cfg.device.timeout(),
    )
    .await
    .with_context(|| format!("device at {} is unreachable", cfg.device.addr()))?;

    let archive = CsvDayArchive::new(&cfg.forecast.history_dir).with_context(|| {
        format!(
            "failed to create history directory {}",
            cfg.forecast.history_dir.display()
        )
    })?;
    let forecaster = ForecastController::new(
        HoeffdingTreeRegressor::new(cfg.model),
        Adwin::new(cfg.drift),
        Box::new(FileModelStore::<HoeffdingTreeRegressor>::new(&cfg.forecast.model_path)),
        Arc::new(source),
        extractor(),
        cfg.forecast_settings(),
    )
    .with_archive(Box::new(archive));

    let mut client = ControllerClient::new(
        Arc::new(device),
        forecaster,
        cfg.policy(),
        cfg.battery.capacity_kwh,
    );
    client
        .run(
            Duration::from_secs_f64(cfg.control.poll_seconds),
            Duration::from_secs_f64(cfg.control.retry_delay_seconds),
            shutdown_token(),
        )
        .await?;

    info!("controller stopped");
    Ok(())
}

fn train(cfg: &Config, history: Option<PathBuf>, output: Option<PathBuf>) -> Result<()> {
    let history_path = history.unwrap_or_else(|| cfg.data.history_path.clone());
    let output = output.unwrap_or_else(|| cfg.forecast.model_path.clone());
    let log = load_observations(&history_path)?;

    let mut model = HoeffdingTreeRegressor::new(cfg.model);
    let samples = learn_all(&mut model, log.iter());

    FileModelStore::<HoeffdingTreeRegressor>::new(&output)
        .save(&model)
        .with_context(|| format!("failed to write model to {}", output.display()))?;

    info!(
        samples,
        days = log.days(),
        leaves = model.n_leaves(),
        depth = model.depth(),
        path = %output.display(),
        "trained model"
    );
    Ok(())
}
