use clap::Parser;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing_subscriber::EnvFilter;

use gesture::GestureSet;
use kinetiq_engine::{
    config::EngineConfig,
    lifecycle::{build_tasks, SensorLifecycle},
    notify::HttpNotifier,
};
use sensor::SyntheticSensor;

#[derive(Parser, Debug)]
#[command(version, about = "Body tracking analysis engine")]
struct Cli {
    /// Engine configuration (json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Gesture definitions (json)
    #[arg(long)]
    gestures: Option<PathBuf>,

    /// Stop after this many published frames
    #[arg(long)]
    frames: Option<u64>,
}

fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_env_filter(EnvFilter::from_default_env())
        .compact()
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(true)
        .with_target(false)
        .init();
}

async fn run(
    config: EngineConfig,
    gestures: GestureSet,
    frames: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let notifier = Arc::new(HttpNotifier::new(Duration::from_millis(
        config.notify.timeout_ms,
    ))?);
    let tasks = build_tasks(&config, gestures, notifier);

    let sensor = SyntheticSensor::new(config.sensor.synthetic_fps);
    let mut lifecycle = SensorLifecycle::new(sensor);
    lifecycle.start(&config.sensor, tasks)?;

    let buffer = lifecycle.buffer().clone();
    let frame_limit = async move {
        match frames {
            Some(limit) => {
                while buffer.frame_id() < limit {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = frame_limit => tracing::info!("frame limit reached"),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("interrupted");
        }
    }

    lifecycle.stop().await;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    setup_tracing();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let gestures = match &cli.gestures {
        Some(path) => GestureSet::from_file(path)?,
        None => {
            tracing::warn!("no gesture definitions given");
            GestureSet::default()
        }
    };
    tracing::info!(gestures = gestures.gestures.len(), "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config, gestures, cli.frames))
}
