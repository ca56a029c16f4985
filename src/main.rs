//! Runs one exposure against the simulated camera.
//!
//! ```bash
//! exposure_sim --duration 2.5 --kind dark
//! RUST_LOG=exposure_engine=debug exposure_sim --duration 5 --fail-exposures 2
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use exposure_engine::config::EngineConfig;
use exposure_engine::exposure::{ExposureOutcome, FrameKind};
use exposure_engine::hardware::mock::MockCamera;
use exposure_engine::hardware::{ExposureStatus, SensorInfo};
use exposure_engine::logging;
use exposure_engine::session::CameraSession;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    Light,
    Dark,
    Bias,
    Flat,
}

impl From<KindArg> for FrameKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Light => FrameKind::Light,
            KindArg::Dark => FrameKind::Dark,
            KindArg::Bias => FrameKind::Bias,
            KindArg::Flat => FrameKind::Flat,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Simulated camera exposure")]
struct Args {
    /// Exposure duration in seconds
    #[arg(short, long, default_value = "2.5")]
    duration: f64,

    #[arg(short, long, value_enum, default_value = "light")]
    kind: KindArg,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "1920")]
    width: u32,

    #[arg(long, default_value = "1080")]
    height: u32,

    /// Simulate a colour sensor
    #[arg(long)]
    color: bool,

    /// Cool the sensor to this temperature first
    #[arg(long)]
    temperature: Option<f64>,

    /// Number of exposures the simulated camera reports as failed
    #[arg(long, default_value = "0")]
    fail_exposures: usize,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = EngineConfig::load(args.config.as_deref()).context("loading configuration")?;
    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }
    logging::init(&config.logging)?;

    let camera = Arc::new(MockCamera::new(args.width, args.height));
    camera.script_statuses(std::iter::repeat(ExposureStatus::Failed).take(args.fail_exposures));
    let sensor = if args.color {
        SensorInfo::color(args.width, args.height)
    } else {
        SensorInfo::mono(args.width, args.height)
    };

    let session = CameraSession::connect(camera, sensor, config).await?;

    if let Some(target) = args.temperature {
        let result = session.set_temperature(target).await?;
        info!(target, ?result, "Temperature request");
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    session.controller().on_complete(move |outcome| {
        let _ = tx.send(outcome);
    });

    let mut countdown = session.controller().time_left().subscribe();
    let countdown_task = tokio::spawn(async move {
        while countdown.changed().await.is_ok() {
            let left = *countdown.borrow_and_update();
            info!(time_left = left, "Exposure countdown");
        }
    });

    session.start_exposure(args.duration, args.kind.into())?;
    let outcome = rx.recv().await.context("exposure worker vanished")?;
    countdown_task.abort();

    let result = match outcome {
        ExposureOutcome::Complete(frame) => {
            let metadata = serde_json::to_string_pretty(&frame.metadata)?;
            info!(bytes = frame.len(), "Frame received");
            println!("{metadata}");
            Ok(())
        }
        ExposureOutcome::Failed(e) => Err(e),
        ExposureOutcome::Aborted => {
            session.disconnect().await?;
            bail!("exposure aborted");
        }
    };

    session.disconnect().await?;
    result?;
    Ok(())
}
