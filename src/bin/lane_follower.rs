use anyhow::Result;
use clap::Parser;
use lane_follower::{
    configuration,
    control_loop::start_lane_follower,
    driver::{driver_from_config, DriverKind},
    error::ErrorWrapper,
    ground_projection::CameraModel,
    ingest::start_ingest,
    logging,
    telemetry::ZenohTelemetry,
};
use std::{path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::info;
use zenoh::prelude::r#async::*;

#[derive(Parser, Debug)]
#[command(version, about = "Camera lane follower")]
struct Args {
    /// path to config
    #[arg(long)]
    config: Option<PathBuf>,

    /// Only log wheel commands
    #[arg(long)]
    dry_run: bool,

    /// Log as json lines
    #[arg(long)]
    json_logs: bool,

    /// Sets the level of verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbosity: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::setup_tracing(args.verbosity, args.json_logs);

    let mut app_config = configuration::AppConfig::load_config(&args.config)?;
    if args.dry_run {
        app_config.body.driver = DriverKind::DryRun;
    }

    let driver = driver_from_config(app_config.body.clone()).await?;

    // zenoh
    let zenoh_config = app_config.zenoh.get_zenoh_config()?;
    let zenoh_session = zenoh::open(zenoh_config)
        .res()
        .await
        .map_err(ErrorWrapper::ZenohError)?
        .into_arc();

    let topics = app_config.zenoh.topics();
    let telemetry = Arc::new(ZenohTelemetry::new(zenoh_session.clone(), topics.clone()));
    let cancellation_token = CancellationToken::new();

    let (inputs, tasks) = start_lane_follower(
        app_config.pipeline(),
        app_config.control_settings(),
        driver,
        telemetry,
        cancellation_token.clone(),
    );
    let camera = Arc::new(CameraModel::new(app_config.camera.clone()));
    start_ingest(
        zenoh_session,
        &topics,
        camera,
        inputs,
        cancellation_token.clone(),
    )
    .await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, stopping");
        }
        _ = cancellation_token.cancelled() => {
            info!("Lane follower shut down");
        }
    }
    cancellation_token.cancel();
    tasks.join().await
}
