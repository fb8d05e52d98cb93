//! Inbound zenoh topics feeding a running lane follower.

use crate::{
    control_loop::{ControlSignal, LaneFollowerInputs, OdometrySample},
    error::ErrorWrapper,
    frame::Frame,
    ground_projection::CameraModel,
    lane_filter::MotionInput,
    telemetry::Topics,
    util::LatestSender,
};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use zenoh::{prelude::r#async::*, subscriber::FlumeSubscriber, Session, SessionDeclarations};

/// Subscribe to camera frames, odometry and control signals
pub async fn start_ingest(
    zenoh_session: Arc<Session>,
    topics: &Topics,
    camera: Arc<CameraModel>,
    inputs: LaneFollowerInputs,
    cancellation_token: CancellationToken,
) -> Result<()> {
    let LaneFollowerInputs {
        frames,
        odometry,
        signals,
    } = inputs;
    let mut frame_subscriber = zenoh_session
        .declare_subscriber(&topics.frame)
        .res()
        .await
        .map_err(ErrorWrapper::ZenohError)?;
    let mut odometry_subscriber = zenoh_session
        .declare_subscriber(&topics.odometry)
        .res()
        .await
        .map_err(ErrorWrapper::ZenohError)?;
    let mut signal_subscriber = zenoh_session
        .declare_subscriber(&topics.signal)
        .res()
        .await
        .map_err(ErrorWrapper::ZenohError)?;
    info!(
        frames = %topics.frame,
        odometry = %topics.odometry,
        signals = %topics.signal,
        "Listening"
    );

    tokio::spawn({
        let cancellation_token = cancellation_token.clone();
        async move {
            tokio::select! {
                _ = cancellation_token.cancelled() => {}
                result = run_frame_listener(&mut frame_subscriber, &frames, &camera) => {
                    if let Err(err) = result {
                        error!("Frame listener failed with {:?}", err);
                    }
                }
            }
        }
    });

    tokio::spawn({
        let cancellation_token = cancellation_token.clone();
        async move {
            tokio::select! {
                _ = cancellation_token.cancelled() => {}
                result = run_odometry_listener(&mut odometry_subscriber, &odometry) => {
                    if let Err(err) = result {
                        error!("Odometry listener failed with {:?}", err);
                    }
                }
            }
        }
    });

    tokio::spawn(async move {
        tokio::select! {
            _ = cancellation_token.cancelled() => {}
            result = run_signal_listener(&mut signal_subscriber, &signals) => {
                if let Err(err) = result {
                    error!("Signal listener failed with {:?}", err);
                }
            }
        }
    });

    Ok(())
}

/// Runs until the lane follower stops taking frames
async fn run_frame_listener(
    subscriber: &mut FlumeSubscriber<'_>,
    frames: &LatestSender<Frame>,
    camera: &Arc<CameraModel>,
) -> Result<()> {
    loop {
        let sample = subscriber.recv_async().await?;
        let payload = sample.value.payload.contiguous();
        match Frame::decode(&payload, camera.clone()) {
            Ok(frame) => {
                if frames.send(frame).is_err() {
                    info!("Lane follower stopped taking frames");
                    return Ok(());
                }
            }
            Err(err) => warn!(%err, "Dropping undecodable frame"),
        }
    }
}

async fn run_odometry_listener(
    subscriber: &mut FlumeSubscriber<'_>,
    odometry: &watch::Sender<Option<OdometrySample>>,
) -> Result<()> {
    loop {
        let sample = subscriber.recv_async().await?;
        let message: String = match sample.value.try_into() {
            Ok(message) => message,
            Err(err) => {
                warn!(%err, "Odometry is not text");
                continue;
            }
        };
        match serde_json::from_str::<MotionInput>(&message) {
            Ok(motion) => {
                odometry.send_replace(Some(OdometrySample::new(motion)));
            }
            Err(err) => warn!(%err, "Ignoring malformed odometry"),
        }
    }
}

/// Runs until the control task stops taking signals
async fn run_signal_listener(
    subscriber: &mut FlumeSubscriber<'_>,
    signals: &mpsc::Sender<ControlSignal>,
) -> Result<()> {
    loop {
        let sample = subscriber.recv_async().await?;
        let message: String = match sample.value.try_into() {
            Ok(message) => message,
            Err(err) => {
                warn!(%err, "Control signal is not text");
                continue;
            }
        };
        match message.parse::<ControlSignal>() {
            Ok(signal) => {
                info!(?signal, "Received control signal");
                if signals.send(signal).await.is_err() {
                    return Ok(());
                }
            }
            Err(err) => warn!(%err, "Ignoring control signal"),
        }
    }
}
