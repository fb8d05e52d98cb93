//! Perception and control tasks and the plumbing between them.
//!
//! Frames arrive through a latest value channel, so a slow perception cycle only
//! ever works on the newest frame. Perception hands its estimate to the control
//! task through a watch channel and the control task runs on a fixed period,
//! independent of the camera rate.

use crate::{
    control::{ControlCommand, ControllerConfig, LaneController},
    driver::WheelDriver,
    error::LaneError,
    frame::Frame,
    kinematics::{DifferentialDrive, KinematicsConfig, WheelCommand},
    lane_filter::{LanePose, MotionInput, PoseRate},
    pipeline::LanePipeline,
    stop_line::{StopLine, StopLineConfig, StopLineHold},
    telemetry::TelemetrySink,
    tracking::{LaneStatus, TrackingMonitor},
    util::{latest_value_channel, LatestReceiver, LatestSender},
};
use anyhow::Result;
use serde::Deserialize;
use std::{ops::ControlFlow, str::FromStr, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval, timeout, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ControlLoopConfig {
    pub period_ms: u64,
    /// estimates older than this count as lane lost
    pub frame_timeout_ms: u64,
    /// odometry older than this is ignored in favor of the last command
    pub odometry_timeout_ms: u64,
    /// how many times the stop command is sent on shutdown
    pub stop_repeat: u32,
}

impl Default for ControlLoopConfig {
    fn default() -> Self {
        Self {
            period_ms: 50,
            frame_timeout_ms: 500,
            odometry_timeout_ms: 200,
            stop_repeat: 3,
        }
    }
}

impl ControlLoopConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn odometry_timeout(&self) -> Duration {
        Duration::from_millis(self.odometry_timeout_ms)
    }
}

/// Settings of everything downstream of perception
#[derive(Debug, Clone, Default)]
pub struct ControlSettings {
    pub controller: ControllerConfig,
    pub stop_line: StopLineConfig,
    pub kinematics: KinematicsConfig,
    pub control_loop: ControlLoopConfig,
}

/// Latest perception result as seen by the control task
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerceptionSnapshot {
    pub pose: LanePose,
    pub rate: PoseRate,
    pub uncertainty: f32,
    pub lane_lost: bool,
    pub stop_line: Option<StopLine>,
    pub received: Instant,
    /// reinitialization the estimate belongs to
    pub epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OdometrySample {
    pub motion: MotionInput,
    pub received: Instant,
}

impl OdometrySample {
    pub fn new(motion: MotionInput) -> Self {
        Self {
            motion,
            received: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// leave safe stop and start from scratch
    Reinitialize,
    /// stop and stay stopped until reinitialized
    Stop,
    /// stop and exit
    Shutdown,
}

impl FromStr for ControlSignal {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reinit" | "reinitialize" => Ok(ControlSignal::Reinitialize),
            "stop" => Ok(ControlSignal::Stop),
            "shutdown" => Ok(ControlSignal::Shutdown),
            other => Err(anyhow::anyhow!("Unknown control signal {:?}", other)),
        }
    }
}

/// Everything a running lane follower takes input from
pub struct LaneFollowerInputs {
    pub frames: LatestSender<Frame>,
    pub odometry: watch::Sender<Option<OdometrySample>>,
    pub signals: mpsc::Sender<ControlSignal>,
}

pub struct LaneFollowerTasks {
    perception: JoinHandle<Result<()>>,
    control: JoinHandle<Result<()>>,
}

impl LaneFollowerTasks {
    /// Wait for both tasks to finish
    pub async fn join(self) -> Result<()> {
        let control_result = self.control.await;
        let perception_result = self.perception.await;
        control_result??;
        perception_result??;
        Ok(())
    }
}

pub fn start_lane_follower(
    pipeline: LanePipeline,
    settings: ControlSettings,
    driver: Box<dyn WheelDriver>,
    telemetry: Arc<dyn TelemetrySink>,
    cancellation_token: CancellationToken,
) -> (LaneFollowerInputs, LaneFollowerTasks) {
    let (frame_sender, frame_receiver) = latest_value_channel();
    let (odometry_sender, odometry_receiver) = watch::channel(None);
    let (signal_sender, signal_receiver) = mpsc::channel(8);
    let (snapshot_sender, snapshot_receiver) = watch::channel(None);
    let (motion_sender, motion_receiver) = watch::channel(MotionInput::default());
    let (epoch_sender, epoch_receiver) = watch::channel(0);

    let perception = tokio::spawn({
        let cancellation_token = cancellation_token.clone();
        let odometry_timeout = settings.control_loop.odometry_timeout();
        async move {
            let result = run_perception(
                pipeline,
                frame_receiver,
                PerceptionLinks {
                    snapshots: snapshot_sender,
                    motion: motion_receiver,
                    odometry: odometry_receiver,
                    epoch: epoch_receiver,
                },
                odometry_timeout,
                cancellation_token,
            )
            .await;
            if let Err(err) = &result {
                error!("Perception task failed with {:?}", err);
            }
            result
        }
    });

    let control = tokio::spawn({
        let mut control_task = ControlTask::new(
            settings,
            driver,
            telemetry,
            snapshot_receiver,
            motion_sender,
            epoch_sender,
        );
        async move {
            let result = control_task
                .run(signal_receiver, cancellation_token.clone())
                .await;
            // perception has nothing to do without control
            cancellation_token.cancel();
            if let Err(err) = &result {
                error!("Control task failed with {:?}", err);
            }
            result
        }
    });

    (
        LaneFollowerInputs {
            frames: frame_sender,
            odometry: odometry_sender,
            signals: signal_sender,
        },
        LaneFollowerTasks {
            perception,
            control,
        },
    )
}

struct PerceptionLinks {
    snapshots: watch::Sender<Option<PerceptionSnapshot>>,
    motion: watch::Receiver<MotionInput>,
    odometry: watch::Receiver<Option<OdometrySample>>,
    epoch: watch::Receiver<u64>,
}

async fn run_perception(
    mut pipeline: LanePipeline,
    frames: LatestReceiver<Frame>,
    mut links: PerceptionLinks,
    odometry_timeout: Duration,
    cancellation_token: CancellationToken,
) -> Result<()> {
    let mut epoch = *links.epoch.borrow_and_update();
    let mut reported_dropped = 0;
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => break,
            frame = frames.recv() => match frame {
                Ok(frame) => frame,
                Err(_) => {
                    info!("Frame source closed");
                    break;
                }
            },
        };

        let dropped = frames.dropped();
        if dropped != reported_dropped {
            debug!(dropped, "Perception is behind, dropped frames");
            reported_dropped = dropped;
        }

        if links.epoch.has_changed().unwrap_or(false) {
            epoch = *links.epoch.borrow_and_update();
            pipeline.reinitialize();
        }

        let motion = motion_input(
            *links.odometry.borrow(),
            *links.motion.borrow(),
            odometry_timeout,
        );

        // image processing is cpu bound, keep it off the async workers
        let (returned, result) = tokio::task::spawn_blocking(move || {
            let result = pipeline.process(&frame, motion);
            (pipeline, result)
        })
        .await?;
        pipeline = returned;

        match result {
            Ok(output) => {
                links.snapshots.send_replace(Some(PerceptionSnapshot {
                    pose: output.estimate.pose,
                    rate: output.estimate.rate,
                    uncertainty: pipeline.estimator().state().uncertainty(),
                    lane_lost: output.estimate.lane_lost,
                    stop_line: output.stop_line,
                    received: Instant::now(),
                    epoch,
                }));
            }
            Err(err) => warn!(%err, "Skipping frame"),
        }
    }
    Ok(())
}

/// Measured odometry while it is fresh, otherwise the last command
fn motion_input(
    odometry: Option<OdometrySample>,
    commanded: MotionInput,
    odometry_timeout: Duration,
) -> MotionInput {
    match odometry {
        Some(sample) if sample.received.elapsed() <= odometry_timeout => sample.motion,
        _ => commanded,
    }
}

enum CycleOutcome {
    Finished(Result<Result<ControlCommand>, tokio::time::error::Elapsed>),
    Interrupted(ControlSignal),
}

struct ControlTask {
    config: ControlLoopConfig,
    controller: LaneController,
    monitor: TrackingMonitor,
    stop_hold: StopLineHold,
    drive: DifferentialDrive,
    driver: Box<dyn WheelDriver>,
    telemetry: Arc<dyn TelemetrySink>,
    snapshots: watch::Receiver<Option<PerceptionSnapshot>>,
    motion: watch::Sender<MotionInput>,
    epoch: watch::Sender<u64>,
    started: Instant,
    last_command: ControlCommand,
    published_status: Option<LaneStatus>,
}

impl ControlTask {
    fn new(
        settings: ControlSettings,
        driver: Box<dyn WheelDriver>,
        telemetry: Arc<dyn TelemetrySink>,
        snapshots: watch::Receiver<Option<PerceptionSnapshot>>,
        motion: watch::Sender<MotionInput>,
        epoch: watch::Sender<u64>,
    ) -> Self {
        Self {
            monitor: TrackingMonitor::new(settings.controller.safe_stop_after()),
            controller: LaneController::new(settings.controller),
            stop_hold: StopLineHold::new(settings.stop_line),
            drive: DifferentialDrive::new(settings.kinematics),
            config: settings.control_loop,
            driver,
            telemetry,
            snapshots,
            motion,
            epoch,
            started: Instant::now(),
            last_command: ControlCommand::stop(Duration::ZERO),
            published_status: None,
        }
    }

    async fn run(
        &mut self,
        mut signals: mpsc::Receiver<ControlSignal>,
        cancellation_token: CancellationToken,
    ) -> Result<()> {
        let period = self.config.period();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_tick = Instant::now();
        info!(?period, "Control loop started");

        loop {
            tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => break,
                Some(signal) = signals.recv() => {
                    if self.handle_signal(signal).await.is_break() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            let cycle_start = Instant::now();
            let dt = cycle_start.duration_since(last_tick);
            last_tick = cycle_start;

            // cancellation and signals do not wait for a cycle in flight
            let outcome = tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => break,
                Some(signal) = signals.recv() => CycleOutcome::Interrupted(signal),
                result = timeout(period, self.cycle(dt)) => CycleOutcome::Finished(result),
            };

            match outcome {
                CycleOutcome::Finished(Ok(Ok(command))) => self.last_command = command,
                CycleOutcome::Finished(Ok(Err(err))) => warn!(%err, "Control cycle failed"),
                CycleOutcome::Finished(Err(_)) => {
                    self.repeat_last_command(cycle_start.elapsed(), period).await
                }
                CycleOutcome::Interrupted(signal) => {
                    debug!(?signal, "Control cycle interrupted");
                    if self.handle_signal(signal).await.is_break() {
                        break;
                    }
                }
            }
        }

        self.emergency_stop().await;
        Ok(())
    }

    async fn handle_signal(&mut self, signal: ControlSignal) -> ControlFlow<()> {
        match signal {
            ControlSignal::Reinitialize => {
                self.epoch.send_modify(|epoch| *epoch += 1);
                self.monitor.reinitialize();
                self.controller.reset();
                self.stop_hold.reset();
            }
            ControlSignal::Stop => {
                self.monitor.safe_stop();
                self.emergency_stop().await;
            }
            ControlSignal::Shutdown => {
                info!("Shutdown requested");
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Overrun cycle. Send the previous command again, or stop once in safe stop.
    async fn repeat_last_command(&mut self, elapsed: Duration, period: Duration) {
        let overrun = LaneError::DeadlineExceeded { elapsed, period };
        let command = if self.monitor.status().is_stopped() {
            ControlCommand::stop(self.timestamp())
        } else {
            self.last_command
        };
        warn!(error = %overrun, stop = command.is_stop(), "Repeating last command");
        let wheels = self.drive.wheel_command(&command);
        match timeout(period, self.driver.send(wheels)).await {
            Ok(Ok(())) => {
                self.motion.send_replace(MotionInput {
                    linear_velocity: command.linear_velocity,
                    angular_velocity: command.angular_velocity,
                });
                self.last_command = command;
            }
            Ok(Err(err)) => warn!(%err, "Failed to repeat last command"),
            Err(_) => warn!(?period, "Repeating last command timed out"),
        }
    }

    fn timestamp(&self) -> Duration {
        self.started.elapsed()
    }

    async fn cycle(&mut self, dt: Duration) -> Result<ControlCommand> {
        let epoch = *self.epoch.borrow();
        let snapshot_changed = self.snapshots.has_changed().unwrap_or(false);
        let snapshot = (*self.snapshots.borrow_and_update()).filter(|snapshot| snapshot.epoch == epoch);
        let timestamp = self.timestamp();

        let command = match snapshot {
            // nothing seen since start or reinit yet
            None => ControlCommand::stop(timestamp),
            Some(snapshot) => {
                let stale = snapshot.received.elapsed() > self.config.frame_timeout();
                if stale {
                    debug!(age = ?snapshot.received.elapsed(), "Perception estimate is stale");
                }
                let status = self.monitor.update(snapshot.lane_lost || stale, dt);
                self.publish_status(status).await;

                let stop_line = if status == LaneStatus::Tracking && !stale {
                    snapshot.stop_line
                } else {
                    None
                };
                let holding = self.stop_hold.update(stop_line, dt);
                if snapshot_changed && !stale {
                    if let Err(err) = self
                        .telemetry
                        .publish_pose(&snapshot.pose, snapshot.uncertainty)
                        .await
                    {
                        warn!(%err, "Failed to publish pose");
                    }
                }

                let rate = if stale {
                    PoseRate::default()
                } else {
                    snapshot.rate
                };
                if holding {
                    self.controller.hold(status, timestamp)
                } else {
                    self.controller
                        .compute(&snapshot.pose, &rate, status, dt, timestamp)
                }
            }
        };

        let wheels = self.drive.wheel_command(&command);
        self.driver.send(wheels).await?;
        self.motion.send_replace(MotionInput {
            linear_velocity: command.linear_velocity,
            angular_velocity: command.angular_velocity,
        });
        if let Err(err) = self.telemetry.publish_command(&command).await {
            warn!(%err, "Failed to publish command");
        }
        Ok(command)
    }

    async fn publish_status(&mut self, status: LaneStatus) {
        if self.published_status == Some(status) {
            return;
        }
        match self.telemetry.publish_status(status).await {
            Ok(()) => self.published_status = Some(status),
            Err(err) => warn!(%err, "Failed to publish status"),
        }
    }

    /// Make sure the wheels stop, even if some sends get lost
    async fn emergency_stop(&mut self) {
        info!(repeat = self.config.stop_repeat, "Stopping wheels");
        let period = self.config.period();
        for _ in 0..self.config.stop_repeat {
            match timeout(period, self.driver.send(WheelCommand::stop())).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(%err, "Failed to send stop command"),
                Err(_) => error!("Sending stop command timed out"),
            }
        }
        let command = ControlCommand::stop(self.timestamp());
        self.motion.send_replace(MotionInput::default());
        if let Err(err) = self.telemetry.publish_command(&command).await {
            warn!(%err, "Failed to publish stop command");
        }
        self.last_command = command;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        lane_filter::EstimatorConfig,
        preprocessing::PreprocessorConfig,
        segment_detector::DetectorConfig,
        test_support::SyntheticLane,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Clone, Default)]
    struct RecordingDriver {
        sent: Arc<Mutex<Vec<WheelCommand>>>,
        /// time every send takes after it was recorded
        delay: Duration,
        started: Arc<Notify>,
    }

    impl RecordingDriver {
        fn sent(&self) -> Vec<WheelCommand> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WheelDriver for RecordingDriver {
        async fn send(&mut self, command: WheelCommand) -> Result<()> {
            self.sent.lock().unwrap().push(command);
            self.started.notify_one();
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingTelemetry {
        statuses: Mutex<Vec<LaneStatus>>,
        poses: Mutex<Vec<LanePose>>,
        commands: Mutex<Vec<ControlCommand>>,
        /// status publishing never completes
        stall_status: bool,
    }

    impl RecordingTelemetry {
        fn statuses(&self) -> Vec<LaneStatus> {
            self.statuses.lock().unwrap().clone()
        }

        fn commands(&self) -> Vec<ControlCommand> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TelemetrySink for RecordingTelemetry {
        async fn publish_pose(&self, pose: &LanePose, _uncertainty: f32) -> Result<()> {
            self.poses.lock().unwrap().push(*pose);
            Ok(())
        }

        async fn publish_status(&self, status: LaneStatus) -> Result<()> {
            if self.stall_status {
                std::future::pending::<()>().await;
            }
            self.statuses.lock().unwrap().push(status);
            Ok(())
        }

        async fn publish_command(&self, command: &ControlCommand) -> Result<()> {
            self.commands.lock().unwrap().push(*command);
            Ok(())
        }
    }

    fn pipeline() -> LanePipeline {
        LanePipeline::new(
            PreprocessorConfig::default(),
            DetectorConfig::default(),
            StopLineConfig::default(),
            EstimatorConfig::default(),
        )
    }

    fn settings() -> ControlSettings {
        ControlSettings {
            controller: ControllerConfig {
                safe_stop_after_ms: 150,
                ..Default::default()
            },
            control_loop: ControlLoopConfig {
                period_ms: 10,
                frame_timeout_ms: 60,
                odometry_timeout_ms: 100,
                stop_repeat: 3,
            },
            ..Default::default()
        }
    }

    /// Control task on its own, fed snapshots directly
    fn control_task(
        settings: ControlSettings,
        driver: &RecordingDriver,
        telemetry: &Arc<RecordingTelemetry>,
    ) -> (ControlTask, watch::Sender<Option<PerceptionSnapshot>>) {
        let (snapshot_sender, snapshot_receiver) = watch::channel(None);
        let (motion_sender, _) = watch::channel(MotionInput::default());
        let (epoch_sender, _) = watch::channel(0);
        let task = ControlTask::new(
            settings,
            Box::new(driver.clone()),
            telemetry.clone(),
            snapshot_receiver,
            motion_sender,
            epoch_sender,
        );
        (task, snapshot_sender)
    }

    fn snapshot(lane_lost: bool) -> PerceptionSnapshot {
        PerceptionSnapshot {
            pose: LanePose {
                d: 0.02,
                phi: -0.05,
                timestamp: Duration::ZERO,
            },
            rate: PoseRate::default(),
            uncertainty: 0.01,
            lane_lost,
            stop_line: None,
            received: Instant::now(),
            epoch: 0,
        }
    }

    fn spawn_control(
        mut task: ControlTask,
        cancellation_token: &CancellationToken,
    ) -> (mpsc::Sender<ControlSignal>, JoinHandle<Result<()>>) {
        let (signal_sender, signal_receiver) = mpsc::channel(1);
        let cancellation_token = cancellation_token.clone();
        let handle =
            tokio::spawn(async move { task.run(signal_receiver, cancellation_token).await });
        (signal_sender, handle)
    }

    struct Harness {
        inputs: LaneFollowerInputs,
        tasks: LaneFollowerTasks,
        driver: RecordingDriver,
        telemetry: Arc<RecordingTelemetry>,
        cancellation_token: CancellationToken,
        frame_time: Duration,
    }

    impl Harness {
        fn start() -> Self {
            let driver = RecordingDriver::default();
            let telemetry = Arc::new(RecordingTelemetry::default());
            let cancellation_token = CancellationToken::new();
            let (inputs, tasks) = start_lane_follower(
                pipeline(),
                settings(),
                Box::new(driver.clone()),
                telemetry.clone(),
                cancellation_token.clone(),
            );
            Self {
                inputs,
                tasks,
                driver,
                telemetry,
                cancellation_token,
                frame_time: Duration::ZERO,
            }
        }

        async fn feed(&mut self, lane: &SyntheticLane, count: usize) {
            for _ in 0..count {
                self.frame_time += Duration::from_millis(20);
                let frame = lane.clone().at(self.frame_time).render();
                self.inputs.frames.send(frame).unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }

    #[test]
    fn parses_signals() {
        assert_eq!(
            "reinit".parse::<ControlSignal>().unwrap(),
            ControlSignal::Reinitialize
        );
        assert_eq!(" STOP\n".parse::<ControlSignal>().unwrap(), ControlSignal::Stop);
        assert_eq!(
            "shutdown".parse::<ControlSignal>().unwrap(),
            ControlSignal::Shutdown
        );
        assert!("jump".parse::<ControlSignal>().is_err());
    }

    #[tokio::test]
    async fn drives_forward_on_centered_lane_and_stops_on_cancel() {
        let mut harness = Harness::start();
        harness.feed(&SyntheticLane::default(), 10).await;
        harness.cancellation_token.cancel();
        let Harness {
            tasks,
            driver,
            telemetry,
            ..
        } = harness;
        tasks.join().await.unwrap();

        let sent = driver.sent();
        assert!(sent
            .iter()
            .any(|wheels| wheels.left > 0.0 && wheels.right > 0.0));
        // stop burst at the end
        assert!(sent.len() >= 3);
        assert!(sent[sent.len() - 3..]
            .iter()
            .all(|wheels| *wheels == WheelCommand::stop()));
        assert_eq!(telemetry.statuses().first(), Some(&LaneStatus::Tracking));
        assert!(!telemetry.poses.lock().unwrap().is_empty());
        let last = *telemetry.commands.lock().unwrap().last().unwrap();
        assert!(last.is_stop());
    }

    #[tokio::test]
    async fn waits_without_frames() {
        let harness = Harness::start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        harness.cancellation_token.cancel();
        let Harness { tasks, driver, .. } = harness;
        tasks.join().await.unwrap();
        assert!(driver
            .sent()
            .iter()
            .all(|wheels| *wheels == WheelCommand::stop()));
    }

    #[tokio::test]
    async fn camera_silence_ends_in_safe_stop_until_reinit() {
        let mut harness = Harness::start();
        harness.feed(&SyntheticLane::default(), 5).await;
        // camera goes quiet
        tokio::time::sleep(Duration::from_millis(400)).await;
        let statuses = harness.telemetry.statuses();
        assert!(statuses.contains(&LaneStatus::LaneLost));
        assert_eq!(statuses.last(), Some(&LaneStatus::SafeStop));
        let stopped_at = harness.driver.sent().len();

        // frames alone do not leave safe stop
        harness.feed(&SyntheticLane::default(), 5).await;
        assert_eq!(harness.telemetry.statuses().last(), Some(&LaneStatus::SafeStop));
        assert!(harness.driver.sent()[stopped_at..]
            .iter()
            .all(|wheels| *wheels == WheelCommand::stop()));

        harness
            .inputs
            .signals
            .send(ControlSignal::Reinitialize)
            .await
            .unwrap();
        harness.feed(&SyntheticLane::default(), 10).await;
        assert_eq!(harness.telemetry.statuses().last(), Some(&LaneStatus::Tracking));

        harness.cancellation_token.cancel();
        harness.tasks.join().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_signal_stops_both_tasks() {
        let mut harness = Harness::start();
        harness.feed(&SyntheticLane::default(), 5).await;
        harness
            .inputs
            .signals
            .send(ControlSignal::Shutdown)
            .await
            .unwrap();
        let Harness { tasks, driver, .. } = harness;
        tasks.join().await.unwrap();
        let sent = driver.sent();
        assert!(sent[sent.len() - 3..]
            .iter()
            .all(|wheels| *wheels == WheelCommand::stop()));
    }

    #[tokio::test]
    async fn stop_signal_holds_vehicle() {
        let mut harness = Harness::start();
        harness.feed(&SyntheticLane::default(), 5).await;
        harness.inputs.signals.send(ControlSignal::Stop).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let stopped_at = harness.driver.sent().len();
        harness.feed(&SyntheticLane::default(), 5).await;
        assert!(harness.driver.sent()[stopped_at..]
            .iter()
            .all(|wheels| *wheels == WheelCommand::stop()));
        assert_eq!(harness.telemetry.statuses().last(), Some(&LaneStatus::SafeStop));
        harness.cancellation_token.cancel();
        harness.tasks.join().await.unwrap();
    }

    #[tokio::test]
    async fn odometry_is_preferred_until_it_goes_stale() {
        let commanded = MotionInput {
            linear_velocity: 0.2,
            angular_velocity: 0.0,
        };
        let measured = MotionInput {
            linear_velocity: 0.15,
            angular_velocity: 0.3,
        };
        let odometry_timeout = settings().control_loop.odometry_timeout();
        let sample = Some(OdometrySample::new(measured));
        assert_eq!(motion_input(sample, commanded, odometry_timeout), measured);
        assert_eq!(motion_input(None, commanded, odometry_timeout), commanded);

        tokio::time::sleep(odometry_timeout + Duration::from_millis(20)).await;
        assert_eq!(motion_input(sample, commanded, odometry_timeout), commanded);
    }

    #[tokio::test]
    async fn overrun_cycle_repeats_last_command() {
        let driver = RecordingDriver::default();
        let telemetry = Arc::new(RecordingTelemetry {
            stall_status: true,
            ..Default::default()
        });
        let (mut task, snapshots) = control_task(settings(), &driver, &telemetry);
        let driving = ControlCommand {
            angular_velocity: 0.5,
            linear_velocity: 0.2,
            timestamp: Duration::ZERO,
        };
        task.last_command = driving;
        let expected = task.drive.wheel_command(&driving);
        snapshots.send_replace(Some(snapshot(false)));

        let cancellation_token = CancellationToken::new();
        let (_signals, handle) = spawn_control(task, &cancellation_token);
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancellation_token.cancel();
        handle.await.unwrap().unwrap();

        let sent = driver.sent();
        let (repeated, burst) = sent.split_at(sent.len() - 3);
        assert!(!repeated.is_empty());
        assert!(repeated.iter().all(|wheels| *wheels == expected));
        assert!(burst.iter().all(|wheels| *wheels == WheelCommand::stop()));
        // only the stop burst is published, overrun cycles never get that far
        assert_eq!(telemetry.commands().len(), 1);
    }

    #[tokio::test]
    async fn overrun_cycle_in_safe_stop_sends_stop() {
        let driver = RecordingDriver::default();
        let telemetry = Arc::new(RecordingTelemetry {
            stall_status: true,
            ..Default::default()
        });
        let mut settings = settings();
        settings.controller.safe_stop_after_ms = 0;
        let (mut task, snapshots) = control_task(settings, &driver, &telemetry);
        task.last_command = ControlCommand {
            angular_velocity: 0.5,
            linear_velocity: 0.2,
            timestamp: Duration::ZERO,
        };
        snapshots.send_replace(Some(snapshot(true)));

        let cancellation_token = CancellationToken::new();
        let (_signals, handle) = spawn_control(task, &cancellation_token);
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancellation_token.cancel();
        handle.await.unwrap().unwrap();

        let sent = driver.sent();
        assert!(sent.len() > 3);
        assert!(sent.iter().all(|wheels| *wheels == WheelCommand::stop()));
    }

    #[tokio::test]
    async fn cancel_does_not_wait_for_slow_cycle() {
        let driver = RecordingDriver {
            delay: Duration::from_millis(35),
            ..Default::default()
        };
        let telemetry = Arc::new(RecordingTelemetry::default());
        let mut settings = settings();
        settings.control_loop.period_ms = 50;
        let (task, _snapshots) = control_task(settings, &driver, &telemetry);

        let cancellation_token = CancellationToken::new();
        let (_signals, handle) = spawn_control(task, &cancellation_token);
        // first cycle is in the middle of its send
        driver.started.notified().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(telemetry.commands().is_empty());
        cancellation_token.cancel();
        handle.await.unwrap().unwrap();

        // the interrupted cycle publishes nothing, the stop burst follows right away
        let commands = telemetry.commands();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].is_stop());
        assert_eq!(driver.sent().len(), 1 + 3);
    }

    #[tokio::test]
    async fn stop_signal_interrupts_slow_cycle() {
        let driver = RecordingDriver {
            delay: Duration::from_millis(35),
            ..Default::default()
        };
        let telemetry = Arc::new(RecordingTelemetry::default());
        let mut settings = settings();
        settings.control_loop.period_ms = 50;
        let (task, snapshots) = control_task(settings, &driver, &telemetry);
        snapshots.send_replace(Some(snapshot(false)));

        let cancellation_token = CancellationToken::new();
        let (signals, handle) = spawn_control(task, &cancellation_token);
        driver.started.notified().await;
        signals.send(ControlSignal::Stop).await.unwrap();
        // the stop burst starts while the interrupted send would still be running
        tokio::time::sleep(Duration::from_millis(10)).await;
        let sent = driver.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1], WheelCommand::stop());

        cancellation_token.cancel();
        handle.await.unwrap().unwrap();
        let commands = telemetry.commands();
        assert!(!commands.is_empty());
        assert!(commands.iter().all(|command| command.is_stop()));
    }
}
