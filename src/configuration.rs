use config::Config;
use serde::Deserialize;
use std::{path::PathBuf, str};
use tracing::*;

use crate::{
    control::ControllerConfig,
    control_loop::{ControlLoopConfig, ControlSettings},
    driver::BodyConfig,
    error::ErrorWrapper,
    ground_projection::CameraConfig,
    lane_filter::EstimatorConfig,
    pipeline::LanePipeline,
    preprocessing::PreprocessorConfig,
    segment_detector::{DetectorConfig, DrivingSide},
    stop_line::StopLineConfig,
    telemetry::Topics,
};

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub driving_side: DrivingSide,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub preprocessor: PreprocessorConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub stop_line: StopLineConfig,
    #[serde(default)]
    pub estimator: EstimatorConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub control_loop: ControlLoopConfig,
    pub body: BodyConfig,
    #[serde(default)]
    pub zenoh: LaneFollowerZenohConfig,
}

impl AppConfig {
    pub fn load_config(config: &Option<PathBuf>) -> anyhow::Result<Self> {
        let settings = if let Some(config) = config {
            info!("Using configuration from {:?}", config);
            Config::builder()
                .add_source(config::File::with_name(
                    config
                        .to_str()
                        .ok_or_else(|| anyhow::anyhow!("Failed to convert path"))?,
                ))
                .add_source(config::Environment::with_prefix("APP").separator("__"))
                .build()?
        } else {
            info!("Using dev configuration");
            Config::builder()
                .add_source(config::File::with_name("config/settings"))
                .add_source(config::File::with_name("config/dev_settings"))
                .add_source(config::Environment::with_prefix("APP").separator("__"))
                .build()?
        };

        let app_config: Self = settings.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Reject combinations the individual sections can not check on their own
    pub fn validate(&self) -> anyhow::Result<()> {
        // the vehicle has to be stopped before the estimator forgets the lane
        let safe_stop_after = self.controller.safe_stop_after();
        let reset_after = self.estimator.reset_after();
        if safe_stop_after >= reset_after {
            anyhow::bail!(
                "controller.safe_stop_after_ms ({:?}) must be shorter than estimator.reset_after_ms ({:?})",
                safe_stop_after,
                reset_after
            );
        }
        Ok(())
    }

    pub fn pipeline(&self) -> LanePipeline {
        LanePipeline::new(
            self.preprocessor.clone(),
            DetectorConfig {
                driving_side: self.driving_side,
                ..self.detector.clone()
            },
            self.stop_line.clone(),
            EstimatorConfig {
                driving_side: self.driving_side,
                ..self.estimator.clone()
            },
        )
    }

    pub fn control_settings(&self) -> ControlSettings {
        ControlSettings {
            controller: self.controller.clone(),
            stop_line: self.stop_line.clone(),
            kinematics: self.body.kinematics.clone(),
            control_loop: self.control_loop.clone(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct LaneFollowerZenohConfig {
    #[serde(default)]
    pub connect: Vec<zenoh_config::EndPoint>,
    #[serde(default)]
    pub listen: Vec<zenoh_config::EndPoint>,
    #[serde(default)]
    pub config_path: Option<String>,
    /// prepended to every topic
    #[serde(default)]
    pub prefix: String,
}

impl LaneFollowerZenohConfig {
    pub fn get_zenoh_config(&self) -> anyhow::Result<zenoh::config::Config> {
        let mut config = if let Some(conf_file) = &self.config_path {
            zenoh::config::Config::from_file(conf_file).map_err(ErrorWrapper::ZenohError)?
        } else {
            zenoh::config::Config::default()
        };
        if !self.connect.is_empty() {
            config.connect.endpoints.clone_from(&self.connect);
        }
        if !self.listen.is_empty() {
            config.listen.endpoints.clone_from(&self.listen);
        }
        Ok(config)
    }

    pub fn topics(&self) -> Topics {
        Topics::new(&self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverKind;

    static DEFAULT_CONFIG: &str = include_str!("../config/settings.yaml");

    #[test]
    fn test_config() {
        let builder = Config::builder()
            .add_source(config::File::from_str(
                DEFAULT_CONFIG,
                config::FileFormat::Yaml,
            ))
            .build()
            .unwrap();
        let config = builder.try_deserialize::<AppConfig>().unwrap();
        assert_eq!(config.zenoh.topics().frame, "duckie/camera/frame");
        config.validate().unwrap();
    }

    #[test]
    fn safe_stop_must_come_before_estimator_reset() {
        let builder = Config::builder()
            .add_source(config::File::from_str(
                DEFAULT_CONFIG,
                config::FileFormat::Yaml,
            ))
            .set_override("controller.safe_stop_after_ms", 3000)
            .unwrap()
            .build()
            .unwrap();
        let config = builder.try_deserialize::<AppConfig>().unwrap();
        assert_eq!(config.estimator.reset_after_ms, 3000);
        assert!(config.validate().is_err());
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let builder = Config::builder()
            .add_source(config::File::from_str(
                "body:\n  driver:\n    type: dry_run\n  left_motor:\n    id: 0\n  right_motor:\n    id: 1\n  multiplier: 1.0\n",
                config::FileFormat::Yaml,
            ))
            .build()
            .unwrap();
        let config = builder.try_deserialize::<AppConfig>().unwrap();
        assert_eq!(config.body.driver, DriverKind::DryRun);
        assert_eq!(config.controller, ControllerConfig::default());
        config.validate().unwrap();
        assert_eq!(config.driving_side, DrivingSide::Right);
        assert_eq!(config.zenoh.topics().pose, "lane_follower/pose");
    }

    #[test]
    fn driving_side_reaches_perception() {
        let builder = Config::builder()
            .add_source(config::File::from_str(
                DEFAULT_CONFIG,
                config::FileFormat::Yaml,
            ))
            .set_override("driving_side", "left")
            .unwrap()
            .build()
            .unwrap();
        let config = builder.try_deserialize::<AppConfig>().unwrap();
        assert_eq!(config.driving_side, DrivingSide::Left);
        // only checks construction, the side itself is covered by perception tests
        let _pipeline = config.pipeline();
        assert_eq!(config.control_settings().control_loop, config.control_loop);
    }
}
