//! Ramp profile: target concurrency as a function of elapsed time

use crate::config::parse_duration;
use crate::error::ConfigError;
use serde::Serialize;
use std::str::FromStr;
use std::time::Duration;

/// How concurrency moves toward a stage's target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RampPolicy {
    /// Interpolate from the previous target across the stage
    #[default]
    Linear,
    /// Jump to the stage target as soon as the stage begins
    Immediate,
}

impl FromStr for RampPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "linear" => Ok(RampPolicy::Linear),
            "immediate" => Ok(RampPolicy::Immediate),
            _ => Err(ConfigError::InvalidValue {
                key: "CHATLOAD_RAMP_POLICY",
                value: s.to_string(),
            }),
        }
    }
}

/// One window of the ramp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RampStage {
    pub duration: Duration,
    pub target: usize,
}

impl RampStage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

/// Parses `"<duration>:<target>"`, e.g. `"1m:300"`
impl FromStr for RampStage {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidStage(s.to_string());
        let (duration, target) = s.trim().split_once(':').ok_or_else(invalid)?;
        let duration = parse_duration(duration).ok_or_else(invalid)?;
        let target = target.trim().parse().map_err(|_| invalid())?;
        Ok(Self { duration, target })
    }
}

/// Parse a comma separated stage list
pub fn parse_stages(s: &str) -> Result<Vec<RampStage>, ConfigError> {
    s.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// Ordered stages plus the concurrency at t=0
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RampProfile {
    start_vus: usize,
    stages: Vec<RampStage>,
    policy: RampPolicy,
}

impl RampProfile {
    pub fn new(
        start_vus: usize,
        stages: Vec<RampStage>,
        policy: RampPolicy,
    ) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::NoStages);
        }
        Ok(Self {
            start_vus,
            stages,
            policy,
        })
    }

    pub fn stages(&self) -> &[RampStage] {
        &self.stages
    }

    pub fn policy(&self) -> RampPolicy {
        self.policy
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    /// Highest concurrency the profile ever asks for
    pub fn peak_target(&self) -> usize {
        self.stages
            .iter()
            .map(|s| s.target)
            .chain(std::iter::once(self.start_vus))
            .max()
            .unwrap_or(0)
    }

    /// Index of the stage containing `elapsed`, `None` once the ramp is complete
    pub fn stage_at(&self, elapsed: Duration) -> Option<usize> {
        let mut stage_end = Duration::ZERO;
        for (index, stage) in self.stages.iter().enumerate() {
            stage_end += stage.duration;
            if elapsed < stage_end {
                return Some(index);
            }
        }
        None
    }

    /// Target concurrency at `elapsed`. After the last stage the final target holds.
    pub fn target_at(&self, elapsed: Duration) -> usize {
        let mut stage_start = Duration::ZERO;
        let mut previous = self.start_vus;

        for stage in &self.stages {
            if elapsed < stage_start + stage.duration {
                return match self.policy {
                    RampPolicy::Immediate => stage.target,
                    RampPolicy::Linear => {
                        let progress = (elapsed - stage_start).as_secs_f64()
                            / stage.duration.as_secs_f64();
                        let diff = stage.target as f64 - previous as f64;
                        (previous as f64 + diff * progress).floor().max(0.0) as usize
                    }
                };
            }
            stage_start += stage.duration;
            previous = stage.target;
        }

        previous
    }
}
