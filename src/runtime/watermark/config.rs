use serde::{Deserialize, Serialize};

use crate::common::OriginId;

/// What to do when an origin reports a watermark below the one already recorded for it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegressionPolicy {
    /// Keep the previous watermark and log a warning.
    #[default]
    Tolerant,
    /// Fail the query.
    Strict,
}

/// Whether origins outside `input_origins` may join at runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginPolicy {
    #[default]
    Open,
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkConfig {
    #[serde(default)]
    pub regression_policy: RegressionPolicy,
    #[serde(default)]
    pub origin_policy: OriginPolicy,
    /// Origins known up front. They hold the global watermark at 0 until they report.
    #[serde(default)]
    pub input_origins: Vec<OriginId>,
}

impl WatermarkConfig {
    pub fn new(input_origins: Vec<OriginId>) -> Self {
        Self {
            input_origins,
            ..Default::default()
        }
    }

    pub fn closed(input_origins: Vec<OriginId>) -> Self {
        Self {
            origin_policy: OriginPolicy::Closed,
            input_origins,
            ..Default::default()
        }
    }

    pub fn with_regression_policy(mut self, policy: RegressionPolicy) -> Self {
        self.regression_policy = policy;
        self
    }
}
