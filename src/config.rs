//! Cache, query and selection policy.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::state::{DEFAULT_AGGREGATION_RATIO, DEFAULT_POINT_BUDGET_FACTOR, MAX_CHANNELS, MAX_CHART_POINTS};

/// Tunable policy values. Missing fields take their defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Children per bucket between adjacent resolution tiers (> 1)
    pub aggregation_ratio: usize,
    /// Default points per query when the caller has no pixel width
    pub target_points: usize,
    pub max_channels: usize,
    /// Results longer than `point_budget_factor * target_points` are merged.
    /// Not capped; the product saturates.
    pub point_budget_factor: usize,
    /// Color traces from the colorblind-friendly palette
    pub colorblind: bool,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            aggregation_ratio: DEFAULT_AGGREGATION_RATIO,
            target_points: MAX_CHART_POINTS,
            max_channels: MAX_CHANNELS,
            point_budget_factor: DEFAULT_POINT_BUDGET_FACTOR,
            colorblind: false,
        }
    }
}

impl BrowserConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.aggregation_ratio <= 1 {
            return Err(ConfigurationError::AggregationRatio(self.aggregation_ratio));
        }
        if self.target_points == 0 {
            return Err(ConfigurationError::TargetPoints);
        }
        if self.max_channels == 0 {
            return Err(ConfigurationError::MaxChannels);
        }
        if self.point_budget_factor == 0 {
            return Err(ConfigurationError::PointBudgetFactor(self.point_budget_factor));
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self, ConfigurationError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigurationError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ConfigurationError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let config = Self::from_json_str(&json)?;
        tracing::debug!("Loaded configuration from {}: {:?}", path.display(), config);
        Ok(config)
    }
}
