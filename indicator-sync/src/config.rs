use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::warn;

use ts_core::{TimeValueCache, Timestamp};

pub const ENV_MAX_POINTS: &str = "CHART_SYNC_MAX_POINTS";
pub const ENV_TIME_TOLERANCE: &str = "CHART_SYNC_TIME_TOLERANCE_SECS";
pub const ENV_OVERBOUGHT: &str = "CHART_SYNC_OVERBOUGHT";
pub const ENV_OVERSOLD: &str = "CHART_SYNC_OVERSOLD";

const DEFAULT_MAX_POINTS: usize = 1000;

/// Engine tunables. Retention bounds every per-series buffer the engine keeps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub max_points: usize,
    /// Live ticks within this many seconds of a cached point overwrite it.
    pub time_tolerance: Timestamp,
    pub default_overbought: f64,
    pub default_oversold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_points: DEFAULT_MAX_POINTS,
            time_tolerance: 0,
            default_overbought: 70.0,
            default_oversold: 30.0,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::default().overlay_env(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`; values that fail to parse are ignored.
    pub fn overlay_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(n) = parse_var::<usize>(&lookup, ENV_MAX_POINTS) {
            self = self.with_max_points(n);
        }
        if let Some(secs) = parse_var::<Timestamp>(&lookup, ENV_TIME_TOLERANCE) {
            self = self.with_time_tolerance(secs);
        }
        if let Some(v) = parse_var::<f64>(&lookup, ENV_OVERBOUGHT) {
            self.default_overbought = v;
        }
        if let Some(v) = parse_var::<f64>(&lookup, ENV_OVERSOLD) {
            self.default_oversold = v;
        }
        self
    }

    pub fn with_max_points(mut self, max_points: usize) -> Self {
        self.max_points = max_points.max(2);
        self
    }

    pub fn with_time_tolerance(mut self, secs: Timestamp) -> Self {
        self.time_tolerance = secs.max(0);
        self
    }

    pub fn with_levels(mut self, overbought: f64, oversold: f64) -> Self {
        self.default_overbought = overbought;
        self.default_oversold = oversold;
        self
    }

    /// An empty cache using these retention and tolerance settings.
    pub fn cache(&self) -> TimeValueCache {
        TimeValueCache::new(self.max_points).with_tolerance(self.time_tolerance)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparsable config value");
            None
        }
    }
}
