//! Engine configuration.
//!
//! [`EngineConfig`] aggregates one section per subsystem. Every field has a
//! default, so an empty TOML file is valid. Validation rejects bad values
//! instead of clamping them; a rejected config leaves the running one intact.
//!
//! ```toml
//! [lifecycle]
//! leak_threshold_ms = 30000
//!
//! [frames]
//! target_fps = 120.0
//!
//! [aggregator.weights]
//! memory = 0.25
//! cpu = 0.25
//! thread = 0.2
//! network = 0.2
//! frame = 0.1
//!
//! [logging]
//! format = "json"
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::aggregator::AggregatorConfig;
use crate::error::{ConfigError, Result};
use crate::events::DEFAULT_BUS_CAPACITY;
use crate::frames::FrameConfig;
use crate::graph::GraphConfig;
use crate::lifecycle::LifecycleConfig;
use crate::logging::LogConfig;
use crate::threads::ThreadConfig;
use crate::watchdog::WatchdogConfig;

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, colored
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// Full engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Findings a slow subscriber may lag behind before losing the oldest.
    pub bus_capacity: usize,
    pub lifecycle: LifecycleConfig,
    pub graph: GraphConfig,
    pub threads: ThreadConfig,
    pub watchdog: WatchdogConfig,
    pub frames: FrameConfig,
    pub aggregator: AggregatorConfig,
    pub logging: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bus_capacity: DEFAULT_BUS_CAPACITY,
            lifecycle: LifecycleConfig::default(),
            graph: GraphConfig::default(),
            threads: ThreadConfig::default(),
            watchdog: WatchdogConfig::default(),
            frames: FrameConfig::default(),
            aggregator: AggregatorConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let display = path.display().to_string();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(display).into());
        }
        let source = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(display, e.to_string()))?;
        Self::from_toml_str(&source)
    }

    /// Serialize to TOML, e.g. to write out the defaults.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseFailed(e.to_string()).into())
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.lifecycle.validate()?;
        self.graph.validate()?;
        self.threads.validate()?;
        self.watchdog.validate()?;
        self.frames.validate()?;
        self.aggregator.validate()?;
        self.logging.validate()?;
        ensure_capacity("bus_capacity", self.bus_capacity)
    }
}

// =============================================================================
// Validation helpers
// =============================================================================

pub(crate) fn ensure_positive_ms(field: &str, value: u64) -> std::result::Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::invalid(format!("{field} must be > 0")));
    }
    Ok(())
}

pub(crate) fn ensure_capacity(field: &str, value: usize) -> std::result::Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::invalid(format!("{field} must be > 0")));
    }
    Ok(())
}

pub(crate) fn ensure_positive(field: &str, value: f64) -> std::result::Result<(), ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::invalid(format!(
            "{field} must be a finite value > 0 (got {value})"
        )));
    }
    Ok(())
}

pub(crate) fn ensure_in_range(
    field: &str,
    value: f64,
    min: f64,
    max: f64,
) -> std::result::Result<(), ConfigError> {
    if !value.is_finite() || value < min || value > max {
        return Err(ConfigError::invalid(format!(
            "{field} must be within [{min}, {max}] (got {value})"
        )));
    }
    Ok(())
}

/// Ring-buffer capacities are sized once, at construction.
pub(crate) fn ensure_fixed_capacity(
    field: &str,
    current: usize,
    requested: usize,
) -> std::result::Result<(), ConfigError> {
    if current != requested {
        return Err(ConfigError::invalid(format!(
            "{field} is fixed at construction ({current}); cannot change it to {requested}"
        )));
    }
    Ok(())
}

pub(crate) fn ensure_ascending<T>(field: &str, steps: &[T]) -> std::result::Result<(), ConfigError>
where
    T: PartialOrd + fmt::Debug,
{
    if steps.windows(2).all(|pair| pair[0] < pair[1]) {
        Ok(())
    } else {
        Err(ConfigError::invalid(format!(
            "{field} must be strictly ascending (got {steps:?})"
        )))
    }
}
