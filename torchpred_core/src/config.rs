//! Predictor configuration
//!
//! Built in code, or loaded from a TOML/YAML file whose format is detected by
//! extension. Environment variables override file values.

use crate::error::ConfigError;
use crate::native::DeviceKind;
use crate::trace::{TraceLevel, ROOT_SPAN_NAME};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const ENV_DEVICE: &str = "TORCHPRED_DEVICE";
pub const ENV_TRACE_LEVEL: &str = "TORCHPRED_TRACE_LEVEL";
pub const ENV_ROOT_SPAN: &str = "TORCHPRED_ROOT_SPAN";

/// Where the model runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Gpu,
}

impl Device {
    pub fn to_native(self) -> DeviceKind {
        match self {
            Device::Cpu => DeviceKind::Cpu,
            Device::Gpu => DeviceKind::Cuda,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu => write!(f, "gpu"),
        }
    }
}

impl std::str::FromStr for Device {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "gpu" | "cuda" => Ok(Device::Gpu),
            _ => Err(ConfigError::InvalidValue {
                key: "device".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

fn default_root_span() -> String {
    ROOT_SPAN_NAME.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictorConfig {
    /// Serialized TorchScript module
    pub model_path: PathBuf,

    #[serde(default)]
    pub device: Device,

    #[serde(default)]
    pub trace_level: TraceLevel,

    /// Profiler event that wraps the whole forward pass; never published
    #[serde(default = "default_root_span")]
    pub root_span: String,
}

impl PredictorConfig {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            device: Device::default(),
            trace_level: TraceLevel::default(),
            root_span: default_root_span(),
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_trace_level(mut self, level: TraceLevel) -> Self {
        self.trace_level = level;
        self
    }

    pub fn with_root_span(mut self, name: impl Into<String>) -> Self {
        self.root_span = name.into();
        self
    }

    /// The native profiler only runs when framework layers are traced
    pub fn profiling_enabled(&self) -> bool {
        self.trace_level >= TraceLevel::Framework
    }

    /// Load config from a file (auto-detect format)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;

        match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => Self::from_toml(&contents),
            Some("yaml") | Some("yml") => Self::from_yaml(&contents),
            _ => Self::from_toml(&contents).or_else(|_| Self::from_yaml(&contents)),
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Apply `TORCHPRED_*` environment overrides
    pub fn apply_env_overrides(self) -> Result<Self, ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(device) = lookup(ENV_DEVICE) {
            self.device = device.parse()?;
        }
        if let Some(level) = lookup(ENV_TRACE_LEVEL) {
            self.trace_level = level.parse().map_err(|_| ConfigError::InvalidValue {
                key: ENV_TRACE_LEVEL.to_string(),
                value: level.clone(),
            })?;
        }
        if let Some(root) = lookup(ENV_ROOT_SPAN) {
            self.root_span = root;
        }
        Ok(self)
    }
}
