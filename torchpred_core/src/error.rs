//! Error types for torchpred
//!
//! Every fallible operation returns [`PredictorResult`]. The families mirror
//! where a failure originates: configuration, the native engine, tensor
//! marshaling, result decoding and trace reconstruction.

use std::path::PathBuf;

/// Main error type for predictor operations
#[derive(Debug, thiserror::Error)]
pub enum PredictorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Native(#[from] NativeCallError),

    #[error(transparent)]
    Marshal(#[from] MarshalError),

    #[error(transparent)]
    Result(#[from] ResultError),

    #[error(transparent)]
    Trace(#[from] TraceError),

    /// The predictor has been closed; its native handle is gone
    #[error("predictor is closed")]
    Closed,
}

/// Convenience type alias for Results
pub type PredictorResult<T> = Result<T, PredictorError>;

/// Errors raised before any native allocation happens
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("model file {} not found", .0.display())]
    ModelNotFound(PathBuf),

    #[error("invalid model path {0:?}")]
    InvalidModelPath(String),

    /// GPU requested but no CUDA device is available
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("invalid configuration value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Failure reported through the native last-error slot
#[derive(Debug, Clone, thiserror::Error)]
#[error("native call {call} failed: {message}")]
pub struct NativeCallError {
    pub call: &'static str,
    pub message: String,
}

impl NativeCallError {
    pub fn new(call: &'static str, message: impl Into<String>) -> Self {
        Self {
            call,
            message: message.into(),
        }
    }
}

/// Errors converting host arrays into native tensor descriptors
#[derive(Debug, thiserror::Error)]
pub enum MarshalError {
    #[error("input nil or empty")]
    EmptyInput,

    #[error("expecting a dense tensor at input {index}")]
    NotDense { index: usize },

    #[error("unsupported element type {0}")]
    UnsupportedDType(String),

    #[error("buffer holds {actual} bytes but shape {shape:?} of {dtype} needs {expected}")]
    LengthMismatch {
        shape: Vec<usize>,
        dtype: String,
        expected: usize,
        actual: usize,
    },

    #[error("invalid tensor shape {0:?}")]
    InvalidShape(Vec<i64>),

    #[error("native tensor with {0} elements has no data")]
    NullData(usize),
}

/// Errors reading the output of a prediction
#[derive(Debug, thiserror::Error)]
pub enum ResultError {
    #[error("zero number of tensors")]
    NoOutputs,

    #[error("empty predictions")]
    EmptyPrediction,

    #[error("malformed result tree: {0}")]
    MalformedTree(String),
}

/// Errors reading or parsing the native profile
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("failed to read nil profile")]
    Unavailable,

    #[error("profile is not valid UTF-8")]
    InvalidUtf8,

    #[error("malformed profile: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid trace event {index} ({name}): {reason}")]
    InvalidEvent {
        index: usize,
        name: String,
        reason: String,
    },
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}
