use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

/// Top-level configuration for a fine-tuning run.
///
/// Loadable from TOML or JSON (selected by file extension). The struct only
/// covers the classifier itself; tokenization and feature construction happen
/// upstream and arrive as ready-made tensors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FineTuneConfig {
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub optimizer: OptimizerSettings,
    pub schedule: ScheduleSettings,
    #[serde(default)]
    pub runtime: RuntimeSettings,
}

impl FineTuneConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, FineTuneError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: FineTuneConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(FineTuneError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, FineTuneError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), FineTuneError> {
        let mut errors = Vec::new();

        if self.model.num_labels < 2 {
            errors.push("model.num_labels must be at least 2".to_string());
        }

        if !(0.0..1.0).contains(&self.model.dropout_prob) {
            errors.push("model.dropout_prob must be in [0, 1)".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if let Some(max_norm) = self.optimizer.max_grad_norm {
            if max_norm <= 0.0 {
                errors.push("optimizer.max_grad_norm must be greater than 0".to_string());
            }
        }

        if self.schedule.num_train_steps == 0 {
            errors.push("schedule.num_train_steps must be greater than 0".to_string());
        }

        if self.schedule.num_warmup_steps > self.schedule.num_train_steps {
            errors.push(
                "schedule.num_warmup_steps cannot exceed schedule.num_train_steps".to_string(),
            );
        }

        if self.runtime.log_every_n_steps == 0 {
            errors.push("runtime.log_every_n_steps must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(FineTuneError::validation(errors));
        }

        Ok(())
    }
}

/// Classification-head settings. The encoder's hidden size is not configured
/// here: it is reported by the encoder implementation itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_num_labels")]
    pub num_labels: usize,
    #[serde(default = "default_dropout_prob")]
    pub dropout_prob: f32,
    #[serde(default)]
    pub dropout: DropoutGate,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            num_labels: default_num_labels(),
            dropout_prob: default_dropout_prob(),
            dropout: DropoutGate::default(),
        }
    }
}

/// When the head applies dropout to the pooled representation.
///
/// `Always` reproduces the reference behavior of dropping units in every
/// mode, including evaluation and prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropoutGate {
    TrainOnly,
    Always,
}

impl Default for DropoutGate {
    fn default() -> Self {
        Self::TrainOnly
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSettings {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: Option<f64>,
    #[serde(default = "default_weight_decay_exclude")]
    pub weight_decay_exclude: Vec<String>,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            max_grad_norm: default_max_grad_norm(),
            weight_decay_exclude: default_weight_decay_exclude(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSettings {
    pub num_train_steps: usize,
    #[serde(default)]
    pub num_warmup_steps: usize,
    #[serde(default)]
    pub strategy: ScheduleStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStrategy {
    /// Linear warmup, then linear decay to zero over the remaining steps.
    LinearDecay,
    /// Linear warmup, then a constant learning rate.
    Constant,
}

impl Default for ScheduleStrategy {
    fn default() -> Self {
        Self::LinearDecay
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            log_every_n_steps: default_log_every_n_steps(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_enable_stdout")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush_every_n")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: default_enable_stdout(),
            tensorboard: None,
            tensorboard_flush_every_n: default_tensorboard_flush_every_n(),
        }
    }
}

fn default_num_labels() -> usize {
    2
}

fn default_dropout_prob() -> f32 {
    0.1
}

fn default_learning_rate() -> f64 {
    2e-5
}

fn default_weight_decay() -> f64 {
    0.01
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-6
}

fn default_max_grad_norm() -> Option<f64> {
    Some(1.0)
}

fn default_weight_decay_exclude() -> Vec<String> {
    vec!["bias".to_string(), "norm".to_string()]
}

fn default_seed() -> u64 {
    42
}

fn default_log_every_n_steps() -> usize {
    100
}

fn default_enable_stdout() -> bool {
    true
}

fn default_tensorboard_flush_every_n() -> usize {
    100
}

#[derive(Debug)]
pub enum FineTuneError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
}

impl FineTuneError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for FineTuneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FineTuneError::Io(err) => write!(f, "failed to read config: {}", err),
            FineTuneError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            FineTuneError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            FineTuneError::Initialization(msg) => {
                write!(f, "classifier initialization failed: {}", msg)
            }
            FineTuneError::Runtime(msg) => write!(f, "fine-tuning failed: {}", msg),
        }
    }
}

impl std::error::Error for FineTuneError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FineTuneError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FineTuneError {
    fn from(value: std::io::Error) -> Self {
        FineTuneError::Io(value)
    }
}

impl From<toml::de::Error> for FineTuneError {
    fn from(value: toml::de::Error) -> Self {
        FineTuneError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for FineTuneError {
    fn from(value: serde_json::Error) -> Self {
        FineTuneError::ConfigFormat(value.to_string())
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> FineTuneError {
    FineTuneError::runtime(err.to_string())
}
