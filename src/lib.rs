pub mod config;
pub mod encoder;
pub mod estimator;
pub mod head;
pub mod logging;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;

pub use config::{DropoutGate, FineTuneConfig, FineTuneError};
pub use encoder::{EmbeddingEncoder, EmbeddingEncoderConfig, SequenceEncoder};
pub use estimator::{EstimatorSpec, FeatureBatch, Mode, SequenceClassifier};
pub use head::{ClassificationHead, HeadOutput};
pub use logging::Logger;
pub use metrics::{EvalMetrics, MetricsReport};
pub use optimizer::{create_optimizer, AdamW};
pub use scheduler::{LrSchedule, WarmupConstant, WarmupLinearDecay};
