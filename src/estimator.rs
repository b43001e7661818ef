//! Mode-dispatched fine-tuning driver.
//!
//! [`SequenceClassifier`] owns the encoder, the classification head, the
//! optimizer with its schedule, and the streaming metrics. A single [`run`]
//! call handles one batch in one of three modes and returns the matching
//! [`EstimatorSpec`] variant.
//!
//! [`run`]: SequenceClassifier::run

use candle_core::{DType, Device, Tensor};

use crate::config::{to_runtime_error, FineTuneConfig, FineTuneError};
use crate::encoder::SequenceEncoder;
use crate::head::{ClassificationHead, HeadOutput};
use crate::logging::Logger;
use crate::metrics::{EvalMetrics, MetricsReport};
use crate::optimizer::{create_optimizer, AdamW};
use crate::scheduler::LrSchedule;

/// What the caller wants from this batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
    Predict,
}

/// One batch of tokenized examples.
///
/// `input_ids`, `input_mask` and `segment_ids` are `(batch, seq_len)`;
/// `label_ids` is `(batch,)` and may be absent for prediction.
#[derive(Debug, Clone)]
pub struct FeatureBatch {
    pub input_ids: Tensor,
    pub input_mask: Tensor,
    pub segment_ids: Tensor,
    pub label_ids: Option<Tensor>,
}

impl FeatureBatch {
    fn validate(&self) -> Result<(), FineTuneError> {
        let ids = self.input_ids.dims();
        if ids.len() != 2 {
            return Err(FineTuneError::runtime(format!(
                "input_ids must be rank 2, got shape {:?}",
                ids
            )));
        }
        for (name, tensor) in [
            ("input_mask", &self.input_mask),
            ("segment_ids", &self.segment_ids),
        ] {
            if tensor.dims() != ids {
                return Err(FineTuneError::runtime(format!(
                    "{name} shape {:?} does not match input_ids shape {:?}",
                    tensor.dims(),
                    ids
                )));
            }
        }
        if let Some(labels) = &self.label_ids {
            if labels.dims() != [ids[0]] {
                return Err(FineTuneError::runtime(format!(
                    "label_ids shape {:?} does not match batch size {}",
                    labels.dims(),
                    ids[0]
                )));
            }
        }
        Ok(())
    }
}

/// The mode-specific result of processing one batch.
#[derive(Debug)]
pub enum EstimatorSpec {
    Train {
        loss: f32,
        learning_rate: f64,
    },
    Eval {
        loss: f32,
        metrics: MetricsReport,
    },
    Predict {
        predicted_labels: Tensor,
        log_probs: Tensor,
    },
}

pub struct SequenceClassifier {
    config: FineTuneConfig,
    encoder: Box<dyn SequenceEncoder>,
    head: ClassificationHead,
    optimizer: AdamW,
    schedule: Box<dyn LrSchedule>,
    metrics: EvalMetrics,
    logger: Logger,
    global_step: usize,
}

impl SequenceClassifier {
    /// Seeds the device, builds the head on top of the encoder, and wires
    /// every trainable parameter into the optimizer.
    pub fn new(
        config: FineTuneConfig,
        encoder: Box<dyn SequenceEncoder>,
        device: &Device,
    ) -> Result<Self, FineTuneError> {
        config.validate()?;
        device
            .set_seed(config.runtime.seed)
            .map_err(to_runtime_error)?;

        let head = ClassificationHead::new(
            config.model.num_labels,
            encoder.hidden_size(),
            config.model.dropout_prob,
            config.model.dropout,
            device,
        )
        .map_err(|err| FineTuneError::initialization(err.to_string()))?;

        let mut named_params = encoder.named_parameters();
        named_params.extend(head.named_parameters());
        let (optimizer, schedule) =
            create_optimizer(named_params, &config.optimizer, &config.schedule)?;
        let logger = Logger::new(&config.runtime.logging)?;

        Ok(Self {
            config,
            encoder,
            head,
            optimizer,
            schedule,
            metrics: EvalMetrics::new(),
            logger,
            global_step: 0,
        })
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn metrics(&self) -> MetricsReport {
        self.metrics.report()
    }

    /// Clears the streaming metrics, starting a fresh evaluation pass.
    pub fn reset_metrics(&mut self) {
        self.metrics.reset();
    }

    /// Processes one batch according to `mode`.
    pub fn run(&mut self, mode: Mode, batch: &FeatureBatch) -> Result<EstimatorSpec, FineTuneError> {
        batch.validate()?;
        match mode {
            Mode::Train => self.train_step(batch),
            Mode::Eval => self.eval_step(batch),
            Mode::Predict => self.predict(batch),
        }
    }

    fn train_step(&mut self, batch: &FeatureBatch) -> Result<EstimatorSpec, FineTuneError> {
        let labels = batch
            .label_ids
            .as_ref()
            .ok_or_else(|| FineTuneError::runtime("training requires label_ids"))?;

        let output = self.forward(batch, Some(labels), true)?;
        let loss_tensor = output
            .loss
            .ok_or_else(|| FineTuneError::runtime("training produced no loss"))?;
        let loss = loss_tensor.to_scalar::<f32>().map_err(to_runtime_error)?;

        let grads = loss_tensor.backward().map_err(to_runtime_error)?;
        let learning_rate = self.schedule.step();
        self.optimizer.set_learning_rate(learning_rate);
        self.optimizer.step(&grads)?;

        self.global_step += 1;
        if self.global_step % self.config.runtime.log_every_n_steps == 0 {
            self.logger
                .log_training_step(self.global_step, loss, learning_rate);
        }

        Ok(EstimatorSpec::Train {
            loss,
            learning_rate,
        })
    }

    fn eval_step(&mut self, batch: &FeatureBatch) -> Result<EstimatorSpec, FineTuneError> {
        let labels = batch
            .label_ids
            .as_ref()
            .ok_or_else(|| FineTuneError::runtime("evaluation requires label_ids"))?;

        let output = self.forward(batch, Some(labels), false)?;
        let loss = output
            .loss
            .ok_or_else(|| FineTuneError::runtime("evaluation produced no loss"))?
            .to_scalar::<f32>()
            .map_err(to_runtime_error)?;

        let predicted = tensor_to_labels(&output.predicted_labels)?;
        let truth = tensor_to_labels(labels)?;
        self.metrics.update(&truth, &predicted)?;

        let metrics = self.metrics.report();
        self.logger.log_evaluation(self.global_step, loss, &metrics);

        Ok(EstimatorSpec::Eval { loss, metrics })
    }

    fn predict(&mut self, batch: &FeatureBatch) -> Result<EstimatorSpec, FineTuneError> {
        let output = self.forward(batch, None, false)?;
        Ok(EstimatorSpec::Predict {
            predicted_labels: output.predicted_labels,
            log_probs: output.log_probs,
        })
    }

    fn forward(
        &self,
        batch: &FeatureBatch,
        labels: Option<&Tensor>,
        train: bool,
    ) -> Result<HeadOutput, FineTuneError> {
        let pooled = self
            .encoder
            .encode(&batch.input_ids, &batch.input_mask, &batch.segment_ids)
            .map_err(to_runtime_error)?;
        self.head
            .forward(&pooled, labels, train)
            .map_err(to_runtime_error)
    }
}

fn tensor_to_labels(tensor: &Tensor) -> Result<Vec<u32>, FineTuneError> {
    tensor
        .to_dtype(DType::U32)
        .and_then(|t| t.to_vec1::<u32>())
        .map_err(to_runtime_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScheduleSettings, ScheduleStrategy};
    use crate::encoder::{EmbeddingEncoder, EmbeddingEncoderConfig};

    fn small_config() -> FineTuneConfig {
        let mut config = FineTuneConfig {
            model: Default::default(),
            optimizer: Default::default(),
            schedule: ScheduleSettings {
                num_train_steps: 10,
                num_warmup_steps: 0,
                strategy: ScheduleStrategy::LinearDecay,
            },
            runtime: Default::default(),
        };
        config.runtime.logging.enable_stdout = false;
        config
    }

    fn encoder(device: &Device) -> Box<dyn SequenceEncoder> {
        let encoder = EmbeddingEncoder::new(
            EmbeddingEncoderConfig {
                vocab_size: 16,
                hidden_size: 8,
            },
            device,
        )
        .unwrap();
        Box::new(encoder)
    }

    fn batch(device: &Device, with_labels: bool) -> FeatureBatch {
        let input_ids = Tensor::from_slice(&[1i64, 2, 3, 4, 5, 6], (2, 3), device).unwrap();
        let input_mask = Tensor::ones((2, 3), DType::F32, device).unwrap();
        let segment_ids = Tensor::zeros((2, 3), DType::I64, device).unwrap();
        let label_ids = with_labels
            .then(|| Tensor::from_slice(&[1u32, 0], (2,), device).unwrap());
        FeatureBatch {
            input_ids,
            input_mask,
            segment_ids,
            label_ids,
        }
    }

    #[test]
    fn training_without_labels_is_an_error() {
        let device = Device::Cpu;
        let mut classifier =
            SequenceClassifier::new(small_config(), encoder(&device), &device).unwrap();
        let result = classifier.run(Mode::Train, &batch(&device, false));
        assert!(result.is_err());
    }

    #[test]
    fn prediction_carries_no_loss() {
        let device = Device::Cpu;
        let mut classifier =
            SequenceClassifier::new(small_config(), encoder(&device), &device).unwrap();
        let spec = classifier.run(Mode::Predict, &batch(&device, false)).unwrap();
        match spec {
            EstimatorSpec::Predict {
                predicted_labels,
                log_probs,
            } => {
                assert_eq!(predicted_labels.dims(), [2]);
                assert_eq!(log_probs.dims(), [2, 2]);
            }
            other => panic!("expected a prediction, got {other:?}"),
        }
    }

    #[test]
    fn evaluation_accumulates_until_reset() {
        let device = Device::Cpu;
        let mut classifier =
            SequenceClassifier::new(small_config(), encoder(&device), &device).unwrap();

        classifier.run(Mode::Eval, &batch(&device, true)).unwrap();
        classifier.run(Mode::Eval, &batch(&device, true)).unwrap();
        assert_eq!(
            classifier.metrics().true_positives
                + classifier.metrics().true_negatives
                + classifier.metrics().false_positives
                + classifier.metrics().false_negatives,
            4
        );

        classifier.reset_metrics();
        let report = classifier.metrics();
        assert_eq!(
            report.true_positives
                + report.true_negatives
                + report.false_positives
                + report.false_negatives,
            0
        );
    }

    #[test]
    fn train_steps_advance_the_global_step() {
        let device = Device::Cpu;
        let mut classifier =
            SequenceClassifier::new(small_config(), encoder(&device), &device).unwrap();

        for _ in 0..3 {
            let spec = classifier.run(Mode::Train, &batch(&device, true)).unwrap();
            match spec {
                EstimatorSpec::Train { learning_rate, .. } => assert!(learning_rate > 0.0),
                other => panic!("expected a train result, got {other:?}"),
            }
        }
        assert_eq!(classifier.global_step(), 3);
    }

    #[test]
    fn mismatched_mask_shape_is_rejected() {
        let device = Device::Cpu;
        let mut classifier =
            SequenceClassifier::new(small_config(), encoder(&device), &device).unwrap();
        let mut bad = batch(&device, true);
        bad.input_mask = Tensor::ones((2, 4), DType::F32, &device).unwrap();
        assert!(classifier.run(Mode::Eval, &bad).is_err());
    }
}
