//! Classification head: dropout, affine projection, log-softmax and the
//! categorical cross-entropy loss used by the train and eval modes.

use candle_core::{DType, Error, Result, Tensor, Var, D};
use candle_nn::{ops, Dropout};

use crate::config::DropoutGate;

const INIT_STDDEV: f32 = 0.02;

/// Output of one forward pass through the head.
///
/// `loss` is present exactly when labels were supplied.
#[derive(Debug, Clone)]
pub struct HeadOutput {
    pub log_probs: Tensor,
    pub predicted_labels: Tensor,
    pub loss: Option<Tensor>,
}

/// Trainable affine head mapping pooled encoder output to per-class
/// log-probabilities.
///
/// The weight matrix is `(num_labels, hidden_size)`, sampled from a
/// truncated normal (stddev 0.02, clamped at two standard deviations); the
/// bias starts at zero. Both persist across steps and are only mutated by
/// the optimizer.
pub struct ClassificationHead {
    num_labels: usize,
    hidden_size: usize,
    weight: Var,
    bias: Var,
    dropout: Dropout,
    dropout_gate: DropoutGate,
}

impl ClassificationHead {
    pub fn new(
        num_labels: usize,
        hidden_size: usize,
        dropout_prob: f32,
        dropout_gate: DropoutGate,
        device: &candle_core::Device,
    ) -> Result<Self> {
        if num_labels < 2 {
            return Err(Error::Msg(format!(
                "classification head requires at least two labels, got {}",
                num_labels
            )));
        }
        if hidden_size == 0 {
            return Err(Error::Msg("classification head requires hidden_size > 0".into()));
        }

        let sampled = Tensor::randn(0f32, INIT_STDDEV, (num_labels, hidden_size), device)?
            .clamp(-2.0 * INIT_STDDEV, 2.0 * INIT_STDDEV)?;
        let weight = Var::from_tensor(&sampled)?;
        let bias = Var::zeros(num_labels, DType::F32, device)?;

        Ok(Self {
            num_labels,
            hidden_size,
            weight,
            bias,
            dropout: Dropout::new(dropout_prob),
            dropout_gate,
        })
    }

    /// Builds a head from fixed parameters. Used when restoring weights and
    /// for deterministic tests.
    pub fn from_parameters(
        weight: Tensor,
        bias: Tensor,
        dropout_prob: f32,
        dropout_gate: DropoutGate,
    ) -> Result<Self> {
        let (num_labels, hidden_size) = weight.dims2()?;
        if bias.dims() != [num_labels] {
            return Err(Error::Msg(format!(
                "bias must be shaped [{}], got {:?}",
                num_labels,
                bias.dims()
            )));
        }
        Ok(Self {
            num_labels,
            hidden_size,
            weight: Var::from_tensor(&weight)?,
            bias: Var::from_tensor(&bias)?,
            dropout: Dropout::new(dropout_prob),
            dropout_gate,
        })
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn named_parameters(&self) -> Vec<(String, Var)> {
        vec![
            ("classifier.output_weights".to_string(), self.weight.clone()),
            ("classifier.output_bias".to_string(), self.bias.clone()),
        ]
    }

    /// Runs the head on a pooled batch shaped `(batch, hidden_size)`.
    ///
    /// With `labels` (one id per example, each in `[0, num_labels)`) the
    /// output carries the batch-mean categorical cross-entropy; without
    /// labels only predictions and log-probabilities are produced.
    pub fn forward(&self, pooled: &Tensor, labels: Option<&Tensor>, train: bool) -> Result<HeadOutput> {
        let (batch, hidden) = pooled.dims2()?;
        if hidden != self.hidden_size {
            return Err(Error::Msg(format!(
                "pooled width {} does not match head hidden_size {}",
                hidden, self.hidden_size
            )));
        }

        let apply_dropout = match self.dropout_gate {
            DropoutGate::TrainOnly => train,
            DropoutGate::Always => true,
        };
        let hidden_state = self.dropout.forward(pooled, apply_dropout)?;

        let logits = hidden_state
            .matmul(&self.weight.as_tensor().t()?)?
            .broadcast_add(self.bias.as_tensor())?;
        let log_probs = ops::log_softmax(&logits, D::Minus1)?;
        let predicted_labels = log_probs.argmax(D::Minus1)?;

        let loss = match labels {
            Some(labels) => Some(self.cross_entropy(&log_probs, labels, batch)?),
            None => None,
        };

        Ok(HeadOutput {
            log_probs,
            predicted_labels,
            loss,
        })
    }

    /// Negative log-probability of the true label, averaged over the batch.
    /// The gather over the label axis is the one-hot inner product computed
    /// directly in log space.
    fn cross_entropy(&self, log_probs: &Tensor, labels: &Tensor, batch: usize) -> Result<Tensor> {
        if labels.dims() != [batch] {
            return Err(Error::Msg(format!(
                "labels must be shaped [{}], got {:?}",
                batch,
                labels.dims()
            )));
        }
        let labels = match labels.dtype() {
            DType::U32 => labels.clone(),
            DType::I64 | DType::U8 => labels.to_dtype(DType::U32)?,
            dtype => {
                return Err(Error::Msg(format!(
                    "unsupported label dtype {:?} for cross entropy",
                    dtype
                )))
            }
        };
        let indices = labels.unsqueeze(1)?;
        let per_example = log_probs.gather(&indices, 1)?.neg()?.squeeze(1)?;
        per_example.mean_all()
    }
}
