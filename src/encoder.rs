//! Pretrained-encoder seam.
//!
//! The classifier never looks inside the encoder: it hands over token ids,
//! an attention mask and segment ids, and receives one pooled vector per
//! example. Any pretrained transformer wrapper can sit behind the trait; the
//! encoder's own parameters are fine-tuned together with the head whenever
//! `named_parameters` exposes them.

use candle_core::{DType, Error, Result, Tensor, Var};

/// A sequence encoder producing a fixed-width pooled representation.
///
/// Inputs are integer tensors of identical shape `(batch, max_len)`; the
/// attention mask and segment ids carry 0/1 values. The output is shaped
/// `(batch, hidden_size)`.
pub trait SequenceEncoder {
    fn encode(
        &self,
        input_ids: &Tensor,
        input_mask: &Tensor,
        segment_ids: &Tensor,
    ) -> Result<Tensor>;

    /// Width of the pooled representation. A property of the encoder, not of
    /// the classifier configuration.
    fn hidden_size(&self) -> usize;

    /// Trainable parameters to expose to the optimizer. Frozen encoders
    /// return an empty list.
    fn named_parameters(&self) -> Vec<(String, Var)> {
        Vec::new()
    }
}

/// Configuration for [`EmbeddingEncoder`].
#[derive(Debug, Clone)]
pub struct EmbeddingEncoderConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
}

/// A minimal trainable encoder: token embeddings plus segment embeddings,
/// mean-pooled over the positions the attention mask keeps.
///
/// This is not a transformer; it exists so the full train/eval/predict loop
/// can run (and be tested) without downloading pretrained weights. Real
/// deployments implement [`SequenceEncoder`] over an actual pretrained model.
pub struct EmbeddingEncoder {
    config: EmbeddingEncoderConfig,
    token_weight: Var,
    segment_weight: Var,
}

impl EmbeddingEncoder {
    pub fn new(config: EmbeddingEncoderConfig, device: &candle_core::Device) -> Result<Self> {
        if config.vocab_size == 0 {
            return Err(Error::Msg("embedding encoder requires vocab_size > 0".into()));
        }
        if config.hidden_size == 0 {
            return Err(Error::Msg("embedding encoder requires hidden_size > 0".into()));
        }

        let token_weight = Var::randn(
            0f32,
            0.02f32,
            (config.vocab_size, config.hidden_size),
            device,
        )?;
        let segment_weight = Var::randn(0f32, 0.02f32, (2, config.hidden_size), device)?;

        Ok(Self {
            config,
            token_weight,
            segment_weight,
        })
    }

    fn validate_inputs(
        &self,
        input_ids: &Tensor,
        input_mask: &Tensor,
        segment_ids: &Tensor,
    ) -> Result<()> {
        let dims = input_ids.dims();
        if dims.len() != 2 {
            return Err(Error::Msg(format!(
                "input_ids must be shaped [batch, max_len], got {:?}",
                dims
            )));
        }
        if input_mask.dims() != dims || segment_ids.dims() != dims {
            return Err(Error::Msg(format!(
                "input_ids, input_mask and segment_ids must share one shape; got {:?}, {:?}, {:?}",
                dims,
                input_mask.dims(),
                segment_ids.dims()
            )));
        }
        Ok(())
    }
}

impl SequenceEncoder for EmbeddingEncoder {
    fn encode(
        &self,
        input_ids: &Tensor,
        input_mask: &Tensor,
        segment_ids: &Tensor,
    ) -> Result<Tensor> {
        self.validate_inputs(input_ids, input_mask, segment_ids)?;
        let (batch, seq) = input_ids.dims2()?;

        let token_ids = input_ids.to_dtype(DType::I64)?.flatten_all()?;
        let tokens = self
            .token_weight
            .as_tensor()
            .index_select(&token_ids, 0)?
            .reshape((batch, seq, self.config.hidden_size))?;

        let seg_ids = segment_ids.to_dtype(DType::I64)?.flatten_all()?;
        let segments = self
            .segment_weight
            .as_tensor()
            .index_select(&seg_ids, 0)?
            .reshape((batch, seq, self.config.hidden_size))?;

        let hidden = tokens.add(&segments)?;

        // Masked mean pooling: zero out padding positions, then divide each
        // example by its number of kept positions.
        let mask = input_mask.to_dtype(DType::F32)?;
        let mask_expanded = mask.unsqueeze(2)?;
        let summed = hidden.broadcast_mul(&mask_expanded)?.sum(1)?;
        let counts = mask.sum(1)?.clamp(1f32, f32::MAX)?.unsqueeze(1)?;
        summed.broadcast_div(&counts)
    }

    fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        vec![
            ("encoder.token_embedding".to_string(), self.token_weight.clone()),
            (
                "encoder.segment_embedding".to_string(),
                self.segment_weight.clone(),
            ),
        ]
    }
}
