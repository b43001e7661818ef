//! AdamW with decoupled weight decay and global-norm gradient clipping.
//!
//! Weight decay is skipped for parameters whose names match an exclusion
//! substring, so biases and normalization scales stay undecayed. Gradients
//! are rescaled once per step when their global norm exceeds the cap.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};

use crate::config::{to_runtime_error, FineTuneError, OptimizerSettings, ScheduleSettings};
use crate::scheduler::{build_schedule, LrSchedule};

struct ParamSlot {
    name: String,
    param: Var,
    first_moment: Tensor,
    second_moment: Tensor,
    apply_weight_decay: bool,
}

pub struct AdamW {
    slots: Vec<ParamSlot>,
    learning_rate: f64,
    weight_decay: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    max_grad_norm: Option<f64>,
    step: usize,
}

impl AdamW {
    pub fn new(
        named_params: Vec<(String, Var)>,
        settings: &OptimizerSettings,
    ) -> Result<Self, FineTuneError> {
        if named_params.is_empty() {
            return Err(FineTuneError::initialization(
                "optimizer needs at least one parameter",
            ));
        }

        let mut slots = Vec::with_capacity(named_params.len());
        for (name, param) in named_params {
            let first_moment = param.zeros_like().map_err(to_runtime_error)?;
            let second_moment = param.zeros_like().map_err(to_runtime_error)?;
            let apply_weight_decay = !settings
                .weight_decay_exclude
                .iter()
                .any(|fragment| name.contains(fragment.as_str()));
            slots.push(ParamSlot {
                name,
                param,
                first_moment,
                second_moment,
                apply_weight_decay,
            });
        }

        Ok(Self {
            slots,
            learning_rate: settings.learning_rate,
            weight_decay: settings.weight_decay,
            beta1: settings.beta1,
            beta2: settings.beta2,
            epsilon: settings.epsilon,
            max_grad_norm: settings.max_grad_norm,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    pub fn num_params(&self) -> usize {
        self.slots.len()
    }

    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|slot| slot.name.as_str())
    }

    /// Applies one update from the gradients of the current backward pass.
    pub fn step(&mut self, grads: &GradStore) -> Result<(), FineTuneError> {
        self.step += 1;
        let clip_scale = self.clip_scale(grads)?;

        let bias1 = 1.0 - self.beta1.powi(self.step as i32);
        let bias2 = 1.0 - self.beta2.powi(self.step as i32);
        let lr = self.learning_rate;
        let weight_decay = self.weight_decay;
        let beta1 = self.beta1;
        let beta2 = self.beta2;
        let epsilon = self.epsilon;

        for slot in &mut self.slots {
            let grad = match grads.get(&slot.param) {
                Some(grad) => grad,
                None => continue,
            };
            Self::update_slot(
                slot,
                grad,
                clip_scale,
                lr,
                weight_decay,
                beta1,
                beta2,
                epsilon,
                bias1,
                bias2,
            )
            .map_err(to_runtime_error)?;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn update_slot(
        slot: &mut ParamSlot,
        grad: &Tensor,
        clip_scale: Option<f64>,
        lr: f64,
        weight_decay: f64,
        beta1: f64,
        beta2: f64,
        epsilon: f64,
        bias1: f64,
        bias2: f64,
    ) -> candle_core::Result<()> {
        let grad = match clip_scale {
            Some(scale) => grad.affine(scale, 0.0)?,
            None => grad.clone(),
        };

        slot.first_moment = ((&slot.first_moment * beta1)? + (&grad * (1.0 - beta1))?)?;
        slot.second_moment = ((&slot.second_moment * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;

        let first_hat = (&slot.first_moment / bias1)?;
        let second_hat = (&slot.second_moment / bias2)?;
        let denom = (second_hat.sqrt()? + epsilon)?;
        let update = (first_hat / denom)?;

        let mut next = if slot.apply_weight_decay {
            slot.param.affine(1.0 - lr * weight_decay, 0.0)?
        } else {
            slot.param.as_tensor().clone()
        };
        next = (next - (update * lr)?)?;
        slot.param.set(&next)
    }

    /// Returns the rescale factor when the global gradient norm exceeds the
    /// configured cap, `None` when no rescale is needed.
    fn clip_scale(&self, grads: &GradStore) -> Result<Option<f64>, FineTuneError> {
        let max_norm = match self.max_grad_norm {
            Some(max_norm) => max_norm,
            None => return Ok(None),
        };

        let mut squared_sum = 0f64;
        for slot in &self.slots {
            if let Some(grad) = grads.get(&slot.param) {
                let sq = grad
                    .sqr()
                    .and_then(|g| g.sum_all())
                    .and_then(|g| g.to_scalar::<f32>())
                    .map_err(to_runtime_error)?;
                squared_sum += f64::from(sq);
            }
        }

        let global_norm = squared_sum.sqrt();
        if global_norm > max_norm {
            Ok(Some(max_norm / (global_norm + 1e-6)))
        } else {
            Ok(None)
        }
    }
}

/// Builds the standard fine-tuning optimizer: AdamW with decoupled decay,
/// gradient clipping, and a warmup schedule over the optimizer settings.
pub fn create_optimizer(
    named_params: Vec<(String, Var)>,
    optimizer: &OptimizerSettings,
    schedule: &ScheduleSettings,
) -> Result<(AdamW, Box<dyn LrSchedule>), FineTuneError> {
    let adamw = AdamW::new(named_params, optimizer)?;
    let schedule = build_schedule(optimizer.learning_rate, schedule)?;
    Ok((adamw, schedule))
}
