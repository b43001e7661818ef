//! Learning-rate schedules for fine-tuning.
//!
//! Both schedules ramp linearly from zero over the warmup window. After
//! warmup, [`WarmupLinearDecay`] decays linearly to zero at the final step
//! while [`WarmupConstant`] holds the base rate.

use crate::config::{FineTuneError, ScheduleSettings, ScheduleStrategy};

pub trait LrSchedule: Send {
    /// Advances one step and returns the learning rate for that step.
    fn step(&mut self) -> f64;

    /// The rate the most recent step used, without advancing.
    fn learning_rate(&self) -> f64;
}

pub fn build_schedule(
    base_lr: f64,
    settings: &ScheduleSettings,
) -> Result<Box<dyn LrSchedule>, FineTuneError> {
    match settings.strategy {
        ScheduleStrategy::LinearDecay => Ok(Box::new(WarmupLinearDecay::new(
            base_lr,
            settings.num_train_steps,
            settings.num_warmup_steps,
        )?)),
        ScheduleStrategy::Constant => Ok(Box::new(WarmupConstant::new(
            base_lr,
            settings.num_warmup_steps,
        )?)),
    }
}

/// Linear warmup to `base_lr`, then linear decay to zero at `num_train_steps`.
#[derive(Debug, Clone)]
pub struct WarmupLinearDecay {
    base_lr: f64,
    num_train_steps: usize,
    num_warmup_steps: usize,
    current_step: usize,
    current_lr: f64,
}

impl WarmupLinearDecay {
    pub fn new(
        base_lr: f64,
        num_train_steps: usize,
        num_warmup_steps: usize,
    ) -> Result<Self, FineTuneError> {
        if base_lr <= 0.0 {
            return Err(FineTuneError::initialization(format!(
                "base learning rate must be positive, got {base_lr}"
            )));
        }
        if num_train_steps == 0 {
            return Err(FineTuneError::initialization(
                "num_train_steps must be at least 1",
            ));
        }
        if num_warmup_steps > num_train_steps {
            return Err(FineTuneError::initialization(format!(
                "warmup steps ({num_warmup_steps}) exceed total steps ({num_train_steps})"
            )));
        }
        Ok(Self {
            base_lr,
            num_train_steps,
            num_warmup_steps,
            current_step: 0,
            current_lr: 0.0,
        })
    }

    fn rate_at(&self, step: usize) -> f64 {
        if step <= self.num_warmup_steps && self.num_warmup_steps > 0 {
            return self.base_lr * step as f64 / self.num_warmup_steps as f64;
        }
        if step >= self.num_train_steps {
            return 0.0;
        }
        let decay_span = (self.num_train_steps - self.num_warmup_steps) as f64;
        let progressed = (step - self.num_warmup_steps) as f64;
        self.base_lr * (1.0 - progressed / decay_span)
    }
}

impl LrSchedule for WarmupLinearDecay {
    fn step(&mut self) -> f64 {
        self.current_step += 1;
        self.current_lr = self.rate_at(self.current_step);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }
}

/// Linear warmup to `base_lr`, then a flat rate forever after.
#[derive(Debug, Clone)]
pub struct WarmupConstant {
    base_lr: f64,
    num_warmup_steps: usize,
    current_step: usize,
    current_lr: f64,
}

impl WarmupConstant {
    pub fn new(base_lr: f64, num_warmup_steps: usize) -> Result<Self, FineTuneError> {
        if base_lr <= 0.0 {
            return Err(FineTuneError::initialization(format!(
                "base learning rate must be positive, got {base_lr}"
            )));
        }
        Ok(Self {
            base_lr,
            num_warmup_steps,
            current_step: 0,
            current_lr: 0.0,
        })
    }
}

impl LrSchedule for WarmupConstant {
    fn step(&mut self) -> f64 {
        self.current_step += 1;
        self.current_lr = if self.current_step <= self.num_warmup_steps && self.num_warmup_steps > 0
        {
            self.base_lr * self.current_step as f64 / self.num_warmup_steps as f64
        } else {
            self.base_lr
        };
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }
}
