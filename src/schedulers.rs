//! Learning-rate schedules driven by the optimizer step count
//!
//! Every scheduler owns a monotonically increasing step counter, stepped once
//! per optimizer update. The trainer calls `next_lr` right before each update
//! and pushes the returned rate into the live optimizer.

use crate::error::CaloError;
use crate::CaloResult;

/// State machine over a single integer step counter.
pub trait LrScheduler {
    /// Advance one step and return the learning rate for it.
    fn next_lr(&mut self) -> f64;

    /// Number of steps taken so far.
    fn current_step(&self) -> usize;
}

/// Warmup then inverse-square-root decay:
/// `lr(t) = d_model^-0.5 * min(t^-0.5, t * warmup_steps^-1.5)`.
///
/// Strictly increasing for `t < warmup_steps`, single maximum at
/// `t == warmup_steps`, decaying afterwards.
#[derive(Debug, Clone)]
pub struct AttentionDecay {
    d_model: usize,
    warmup_steps: usize,
    step: usize,
}

impl AttentionDecay {
    pub fn new(d_model: usize, warmup_steps: usize) -> CaloResult<Self> {
        if d_model < 1 {
            return Err(CaloError::InvalidParameter(format!(
                "`d_model` should be >= 1, instead {} passed",
                d_model
            )));
        }
        if warmup_steps < 1 {
            return Err(CaloError::InvalidParameter(format!(
                "`warmup_steps` should be >= 1, instead {} passed",
                warmup_steps
            )));
        }
        Ok(Self {
            d_model,
            warmup_steps,
            step: 0,
        })
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }

    fn lr_at(&self, step: usize) -> f64 {
        let t = step as f64;
        let decay = t.powf(-0.5);
        let warmup = t * (self.warmup_steps as f64).powf(-1.5);
        (self.d_model as f64).powf(-0.5) * decay.min(warmup)
    }
}

impl LrScheduler for AttentionDecay {
    fn next_lr(&mut self) -> f64 {
        self.step += 1;
        self.lr_at(self.step)
    }

    fn current_step(&self) -> usize {
        self.step
    }
}

/// Cosine decay from `initial_rate` down to `alpha * initial_rate` over
/// `decay_steps`, constant afterwards.
#[derive(Debug, Clone)]
pub struct CosineDecay {
    initial_rate: f64,
    decay_steps: usize,
    alpha: f64,
    step: usize,
}

impl CosineDecay {
    pub fn new(initial_rate: f64, decay_steps: usize, alpha: f64) -> CaloResult<Self> {
        if initial_rate <= 0.0 {
            return Err(CaloError::InvalidParameter(format!(
                "`initial_rate` should be > 0, instead {} passed",
                initial_rate
            )));
        }
        if decay_steps < 1 {
            return Err(CaloError::InvalidParameter(format!(
                "`decay_steps` should be >= 1, instead {} passed",
                decay_steps
            )));
        }
        if !(0.0..=1.0).contains(&alpha) {
            return Err(CaloError::InvalidParameter(format!(
                "`alpha` should be in [0, 1], instead {} passed",
                alpha
            )));
        }
        Ok(Self {
            initial_rate,
            decay_steps,
            alpha,
            step: 0,
        })
    }

    pub fn initial_rate(&self) -> f64 {
        self.initial_rate
    }

    pub fn decay_steps(&self) -> usize {
        self.decay_steps
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }
}

impl LrScheduler for CosineDecay {
    fn next_lr(&mut self) -> f64 {
        self.step += 1;
        let progress = (self.step.min(self.decay_steps) as f64) / (self.decay_steps as f64);
        let cosine = 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
        self.initial_rate * ((1.0 - self.alpha) * cosine + self.alpha)
    }

    fn current_step(&self) -> usize {
        self.step
    }
}

/// Exponential decay `initial_rate * decay_rate^(t / decay_steps)`, with the
/// exponent quantized to whole intervals when `staircase` is set.
#[derive(Debug, Clone)]
pub struct ExponentialDecay {
    initial_rate: f64,
    decay_rate: f64,
    decay_steps: usize,
    staircase: bool,
    step: usize,
}

impl ExponentialDecay {
    pub fn new(
        initial_rate: f64,
        decay_rate: f64,
        decay_steps: usize,
        staircase: bool,
    ) -> CaloResult<Self> {
        if initial_rate <= 0.0 {
            return Err(CaloError::InvalidParameter(format!(
                "`initial_rate` should be > 0, instead {} passed",
                initial_rate
            )));
        }
        if !(0.0..=1.0).contains(&decay_rate) || decay_rate == 0.0 {
            return Err(CaloError::InvalidParameter(format!(
                "`decay_rate` should be in (0, 1], instead {} passed",
                decay_rate
            )));
        }
        if decay_steps < 1 {
            return Err(CaloError::InvalidParameter(format!(
                "`decay_steps` should be >= 1, instead {} passed",
                decay_steps
            )));
        }
        Ok(Self {
            initial_rate,
            decay_rate,
            decay_steps,
            staircase,
            step: 0,
        })
    }

    pub fn initial_rate(&self) -> f64 {
        self.initial_rate
    }

    pub fn decay_rate(&self) -> f64 {
        self.decay_rate
    }

    pub fn decay_steps(&self) -> usize {
        self.decay_steps
    }

    pub fn staircase(&self) -> bool {
        self.staircase
    }
}

impl LrScheduler for ExponentialDecay {
    fn next_lr(&mut self) -> f64 {
        self.step += 1;
        let mut exponent = self.step as f64 / self.decay_steps as f64;
        if self.staircase {
            exponent = exponent.floor();
        }
        self.initial_rate * self.decay_rate.powf(exponent)
    }

    fn current_step(&self) -> usize {
        self.step
    }
}
