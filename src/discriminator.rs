//! Deep-sets discriminator over a point set
//!
//! Per-element dense stack, mean pooling over the sequence axis, then a dense
//! head squashed with a sigmoid. The adversarial loss strategies evaluate it
//! on true and generated cluster sequences; it never sees the source side.

use candle_core::Tensor;
use candle_nn::{Dropout, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::error::CaloError;
use crate::CaloResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscriminatorConfig {
    /// Feature depth of the point set being judged
    pub input_depth: usize,
    /// Width of the per-element latent representation
    pub latent_dim: usize,
    /// Number of per-element dense layers before pooling
    pub num_layers: usize,
    /// Hidden width of the per-element layers
    pub hidden_units: usize,
    /// Width of the pooled classifier output
    pub output_units: usize,
    pub dropout_rate: f64,
}

impl Default for DiscriminatorConfig {
    fn default() -> Self {
        Self {
            input_depth: 3,
            latent_dim: 64,
            num_layers: 2,
            hidden_units: 128,
            output_units: 1,
            dropout_rate: 0.1,
        }
    }
}

impl DiscriminatorConfig {
    pub fn validate(&self) -> CaloResult<()> {
        for (name, value) in [
            ("input_depth", self.input_depth),
            ("latent_dim", self.latent_dim),
            ("num_layers", self.num_layers),
            ("hidden_units", self.hidden_units),
            ("output_units", self.output_units),
        ] {
            if value < 1 {
                return Err(CaloError::InvalidParameter(format!(
                    "`{}` should be >= 1, instead {} passed",
                    name, value
                )));
            }
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(CaloError::InvalidParameter(format!(
                "`dropout_rate` should be in [0, 1), instead {} passed",
                self.dropout_rate
            )));
        }
        Ok(())
    }
}

/// Permutation-invariant classifier used as the adversarial counterpart.
#[derive(Debug)]
pub struct Discriminator {
    element_layers: Vec<Linear>,
    head_hidden: Linear,
    head_out: Linear,
    dropout: Dropout,
    config: DiscriminatorConfig,
}

impl Discriminator {
    pub fn new(config: DiscriminatorConfig, vb: VarBuilder) -> CaloResult<Self> {
        config.validate()?;

        let mut element_layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            let in_dim = if i == 0 {
                config.input_depth
            } else {
                config.latent_dim
            };
            element_layers.push(candle_nn::linear(
                in_dim,
                config.latent_dim,
                vb.pp(format!("element_{}", i)),
            )?);
        }
        let head_hidden =
            candle_nn::linear(config.latent_dim, config.hidden_units, vb.pp("head_hidden"))?;
        let head_out =
            candle_nn::linear(config.hidden_units, config.output_units, vb.pp("head_out"))?;
        let dropout = Dropout::new(config.dropout_rate as f32);

        Ok(Self {
            element_layers,
            head_hidden,
            head_out,
            dropout,
            config,
        })
    }

    /// Classify [batch, seq_len, input_depth] into [batch, output_units]
    /// with values in (0, 1).
    pub fn forward(&self, x: &Tensor, train: bool) -> CaloResult<Tensor> {
        let (_batch, _len, depth) = x.dims3()?;
        if depth != self.config.input_depth {
            return Err(CaloError::shape(
                format!("input depth {}", self.config.input_depth),
                format!("{}", depth),
            ));
        }

        let mut h = x.clone();
        for layer in &self.element_layers {
            h = layer.forward(&h)?.relu()?;
            h = self.dropout.forward(&h, train)?;
        }
        // pooling over the sequence axis makes the head order-invariant
        let pooled = h.mean(1)?;
        let h = self.head_hidden.forward(&pooled)?.relu()?;
        let h = self.dropout.forward(&h, train)?;
        let logits = self.head_out.forward(&h)?;
        Ok(candle_nn::ops::sigmoid(&logits)?)
    }

    pub fn output_units(&self) -> usize {
        self.config.output_units
    }

    pub fn config(&self) -> &DiscriminatorConfig {
        &self.config
    }
}
