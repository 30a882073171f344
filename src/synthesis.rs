//! Synthesis stack: a decoder variant conditioned on a latent vector
//!
//! Structurally the same three blocks as a decoder layer, but every block is
//! preceded by one shared [`ModulatedLayerNorm`] whose scale/shift come from
//! an additional per-example latent vector `w`. Residual additions are plain
//! (the modulated norm already adapts per state), and the feature width stays
//! at `output_depth` through the whole stack.

use candle_core::Tensor;
use candle_nn::{Dropout, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::attention::MultiHeadAttention;
use crate::embedding::{SeqOrderConfig, SeqOrderEmbedding};
use crate::error::CaloError;
use crate::norm::ModulatedLayerNorm;
use crate::CaloResult;

const LN_EPSILON: f64 = 1e-3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// Feature depth of the target point set fed to the stack
    pub input_depth: usize,
    /// Feature depth produced by every layer
    pub output_depth: usize,
    /// Feature depth of the condition sequence
    pub condition_depth: usize,
    /// Width of the per-example latent vector `w`
    pub latent_depth: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub key_dim: usize,
    pub mlp_units: usize,
    pub dropout_rate: f64,
    pub seq_ord: SeqOrderConfig,
    pub enable_res_smoothing: bool,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            input_depth: 3,
            output_depth: 16,
            condition_depth: 32,
            latent_depth: 16,
            num_layers: 4,
            num_heads: 8,
            key_dim: 32,
            mlp_units: 128,
            dropout_rate: 0.0,
            seq_ord: SeqOrderConfig::default(),
            enable_res_smoothing: true,
        }
    }
}

impl SynthesisConfig {
    pub fn validate(&self) -> CaloResult<()> {
        for (name, value) in [
            ("input_depth", self.input_depth),
            ("output_depth", self.output_depth),
            ("condition_depth", self.condition_depth),
            ("latent_depth", self.latent_depth),
            ("num_layers", self.num_layers),
            ("num_heads", self.num_heads),
            ("key_dim", self.key_dim),
            ("mlp_units", self.mlp_units),
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
        self.seq_ord.validate()?;
        if !self.enable_res_smoothing && self.seq_ord.latent_dim != self.output_depth {
            return Err(CaloError::InvalidParameter(format!(
                "without residual smoothing the embedding latent dim should \
                 equal `output_depth`, instead {} and {} passed",
                self.seq_ord.latent_dim, self.output_depth
            )));
        }
        Ok(())
    }
}

/// One latent-modulated attention layer.
#[derive(Debug)]
pub struct SynthesisLayer {
    ln: ModulatedLayerNorm,
    self_attn: MultiHeadAttention,
    cross_attn: MultiHeadAttention,
    mlp_hidden: Linear,
    mlp_out: Linear,
    dropout: Dropout,
    output_depth: usize,
}

impl SynthesisLayer {
    pub fn new(
        output_depth: usize,
        condition_depth: usize,
        latent_depth: usize,
        num_heads: usize,
        key_dim: usize,
        mlp_units: usize,
        dropout_rate: f64,
        vb: VarBuilder,
    ) -> CaloResult<Self> {
        let ln = ModulatedLayerNorm::new(output_depth, latent_depth, LN_EPSILON, vb.pp("ln"))?;
        let self_attn = MultiHeadAttention::new(
            output_depth,
            output_depth,
            output_depth,
            num_heads,
            key_dim,
            vb.pp("self_attn"),
        )?;
        let cross_attn = MultiHeadAttention::new(
            output_depth,
            condition_depth,
            output_depth,
            num_heads,
            key_dim,
            vb.pp("cross_attn"),
        )?;
        let mlp_hidden = candle_nn::linear(output_depth, mlp_units, vb.pp("mlp_hidden"))?;
        let mlp_out = candle_nn::linear(mlp_units, output_depth, vb.pp("mlp_out"))?;
        let dropout = Dropout::new(dropout_rate as f32);

        Ok(Self {
            ln,
            self_attn,
            cross_attn,
            mlp_hidden,
            mlp_out,
            dropout,
            output_depth,
        })
    }

    /// Returns the transformed sequence and the cross-attention weights.
    pub fn forward(
        &self,
        x: &Tensor,
        w: &Tensor,
        condition: &Tensor,
        train: bool,
    ) -> CaloResult<(Tensor, Tensor)> {
        // self-attention block, causal
        let normed = self.ln.forward(x, w)?;
        let (attended, _) = self.self_attn.forward(&normed, &normed, true)?;
        let x = (x + attended)?;

        // cross-attention block
        let normed = self.ln.forward(&x, w)?;
        let (attended, scores) = self.cross_attn.forward(&normed, condition, false)?;
        let x = (x + attended)?;

        // MLP block
        let normed = self.ln.forward(&x, w)?;
        let h = self.mlp_hidden.forward(&normed)?.relu()?;
        let h = self.mlp_out.forward(&h)?;
        let h = self.dropout.forward(&h, train)?;
        let x = (x + h)?;

        Ok((x, scores))
    }

    pub fn output_depth(&self) -> usize {
        self.output_depth
    }
}

/// Latent-conditioned synthesis stack.
#[derive(Debug)]
pub struct SynthesisNet {
    embed: SeqOrderEmbedding,
    smooth: Option<(Linear, Dropout)>,
    layers: Vec<SynthesisLayer>,
    config: SynthesisConfig,
}

impl SynthesisNet {
    pub fn new(config: SynthesisConfig, vb: VarBuilder) -> CaloResult<Self> {
        config.validate()?;

        let device = vb.device().clone();
        let embed = SeqOrderEmbedding::new(
            config.input_depth,
            &config.seq_ord,
            true,
            vb.pp("seq_ord_embed"),
            &device,
        )?;

        let smooth = if config.enable_res_smoothing {
            let dense = candle_nn::linear(
                config.seq_ord.latent_dim,
                config.output_depth,
                vb.pp("smooth"),
            )?;
            Some((dense, Dropout::new(config.dropout_rate as f32)))
        } else {
            None
        };

        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            layers.push(SynthesisLayer::new(
                config.output_depth,
                config.condition_depth,
                config.latent_depth,
                config.num_heads,
                config.key_dim,
                config.mlp_units,
                config.dropout_rate,
                vb.pp(format!("layer_{}", i)),
            )?);
        }

        Ok(Self {
            embed,
            smooth,
            layers,
            config,
        })
    }

    /// Run the stack over `x` [batch, tgt_len, input_depth] modulated by `w`
    /// [batch, latent_depth] and conditioned on the encoder output.
    pub fn forward(
        &self,
        x: &Tensor,
        w: &Tensor,
        condition: &Tensor,
        train: bool,
    ) -> CaloResult<(Tensor, Tensor)> {
        let mut x = self.embed.forward(x, train)?;
        if let Some((dense, dropout)) = &self.smooth {
            x = dense.forward(&x)?.relu()?;
            x = dropout.forward(&x, train)?;
        }

        let mut last_scores = None;
        for layer in &self.layers {
            let (next, scores) = layer.forward(&x, w, condition, train)?;
            x = next;
            last_scores = Some(scores);
        }
        let scores = last_scores.ok_or_else(|| {
            CaloError::InvalidParameter("synthesis stack has no layers".to_string())
        })?;
        Ok((x, scores))
    }

    pub fn output_depth(&self) -> usize {
        self.config.output_depth
    }

    pub fn num_layers(&self) -> usize {
        self.config.num_layers
    }

    pub fn enable_res_smoothing(&self) -> bool {
        self.config.enable_res_smoothing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn vb() -> VarBuilder<'static> {
        let varmap = VarMap::new();
        VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu)
    }

    fn small_config(enable_res_smoothing: bool, output_depth: usize) -> SynthesisConfig {
        SynthesisConfig {
            input_depth: 4,
            output_depth,
            condition_depth: 5,
            latent_depth: output_depth,
            num_layers: 2,
            num_heads: 2,
            key_dim: 8,
            mlp_units: 32,
            dropout_rate: 0.0,
            seq_ord: SeqOrderConfig {
                latent_dim: 8,
                max_length: 32,
                ..SeqOrderConfig::default()
            },
            enable_res_smoothing,
        }
    }

    #[test]
    fn test_forward_shapes_with_smoothing() {
        let net = SynthesisNet::new(small_config(true, 10), vb()).unwrap();
        let source = Tensor::randn(0f32, 1f32, (6, 10, 5), &Device::Cpu).unwrap();
        let latent = Tensor::randn(0f32, 1f32, (6, 10), &Device::Cpu).unwrap();
        let target = Tensor::randn(0f32, 1f32, (6, 12, 4), &Device::Cpu).unwrap();
        let (out, _) = net.forward(&target, &latent, &source, false).unwrap();
        assert_eq!(out.dims(), &[6, 12, 10]);
    }

    #[test]
    fn test_forward_shapes_without_smoothing() {
        // latent_dim of the embedding must equal output_depth here
        let net = SynthesisNet::new(small_config(false, 8), vb()).unwrap();
        let source = Tensor::randn(0f32, 1f32, (6, 10, 5), &Device::Cpu).unwrap();
        let latent = Tensor::randn(0f32, 1f32, (6, 8), &Device::Cpu).unwrap();
        let target = Tensor::randn(0f32, 1f32, (6, 12, 4), &Device::Cpu).unwrap();
        let (out, _) = net.forward(&target, &latent, &source, false).unwrap();
        assert_eq!(out.dims(), &[6, 12, 8]);
    }

    #[test]
    fn test_smoothing_mismatch_rejected() {
        assert!(matches!(
            SynthesisNet::new(small_config(false, 10), vb()),
            Err(CaloError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_latent_modulates_output() {
        let net = SynthesisNet::new(small_config(true, 10), vb()).unwrap();
        let source = Tensor::randn(0f32, 1f32, (2, 6, 5), &Device::Cpu).unwrap();
        let target = Tensor::randn(0f32, 1f32, (2, 4, 4), &Device::Cpu).unwrap();
        let w0 = Tensor::zeros((2, 10), DType::F32, &Device::Cpu).unwrap();
        let w1 = Tensor::ones((2, 10), DType::F32, &Device::Cpu).unwrap();
        let (a, _) = net.forward(&target, &w0, &source, false).unwrap();
        let (b, _) = net.forward(&target, &w1, &source, false).unwrap();
        let diff = (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff > 0.0, "latent vector should modulate the output");
    }
}
