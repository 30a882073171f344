//! Decoder stack over the target point set
//!
//! Each layer runs a causal self-attention block, a cross-attention block
//! against the condition sequence (the encoder output), and a position-wise
//! MLP block. Residual branches are scaled by an admin-style factor derived
//! from the residual count of the whole stack so that deep stacks stay
//! trainable. The cross-attention weights of the last layer are returned for
//! diagnostics; nothing is stashed in layer state.

use candle_core::Tensor;
use candle_nn::{Dropout, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::attention::MultiHeadAttention;
use crate::embedding::{SeqOrderConfig, SeqOrderEmbedding};
use crate::error::CaloError;
use crate::CaloResult;

/// Residual scaling strategy for deep decoder stacks.
///
/// The multiplier is applied to the identity branch of every residual
/// addition and is computed from the residual count `n` of the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminResScale {
    /// `sqrt(n)` scaling
    #[serde(rename = "O(n)")]
    OrderN,
    /// `ln(n)` scaling (at least 1)
    #[serde(rename = "O(logn)")]
    OrderLogN,
    /// plain residual additions
    #[serde(rename = "O(1)")]
    OrderOne,
}

impl AdminResScale {
    pub fn factor(&self, num_res_layers: usize) -> f64 {
        let n = num_res_layers.max(1) as f64;
        match self {
            AdminResScale::OrderN => n.sqrt(),
            AdminResScale::OrderLogN => n.ln().max(1.0),
            AdminResScale::OrderOne => 1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AdminResScale::OrderN => "O(n)",
            AdminResScale::OrderLogN => "O(logn)",
            AdminResScale::OrderOne => "O(1)",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Feature depth of the target point set fed to the stack
    pub input_depth: usize,
    /// Feature depth produced by every layer
    pub output_depth: usize,
    /// Feature depth of the condition sequence
    pub condition_depth: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub key_dim: usize,
    /// Hidden width of the per-layer MLP blocks
    pub mlp_units: usize,
    pub dropout_rate: f64,
    pub seq_ord: SeqOrderConfig,
    pub pos_sensitive: bool,
    /// Enable the smoothing projection between embedding and first layer
    pub enable_res_smoothing: bool,
    pub admin_res_scale: AdminResScale,
    /// Apply the causal mask to self-attention
    pub autoregressive_mode: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            input_depth: 3,
            output_depth: 32,
            condition_depth: 32,
            num_layers: 5,
            num_heads: 4,
            key_dim: 64,
            mlp_units: 128,
            dropout_rate: 0.1,
            seq_ord: SeqOrderConfig::default(),
            pos_sensitive: true,
            enable_res_smoothing: true,
            admin_res_scale: AdminResScale::OrderN,
            autoregressive_mode: true,
        }
    }
}

impl DecoderConfig {
    pub fn validate(&self) -> CaloResult<()> {
        for (name, value) in [
            ("input_depth", self.input_depth),
            ("output_depth", self.output_depth),
            ("condition_depth", self.condition_depth),
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

/// Causal self-attention + cross-attention + MLP, all at `output_depth`.
#[derive(Debug)]
pub struct DecoderLayer {
    norm_self: candle_nn::LayerNorm,
    norm_cross: candle_nn::LayerNorm,
    norm_mlp: candle_nn::LayerNorm,
    self_attn: MultiHeadAttention,
    cross_attn: MultiHeadAttention,
    mlp_hidden: Linear,
    mlp_out: Linear,
    dropout: Dropout,
    res_scale: f64,
    autoregressive: bool,
    output_depth: usize,
}

impl DecoderLayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        output_depth: usize,
        condition_depth: usize,
        num_heads: usize,
        key_dim: usize,
        mlp_units: usize,
        dropout_rate: f64,
        num_res_layers: usize,
        admin_res_scale: AdminResScale,
        autoregressive: bool,
        vb: VarBuilder,
    ) -> CaloResult<Self> {
        let norm_self = candle_nn::layer_norm(output_depth, 1e-5, vb.pp("norm_self"))?;
        let norm_cross = candle_nn::layer_norm(output_depth, 1e-5, vb.pp("norm_cross"))?;
        let norm_mlp = candle_nn::layer_norm(output_depth, 1e-5, vb.pp("norm_mlp"))?;
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
        let res_scale = admin_res_scale.factor(num_res_layers);

        Ok(Self {
            norm_self,
            norm_cross,
            norm_mlp,
            self_attn,
            cross_attn,
            mlp_hidden,
            mlp_out,
            dropout,
            res_scale,
            autoregressive,
            output_depth,
        })
    }

    /// Returns the transformed sequence and the cross-attention weights.
    pub fn forward(
        &self,
        x: &Tensor,
        condition: &Tensor,
        train: bool,
    ) -> CaloResult<(Tensor, Tensor)> {
        // self-attention block
        let normed = self.norm_self.forward(x)?;
        let (attended, _) = self.self_attn.forward(&normed, &normed, self.autoregressive)?;
        let x = ((x * self.res_scale)? + attended)?;

        // cross-attention block, unmasked
        let normed = self.norm_cross.forward(&x)?;
        let (attended, scores) = self.cross_attn.forward(&normed, condition, false)?;
        let x = ((x * self.res_scale)? + attended)?;

        // MLP block
        let normed = self.norm_mlp.forward(&x)?;
        let h = self.mlp_hidden.forward(&normed)?.relu()?;
        let h = self.mlp_out.forward(&h)?;
        let h = self.dropout.forward(&h, train)?;
        let x = ((x * self.res_scale)? + h)?;

        Ok((x, scores))
    }

    pub fn output_depth(&self) -> usize {
        self.output_depth
    }

    pub fn res_scale(&self) -> f64 {
        self.res_scale
    }

    pub fn autoregressive(&self) -> bool {
        self.autoregressive
    }
}

/// Cross-conditioned attention stack over the target sequence.
#[derive(Debug)]
pub struct Decoder {
    embed: SeqOrderEmbedding,
    smooth: Option<(Linear, Dropout)>,
    layers: Vec<DecoderLayer>,
    config: DecoderConfig,
}

impl Decoder {
    pub fn new(config: DecoderConfig, vb: VarBuilder) -> CaloResult<Self> {
        config.validate()?;

        let device = vb.device().clone();
        let embed = SeqOrderEmbedding::new(
            config.input_depth,
            &config.seq_ord,
            config.pos_sensitive,
            vb.pp("seq_ord_embed"),
            &device,
        )?;

        let smooth = if config.enable_res_smoothing {
            let dense = candle_nn::linear(
                config.seq_ord.latent_dim,
                config.output_depth,
                vb.pp("res_smooth"),
            )?;
            Some((dense, Dropout::new(config.dropout_rate as f32)))
        } else {
            None
        };

        // two attention residuals per layer dominate the depth scaling
        let num_res_layers = 2 * config.num_layers;
        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            layers.push(DecoderLayer::new(
                config.output_depth,
                config.condition_depth,
                config.num_heads,
                config.key_dim,
                config.mlp_units,
                config.dropout_rate,
                num_res_layers,
                config.admin_res_scale,
                config.autoregressive_mode,
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

    /// Decode [batch, tgt_len, input_depth] conditioned on the encoder
    /// output; returns the transformed sequence and the last layer's
    /// cross-attention weights.
    pub fn forward(
        &self,
        target: &Tensor,
        condition: &Tensor,
        train: bool,
    ) -> CaloResult<(Tensor, Tensor)> {
        let mut x = self.embed.forward(target, train)?;
        if let Some((dense, dropout)) = &self.smooth {
            x = dense.forward(&x)?.relu()?;
            x = dropout.forward(&x, train)?;
        }

        let mut last_scores = None;
        for layer in &self.layers {
            let (next, scores) = layer.forward(&x, condition, train)?;
            x = next;
            last_scores = Some(scores);
        }
        // num_layers >= 1 is enforced at construction
        let scores = last_scores.ok_or_else(|| {
            CaloError::InvalidParameter("decoder stack has no layers".to_string())
        })?;
        Ok((x, scores))
    }

    pub fn output_depth(&self) -> usize {
        self.config.output_depth
    }

    pub fn num_layers(&self) -> usize {
        self.config.num_layers
    }

    pub fn admin_res_scale(&self) -> AdminResScale {
        self.config.admin_res_scale
    }

    pub fn autoregressive_mode(&self) -> bool {
        self.config.autoregressive_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::{VarBuilder, VarMap};

    fn vb() -> VarBuilder<'static> {
        let varmap = VarMap::new();
        VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu)
    }

    fn small_config() -> DecoderConfig {
        DecoderConfig {
            input_depth: 3,
            output_depth: 16,
            condition_depth: 16,
            num_layers: 2,
            num_heads: 2,
            key_dim: 8,
            mlp_units: 32,
            dropout_rate: 0.0,
            seq_ord: SeqOrderConfig {
                latent_dim: 8,
                max_length: 64,
                ..SeqOrderConfig::default()
            },
            pos_sensitive: true,
            enable_res_smoothing: true,
            admin_res_scale: AdminResScale::OrderN,
            autoregressive_mode: true,
        }
    }

    #[test]
    fn test_admin_res_scale_factors() {
        assert_eq!(AdminResScale::OrderN.factor(4), 2.0);
        assert_eq!(AdminResScale::OrderOne.factor(10), 1.0);
        assert!((AdminResScale::OrderLogN.factor(10) - 10f64.ln()).abs() < 1e-12);
        // ln(n) is floored at 1 for shallow stacks
        assert_eq!(AdminResScale::OrderLogN.factor(2), 1.0);
    }

    #[test]
    fn test_forward_shapes() {
        let decoder = Decoder::new(small_config(), vb()).unwrap();
        let target = Tensor::randn(0f32, 1f32, (4, 12, 3), &Device::Cpu).unwrap();
        let condition = Tensor::randn(0f32, 1f32, (4, 10, 16), &Device::Cpu).unwrap();
        let (out, scores) = decoder.forward(&target, &condition, false).unwrap();
        assert_eq!(out.dims(), &[4, 12, 16]);
        assert_eq!(scores.dims(), &[4, 2, 12, 10]);
    }

    /// Copy of `target` with the features at `position` shifted by 10.
    fn perturb_at(target: &Tensor, position: usize) -> Tensor {
        let (batch, seq_len, depth) = target.dims3().unwrap();
        let mut data = target
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        for b in 0..batch {
            for c in 0..depth {
                data[b * seq_len * depth + position * depth + c] += 10.0;
            }
        }
        Tensor::from_vec(data, (batch, seq_len, depth), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_causal_self_attention_blocks_leakage() {
        // perturb the last target position; every earlier output position
        // must be unchanged when the causal mask is active
        let decoder = Decoder::new(small_config(), vb()).unwrap();
        let target = Tensor::randn(0f32, 1f32, (2, 8, 3), &Device::Cpu).unwrap();
        let condition = Tensor::randn(0f32, 1f32, (2, 5, 16), &Device::Cpu).unwrap();
        let perturbed = perturb_at(&target, 7);

        let (a, _) = decoder.forward(&target, &condition, false).unwrap();
        let (b, _) = decoder.forward(&perturbed, &condition, false).unwrap();
        let diff = (a.i((.., ..7, ..)).unwrap() - b.i((.., ..7, ..)).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5, "future positions leaked into the past: {}", diff);
    }

    #[test]
    fn test_non_autoregressive_mode_attends_everywhere() {
        let config = DecoderConfig {
            autoregressive_mode: false,
            ..small_config()
        };
        let decoder = Decoder::new(config, vb()).unwrap();
        let target = Tensor::randn(0f32, 1f32, (2, 8, 3), &Device::Cpu).unwrap();
        let condition = Tensor::randn(0f32, 1f32, (2, 5, 16), &Device::Cpu).unwrap();
        let perturbed = perturb_at(&target, 7);

        let (a, _) = decoder.forward(&target, &condition, false).unwrap();
        let (b, _) = decoder.forward(&perturbed, &condition, false).unwrap();
        let diff = (a.i((.., ..7, ..)).unwrap() - b.i((.., ..7, ..)).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff > 1e-4, "unmasked self-attention should mix positions");
    }

    #[test]
    fn test_invalid_dropout_rejected() {
        let config = DecoderConfig {
            dropout_rate: 1.5,
            ..small_config()
        };
        assert!(matches!(
            Decoder::new(config, vb()),
            Err(CaloError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_scale_string_round_trip() {
        assert_eq!(AdminResScale::OrderN.as_str(), "O(n)");
        let parsed: AdminResScale = serde_json::from_str("\"O(logn)\"").unwrap();
        assert_eq!(parsed, AdminResScale::OrderLogN);
    }
}
