//! Encoder stack over the source point set
//!
//! A sequence-order embedding followed by `num_layers` self-attention layers.
//! Each layer is a pre-norm self-attention block and a feed-forward block; the
//! feed-forward block carries the optional residual-smoothing projection that
//! reconciles the layer input width with the configured output depth.

use candle_core::Tensor;
use candle_nn::{Module, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::attention::{FeedForward, MultiHeadAttention};
use crate::embedding::{SeqOrderConfig, SeqOrderEmbedding};
use crate::error::CaloError;
use crate::CaloResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Feature depth of the source point set
    pub input_depth: usize,
    /// Feature depth produced by every layer
    pub output_depth: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub key_dim: usize,
    /// Hidden width of the feed-forward blocks
    pub ff_units: usize,
    pub dropout_rate: f64,
    pub seq_ord: SeqOrderConfig,
    /// Add the sinusoidal ordering signal to the embedded input
    pub pos_sensitive: bool,
    /// Allow feature-width changes across residual additions
    pub residual_smoothing: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            input_depth: 3,
            output_depth: 32,
            num_layers: 5,
            num_heads: 4,
            key_dim: 64,
            ff_units: 256,
            dropout_rate: 0.1,
            seq_ord: SeqOrderConfig::default(),
            pos_sensitive: true,
            residual_smoothing: true,
        }
    }
}

impl EncoderConfig {
    pub fn validate(&self) -> CaloResult<()> {
        for (name, value) in [
            ("input_depth", self.input_depth),
            ("output_depth", self.output_depth),
            ("num_layers", self.num_layers),
            ("num_heads", self.num_heads),
            ("key_dim", self.key_dim),
            ("ff_units", self.ff_units),
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
        if !self.residual_smoothing && self.seq_ord.latent_dim != self.output_depth {
            return Err(CaloError::InvalidParameter(format!(
                "without residual smoothing the embedding latent dim should \
                 equal `output_depth`, instead {} and {} passed",
                self.seq_ord.latent_dim, self.output_depth
            )));
        }
        Ok(())
    }
}

/// One self-attention + feed-forward layer.
#[derive(Debug)]
pub struct EncoderLayer {
    norm: candle_nn::LayerNorm,
    self_attn: MultiHeadAttention,
    ff: FeedForward,
    output_depth: usize,
}

impl EncoderLayer {
    pub fn new(
        input_depth: usize,
        output_depth: usize,
        num_heads: usize,
        key_dim: usize,
        ff_units: usize,
        dropout_rate: f64,
        residual_smoothing: bool,
        vb: VarBuilder,
    ) -> CaloResult<Self> {
        let norm = candle_nn::layer_norm(input_depth, 1e-5, vb.pp("norm"))?;
        let self_attn = MultiHeadAttention::new(
            input_depth,
            input_depth,
            input_depth,
            num_heads,
            key_dim,
            vb.pp("self_attn"),
        )?;
        let ff = FeedForward::new(
            input_depth,
            output_depth,
            ff_units,
            dropout_rate,
            residual_smoothing,
            vb.pp("ff"),
        )?;
        Ok(Self {
            norm,
            self_attn,
            ff,
            output_depth,
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> CaloResult<Tensor> {
        // self-attention block: normalize, attend, residual-add
        let normed = self.norm.forward(x)?;
        let (attended, _) = self.self_attn.forward(&normed, &normed, false)?;
        let x = (x + attended)?;
        // feed-forward block handles the width change
        self.ff.forward(&x, train)
    }

    pub fn output_depth(&self) -> usize {
        self.output_depth
    }
}

/// Self-attention stack producing the condition sequence for the decoder.
#[derive(Debug)]
pub struct Encoder {
    embed: SeqOrderEmbedding,
    layers: Vec<EncoderLayer>,
    config: EncoderConfig,
}

impl Encoder {
    pub fn new(config: EncoderConfig, vb: VarBuilder) -> CaloResult<Self> {
        config.validate()?;

        let device = vb.device().clone();
        let embed = SeqOrderEmbedding::new(
            config.input_depth,
            &config.seq_ord,
            config.pos_sensitive,
            vb.pp("seq_ord_embed"),
            &device,
        )?;

        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            let input_depth = if i == 0 {
                config.seq_ord.latent_dim
            } else {
                config.output_depth
            };
            layers.push(EncoderLayer::new(
                input_depth,
                config.output_depth,
                config.num_heads,
                config.key_dim,
                config.ff_units,
                config.dropout_rate,
                config.residual_smoothing,
                vb.pp(format!("layer_{}", i)),
            )?);
        }

        Ok(Self {
            embed,
            layers,
            config,
        })
    }

    /// Encode [batch, src_len, input_depth] into [batch, src_len, output_depth].
    pub fn forward(&self, source: &Tensor, train: bool) -> CaloResult<Tensor> {
        let mut x = self.embed.forward(source, train)?;
        for layer in &self.layers {
            x = layer.forward(&x, train)?;
        }
        Ok(x)
    }

    pub fn output_depth(&self) -> usize {
        self.config.output_depth
    }

    pub fn num_layers(&self) -> usize {
        self.config.num_layers
    }
}
