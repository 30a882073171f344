//! Transformer composition: encoder, decoder and output head
//!
//! The encoder turns the source point set into the condition sequence; the
//! decoder transforms the target sequence under that condition; a final
//! projection maps to the configured output depth with an independently
//! configurable activation per output channel (spatial coordinates stay
//! unconstrained, an energy-fraction channel can be squashed to [0, 1]).
//!
//! The forward pass runs the decoder on the target exactly as given. The
//! teacher-forcing shift (prepend start token, drop the last step) is the
//! training loop's job, so the same forward drives autoregressive generation
//! where the input already begins with the seed.

use candle_core::{IndexOp, Tensor, D};
use candle_nn::{Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::decoder::{AdminResScale, Decoder, DecoderConfig};
use crate::embedding::SeqOrderConfig;
use crate::encoder::{Encoder, EncoderConfig};
use crate::error::CaloError;
use crate::CaloResult;

/// Activation applied to a single output channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputActivation {
    Linear,
    Relu,
    Sigmoid,
}

impl OutputActivation {
    fn apply(&self, x: &Tensor) -> CaloResult<Tensor> {
        Ok(match self {
            OutputActivation::Linear => x.clone(),
            OutputActivation::Relu => x.relu()?,
            OutputActivation::Sigmoid => candle_nn::ops::sigmoid(x)?,
        })
    }
}

/// Deterministic rule producing the start token from a target batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartTokenInitializer {
    Zeros,
    Ones,
    /// Per-feature mean of the first target position across the batch
    Mean,
}

/// Every recognized hyperparameter with its default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerConfig {
    /// Feature depth of the source point set
    pub source_depth: usize,
    /// Feature depth of the target point set and of the model output
    pub output_depth: usize,
    /// Feature depth inside the encoder stack
    pub encoder_depth: usize,
    /// Feature depth inside the decoder stack
    pub decoder_depth: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub key_dim: usize,
    /// Hidden width of the encoder feed-forward blocks
    pub ff_units: usize,
    /// Hidden width of the decoder MLP blocks
    pub mlp_units: usize,
    pub dropout_rate: f64,
    pub encoder_seq_ord: SeqOrderConfig,
    pub decoder_seq_ord: SeqOrderConfig,
    /// Inject the sinusoidal ordering signal on both sides
    pub pos_sensitive: bool,
    pub residual_smoothing: bool,
    pub admin_res_scale: AdminResScale,
    pub autoregressive_mode: bool,
    /// One entry per output channel, or a single entry applied to all
    pub output_activations: Vec<OutputActivation>,
    pub start_token_initializer: StartTokenInitializer,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            source_depth: 3,
            output_depth: 3,
            encoder_depth: 32,
            decoder_depth: 32,
            num_layers: 5,
            num_heads: 4,
            key_dim: 64,
            ff_units: 256,
            mlp_units: 128,
            dropout_rate: 0.1,
            encoder_seq_ord: SeqOrderConfig {
                latent_dim: 32,
                max_length: 512,
                normalization: 128.0,
                dropout_rate: 0.1,
            },
            decoder_seq_ord: SeqOrderConfig {
                latent_dim: 32,
                max_length: 512,
                normalization: 128.0,
                dropout_rate: 0.1,
            },
            pos_sensitive: true,
            residual_smoothing: true,
            admin_res_scale: AdminResScale::OrderN,
            autoregressive_mode: true,
            output_activations: vec![OutputActivation::Linear],
            start_token_initializer: StartTokenInitializer::Zeros,
        }
    }
}

impl TransformerConfig {
    pub fn validate(&self) -> CaloResult<()> {
        if self.output_activations.is_empty()
            || (self.output_activations.len() != 1
                && self.output_activations.len() != self.output_depth)
        {
            return Err(CaloError::InvalidParameter(format!(
                "`output_activations` should have 1 or {} entries, instead {} passed",
                self.output_depth,
                self.output_activations.len()
            )));
        }
        // remaining ranges are validated by the encoder/decoder configs
        self.encoder_config().validate()?;
        self.decoder_config().validate()?;
        Ok(())
    }

    fn encoder_config(&self) -> EncoderConfig {
        EncoderConfig {
            input_depth: self.source_depth,
            output_depth: self.encoder_depth,
            num_layers: self.num_layers,
            num_heads: self.num_heads,
            key_dim: self.key_dim,
            ff_units: self.ff_units,
            dropout_rate: self.dropout_rate,
            seq_ord: self.encoder_seq_ord.clone(),
            pos_sensitive: self.pos_sensitive,
            residual_smoothing: self.residual_smoothing,
        }
    }

    fn decoder_config(&self) -> DecoderConfig {
        DecoderConfig {
            input_depth: self.output_depth,
            output_depth: self.decoder_depth,
            condition_depth: self.encoder_depth,
            num_layers: self.num_layers,
            num_heads: self.num_heads,
            key_dim: self.key_dim,
            mlp_units: self.mlp_units,
            dropout_rate: self.dropout_rate,
            seq_ord: self.decoder_seq_ord.clone(),
            pos_sensitive: self.pos_sensitive,
            enable_res_smoothing: self.residual_smoothing,
            admin_res_scale: self.admin_res_scale,
            autoregressive_mode: self.autoregressive_mode,
        }
    }
}

/// Model output: predictions plus the decoder's last cross-attention weights.
#[derive(Debug)]
pub struct TransformerOutput {
    /// [batch, tgt_len, output_depth]
    pub output: Tensor,
    /// [batch, heads, tgt_len, src_len], diagnostics only
    pub attention: Tensor,
}

/// Encoder/decoder composition trained by the optimizer.
#[derive(Debug)]
pub struct Transformer {
    encoder: Encoder,
    decoder: Decoder,
    output_proj: Linear,
    config: TransformerConfig,
}

impl Transformer {
    pub fn new(config: TransformerConfig, vb: VarBuilder) -> CaloResult<Self> {
        config.validate()?;

        let encoder = Encoder::new(config.encoder_config(), vb.pp("encoder"))?;
        let decoder = Decoder::new(config.decoder_config(), vb.pp("decoder"))?;
        let output_proj = candle_nn::linear(
            config.decoder_depth,
            config.output_depth,
            vb.pp("output_proj"),
        )?;

        Ok(Self {
            encoder,
            decoder,
            output_proj,
            config,
        })
    }

    /// Run the full model on `(source, target)`.
    ///
    /// Shape requirements are checked before any tensor computation: equal
    /// batch sizes, source depth and target depth matching the configuration.
    pub fn forward(
        &self,
        source: &Tensor,
        target: &Tensor,
        train: bool,
    ) -> CaloResult<TransformerOutput> {
        let (src_batch, _src_len, src_depth) = source.dims3()?;
        let (tgt_batch, _tgt_len, tgt_depth) = target.dims3()?;
        if src_batch != tgt_batch {
            return Err(CaloError::shape(
                format!("matching batch sizes, source has {}", src_batch),
                format!("target batch {}", tgt_batch),
            ));
        }
        if src_depth != self.config.source_depth {
            return Err(CaloError::shape(
                format!("source depth {}", self.config.source_depth),
                format!("{}", src_depth),
            ));
        }
        if tgt_depth != self.config.output_depth {
            return Err(CaloError::shape(
                format!("target depth {}", self.config.output_depth),
                format!("{}", tgt_depth),
            ));
        }

        let condition = self.encoder.forward(source, train)?;
        let (decoded, attention) = self.decoder.forward(target, &condition, train)?;
        let projected = self.output_proj.forward(&decoded)?;
        let output = self.apply_output_activations(&projected)?;

        Ok(TransformerOutput { output, attention })
    }

    fn apply_output_activations(&self, x: &Tensor) -> CaloResult<Tensor> {
        let activations = &self.config.output_activations;
        if activations.len() == 1 {
            return activations[0].apply(x);
        }
        if activations.iter().all(|a| *a == OutputActivation::Linear) {
            return Ok(x.clone());
        }
        let mut channels = Vec::with_capacity(activations.len());
        for (i, activation) in activations.iter().enumerate() {
            let channel = x.narrow(D::Minus1, i, 1)?;
            channels.push(activation.apply(&channel)?);
        }
        Ok(Tensor::cat(&channels, D::Minus1)?)
    }

    /// Deterministic start token for a batch of target sequences,
    /// [batch, output_depth]. Seeds autoregressive generation.
    pub fn get_start_token(&self, target: &Tensor) -> CaloResult<Tensor> {
        let (batch, _len, depth) = target.dims3()?;
        if depth != self.config.output_depth {
            return Err(CaloError::shape(
                format!("target depth {}", self.config.output_depth),
                format!("{}", depth),
            ));
        }
        let token = match self.config.start_token_initializer {
            StartTokenInitializer::Zeros => {
                Tensor::zeros((batch, depth), target.dtype(), target.device())?
            }
            StartTokenInitializer::Ones => {
                Tensor::ones((batch, depth), target.dtype(), target.device())?
            }
            StartTokenInitializer::Mean => target
                .i((.., 0, ..))?
                .mean_keepdim(0)?
                .expand((batch, depth))?
                .contiguous()?,
        };
        Ok(token)
    }

    pub fn output_depth(&self) -> usize {
        self.config.output_depth
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }
}
