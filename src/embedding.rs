//! Sequence order embedding
//!
//! Point sets carry no intrinsic ordering, so the attention stacks inject a
//! sinusoidal ordering signal before the first layer: the input features are
//! projected to a latent width and a precomputed position encoding is added.
//! With `positional` disabled the projection alone is applied, keeping the
//! stack permutation-insensitive.

use candle_core::{Device, Tensor};
use candle_nn::{Dropout, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::error::CaloError;
use crate::CaloResult;

/// Configuration of the sequence-order embedding shared by encoder and decoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeqOrderConfig {
    /// Width of the latent ordering space
    pub latent_dim: usize,
    /// Longest sequence the encoding table covers
    pub max_length: usize,
    /// Normalization base of the sinusoidal frequencies
    pub normalization: f64,
    /// Dropout applied after the encoding is added
    pub dropout_rate: f64,
}

impl Default for SeqOrderConfig {
    fn default() -> Self {
        Self {
            latent_dim: 16,
            max_length: 512,
            normalization: 10_000.0,
            dropout_rate: 0.0,
        }
    }
}

impl SeqOrderConfig {
    pub fn validate(&self) -> CaloResult<()> {
        if self.latent_dim < 1 {
            return Err(CaloError::InvalidParameter(format!(
                "`latent_dim` should be >= 1, instead {} passed",
                self.latent_dim
            )));
        }
        if self.max_length < 1 {
            return Err(CaloError::InvalidParameter(format!(
                "`max_length` should be >= 1, instead {} passed",
                self.max_length
            )));
        }
        if self.normalization <= 0.0 {
            return Err(CaloError::InvalidParameter(format!(
                "`normalization` should be > 0, instead {} passed",
                self.normalization
            )));
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

/// Projects a point set to the latent width and adds the ordering signal.
#[derive(Debug)]
pub struct SeqOrderEmbedding {
    proj: Linear,
    /// Precomputed sinusoidal table, [max_length, latent_dim]
    encoding: Tensor,
    dropout: Dropout,
    positional: bool,
    latent_dim: usize,
    max_length: usize,
    normalization: f64,
}

impl SeqOrderEmbedding {
    pub fn new(
        input_depth: usize,
        config: &SeqOrderConfig,
        positional: bool,
        vb: VarBuilder,
        device: &Device,
    ) -> CaloResult<Self> {
        config.validate()?;
        if input_depth < 1 {
            return Err(CaloError::InvalidParameter(format!(
                "`input_depth` should be >= 1, instead {} passed",
                input_depth
            )));
        }

        let proj = candle_nn::linear(input_depth, config.latent_dim, vb.pp("proj"))?;
        let encoding = Self::sinusoidal_table(
            config.max_length,
            config.latent_dim,
            config.normalization,
            device,
        )?;
        let dropout = Dropout::new(config.dropout_rate as f32);

        Ok(Self {
            proj,
            encoding,
            dropout,
            positional,
            latent_dim: config.latent_dim,
            max_length: config.max_length,
            normalization: config.normalization,
        })
    }

    /// Standard sinusoidal encoding: sin on even channels, cos on odd ones,
    /// frequencies geometric in the normalization base.
    fn sinusoidal_table(
        max_length: usize,
        latent_dim: usize,
        normalization: f64,
        device: &Device,
    ) -> CaloResult<Tensor> {
        let mut table = vec![0.0f32; max_length * latent_dim];
        for pos in 0..max_length {
            for i in 0..latent_dim {
                let exponent = 2.0 * (i / 2) as f64 / latent_dim as f64;
                let angle = pos as f64 / normalization.powf(exponent);
                table[pos * latent_dim + i] = if i % 2 == 0 {
                    angle.sin() as f32
                } else {
                    angle.cos() as f32
                };
            }
        }
        Ok(Tensor::from_vec(table, (max_length, latent_dim), device)?)
    }

    /// Forward pass over [batch, seq_len, input_depth].
    ///
    /// Fails when `seq_len` exceeds the configured maximum. For a fixed length
    /// and configuration the added signal is identical across calls.
    pub fn forward(&self, x: &Tensor, train: bool) -> CaloResult<Tensor> {
        let (_batch, seq_len, _depth) = x.dims3()?;
        if seq_len > self.max_length {
            return Err(CaloError::shape(
                format!("sequence length <= {}", self.max_length),
                format!("{}", seq_len),
            ));
        }

        let mut out = self.proj.forward(x)?;
        if self.positional {
            let pos = self.encoding.narrow(0, 0, seq_len)?.unsqueeze(0)?;
            out = out.broadcast_add(&pos)?;
        }
        Ok(self.dropout.forward(&out, train)?)
    }

    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn normalization(&self) -> f64 {
        self.normalization
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::{VarBuilder, VarMap};

    fn embedding(max_length: usize, positional: bool) -> SeqOrderEmbedding {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = SeqOrderConfig {
            latent_dim: 8,
            max_length,
            normalization: 10_000.0,
            dropout_rate: 0.0,
        };
        SeqOrderEmbedding::new(3, &config, positional, vb, &device).unwrap()
    }

    #[test]
    fn test_output_shape() {
        let emb = embedding(32, true);
        let x = Tensor::zeros((4, 10, 3), DType::F32, &Device::Cpu).unwrap();
        let out = emb.forward(&x, false).unwrap();
        assert_eq!(out.dims(), &[4, 10, 8]);
    }

    #[test]
    fn test_deterministic_at_inference() {
        let emb = embedding(32, true);
        let x = Tensor::randn(0f32, 1f32, (2, 10, 3), &Device::Cpu).unwrap();
        let a = emb.forward(&x, false).unwrap().flatten_all().unwrap();
        let b = emb.forward(&x, false).unwrap().flatten_all().unwrap();
        let diff = (a - b).unwrap().abs().unwrap().max(0).unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_length_above_maximum_fails() {
        let emb = embedding(8, true);
        let x = Tensor::zeros((1, 9, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            emb.forward(&x, false),
            Err(CaloError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_config_fails_eagerly() {
        let bad = SeqOrderConfig {
            dropout_rate: 1.0,
            ..SeqOrderConfig::default()
        };
        assert!(matches!(
            bad.validate(),
            Err(CaloError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_positional_signal_actually_added() {
        let with_pos = embedding(32, true);
        let x = Tensor::zeros((1, 4, 3), DType::F32, &Device::Cpu).unwrap();
        let out = with_pos.forward(&x, false).unwrap();
        // rows differ across positions because of the encoding
        let row0 = out.i((0, 0, ..)).unwrap();
        let row1 = out.i((0, 1, ..)).unwrap();
        let diff = (row0 - row1).unwrap().abs().unwrap().max(0).unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() > 0.0);
    }
}
