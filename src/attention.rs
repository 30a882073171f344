//! Multi-head attention and position-wise feed-forward primitives
//!
//! The attention layer keeps separate query/key/value projections sized
//! `num_heads * key_dim`, so the key width is decoupled from both the input
//! and output depths. Every forward returns the post-softmax attention
//! weights alongside the output; callers that want them for diagnostics take
//! them from the returned pair instead of reading hidden layer state.

use candle_core::{Device, Tensor, D};
use candle_nn::{Dropout, Linear, Module, VarBuilder};

use crate::error::CaloError;
use crate::CaloResult;

/// Additive causal mask: 0 where position i may attend to j (j <= i),
/// -inf elsewhere. Shape [len, len], broadcast over batch and heads.
pub fn causal_mask(len: usize, device: &Device) -> CaloResult<Tensor> {
    let mut data = vec![f32::NEG_INFINITY; len * len];
    for i in 0..len {
        for j in 0..=i {
            data[i * len + j] = 0.0;
        }
    }
    Ok(Tensor::from_vec(data, (len, len), device)?)
}

/// Multi-head attention with decoupled query/key-value widths.
#[derive(Debug)]
pub struct MultiHeadAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    num_heads: usize,
    key_dim: usize,
    scale: f64,
}

impl MultiHeadAttention {
    /// `query_depth`/`kv_depth` are the feature depths of the two input
    /// sequences; the output keeps `output_depth` features per position.
    pub fn new(
        query_depth: usize,
        kv_depth: usize,
        output_depth: usize,
        num_heads: usize,
        key_dim: usize,
        vb: VarBuilder,
    ) -> CaloResult<Self> {
        for (name, value) in [
            ("query_depth", query_depth),
            ("kv_depth", kv_depth),
            ("output_depth", output_depth),
            ("num_heads", num_heads),
            ("key_dim", key_dim),
        ] {
            if value < 1 {
                return Err(CaloError::InvalidParameter(format!(
                    "`{}` should be >= 1, instead {} passed",
                    name, value
                )));
            }
        }

        let inner = num_heads * key_dim;
        let query = candle_nn::linear(query_depth, inner, vb.pp("query"))?;
        let key = candle_nn::linear(kv_depth, inner, vb.pp("key"))?;
        let value = candle_nn::linear(kv_depth, inner, vb.pp("value"))?;
        let output = candle_nn::linear(inner, output_depth, vb.pp("output"))?;
        let scale = 1.0 / (key_dim as f64).sqrt();

        Ok(Self {
            query,
            key,
            value,
            output,
            num_heads,
            key_dim,
            scale,
        })
    }

    /// Attend `q_input` over `kv_input`; self-attention passes the same
    /// tensor for both. Returns `(output, weights)` with weights shaped
    /// [batch, heads, q_len, kv_len].
    pub fn forward(
        &self,
        q_input: &Tensor,
        kv_input: &Tensor,
        causal: bool,
    ) -> CaloResult<(Tensor, Tensor)> {
        let (batch, q_len, _) = q_input.dims3()?;
        let (kv_batch, kv_len, _) = kv_input.dims3()?;
        if batch != kv_batch {
            return Err(CaloError::shape(
                format!("key/value batch size {}", batch),
                format!("{}", kv_batch),
            ));
        }

        let q = self
            .query
            .forward(q_input)?
            .reshape((batch, q_len, self.num_heads, self.key_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .key
            .forward(kv_input)?
            .reshape((batch, kv_len, self.num_heads, self.key_dim))?
            .transpose(1, 2)?;
        let v = self
            .value
            .forward(kv_input)?
            .reshape((batch, kv_len, self.num_heads, self.key_dim))?
            .transpose(1, 2)?;

        // [B, H, Lq, Lkv]
        let mut scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * self.scale)?;
        if causal {
            let mask = causal_mask(q_len, q_input.device())?;
            scores = scores.broadcast_add(&mask)?;
        }
        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;

        let context = weights
            .matmul(&v.contiguous()?)?
            .transpose(1, 2)?
            .reshape((batch, q_len, self.num_heads * self.key_dim))?;
        let out = self.output.forward(&context)?;
        Ok((out, weights))
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn key_dim(&self) -> usize {
        self.key_dim
    }
}

/// Position-wise feed-forward block with residual add.
///
/// When `residual_smoothing` is enabled, the input is first projected to
/// `output_units` so the residual addition stays dimensionally valid after a
/// width change; with smoothing disabled the input depth must already equal
/// `output_units`, checked at construction.
#[derive(Debug)]
pub struct FeedForward {
    smooth: Option<Linear>,
    norm: candle_nn::LayerNorm,
    hidden: Linear,
    out: Linear,
    dropout: Dropout,
    output_units: usize,
    hidden_units: usize,
    dropout_rate: f64,
    residual_smoothing: bool,
}

impl FeedForward {
    pub fn new(
        input_units: usize,
        output_units: usize,
        hidden_units: usize,
        dropout_rate: f64,
        residual_smoothing: bool,
        vb: VarBuilder,
    ) -> CaloResult<Self> {
        for (name, value) in [
            ("input_units", input_units),
            ("output_units", output_units),
            ("hidden_units", hidden_units),
        ] {
            if value < 1 {
                return Err(CaloError::InvalidParameter(format!(
                    "`{}` should be >= 1, instead {} passed",
                    name, value
                )));
            }
        }
        if !(0.0..1.0).contains(&dropout_rate) {
            return Err(CaloError::InvalidParameter(format!(
                "`dropout_rate` should be in [0, 1), instead {} passed",
                dropout_rate
            )));
        }
        if !residual_smoothing && input_units != output_units {
            return Err(CaloError::InvalidParameter(format!(
                "without residual smoothing `input_units` should equal \
                 `output_units`, instead {} and {} passed",
                input_units, output_units
            )));
        }

        let smooth = if residual_smoothing {
            Some(candle_nn::linear(
                input_units,
                output_units,
                vb.pp("smooth"),
            )?)
        } else {
            None
        };
        let norm = candle_nn::layer_norm(output_units, 1e-5, vb.pp("norm"))?;
        let hidden = candle_nn::linear(output_units, hidden_units, vb.pp("hidden"))?;
        let out = candle_nn::linear(hidden_units, output_units, vb.pp("out"))?;
        let dropout = Dropout::new(dropout_rate as f32);

        Ok(Self {
            smooth,
            norm,
            hidden,
            out,
            dropout,
            output_units,
            hidden_units,
            dropout_rate,
            residual_smoothing,
        })
    }

    /// Normalize, project up then down, residual-add.
    pub fn forward(&self, x: &Tensor, train: bool) -> CaloResult<Tensor> {
        let x = match &self.smooth {
            Some(smooth) => smooth.forward(x)?,
            None => x.clone(),
        };
        let normed = self.norm.forward(&x)?;
        let h = self.hidden.forward(&normed)?.relu()?;
        let h = self.dropout.forward(&h, train)?;
        let h = self.out.forward(&h)?;
        Ok((x + h)?)
    }

    pub fn output_units(&self) -> usize {
        self.output_units
    }

    pub fn hidden_units(&self) -> usize {
        self.hidden_units
    }

    pub fn dropout_rate(&self) -> f64 {
        self.dropout_rate
    }

    pub fn residual_smoothing(&self) -> bool {
        self.residual_smoothing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::{VarBuilder, VarMap};

    fn vb() -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (varmap, vb)
    }

    #[test]
    fn test_attention_shapes() {
        let (_m, vb) = vb();
        let attn = MultiHeadAttention::new(8, 5, 8, 4, 16, vb).unwrap();
        let q = Tensor::randn(0f32, 1f32, (2, 10, 8), &Device::Cpu).unwrap();
        let kv = Tensor::randn(0f32, 1f32, (2, 7, 5), &Device::Cpu).unwrap();
        let (out, weights) = attn.forward(&q, &kv, false).unwrap();
        assert_eq!(out.dims(), &[2, 10, 8]);
        assert_eq!(weights.dims(), &[2, 4, 10, 7]);
    }

    #[test]
    fn test_attention_weights_sum_to_one() {
        let (_m, vb) = vb();
        let attn = MultiHeadAttention::new(8, 8, 8, 2, 4, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (1, 6, 8), &Device::Cpu).unwrap();
        let (_, weights) = attn.forward(&x, &x, true).unwrap();
        let sums = weights.sum(D::Minus1).unwrap().flatten_all().unwrap();
        for s in sums.to_vec1::<f32>().unwrap() {
            assert!((s - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_causal_mask_zeroes_future_weights() {
        let (_m, vb) = vb();
        let attn = MultiHeadAttention::new(4, 4, 4, 2, 4, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (1, 5, 4), &Device::Cpu).unwrap();
        let (_, weights) = attn.forward(&x, &x, true).unwrap();
        for i in 0..5 {
            for j in (i + 1)..5 {
                let w = weights
                    .i((0, 0, i, j))
                    .unwrap()
                    .to_scalar::<f32>()
                    .unwrap();
                assert_eq!(w, 0.0, "position {} attended to future position {}", i, j);
            }
        }
    }

    #[test]
    fn test_invalid_head_count_fails() {
        let (_m, vb) = vb();
        assert!(matches!(
            MultiHeadAttention::new(8, 8, 8, 0, 4, vb),
            Err(CaloError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_feed_forward_width_change() {
        let (_m, vb) = vb();
        let ff = FeedForward::new(8, 16, 32, 0.1, true, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (4, 12, 8), &Device::Cpu).unwrap();
        let out = ff.forward(&x, false).unwrap();
        assert_eq!(out.dims(), &[4, 12, 16]);
    }

    #[test]
    fn test_feed_forward_without_smoothing_requires_equal_depths() {
        let (_m, vb) = vb();
        assert!(matches!(
            FeedForward::new(8, 16, 32, 0.1, false, vb),
            Err(CaloError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_feed_forward_dropout_range_checked() {
        let (_m, vb) = vb();
        assert!(matches!(
            FeedForward::new(8, 8, 32, 1.0, false, vb),
            Err(CaloError::InvalidParameter(_))
        ));
    }
}
