//! # ModulatedLayerNorm - conditioning-aware layer normalization
//!
//! Plain layer normalization over the last axis, except that the affine scale
//! and shift are not learned per-channel constants: they are projected from an
//! external conditioning vector, so one shared normalization can respond
//! differently per example/state.
//!
//! ## Formula
//! ```text
//! ModLN(x, w) = (x - mean(x)) / sqrt(var(x) + eps) * (1 + scale(w)) + shift(w)
//! ```
//! where `scale` and `shift` are linear maps of `w`, broadcast over the
//! sequence axis. Zero-initialized projections therefore start out as an
//! unmodulated layer norm.

use candle_core::{Tensor, D};
use candle_nn::{Linear, Module, VarBuilder};

use crate::error::CaloError;
use crate::CaloResult;

#[derive(Debug)]
pub struct ModulatedLayerNorm {
    scale_proj: Linear,
    shift_proj: Linear,
    eps: f64,
    depth: usize,
    latent_depth: usize,
}

impl ModulatedLayerNorm {
    pub fn new(depth: usize, latent_depth: usize, eps: f64, vb: VarBuilder) -> CaloResult<Self> {
        if depth < 1 {
            return Err(CaloError::InvalidParameter(format!(
                "`depth` should be >= 1, instead {} passed",
                depth
            )));
        }
        if latent_depth < 1 {
            return Err(CaloError::InvalidParameter(format!(
                "`latent_depth` should be >= 1, instead {} passed",
                latent_depth
            )));
        }
        if eps <= 0.0 {
            return Err(CaloError::InvalidParameter(format!(
                "`eps` should be > 0, instead {} passed",
                eps
            )));
        }

        let scale_proj = candle_nn::linear(latent_depth, depth, vb.pp("scale"))?;
        let shift_proj = candle_nn::linear(latent_depth, depth, vb.pp("shift"))?;
        Ok(Self {
            scale_proj,
            shift_proj,
            eps,
            depth,
            latent_depth,
        })
    }

    /// Normalize `x` [batch, seq_len, depth] modulated by `w` [batch, latent_depth].
    pub fn forward(&self, x: &Tensor, w: &Tensor) -> CaloResult<Tensor> {
        let (batch, _seq_len, depth) = x.dims3()?;
        let (w_batch, w_depth) = w.dims2()?;
        if depth != self.depth || w_depth != self.latent_depth || batch != w_batch {
            return Err(CaloError::shape(
                format!(
                    "x: (batch, seq, {}), w: (batch, {})",
                    self.depth, self.latent_depth
                ),
                format!("x: {:?}, w: {:?}", x.dims(), w.dims()),
            ));
        }

        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;

        // [batch, depth] -> [batch, 1, depth], broadcast over the sequence
        let scale = (self.scale_proj.forward(w)? + 1.0)?.unsqueeze(1)?;
        let shift = self.shift_proj.forward(w)?.unsqueeze(1)?;
        Ok(normed.broadcast_mul(&scale)?.broadcast_add(&shift)?)
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn latent_depth(&self) -> usize {
        self.latent_depth
    }
}
