//! Autoregressive inference driver
//!
//! A [`Simulator`] borrows a trained, frozen [`Transformer`] and a start
//! token, then unrolls generation one position at a time: the growing
//! generated sequence is re-fed through the whole model each step and only
//! the last-position prediction is kept. No decode-state caching; the
//! O(max_length^2) cost is accepted for simplicity.

use candle_core::Tensor;

use crate::error::CaloError;
use crate::transformer::Transformer;
use crate::CaloResult;

/// Greedy autoregressive unroller over a frozen model.
#[derive(Debug)]
pub struct Simulator<'a> {
    transformer: &'a Transformer,
    start_token: Tensor,
}

impl<'a> Simulator<'a> {
    /// `start_token` is either [depth] (broadcast over any batch) or
    /// [batch, depth]; its depth must equal the model output depth.
    pub fn new(transformer: &'a Transformer, start_token: Tensor) -> CaloResult<Self> {
        let depth = match start_token.dims() {
            [depth] => *depth,
            [_, depth] => *depth,
            dims => {
                return Err(CaloError::shape(
                    "start token of rank 1 or 2".to_string(),
                    format!("rank {} tensor {:?}", dims.len(), dims),
                ))
            }
        };
        if depth != transformer.output_depth() {
            return Err(CaloError::shape(
                format!("start token depth {}", transformer.output_depth()),
                format!("{}", depth),
            ));
        }
        Ok(Self {
            transformer,
            start_token,
        })
    }

    /// Seed shaped [batch, 1, depth], broadcasting a batch of 1.
    fn seed(&self, batch: usize) -> CaloResult<Tensor> {
        let depth = self.transformer.output_depth();
        let seed = match self.start_token.dims() {
            [_] => self
                .start_token
                .unsqueeze(0)?
                .unsqueeze(0)?
                .expand((batch, 1, depth))?
                .contiguous()?,
            [token_batch, _] if *token_batch == 1 => self
                .start_token
                .unsqueeze(1)?
                .expand((batch, 1, depth))?
                .contiguous()?,
            [token_batch, _] if *token_batch == batch => self.start_token.unsqueeze(1)?,
            dims => {
                return Err(CaloError::shape(
                    format!("start token batch of 1 or {}", batch),
                    format!("{}", dims[0]),
                ))
            }
        };
        Ok(seed)
    }

    /// Generate exactly `max_length` positions for each source in the batch.
    /// The seed never appears in the returned [batch, max_length, depth].
    pub fn generate(&self, source: &Tensor, max_length: usize) -> CaloResult<Tensor> {
        if max_length < 1 {
            return Err(CaloError::InvalidParameter(format!(
                "`max_length` should be >= 1, instead {} passed",
                max_length
            )));
        }
        let (batch, _src_len, _src_depth) = source.dims3()?;

        // ordered buffer of [batch, 1, depth] steps, seed first
        let mut steps = vec![self.seed(batch)?];
        for _ in 0..max_length {
            let target = Tensor::cat(&steps, 1)?;
            let out = self.transformer.forward(source, &target, false)?;
            let last_pos = steps.len() - 1;
            steps.push(out.output.narrow(1, last_pos, 1)?);
        }
        Ok(Tensor::cat(&steps[1..], 1)?)
    }

    pub fn transformer(&self) -> &Transformer {
        self.transformer
    }

    pub fn start_token(&self) -> &Tensor {
        &self.start_token
    }
}

/// A [`Simulator`] with `max_length` frozen, exposing the fixed-signature
/// call used by the export contract.
#[derive(Debug)]
pub struct ExportSimulator<'a> {
    simulator: Simulator<'a>,
    max_length: usize,
}

impl<'a> ExportSimulator<'a> {
    pub fn new(simulator: Simulator<'a>, max_length: usize) -> CaloResult<Self> {
        if max_length < 1 {
            return Err(CaloError::InvalidParameter(format!(
                "`max_length` should be >= 1, instead {} passed",
                max_length
            )));
        }
        Ok(Self {
            simulator,
            max_length,
        })
    }

    /// The single-argument invocation: source in, generated sequence out.
    pub fn generate(&self, source: &Tensor) -> CaloResult<Tensor> {
        self.simulator.generate(source, self.max_length)
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn start_token(&self) -> &Tensor {
        self.simulator.start_token()
    }
}
