//! Streaming evaluation metrics
//!
//! Each metric accumulates a weighted mean across `update_state` calls and
//! reports it from `result`. The optional per-example `sample_weight` follows
//! the same contract as the losses: `None` is exactly a uniform weight of 1.0.

use candle_core::{Tensor, D};

use crate::error::CaloError;
use crate::CaloResult;

const EPS: f64 = 1e-7;

/// Streaming metric over batches of predictions.
pub trait Metric {
    fn name(&self) -> &'static str;

    /// Fold one batch into the running state.
    fn update_state(
        &mut self,
        y_true: &Tensor,
        y_pred: &Tensor,
        sample_weight: Option<&Tensor>,
    ) -> CaloResult<()>;

    /// Current value of the metric.
    fn result(&self) -> f64;

    fn reset_state(&mut self);
}

/// Weighted running mean shared by all metric variants.
#[derive(Debug, Default, Clone)]
struct WeightedMean {
    weighted_sum: f64,
    weight_total: f64,
}

impl WeightedMean {
    /// Fold per-example values [batch] with their weights.
    fn update(&mut self, per_example: &Tensor, sample_weight: Option<&Tensor>) -> CaloResult<()> {
        match sample_weight {
            None => {
                self.weighted_sum += per_example.sum_all()?.to_scalar::<f32>()? as f64;
                self.weight_total += per_example.elem_count() as f64;
            }
            Some(w) => {
                if w.dims() != per_example.dims() {
                    return Err(CaloError::shape(
                        format!("sample_weight of shape {:?}", per_example.dims()),
                        format!("{:?}", w.dims()),
                    ));
                }
                self.weighted_sum +=
                    per_example.broadcast_mul(w)?.sum_all()?.to_scalar::<f32>()? as f64;
                self.weight_total += w.sum_all()?.to_scalar::<f32>()? as f64;
            }
        }
        Ok(())
    }

    fn mean(&self) -> f64 {
        if self.weight_total == 0.0 {
            0.0
        } else {
            self.weighted_sum / self.weight_total
        }
    }

    fn reset(&mut self) {
        self.weighted_sum = 0.0;
        self.weight_total = 0.0;
    }
}

/// Mean over every axis except the batch axis, yielding [batch].
fn per_example_mean(x: &Tensor) -> CaloResult<Tensor> {
    let batch = x.dim(0)?;
    let flat = x.reshape((batch, x.elem_count() / batch))?;
    Ok(flat.mean(D::Minus1)?)
}

/// Fraction of elements on the same side of `threshold` in both tensors.
#[derive(Debug, Clone)]
pub struct Accuracy {
    threshold: f64,
    state: WeightedMean,
}

impl Accuracy {
    pub fn new(threshold: f64) -> CaloResult<Self> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(CaloError::InvalidParameter(format!(
                "`threshold` should be in [0, 1], instead {} passed",
                threshold
            )));
        }
        Ok(Self {
            threshold,
            state: WeightedMean::default(),
        })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

impl Default for Accuracy {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            state: WeightedMean::default(),
        }
    }
}

impl Metric for Accuracy {
    fn name(&self) -> &'static str {
        "accuracy"
    }

    fn update_state(
        &mut self,
        y_true: &Tensor,
        y_pred: &Tensor,
        sample_weight: Option<&Tensor>,
    ) -> CaloResult<()> {
        let true_pos = y_true.ge(self.threshold)?.to_dtype(y_true.dtype())?;
        let pred_pos = y_pred.ge(self.threshold)?.to_dtype(y_pred.dtype())?;
        let matches = true_pos.eq(&pred_pos)?.to_dtype(y_true.dtype())?;
        self.state
            .update(&per_example_mean(&matches)?, sample_weight)
    }

    fn result(&self) -> f64 {
        self.state.mean()
    }

    fn reset_state(&mut self) {
        self.state.reset();
    }
}

/// Binary cross-entropy of probabilities against binary targets.
#[derive(Debug, Default, Clone)]
pub struct BinaryCrossentropy {
    state: WeightedMean,
}

impl Metric for BinaryCrossentropy {
    fn name(&self) -> &'static str {
        "bce"
    }

    fn update_state(
        &mut self,
        y_true: &Tensor,
        y_pred: &Tensor,
        sample_weight: Option<&Tensor>,
    ) -> CaloResult<()> {
        let y_pred = y_pred.clamp(EPS, 1.0 - EPS)?;
        let pos = y_true.broadcast_mul(&y_pred.log()?)?;
        let neg = (1.0 - y_true)?.broadcast_mul(&(1.0 - &y_pred)?.log()?)?;
        let bce = (pos + neg)?.neg()?;
        self.state.update(&per_example_mean(&bce)?, sample_weight)
    }

    fn result(&self) -> f64 {
        self.state.mean()
    }

    fn reset_state(&mut self) {
        self.state.reset();
    }
}

#[derive(Debug, Default, Clone)]
pub struct MeanAbsoluteError {
    state: WeightedMean,
}

impl Metric for MeanAbsoluteError {
    fn name(&self) -> &'static str {
        "mae"
    }

    fn update_state(
        &mut self,
        y_true: &Tensor,
        y_pred: &Tensor,
        sample_weight: Option<&Tensor>,
    ) -> CaloResult<()> {
        let abs_err = (y_true - y_pred)?.abs()?;
        self.state
            .update(&per_example_mean(&abs_err)?, sample_weight)
    }

    fn result(&self) -> f64 {
        self.state.mean()
    }

    fn reset_state(&mut self) {
        self.state.reset();
    }
}

/// Square root of the weighted mean of squared errors.
#[derive(Debug, Default, Clone)]
pub struct RootMeanSquaredError {
    state: WeightedMean,
}

impl Metric for RootMeanSquaredError {
    fn name(&self) -> &'static str {
        "rmse"
    }

    fn update_state(
        &mut self,
        y_true: &Tensor,
        y_pred: &Tensor,
        sample_weight: Option<&Tensor>,
    ) -> CaloResult<()> {
        let sq_err = (y_true - y_pred)?.sqr()?;
        self.state
            .update(&per_example_mean(&sq_err)?, sample_weight)
    }

    fn result(&self) -> f64 {
        self.state.mean().sqrt()
    }

    fn reset_state(&mut self) {
        self.state.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn tensors() -> (Tensor, Tensor) {
        let y_true = Tensor::from_vec(
            vec![0.0f32, 1.0, 1.0, 0.0, 1.0, 0.0],
            (3, 2),
            &Device::Cpu,
        )
        .unwrap();
        let y_pred = Tensor::from_vec(
            vec![0.1f32, 0.9, 0.4, 0.2, 0.8, 0.7],
            (3, 2),
            &Device::Cpu,
        )
        .unwrap();
        (y_true, y_pred)
    }

    fn all_metrics() -> Vec<Box<dyn Metric>> {
        vec![
            Box::new(Accuracy::default()),
            Box::new(BinaryCrossentropy::default()),
            Box::new(MeanAbsoluteError::default()),
            Box::new(RootMeanSquaredError::default()),
        ]
    }

    #[test]
    fn test_unweighted_equals_uniform_weight() {
        let (y_true, y_pred) = tensors();
        let ones = Tensor::ones(3, DType::F32, &Device::Cpu).unwrap();
        for mut metric in all_metrics() {
            metric.update_state(&y_true, &y_pred, None).unwrap();
            let unweighted = metric.result();
            metric.reset_state();
            metric.update_state(&y_true, &y_pred, Some(&ones)).unwrap();
            let weighted = metric.result();
            assert!(
                (unweighted - weighted).abs() < 1e-6,
                "{}: {} vs {}",
                metric.name(),
                unweighted,
                weighted
            );
        }
    }

    #[test]
    fn test_accuracy_value() {
        let (y_true, y_pred) = tensors();
        let mut acc = Accuracy::default();
        acc.update_state(&y_true, &y_pred, None).unwrap();
        // rows agree on 2/2, 1/2 and 1/2 elements
        assert!((acc.result() - 4.0 / 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_mae_value() {
        let (y_true, y_pred) = tensors();
        let mut mae = MeanAbsoluteError::default();
        mae.update_state(&y_true, &y_pred, None).unwrap();
        let expected = (0.1 + 0.1 + 0.6 + 0.2 + 0.2 + 0.7) / 6.0;
        assert!((mae.result() - expected).abs() < 1e-6);
    }

    #[test]
    fn test_rmse_matches_hand_computation() {
        let (y_true, y_pred) = tensors();
        let mut rmse = RootMeanSquaredError::default();
        rmse.update_state(&y_true, &y_pred, None).unwrap();
        let mse: f64 = [0.1f64, 0.1, 0.6, 0.2, 0.2, 0.7]
            .iter()
            .map(|e| e * e)
            .sum::<f64>()
            / 6.0;
        assert!((rmse.result() - mse.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_accumulation_across_batches() {
        let (y_true, y_pred) = tensors();
        let mut mae = MeanAbsoluteError::default();
        mae.update_state(&y_true, &y_pred, None).unwrap();
        let one_batch = mae.result();
        mae.update_state(&y_true, &y_pred, None).unwrap();
        // same batch twice leaves the running mean unchanged
        assert!((mae.result() - one_batch).abs() < 1e-9);
    }

    #[test]
    fn test_reset_state() {
        let (y_true, y_pred) = tensors();
        let mut mae = MeanAbsoluteError::default();
        mae.update_state(&y_true, &y_pred, None).unwrap();
        mae.reset_state();
        assert_eq!(mae.result(), 0.0);
    }

    #[test]
    fn test_accuracy_threshold_validated() {
        assert!(matches!(
            Accuracy::new(1.5),
            Err(CaloError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_weight_shape_mismatch_rejected() {
        let (y_true, y_pred) = tensors();
        let bad = Tensor::ones(5, DType::F32, &Device::Cpu).unwrap();
        let mut mae = MeanAbsoluteError::default();
        assert!(matches!(
            mae.update_state(&y_true, &y_pred, Some(&bad)),
            Err(CaloError::ShapeMismatch { .. })
        ));
    }
}
