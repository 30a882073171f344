//! Adversarial loss strategies
//!
//! Each strategy evaluates the discriminator on the true and the generated
//! cluster sequences and reduces the two response distributions to one scalar.
//! The sign convention is the invariant of the whole adversarial setup: the
//! discriminator minimizes `-D(true, pred)` (divergence maximization), the
//! transformer minimizes `+D(true, pred)` (divergence minimization).
//!
//! `AdversarialLoss` plays the abstract-base role: both methods default to a
//! `NotImplemented` error so only concrete variants are usable.

use candle_core::{Tensor, D};

use crate::discriminator::Discriminator;
use crate::error::CaloError;
use crate::CaloResult;

/// Probability floor for log arguments.
const EPS: f64 = 1e-7;

/// Capability set of an adversarial objective.
///
/// `sample_weight` is an optional per-example weight, [batch]; `None` behaves
/// exactly like a uniform weight of 1.0.
pub trait AdversarialLoss {
    fn name(&self) -> &'static str;

    fn discriminator_loss(
        &self,
        _discriminator: &Discriminator,
        _target_true: &Tensor,
        _target_pred: &Tensor,
        _sample_weight: Option<&Tensor>,
        _train: bool,
    ) -> CaloResult<Tensor> {
        Err(CaloError::NotImplemented("discriminator_loss"))
    }

    fn transformer_loss(
        &self,
        _discriminator: &Discriminator,
        _target_true: &Tensor,
        _target_pred: &Tensor,
        _sample_weight: Option<&Tensor>,
        _train: bool,
    ) -> CaloResult<Tensor> {
        Err(CaloError::NotImplemented("transformer_loss"))
    }
}

/// Reduce per-example values to a scalar, weighting each example.
fn weighted_mean(per_example: &Tensor, sample_weight: Option<&Tensor>) -> CaloResult<Tensor> {
    match sample_weight {
        None => Ok(per_example.mean_all()?),
        Some(w) => {
            if w.dims() != per_example.dims() {
                return Err(CaloError::shape(
                    format!("sample_weight of shape {:?}", per_example.dims()),
                    format!("{:?}", w.dims()),
                ));
            }
            let total = w.sum_all()?;
            if total.to_scalar::<f32>()? == 0.0 {
                return Err(CaloError::InvalidParameter(
                    "`sample_weight` should have a non-zero sum".to_string(),
                ));
            }
            let weighted = per_example.broadcast_mul(w)?.sum_all()?;
            Ok(weighted.broadcast_div(&total)?)
        }
    }
}

/// Per-example KL divergence between two probability rows, [batch].
fn kl_rows(p: &Tensor, q: &Tensor) -> CaloResult<Tensor> {
    let p = p.clamp(EPS, 1.0)?;
    let q = q.clamp(EPS, 1.0)?;
    let ratio = p.broadcast_div(&q)?.log()?;
    Ok(p.broadcast_mul(&ratio)?.sum(D::Minus1)?)
}

fn discriminator_pair(
    discriminator: &Discriminator,
    target_true: &Tensor,
    target_pred: &Tensor,
    train: bool,
) -> CaloResult<(Tensor, Tensor)> {
    let y_true = discriminator.forward(target_true, train)?;
    let y_pred = discriminator.forward(target_pred, train)?;
    Ok((y_true, y_pred))
}

macro_rules! dual_sign_impl {
    () => {
        fn discriminator_loss(
            &self,
            discriminator: &Discriminator,
            target_true: &Tensor,
            target_pred: &Tensor,
            sample_weight: Option<&Tensor>,
            train: bool,
        ) -> CaloResult<Tensor> {
            let loss =
                self.divergence(discriminator, target_true, target_pred, sample_weight, train)?;
            Ok(loss.neg()?)
        }

        fn transformer_loss(
            &self,
            discriminator: &Discriminator,
            target_true: &Tensor,
            target_pred: &Tensor,
            sample_weight: Option<&Tensor>,
            train: bool,
        ) -> CaloResult<Tensor> {
            self.divergence(discriminator, target_true, target_pred, sample_weight, train)
        }
    };
}

/// Kullback-Leibler divergence between discriminator responses.
#[derive(Debug, Default, Clone, Copy)]
pub struct KLDivergence;

impl KLDivergence {
    fn divergence(
        &self,
        discriminator: &Discriminator,
        target_true: &Tensor,
        target_pred: &Tensor,
        sample_weight: Option<&Tensor>,
        train: bool,
    ) -> CaloResult<Tensor> {
        let (y_true, y_pred) = discriminator_pair(discriminator, target_true, target_pred, train)?;
        weighted_mean(&kl_rows(&y_true, &y_pred)?, sample_weight)
    }
}

impl AdversarialLoss for KLDivergence {
    fn name(&self) -> &'static str {
        "kl_loss"
    }

    dual_sign_impl!();
}

/// Jensen-Shannon divergence, the symmetrized and bounded KL variant.
#[derive(Debug, Default, Clone, Copy)]
pub struct JSDivergence;

impl JSDivergence {
    fn divergence(
        &self,
        discriminator: &Discriminator,
        target_true: &Tensor,
        target_pred: &Tensor,
        sample_weight: Option<&Tensor>,
        train: bool,
    ) -> CaloResult<Tensor> {
        let (y_true, y_pred) = discriminator_pair(discriminator, target_true, target_pred, train)?;
        let mid = ((&y_true + &y_pred)? * 0.5)?;
        let js = ((kl_rows(&y_true, &mid)? + kl_rows(&y_pred, &mid)?)? * 0.5)?;
        weighted_mean(&js, sample_weight)
    }
}

impl AdversarialLoss for JSDivergence {
    fn name(&self) -> &'static str {
        "js_loss"
    }

    dual_sign_impl!();
}

/// Mean absolute error between discriminator responses.
#[derive(Debug, Default, Clone, Copy)]
pub struct MeanAbsoluteError;

impl MeanAbsoluteError {
    fn divergence(
        &self,
        discriminator: &Discriminator,
        target_true: &Tensor,
        target_pred: &Tensor,
        sample_weight: Option<&Tensor>,
        train: bool,
    ) -> CaloResult<Tensor> {
        let (y_true, y_pred) = discriminator_pair(discriminator, target_true, target_pred, train)?;
        let per_example = (y_true - y_pred)?.abs()?.mean(D::Minus1)?;
        weighted_mean(&per_example, sample_weight)
    }
}

impl AdversarialLoss for MeanAbsoluteError {
    fn name(&self) -> &'static str {
        "mae_loss"
    }

    dual_sign_impl!();
}

/// Binary cross-entropy of the predicted responses against the true ones.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryCrossentropy;

impl BinaryCrossentropy {
    fn divergence(
        &self,
        discriminator: &Discriminator,
        target_true: &Tensor,
        target_pred: &Tensor,
        sample_weight: Option<&Tensor>,
        train: bool,
    ) -> CaloResult<Tensor> {
        let (y_true, y_pred) = discriminator_pair(discriminator, target_true, target_pred, train)?;
        let y_pred = y_pred.clamp(EPS, 1.0 - EPS)?;
        let pos = y_true.broadcast_mul(&y_pred.log()?)?;
        let neg = (1.0 - &y_true)?.broadcast_mul(&(1.0 - &y_pred)?.log()?)?;
        let per_example = (pos + neg)?.neg()?.mean(D::Minus1)?;
        weighted_mean(&per_example, sample_weight)
    }
}

impl AdversarialLoss for BinaryCrossentropy {
    fn name(&self) -> &'static str {
        "bce_loss"
    }

    dual_sign_impl!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discriminator::DiscriminatorConfig;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    struct AbstractLoss;

    impl AdversarialLoss for AbstractLoss {
        fn name(&self) -> &'static str {
            "abstract"
        }
    }

    fn discriminator() -> Discriminator {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        Discriminator::new(DiscriminatorConfig::default(), vb).unwrap()
    }

    fn targets() -> (Tensor, Tensor) {
        let t = Tensor::randn(0f32, 1f32, (6, 8, 3), &Device::Cpu).unwrap();
        let p = Tensor::randn(0f32, 1f32, (6, 8, 3), &Device::Cpu).unwrap();
        (t, p)
    }

    #[test]
    fn test_abstract_base_not_implemented() {
        let disc = discriminator();
        let (t, p) = targets();
        let loss = AbstractLoss;
        assert!(matches!(
            loss.discriminator_loss(&disc, &t, &p, None, false),
            Err(CaloError::NotImplemented("discriminator_loss"))
        ));
        assert!(matches!(
            loss.transformer_loss(&disc, &t, &p, None, false),
            Err(CaloError::NotImplemented("transformer_loss"))
        ));
    }

    fn assert_dual_sign(loss: &dyn AdversarialLoss) {
        let disc = discriminator();
        let (t, p) = targets();
        let d = loss
            .discriminator_loss(&disc, &t, &p, None, false)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let g = loss
            .transformer_loss(&disc, &t, &p, None, false)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(
            (d + g).abs() < 1e-6,
            "{}: expected discriminator loss {} == -transformer loss {}",
            loss.name(),
            d,
            g
        );
    }

    #[test]
    fn test_dual_sign_invariant() {
        assert_dual_sign(&KLDivergence);
        assert_dual_sign(&JSDivergence);
        assert_dual_sign(&MeanAbsoluteError);
        assert_dual_sign(&BinaryCrossentropy);
    }

    #[test]
    fn test_unweighted_equals_uniform_weight() {
        let disc = discriminator();
        let (t, p) = targets();
        let ones = Tensor::ones(6, DType::F32, &Device::Cpu).unwrap();
        for loss in [
            &KLDivergence as &dyn AdversarialLoss,
            &JSDivergence,
            &MeanAbsoluteError,
            &BinaryCrossentropy,
        ] {
            let unweighted = loss
                .transformer_loss(&disc, &t, &p, None, false)
                .unwrap()
                .to_scalar::<f32>()
                .unwrap();
            let weighted = loss
                .transformer_loss(&disc, &t, &p, Some(&ones), false)
                .unwrap()
                .to_scalar::<f32>()
                .unwrap();
            assert!(
                (unweighted - weighted).abs() < 1e-6,
                "{}: {} vs {}",
                loss.name(),
                unweighted,
                weighted
            );
        }
    }

    #[test]
    fn test_kl_identical_inputs_is_zero() {
        let disc = discriminator();
        let (t, _) = targets();
        let d = KLDivergence
            .transformer_loss(&disc, &t, &t, None, false)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(d.abs() < 1e-6);
    }

    #[test]
    fn test_all_zero_weights_rejected() {
        let disc = discriminator();
        let (t, p) = targets();
        let zeros = Tensor::zeros(6, DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            KLDivergence.transformer_loss(&disc, &t, &p, Some(&zeros), false),
            Err(CaloError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_weight_shape_mismatch_rejected() {
        let disc = discriminator();
        let (t, p) = targets();
        let bad = Tensor::ones(4, DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            KLDivergence.transformer_loss(&disc, &t, &p, Some(&bad), false),
            Err(CaloError::ShapeMismatch { .. })
        ));
    }
}
