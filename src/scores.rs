//! Distribution-level validation scores
//!
//! One-dimensional earth mover's distance between a reference sample and a
//! generated sample, computed on normalized histograms. Used downstream to
//! judge how well generated cluster features track the reference
//! distributions; not part of the training objective.

use crate::error::CaloError;
use crate::CaloResult;

/// Histogram-based 1-D earth mover's distance.
///
/// The bin edges are derived from `x_true` (or from `range` when given) and
/// reused for `x_pred`; values outside the range are dropped. Both histograms
/// are normalized to unit mass before the cumulative-difference walk.
pub fn earth_mover_distance(
    x_true: &[f32],
    x_pred: &[f32],
    bins: usize,
    range: Option<(f32, f32)>,
) -> CaloResult<f64> {
    if bins < 1 {
        return Err(CaloError::InvalidParameter(format!(
            "`bins` should be >= 1, instead {} passed",
            bins
        )));
    }
    if x_true.is_empty() || x_pred.is_empty() {
        return Err(CaloError::InvalidParameter(
            "earth mover's distance needs non-empty samples".to_string(),
        ));
    }

    let (lo, hi) = match range {
        Some((lo, hi)) => (lo, hi),
        None => {
            let lo = x_true.iter().cloned().fold(f32::INFINITY, f32::min);
            let hi = x_true.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            (lo, hi)
        }
    };
    if !(lo < hi) {
        return Err(CaloError::InvalidParameter(format!(
            "histogram range should satisfy lo < hi, instead ({}, {}) passed",
            lo, hi
        )));
    }

    let h_true = normalized_histogram(x_true, bins, lo, hi)?;
    let h_pred = normalized_histogram(x_pred, bins, lo, hi)?;

    // cumulative mass difference walked bin by bin
    let mut carried = 0.0f64;
    let mut score = 0.0f64;
    for i in 0..bins {
        carried += h_true[i] - h_pred[i];
        score += carried.abs();
    }
    Ok(score)
}

fn normalized_histogram(values: &[f32], bins: usize, lo: f32, hi: f32) -> CaloResult<Vec<f64>> {
    let width = (hi - lo) as f64 / bins as f64;
    let mut counts = vec![0.0f64; bins];
    for &v in values {
        if v < lo || v > hi {
            continue;
        }
        // the upper edge belongs to the last bin
        let idx = (((v - lo) as f64 / width) as usize).min(bins - 1);
        counts[idx] += 1.0;
    }
    let total: f64 = counts.iter().sum();
    if total == 0.0 {
        return Err(CaloError::InvalidParameter(
            "histogram range contains no samples".to_string(),
        ));
    }
    for c in counts.iter_mut() {
        *c /= total;
    }
    Ok(counts)
}
