//! Log-space weight arithmetic: normalization, softmax with degenerate-input
//! handling, effective sample size and the marginal-likelihood increment.

use std::str::FromStr;

use log::warn;
use num_traits::Float;

use crate::error::{Result, SmcError};

/// What to do when weights cannot be normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightPolicy {
    /// Fail with [`SmcError::InvalidWeights`].
    Error,
    /// Log a warning and fall back to uniform weights.
    #[default]
    Warn,
    /// Fall back to uniform weights without logging.
    Silent,
}

impl FromStr for WeightPolicy {
    type Err = SmcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "error" => Ok(WeightPolicy::Error),
            "warn" => Ok(WeightPolicy::Warn),
            "silent" => Ok(WeightPolicy::Silent),
            other => Err(SmcError::Configuration(format!(
                "unknown weight policy '{other}' (expected error, warn or silent)"
            ))),
        }
    }
}

/// Numerically stable `log(sum(exp(values)))`.
///
/// Returns `-inf` for an empty slice or when every entry is `-inf`, and `NaN` if any
/// entry is `NaN`.
pub fn logsumexp<T: Float>(values: &[T]) -> T {
    if values.iter().any(|v| v.is_nan()) {
        return T::nan();
    }
    let max = values
        .iter()
        .cloned()
        .fold(T::neg_infinity(), |acc, v| acc.max(v));
    if max.is_infinite() {
        return max;
    }
    let sum = values
        .iter()
        .fold(T::zero(), |acc, &v| acc + (v - max).exp());
    max + sum.ln()
}

/// `log_weights - logsumexp(log_weights)`.
pub fn log_normalize(log_weights: &[f64]) -> Vec<f64> {
    let total = logsumexp(log_weights);
    log_weights.iter().map(|w| w - total).collect()
}

/// Normalized weights in linear space.
pub fn normalize(log_weights: &[f64]) -> Vec<f64> {
    log_normalize(log_weights).into_iter().map(f64::exp).collect()
}

/// Effective sample size `1 / sum(w_i^2)` of the normalized weights, computed in log space.
pub fn effective_sample_size(log_weights: &[f64]) -> f64 {
    if log_weights.is_empty() {
        return 0.0;
    }
    let squared: Vec<f64> = log_weights.iter().map(|w| 2.0 * w).collect();
    (2.0 * logsumexp(log_weights) - logsumexp(&squared)).exp()
}

/// The term `logsumexp(log_weights) - log(N)` that a resampling pass folds into the
/// running log marginal-likelihood estimate.
pub fn log_ml_increment(log_weights: &[f64]) -> f64 {
    logsumexp(log_weights) - (log_weights.len() as f64).ln()
}

/// Why a weight vector could not be normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Degeneracy {
    ContainsNan,
    AllNegInfinite,
    ZeroTotal,
    NanTotal,
}

impl Degeneracy {
    fn describe(&self) -> &'static str {
        match self {
            Degeneracy::ContainsNan => "weights contain NaN",
            Degeneracy::AllNegInfinite => "all log weights are -inf",
            Degeneracy::ZeroTotal => "normalized weights sum to zero",
            Degeneracy::NanTotal => "normalized weights sum to NaN",
        }
    }
}

fn softmax_with_reason(values: &[f64]) -> (Vec<f64>, Option<Degeneracy>) {
    let n = values.len();
    let uniform = || vec![1.0 / n as f64; n];
    if values.iter().any(|v| v.is_nan()) {
        return (vec![f64::NAN; n], Some(Degeneracy::ContainsNan));
    }
    if values.iter().all(|&v| v == f64::NEG_INFINITY) {
        return (uniform(), Some(Degeneracy::AllNegInfinite));
    }
    let total = logsumexp(values);
    let probs: Vec<f64> = values.iter().map(|v| (v - total).exp()).collect();
    let sum: f64 = probs.iter().sum();
    if sum.is_nan() {
        (vec![f64::NAN; n], Some(Degeneracy::NanTotal))
    } else if sum == 0.0 {
        (uniform(), Some(Degeneracy::ZeroTotal))
    } else {
        (probs, None)
    }
}

/// Softmax that reports degenerate inputs instead of producing garbage.
///
/// Returns `(weights, invalid)`. NaN input gives all-NaN weights, all `-inf` input gives
/// uniform weights; both set `invalid`. A zero total falls back to uniform and a NaN
/// total to all-NaN, again with `invalid` set.
pub fn safe_softmax(values: &[f64]) -> (Vec<f64>, bool) {
    let (probs, reason) = softmax_with_reason(values);
    (probs, reason.is_some())
}

/// Softmax under a [`WeightPolicy`].
///
/// Returns the probabilities and whether a uniform fallback was substituted.
pub fn checked_softmax(values: &[f64], policy: WeightPolicy) -> Result<(Vec<f64>, bool)> {
    let (probs, reason) = softmax_with_reason(values);
    let Some(reason) = reason else {
        return Ok((probs, false));
    };
    match policy {
        WeightPolicy::Error => Err(SmcError::InvalidWeights {
            reason: reason.describe().to_string(),
        }),
        WeightPolicy::Warn => {
            warn!(
                "{}; falling back to uniform weights over {} particles",
                reason.describe(),
                values.len()
            );
            Ok((vec![1.0 / values.len() as f64; values.len()], true))
        }
        WeightPolicy::Silent => Ok((vec![1.0 / values.len() as f64; values.len()], true)),
    }
}
