//! Per-step diagnostics of a sequential filter run.

use ndarray::prelude::*;
use ndarray_stats::QuantileExt;

/// Records effective sample size, log marginal-likelihood estimate and resampling
/// events after every filter step.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FilterTracker {
    ess: Vec<f64>,
    log_ml: Vec<f64>,
    resampled: Vec<bool>,
}

/// Summary of a filter run.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterStats {
    pub n_steps: usize,
    pub n_resampled: usize,
    /// Smallest ESS seen before resampling; NaN if no step ran.
    pub min_ess: f64,
    pub mean_ess: f64,
    /// Log marginal-likelihood estimate after the last step.
    pub log_ml: f64,
}

impl FilterTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(&mut self, ess: f64, log_ml: f64, resampled: bool) {
        self.ess.push(ess);
        self.log_ml.push(log_ml);
        self.resampled.push(resampled);
    }

    pub fn n_steps(&self) -> usize {
        self.ess.len()
    }

    pub fn ess_history(&self) -> Array1<f64> {
        Array1::from_vec(self.ess.clone())
    }

    pub fn log_ml_history(&self) -> Array1<f64> {
        Array1::from_vec(self.log_ml.clone())
    }

    pub fn stats(&self) -> FilterStats {
        let ess = self.ess_history();
        FilterStats {
            n_steps: self.n_steps(),
            n_resampled: self.resampled.iter().filter(|&&r| r).count(),
            min_ess: ess.min().map(|m| *m).unwrap_or(f64::NAN),
            mean_ess: ess.mean().unwrap_or(f64::NAN),
            log_ml: self.log_ml.last().copied().unwrap_or(0.0),
        }
    }
}
