/*!
A sequential Monte Carlo driver.

[`SequentialFilter`] advances an ensemble through a schedule of `(args, observations)`
steps. After each update it computes the effective sample size and resamples when the
ESS drops below `ess_fraction * N`. Per-step diagnostics are collected in a
[`FilterTracker`].

# Examples

```rust
use smc_ensemble::resample::ResampleMethod;
use smc_ensemble::smc::SequentialFilter;

let filter = SequentialFilter::new(0.5).method(ResampleMethod::Stratified);
assert_eq!(filter.ess_fraction, 0.5);
```
*/

use indicatif::{ProgressBar, ProgressStyle};
use log::debug;

use crate::choices::ChoiceMap;
use crate::ensemble::ParticleEnsemble;
use crate::error::{Result, SmcError};
use crate::model::GenerativeModel;
use crate::resample::{ResampleMethod, ResampleOptions};
use crate::stats::{FilterStats, FilterTracker};

/// Resample-when-degenerate particle filter.
#[derive(Debug, Clone)]
pub struct SequentialFilter {
    /// Resample when `ESS < ess_fraction * N`. `0` never resamples, `1` almost always does.
    pub ess_fraction: f64,
    pub method: ResampleMethod,
    pub options: ResampleOptions,
}

impl Default for SequentialFilter {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl SequentialFilter {
    pub fn new(ess_fraction: f64) -> Self {
        Self {
            ess_fraction,
            method: ResampleMethod::default(),
            options: ResampleOptions::default(),
        }
    }

    pub fn method(mut self, method: ResampleMethod) -> Self {
        self.method = method;
        self
    }

    pub fn options(mut self, options: ResampleOptions) -> Self {
        self.options = options;
        self
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.ess_fraction) {
            return Err(SmcError::Configuration(format!(
                "ESS fraction must lie in [0, 1], got {}",
                self.ess_fraction
            )));
        }
        Ok(())
    }

    /// One update followed by resampling if the ensemble is degenerate.
    fn step<M>(
        &self,
        ensemble: &mut ParticleEnsemble<M::Trace>,
        model: &M,
        args: &M::Args,
        observations: &ChoiceMap,
        tracker: &mut FilterTracker,
    ) -> Result<()>
    where
        M: GenerativeModel,
    {
        ensemble.update(model, args, observations)?;
        let ess = ensemble.effective_sample_size();
        let resample = ess < self.ess_fraction * ensemble.len() as f64;
        if resample {
            ensemble.resample(self.method, &self.options)?;
        }
        tracker.step(ess, ensemble.log_marginal_likelihood(), resample);
        Ok(())
    }

    /**
    Runs the filter over `schedule`.

    # Arguments

    * `ensemble` - The initialized ensemble, advanced in place.
    * `model` - The model whose `update` moves each particle.
    * `schedule` - Arguments and observations of each step, in order.

    # Returns

    Summary statistics of the run.

    # Errors

    [`SmcError::Configuration`] for an ESS fraction outside `[0, 1]`; otherwise the first
    error of any update or resampling step.
    */
    pub fn run<M>(
        &self,
        ensemble: &mut ParticleEnsemble<M::Trace>,
        model: &M,
        schedule: &[(M::Args, ChoiceMap)],
    ) -> Result<FilterStats>
    where
        M: GenerativeModel,
    {
        self.validate()?;
        let mut tracker = FilterTracker::new();
        for (args, observations) in schedule {
            self.step(ensemble, model, args, observations, &mut tracker)?;
        }
        let stats = tracker.stats();
        debug!(
            "filter finished: {} steps, {} resampled, log ML {:.4}",
            stats.n_steps, stats.n_resampled, stats.log_ml
        );
        Ok(stats)
    }

    /// Same as [`run`](Self::run), with a progress bar showing the current ESS and log
    /// marginal-likelihood estimate.
    pub fn run_progress<M>(
        &self,
        ensemble: &mut ParticleEnsemble<M::Trace>,
        model: &M,
        schedule: &[(M::Args, ChoiceMap)],
    ) -> Result<FilterStats>
    where
        M: GenerativeModel,
    {
        self.validate()?;
        let pb = ProgressBar::new(schedule.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:8} {bar:40.white} ETA {eta:3} | {msg}")
                .map_err(|e| SmcError::Configuration(format!("progress bar template: {e}")))?
                .progress_chars("=>-"),
        );
        pb.set_prefix("SMC");

        let mut tracker = FilterTracker::new();
        for (args, observations) in schedule {
            self.step(ensemble, model, args, observations, &mut tracker)?;
            pb.inc(1);
            pb.set_message(format!(
                "ESS {:.1}/{} | log ML {:.3}",
                ensemble.effective_sample_size(),
                ensemble.len(),
                ensemble.log_marginal_likelihood()
            ));
        }
        pb.finish_with_message("Done!");
        Ok(tracker.stats())
    }
}
