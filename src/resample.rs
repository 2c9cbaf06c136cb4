/*!
Resampling at a fixed population size.

Three algorithms are available through [`ResampleMethod`]:

- **Multinomial**: `N` independent categorical draws.
- **Residual**: `floor(N * w_i)` deterministic copies of particle `i`, the remaining
  slots drawn from the leftover mass `N * w_i - floor(N * w_i)`.
- **Stratified**: one uniform draw inside each of the `N` equal-mass strata of the
  cumulative weight, optionally after sorting particles by decreasing weight.

All three can sample according to a *priority* `p(log_weight)` instead of the weight
itself. The new weights then carry the correction `log_weight - log_priority` of each
selected parent, rescaled so that the total mass is `N`, which keeps the marginal
likelihood estimate unbiased. Without a priority every new weight is zero.

# Examples

```rust
use smc_ensemble::ensemble::ParticleEnsemble;
use smc_ensemble::resample::{ResampleMethod, ResampleOptions};

let mut ens = ParticleEnsemble::new(vec![0, 1, 2, 3], vec![0.0, -1.0, -30.0, 2.0])
    .unwrap()
    .set_seed(42);
ens.resample(ResampleMethod::Residual, &ResampleOptions::default()).unwrap();
assert!(ens.log_weights().iter().all(|&w| w == 0.0));
assert!(ens.traces().iter().all(|&t| t != 2));
```
*/

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use log::debug;
use rand::Rng;

use crate::distributions::Categorical;
use crate::ensemble::{ParticleEnsemble, ParticleSlots, SubEnsemble};
use crate::error::{Result, SmcError};
use crate::weights::{self, checked_softmax, WeightPolicy};

/// Maps a log weight to the log priority used for selection.
pub type PriorityFn = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// Algorithm used by [`ParticleEnsemble::resample`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResampleMethod {
    Multinomial,
    #[default]
    Residual,
    Stratified,
}

impl FromStr for ResampleMethod {
    type Err = SmcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "multinomial" => Ok(ResampleMethod::Multinomial),
            "residual" => Ok(ResampleMethod::Residual),
            "stratified" => Ok(ResampleMethod::Stratified),
            other => Err(SmcError::Configuration(format!(
                "unknown resampling method '{other}' (expected multinomial, residual or stratified)"
            ))),
        }
    }
}

/// Options shared by resampling and resizing.
#[derive(Clone, Default)]
pub struct ResampleOptions {
    pub priority: Option<PriorityFn>,
    pub policy: WeightPolicy,
    /// Sort particles by decreasing weight before stratified selection.
    pub sort_particles: bool,
}

impl fmt::Debug for ResampleOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResampleOptions")
            .field("priority", &self.priority.as_ref().map(|_| "<fn>"))
            .field("policy", &self.policy)
            .field("sort_particles", &self.sort_particles)
            .finish()
    }
}

impl ResampleOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects particles according to `priority(log_weight)` instead of the weight.
    pub fn priority<F>(mut self, priority: F) -> Self
    where
        F: Fn(f64) -> f64 + Send + Sync + 'static,
    {
        self.priority = Some(Arc::new(priority));
        self
    }

    pub fn policy(mut self, policy: WeightPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn sort_particles(mut self, sort: bool) -> Self {
        self.sort_particles = sort;
        self
    }
}

/// Parent indices and log weights of the next generation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Selection {
    pub parents: Vec<usize>,
    pub log_weights: Vec<f64>,
}

/// Log priorities and selection probabilities of the current generation.
pub(crate) struct Priorities {
    pub log_priorities: Vec<f64>,
    pub probs: Vec<f64>,
    /// A uniform fallback replaced degenerate probabilities.
    pub fallback: bool,
    pub custom: bool,
}

impl Priorities {
    pub fn compute(log_weights: &[f64], options: &ResampleOptions) -> Result<Self> {
        let log_priorities: Vec<f64> = match &options.priority {
            Some(p) => log_weights.iter().map(|&w| p(w)).collect(),
            None => log_weights.to_vec(),
        };
        let (probs, fallback) = checked_softmax(&log_priorities, options.policy)?;
        Ok(Self {
            log_priorities,
            probs,
            fallback,
            custom: options.priority.is_some(),
        })
    }

    /// Weights of the selected particles: zero without a priority function, otherwise
    /// the importance correction of each parent rescaled to total mass `target`.
    pub fn reweight(&self, log_weights: &[f64], parents: &[usize]) -> Vec<f64> {
        if !self.custom || self.fallback {
            return vec![0.0; parents.len()];
        }
        let corrected: Vec<f64> = parents
            .iter()
            .map(|&p| log_weights[p] - self.log_priorities[p])
            .collect();
        rescale_to_mass(corrected, parents.len())
    }
}

/// Shifts log weights so that their total mass is `target`.
pub(crate) fn rescale_to_mass(mut log_weights: Vec<f64>, target: usize) -> Vec<f64> {
    let total = weights::logsumexp(&log_weights);
    if total.is_finite() {
        let shift = (target as f64).ln() - total;
        log_weights.iter_mut().for_each(|w| *w += shift);
    }
    log_weights
}

pub(crate) fn multinomial_indices<R: Rng + ?Sized>(
    probs: &[f64],
    target: usize,
    rng: &mut R,
) -> Vec<usize> {
    Categorical::new(probs).sample_n(target, rng)
}

pub(crate) fn residual_indices<R: Rng + ?Sized>(
    probs: &[f64],
    target: usize,
    rng: &mut R,
) -> Vec<usize> {
    let mut parents = Vec::with_capacity(target);
    let mut residuals = Vec::with_capacity(probs.len());
    for (i, &p) in probs.iter().enumerate() {
        let scaled = p * target as f64;
        let mut copies = scaled.floor();
        // A product like 49 * (1 / 49) lands just below an integer.
        if scaled - copies > 1.0 - 1e-9 {
            copies += 1.0;
        }
        residuals.push((scaled - copies).max(0.0));
        let room = target - parents.len();
        parents.extend(std::iter::repeat(i).take((copies as usize).min(room)));
    }
    let remaining = target - parents.len();
    if remaining > 0 {
        let residual_mass: f64 = residuals.iter().sum();
        let draws = if residual_mass > 0.0 {
            Categorical::new(&residuals).sample_n(remaining, rng)
        } else {
            Categorical::new(probs).sample_n(remaining, rng)
        };
        parents.extend(draws);
    }
    parents
}

pub(crate) fn stratified_indices<R: Rng + ?Sized>(
    probs: &[f64],
    target: usize,
    sort: bool,
    rng: &mut R,
) -> Vec<usize> {
    let n = probs.len();
    let mut order: Vec<usize> = (0..n).collect();
    if sort {
        order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));
    }
    // Cumulative mass scaled so that stratum k covers [k, k + 1).
    let mut acc = 0.0;
    let cumulative: Vec<f64> = order
        .iter()
        .map(|&i| {
            acc += probs[i] * target as f64;
            acc
        })
        .collect();
    let mut parents = Vec::with_capacity(target);
    let mut j = 0;
    for k in 0..target {
        let u = k as f64 + rng.gen::<f64>();
        while j + 1 < n && cumulative[j] <= u {
            j += 1;
        }
        parents.push(order[j]);
    }
    parents
}

/// Selects `target` parents from `log_weights` and computes their new weights.
pub(crate) fn select<R: Rng + ?Sized>(
    log_weights: &[f64],
    method: ResampleMethod,
    target: usize,
    options: &ResampleOptions,
    rng: &mut R,
) -> Result<Selection> {
    let priorities = Priorities::compute(log_weights, options)?;
    let parents = match method {
        ResampleMethod::Multinomial => multinomial_indices(&priorities.probs, target, rng),
        ResampleMethod::Residual => residual_indices(&priorities.probs, target, rng),
        ResampleMethod::Stratified => {
            stratified_indices(&priorities.probs, target, options.sort_particles, rng)
        }
    };
    let log_weights = priorities.reweight(log_weights, &parents);
    Ok(Selection {
        parents,
        log_weights,
    })
}

pub(crate) fn resample_slots<Tr: Clone, S: ParticleSlots<Tr>>(
    slots: &mut S,
    method: ResampleMethod,
    options: &ResampleOptions,
) -> Result<()> {
    let n = slots.slot_count();
    if n == 0 {
        return Ok(());
    }
    let log_weights = slots.gather_log_weights();
    let selection = select(&log_weights, method, n, options, slots.rng())?;
    let increment = weights::log_ml_increment(&log_weights);
    debug!(
        "{method:?} resampling of {n} particles, ESS {:.2}, log ML increment {increment:.4}",
        weights::effective_sample_size(&log_weights)
    );
    slots.fold_log_ml(increment);
    for (i, (&parent, &log_weight)) in selection
        .parents
        .iter()
        .zip(selection.log_weights.iter())
        .enumerate()
    {
        let trace = slots.slot_trace(parent).clone();
        slots.stage(i, trace);
        slots.set_parent(i, parent);
        slots.set_log_weight(i, log_weight);
    }
    slots.commit();
    Ok(())
}

impl<Tr: Clone> ParticleEnsemble<Tr> {
    /**
    Resamples the ensemble in place, keeping its size.

    Folds `logsumexp(log_weights) - log(N)` into the log marginal-likelihood estimate.

    # Errors

    [`SmcError::InvalidWeights`] when the weights are degenerate and the policy is
    [`WeightPolicy::Error`].
    */
    pub fn resample(
        &mut self,
        method: ResampleMethod,
        options: &ResampleOptions,
    ) -> Result<&mut Self> {
        resample_slots(self, method, options)?;
        Ok(self)
    }
}

impl<Tr: Clone> SubEnsemble<'_, Tr> {
    /// Resamples the view's slots among themselves. The log marginal-likelihood
    /// estimate of the backing ensemble is not touched.
    pub fn resample(
        &mut self,
        method: ResampleMethod,
        options: &ResampleOptions,
    ) -> Result<&mut Self> {
        resample_slots(self, method, options)?;
        Ok(self)
    }
}
