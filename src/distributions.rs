/*!
Small distributions used by the resampling algorithms and by rejuvenation moves.

- [`Categorical`]: draws indices from a finite set of (unnormalized) probabilities.
- [`normal_log_density`]: Gaussian log density.
- [`GaussianRandomWalk`]: a trace-conditioned [`Proposal`] that perturbs one real-valued
  address with Gaussian noise.

# Examples

```rust
use rand::{rngs::SmallRng, SeedableRng};
use smc_ensemble::distributions::Categorical;

let mut rng = SmallRng::seed_from_u64(42);
let cat = Categorical::new(&[0.2, 0.3, 0.5]);
let i = cat.sample(&mut rng);
assert!(i < 3);
assert!((cat.log_prob(2) - 0.5f64.ln()).abs() < 1e-12);
```
*/

use std::f64::consts::PI;

use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::choices::{Address, ChoiceMap};
use crate::error::{Result, SmcError};
use crate::model::{ProgramTrace, Proposal};

/// A categorical distribution over `0..probs.len()`.
///
/// The probabilities are normalized on construction. Sampling inverts the cumulative
/// distribution with a binary search.
#[derive(Debug, Clone)]
pub struct Categorical {
    probs: Vec<f64>,
    cumulative: Vec<f64>,
}

impl Categorical {
    /// Creates a categorical distribution from nonnegative weights.
    pub fn new(weights: &[f64]) -> Self {
        let total: f64 = weights.iter().sum();
        let probs: Vec<f64> = weights.iter().map(|w| w / total).collect();
        let mut acc = 0.0;
        let cumulative = probs
            .iter()
            .map(|p| {
                acc += p;
                acc
            })
            .collect();
        Self { probs, cumulative }
    }

    pub fn len(&self) -> usize {
        self.probs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probs.is_empty()
    }

    /// Draws one index.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let total = self.cumulative.last().copied().unwrap_or(0.0);
        let u: f64 = rng.gen::<f64>() * total;
        let i = self.cumulative.partition_point(|&c| c <= u);
        // Rounding can push `u` past the last bucket; stay inside the support.
        i.min(self.probs.len().saturating_sub(1))
    }

    /// Draws `n` independent indices.
    pub fn sample_n<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<usize> {
        (0..n).map(|_| self.sample(rng)).collect()
    }

    pub fn log_prob(&self, index: usize) -> f64 {
        match self.probs.get(index) {
            Some(p) => p.ln(),
            None => f64::NEG_INFINITY,
        }
    }
}

/// Log density of `x` under `N(mean, std^2)`.
pub fn normal_log_density(x: f64, mean: f64, std: f64) -> f64 {
    let z = (x - mean) / std;
    -0.5 * z * z - std.ln() - 0.5 * (2.0 * PI).ln()
}

/// Proposes a new value for one real-valued address by adding `N(0, std^2)` noise to
/// its current value in the trace.
#[derive(Debug, Clone)]
pub struct GaussianRandomWalk {
    pub address: Address,
    pub std: f64,
}

impl GaussianRandomWalk {
    pub fn new(address: impl Into<Address>, std: f64) -> Self {
        Self {
            address: address.into(),
            std,
        }
    }

    fn current<Tr: ProgramTrace>(&self, trace: &Tr) -> Result<f64> {
        trace.choices().get_f64(&self.address).ok_or_else(|| {
            SmcError::Model(format!(
                "trace has no real-valued choice at '{}'",
                self.address
            ))
        })
    }
}

impl<Tr: ProgramTrace> Proposal<Tr> for GaussianRandomWalk {
    fn propose<R: Rng + ?Sized>(&self, trace: &Tr, rng: &mut R) -> Result<(ChoiceMap, f64)> {
        let mean = self.current(trace)?;
        let normal = Normal::new(mean, self.std)
            .map_err(|e| SmcError::InvalidArgument(format!("random walk std: {e}")))?;
        let value = normal.sample(rng);
        let mut choices = ChoiceMap::new();
        choices.insert(self.address.clone(), value);
        Ok((choices, normal_log_density(value, mean, self.std)))
    }

    fn assess(&self, trace: &Tr, choices: &ChoiceMap) -> Result<f64> {
        let mean = self.current(trace)?;
        let value = choices.get_f64(&self.address).ok_or_else(|| {
            SmcError::Model(format!("proposal choices lack '{}'", self.address))
        })?;
        Ok(normal_log_density(value, mean, self.std))
    }
}
