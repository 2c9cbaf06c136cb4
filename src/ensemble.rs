/*!
The particle ensemble and borrowed views into it.

A [`ParticleEnsemble`] owns four parallel containers (`traces`, `staging`, `log_weights`,
`parents`) together with the running log marginal-likelihood estimate. Operations that
move particles write the next generation into `staging` and swap it with `traces` when
they finish, so every read during a call sees the pre-call generation.

A [`SubEnsemble`] is a set of disjoint mutable borrows into one ensemble's containers.
Views support every operation that keeps the population size fixed, and they never
touch the log marginal-likelihood estimate; that belongs to the full ensemble alone.
Several views can be processed in parallel, see [`ParticleEnsemble::par_views`].

# Examples

```rust
use smc_ensemble::ensemble::ParticleEnsemble;
use smc_ensemble::stratify::Layout;

let mut ens = ParticleEnsemble::new(vec!["a", "b", "c", "d"], vec![0.0, -1.0, -2.0, -3.0])
    .unwrap()
    .set_seed(42);
assert_eq!(ens.len(), 4);

let views = ens.views(2, Layout::Contiguous).unwrap();
assert_eq!(views[0].indices(), &[0, 1]);
assert_eq!(views[1].indices(), &[2, 3]);
```
*/

use rand::rngs::SmallRng;
use rand::{thread_rng, Rng, SeedableRng};
use rayon::prelude::*;

use crate::error::{Result, SmcError};
use crate::stratify::Layout;
use crate::weights;

/// A weighted population of program traces.
#[derive(Debug, Clone)]
pub struct ParticleEnsemble<Tr> {
    pub(crate) traces: Vec<Tr>,
    pub(crate) staging: Vec<Tr>,
    pub(crate) log_weights: Vec<f64>,
    pub(crate) parents: Vec<usize>,
    pub(crate) log_ml_estimate: f64,
    pub(crate) acceptance_rate: Option<f64>,
    pub(crate) seed: u64,
    pub(crate) rng: SmallRng,
}

impl<Tr: Clone> ParticleEnsemble<Tr> {
    /**
    Creates an ensemble from traces and their log weights.

    Parents start as the identity and the log marginal-likelihood estimate at zero.
    The random number generator is seeded from entropy; use [`set_seed`](Self::set_seed)
    for reproducible runs.

    # Errors

    [`SmcError::InvalidArgument`] if the two vectors differ in length.
    */
    pub fn new(traces: Vec<Tr>, log_weights: Vec<f64>) -> Result<Self> {
        if traces.len() != log_weights.len() {
            return Err(SmcError::InvalidArgument(format!(
                "{} traces but {} log weights",
                traces.len(),
                log_weights.len()
            )));
        }
        let seed = thread_rng().gen::<u64>();
        Ok(Self {
            staging: traces.clone(),
            parents: (0..traces.len()).collect(),
            traces,
            log_weights,
            log_ml_estimate: 0.0,
            acceptance_rate: None,
            seed,
            rng: SmallRng::seed_from_u64(seed),
        })
    }

    /// Reseeds the ensemble's random number generator.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    pub fn traces(&self) -> &[Tr] {
        &self.traces
    }

    pub fn log_weights(&self) -> &[f64] {
        &self.log_weights
    }

    /// Index (into the previous generation) that each current particle was copied from.
    pub fn parents(&self) -> &[usize] {
        &self.parents
    }

    /// Running log marginal-likelihood estimate accumulated by resampling passes.
    ///
    /// Includes the mass still held by the current weights, i.e. the estimate
    /// `log_ml_estimate + logsumexp(log_weights) - log(N)`.
    pub fn log_marginal_likelihood(&self) -> f64 {
        self.log_ml_estimate + weights::log_ml_increment(&self.log_weights)
    }

    /// The accumulated estimate without the contribution of the current weights.
    pub fn log_ml_estimate(&self) -> f64 {
        self.log_ml_estimate
    }

    pub fn log_norm_weights(&self) -> Vec<f64> {
        weights::log_normalize(&self.log_weights)
    }

    pub fn norm_weights(&self) -> Vec<f64> {
        weights::normalize(&self.log_weights)
    }

    pub fn effective_sample_size(&self) -> f64 {
        weights::effective_sample_size(&self.log_weights)
    }

    /// Mean acceptance rate of the most recent rejuvenation pass, if any.
    pub fn last_acceptance_rate(&self) -> Option<f64> {
        self.acceptance_rate
    }

    /// Replaces the current generation with copies of `parents`, carrying the given weights.
    pub(crate) fn install_generation(&mut self, parents: Vec<usize>, log_weights: Vec<f64>) {
        self.staging.clear();
        self.staging
            .extend(parents.iter().map(|&p| self.traces[p].clone()));
        std::mem::swap(&mut self.traces, &mut self.staging);
        self.log_weights = log_weights;
        self.parents = parents;
        self.fit_staging();
    }

    /// Brings `staging` back to the population size after a resize.
    pub(crate) fn fit_staging(&mut self) {
        let n = self.traces.len();
        self.staging.truncate(n);
        let have = self.staging.len();
        self.staging.extend(self.traces[have..].iter().cloned());
    }

    /// Borrows the contiguous slot range `range` as a view.
    pub fn view(&mut self, range: std::ops::Range<usize>) -> Result<SubEnsemble<'_, Tr>> {
        if range.start > range.end || range.end > self.len() {
            return Err(SmcError::InvalidArgument(format!(
                "view range {range:?} out of bounds for {} particles",
                self.len()
            )));
        }
        let mut views = self.split(1, move |i| range.contains(&i).then_some(0));
        Ok(views.remove(0))
    }

    /// Borrows the slots `offset, offset + stride, offset + 2 * stride, ...` as a view.
    pub fn strided_view(&mut self, offset: usize, stride: usize) -> Result<SubEnsemble<'_, Tr>> {
        if stride == 0 {
            return Err(SmcError::InvalidArgument("view stride must be positive".into()));
        }
        let mut views = self.split(1, move |i| {
            (i >= offset && (i - offset) % stride == 0).then_some(0)
        });
        Ok(views.remove(0))
    }

    /**
    Splits the ensemble into `k` disjoint views covering every slot.

    With [`Layout::Contiguous`] view `j` holds a block of adjacent slots (block sizes
    differ by at most one); with [`Layout::Interleaved`] it holds the slots `i` with
    `i % k == j`.
    */
    pub fn views(&mut self, k: usize, layout: Layout) -> Result<Vec<SubEnsemble<'_, Tr>>> {
        let n = self.len();
        if k == 0 || k > n {
            return Err(SmcError::InvalidArgument(format!(
                "cannot split {n} particles into {k} views"
            )));
        }
        Ok(match layout {
            Layout::Contiguous => self.split(k, move |i| Some(i * k / n)),
            Layout::Interleaved => self.split(k, move |i| Some(i % k)),
        })
    }

    /**
    Runs `f` on `k` disjoint views in parallel.

    The log marginal-likelihood estimate is left untouched, whatever `f` does.
    */
    pub fn par_views<F>(&mut self, k: usize, layout: Layout, f: F) -> Result<&mut Self>
    where
        Tr: Send,
        F: Fn(&mut SubEnsemble<'_, Tr>) -> Result<()> + Send + Sync,
    {
        self.views(k, layout)?
            .into_par_iter()
            .try_for_each(|mut view| f(&mut view))?;
        Ok(self)
    }

    fn split<G>(&mut self, k: usize, group_of: G) -> Vec<SubEnsemble<'_, Tr>>
    where
        G: Fn(usize) -> Option<usize>,
    {
        let base_seed: u64 = self.rng.gen();
        let mut views: Vec<SubEnsemble<'_, Tr>> = (0..k)
            .map(|j| SubEnsemble::empty(base_seed.wrapping_add(j as u64)))
            .collect();
        let slots = self
            .traces
            .iter_mut()
            .zip(self.staging.iter_mut())
            .zip(self.log_weights.iter_mut())
            .zip(self.parents.iter_mut())
            .enumerate();
        for (i, (((trace, staged), log_weight), parent)) in slots {
            if let Some(j) = group_of(i) {
                let view = &mut views[j];
                view.indices.push(i);
                view.traces.push(trace);
                view.staging.push(staged);
                view.log_weights.push(log_weight);
                view.parents.push(parent);
            }
        }
        views
    }
}

/// Disjoint mutable borrows of a subset of an ensemble's slots.
#[derive(Debug)]
pub struct SubEnsemble<'a, Tr> {
    indices: Vec<usize>,
    traces: Vec<&'a mut Tr>,
    staging: Vec<&'a mut Tr>,
    log_weights: Vec<&'a mut f64>,
    parents: Vec<&'a mut usize>,
    pub(crate) acceptance_rate: Option<f64>,
    pub(crate) rng: SmallRng,
}

impl<'a, Tr: Clone> SubEnsemble<'a, Tr> {
    fn empty(seed: u64) -> Self {
        Self {
            indices: Vec::new(),
            traces: Vec::new(),
            staging: Vec::new(),
            log_weights: Vec::new(),
            parents: Vec::new(),
            acceptance_rate: None,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Reseeds the view's random number generator.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    /// Indices of the view's slots in the backing ensemble.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn trace(&self, i: usize) -> &Tr {
        self.traces[i]
    }

    pub fn log_weights(&self) -> Vec<f64> {
        self.log_weights.iter().map(|w| **w).collect()
    }

    /// Parent of each slot, as an index into the backing ensemble.
    pub fn parents(&self) -> Vec<usize> {
        self.parents.iter().map(|p| **p).collect()
    }

    pub fn log_norm_weights(&self) -> Vec<f64> {
        weights::log_normalize(&self.log_weights())
    }

    pub fn norm_weights(&self) -> Vec<f64> {
        weights::normalize(&self.log_weights())
    }

    pub fn effective_sample_size(&self) -> f64 {
        weights::effective_sample_size(&self.log_weights())
    }

    pub fn last_acceptance_rate(&self) -> Option<f64> {
        self.acceptance_rate
    }
}

/// Slot-level access shared by ensembles and views.
///
/// Operations that keep the population size fixed are written once against this
/// trait. Indices are local to the implementor; `set_parent` takes a local index and
/// records it in the backing ensemble's coordinates.
pub(crate) trait ParticleSlots<Tr: Clone> {
    fn slot_count(&self) -> usize;

    fn gather_log_weights(&self) -> Vec<f64>;

    fn set_log_weight(&mut self, i: usize, log_weight: f64);

    fn add_log_weight(&mut self, i: usize, increment: f64);

    fn slot_trace(&self, i: usize) -> &Tr;

    /// Calls `f` with slot `i`'s trace and the random number generator.
    fn with_trace<X>(&mut self, i: usize, f: impl FnOnce(&Tr, &mut SmallRng) -> X) -> X;

    fn rng(&mut self) -> &mut SmallRng;

    fn stage(&mut self, i: usize, trace: Tr);

    fn set_parent(&mut self, i: usize, local_parent: usize);

    /// Swaps the staged generation in.
    fn commit(&mut self);

    /// Adds to the log marginal-likelihood estimate. Views ignore this.
    fn fold_log_ml(&mut self, increment: f64);

    fn set_acceptance_rate(&mut self, rate: f64);
}

impl<Tr: Clone> ParticleSlots<Tr> for ParticleEnsemble<Tr> {
    fn slot_count(&self) -> usize {
        self.traces.len()
    }

    fn gather_log_weights(&self) -> Vec<f64> {
        self.log_weights.clone()
    }

    fn set_log_weight(&mut self, i: usize, log_weight: f64) {
        self.log_weights[i] = log_weight;
    }

    fn add_log_weight(&mut self, i: usize, increment: f64) {
        self.log_weights[i] += increment;
    }

    fn slot_trace(&self, i: usize) -> &Tr {
        &self.traces[i]
    }

    fn with_trace<X>(&mut self, i: usize, f: impl FnOnce(&Tr, &mut SmallRng) -> X) -> X {
        f(&self.traces[i], &mut self.rng)
    }

    fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    fn stage(&mut self, i: usize, trace: Tr) {
        self.staging[i] = trace;
    }

    fn set_parent(&mut self, i: usize, local_parent: usize) {
        self.parents[i] = local_parent;
    }

    fn commit(&mut self) {
        std::mem::swap(&mut self.traces, &mut self.staging);
    }

    fn fold_log_ml(&mut self, increment: f64) {
        self.log_ml_estimate += increment;
    }

    fn set_acceptance_rate(&mut self, rate: f64) {
        self.acceptance_rate = Some(rate);
    }
}

impl<Tr: Clone> ParticleSlots<Tr> for SubEnsemble<'_, Tr> {
    fn slot_count(&self) -> usize {
        self.indices.len()
    }

    fn gather_log_weights(&self) -> Vec<f64> {
        self.log_weights()
    }

    fn set_log_weight(&mut self, i: usize, log_weight: f64) {
        *self.log_weights[i] = log_weight;
    }

    fn add_log_weight(&mut self, i: usize, increment: f64) {
        *self.log_weights[i] += increment;
    }

    fn slot_trace(&self, i: usize) -> &Tr {
        self.traces[i]
    }

    fn with_trace<X>(&mut self, i: usize, f: impl FnOnce(&Tr, &mut SmallRng) -> X) -> X {
        f(self.traces[i], &mut self.rng)
    }

    fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    fn stage(&mut self, i: usize, trace: Tr) {
        *self.staging[i] = trace;
    }

    fn set_parent(&mut self, i: usize, local_parent: usize) {
        *self.parents[i] = self.indices[local_parent];
    }

    fn commit(&mut self) {
        for (current, staged) in self.traces.iter_mut().zip(self.staging.iter_mut()) {
            std::mem::swap(&mut **current, &mut **staged);
        }
    }

    fn fold_log_ml(&mut self, _increment: f64) {}

    fn set_acceptance_rate(&mut self, rate: f64) {
        self.acceptance_rate = Some(rate);
    }
}
