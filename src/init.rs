/*!
Building an ensemble from a model.

- [`ParticleEnsemble::initialize`]: every particle is generated with the observations as
  constraints and weighted by the generation weight.
- [`ParticleEnsemble::initialize_with_proposal`]: unobserved choices are proposed first,
  and the proposal score is subtracted from the weight.
- [`ParticleEnsemble::initialize_stratified`]: slots are spread evenly over a list of
  strata (see [`crate::stratify`]); the stratum choices are merged into each particle's
  constraints and the weight gains `log K` for `K` strata.

# Examples

```rust
use rand::Rng;
use smc_ensemble::choices::ChoiceMap;
use smc_ensemble::ensemble::ParticleEnsemble;
use smc_ensemble::error::Result;
use smc_ensemble::model::{GenerativeModel, ProgramTrace, UpdateResult};
use smc_ensemble::stratify::Layout;

#[derive(Clone)]
struct Coin { choices: ChoiceMap }

impl ProgramTrace for Coin {
    type Args = ();
    fn score(&self) -> f64 { 0.5f64.ln() }
    fn choices(&self) -> &ChoiceMap { &self.choices }
    fn args(&self) -> &() { &() }
}

struct Flip;

impl GenerativeModel for Flip {
    type Args = ();
    type Trace = Coin;

    fn simulate<R: Rng + ?Sized>(&self, _: &(), rng: &mut R) -> Result<Coin> {
        Ok(Coin { choices: [("heads", rng.gen::<bool>())].into_iter().collect() })
    }

    fn generate<R: Rng + ?Sized>(
        &self,
        args: &(),
        constraints: &ChoiceMap,
        rng: &mut R,
    ) -> Result<(Coin, f64)> {
        match constraints.get("heads") {
            Some(v) => {
                let choices = [("heads", *v)].into_iter().collect();
                Ok((Coin { choices }, 0.5f64.ln()))
            }
            None => Ok((self.simulate(args, rng)?, 0.0)),
        }
    }

    fn update<R: Rng + ?Sized>(
        &self,
        trace: &Coin,
        _: &(),
        _: &ChoiceMap,
        _: &mut R,
    ) -> Result<UpdateResult<Coin>> {
        Ok(UpdateResult { trace: trace.clone(), log_weight: 0.0, discard: ChoiceMap::new() })
    }
}

let strata: Vec<ChoiceMap> = [true, false]
    .iter()
    .map(|&h| [("heads", h)].into_iter().collect())
    .collect();
let ens = ParticleEnsemble::initialize_stratified(
    &Flip,
    &(),
    &ChoiceMap::new(),
    &strata,
    4,
    Layout::Contiguous,
    42,
)
.unwrap();
let heads: Vec<bool> = ens
    .traces()
    .iter()
    .map(|t| t.choices().get("heads").and_then(|v| v.as_bool()).unwrap())
    .collect();
assert_eq!(heads, vec![true, true, false, false]);
// log(1/2) from the constrained choice plus log(2) for two strata.
assert!(ens.log_weights().iter().all(|w| w.abs() < 1e-12));
```
*/

use log::debug;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::choices::ChoiceMap;
use crate::ensemble::ParticleEnsemble;
use crate::error::{Result, SmcError};
use crate::model::{GenerativeModel, Proposal};
use crate::stratify::{stratify, Layout};

/// Generates one particle constrained on `observations`.
pub(crate) fn generate_particle<M, R>(
    model: &M,
    args: &M::Args,
    observations: &ChoiceMap,
    rng: &mut R,
) -> Result<(M::Trace, f64)>
where
    M: GenerativeModel,
    R: Rng + ?Sized,
{
    model.generate(args, observations, rng)
}

/// Generates one particle from proposed choices; observations take precedence over
/// proposed values at the same address.
pub(crate) fn propose_particle<M, Q, R>(
    model: &M,
    args: &M::Args,
    observations: &ChoiceMap,
    proposal: &Q,
    rng: &mut R,
) -> Result<(M::Trace, f64)>
where
    M: GenerativeModel,
    Q: Proposal<ChoiceMap>,
    R: Rng + ?Sized,
{
    let (proposed, proposal_score) = proposal.propose(observations, rng)?;
    let constraints = proposed.merge(observations);
    let (trace, log_weight) = model.generate(args, &constraints, rng)?;
    Ok((trace, log_weight - proposal_score))
}

impl<Tr: Clone> ParticleEnsemble<Tr> {
    fn from_particles(particles: Vec<(Tr, f64)>, rng: SmallRng, seed: u64) -> Result<Self> {
        let (traces, log_weights) = particles.into_iter().unzip();
        let mut ens = ParticleEnsemble::new(traces, log_weights)?;
        ens.rng = rng;
        ens.seed = seed;
        Ok(ens)
    }

    /**
    Generates `n` particles from `model` constrained on `observations`.

    The ensemble's random number generator is seeded with `seed` and used for
    generation, so the same seed reproduces the same ensemble.

    # Errors

    Propagates [`SmcError::Model`] failures from the model.
    */
    pub fn initialize<M>(
        model: &M,
        args: &M::Args,
        observations: &ChoiceMap,
        n: usize,
        seed: u64,
    ) -> Result<Self>
    where
        M: GenerativeModel<Trace = Tr>,
    {
        let mut rng = SmallRng::seed_from_u64(seed);
        let particles = (0..n)
            .map(|_| generate_particle(model, args, observations, &mut rng))
            .collect::<Result<Vec<_>>>()?;
        debug!("initialized {n} particles");
        Self::from_particles(particles, rng, seed)
    }

    /// Like [`initialize`](Self::initialize), drawing unobserved choices from `proposal`
    /// and weighting by `generate weight - proposal score`.
    pub fn initialize_with_proposal<M, Q>(
        model: &M,
        args: &M::Args,
        observations: &ChoiceMap,
        proposal: &Q,
        n: usize,
        seed: u64,
    ) -> Result<Self>
    where
        M: GenerativeModel<Trace = Tr>,
        Q: Proposal<ChoiceMap>,
    {
        let mut rng = SmallRng::seed_from_u64(seed);
        let particles = (0..n)
            .map(|_| propose_particle(model, args, observations, proposal, &mut rng))
            .collect::<Result<Vec<_>>>()?;
        debug!("initialized {n} particles from a proposal");
        Self::from_particles(particles, rng, seed)
    }

    /**
    Generates `n` particles spread over `strata`.

    Slot `i` is assigned a stratum by [`stratify`]; the stratum's choices are merged with
    `observations` (observations win on shared addresses) and the particle is generated
    under the result. Each weight is the generation weight plus `log K`, the inverse of
    the uniform probability of picking one of the `K` strata.

    # Errors

    [`SmcError::InvalidArgument`] if `strata` is empty.
    */
    pub fn initialize_stratified<M>(
        model: &M,
        args: &M::Args,
        observations: &ChoiceMap,
        strata: &[ChoiceMap],
        n: usize,
        layout: Layout,
        seed: u64,
    ) -> Result<Self>
    where
        M: GenerativeModel<Trace = Tr>,
    {
        if strata.is_empty() {
            return Err(SmcError::InvalidArgument(
                "stratified initialization needs at least one stratum".into(),
            ));
        }
        let mut rng = SmallRng::seed_from_u64(seed);
        let log_k = (strata.len() as f64).ln();
        let assignment = stratify(n, strata.len(), layout, &mut rng)?;
        let particles = assignment
            .iter()
            .map(|&s| {
                let constraints = strata[s].merge(observations);
                let (trace, log_weight) = model.generate(args, &constraints, &mut rng)?;
                Ok((trace, log_weight + log_k))
            })
            .collect::<Result<Vec<_>>>()?;
        debug!("initialized {n} particles over {} strata", strata.len());
        Self::from_particles(particles, rng, seed)
    }
}
